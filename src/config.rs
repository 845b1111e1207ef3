use std::collections::BTreeMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub normalization: NormalizationConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub agents_csv: PathBuf,
    pub departments: PathBuf, // .shp, .json or .geojson
    #[serde(default = "default_department_column")]
    pub department_column: String,
    #[serde(default)]
    pub agent_columns: AgentColumns,
}

/// Header names of the required agent CSV columns.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentColumns {
    pub department: String,
    pub agent_type: String,
    pub name: String,
    pub longitude: String,
    pub latitude: String,
}

impl Default for AgentColumns {
    fn default() -> Self {
        Self {
            department: "DEPARTAMENTO".to_string(),
            agent_type: "TIPO_AGENTE".to_string(),
            name: "NOMBRE_COMERCIAL".to_string(),
            longitude: "LONGITUD".to_string(),
            latitude: "LATITUD".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NormalizationConfig {
    pub use_builtin: bool,
    // variant -> canonical, applied on top of the builtin table
    pub aliases: BTreeMap<String, String>,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            use_builtin: true,
            aliases: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("output") }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: PathBuf,
    pub page_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8050,
            static_dir: PathBuf::from("web"),
            page_size: 10,
        }
    }
}

fn default_department_column() -> String {
    "DPTO_CNMBR".to_string()
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}
