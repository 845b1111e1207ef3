use crate::config::{AgentColumns, InputConfig};
use crate::types::{AgentRecord, DepartmentPolygon};
use csv::{ReaderBuilder, StringRecord};
use geo::MultiPolygon;
use shapefile::Reader;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed CSV {path:?}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed shapefile {path:?}: {source}")]
    Shapefile {
        path: PathBuf,
        #[source]
        source: shapefile::Error,
    },
    #[error("malformed GeoJSON {path:?}: {source}")]
    GeoJson {
        path: PathBuf,
        #[source]
        source: geojson::Error,
    },
    #[error("required column '{column}' not found in {path:?}")]
    MissingColumn { path: PathBuf, column: String },
    #[error("{path:?} line {line}: invalid {column} value '{value}'")]
    InvalidValue {
        path: PathBuf,
        line: u64,
        column: String,
        value: String,
    },
    #[error("unsupported department geometry format: {0:?}")]
    UnsupportedFormat(PathBuf),
    #[error("{path:?}: {message}")]
    Geometry { path: PathBuf, message: String },
}

pub fn load_all(
    input: &InputConfig,
) -> Result<(Vec<AgentRecord>, Vec<DepartmentPolygon>), LoadError> {
    let agents = load_agents(&input.agents_csv, &input.agent_columns)?;
    info!(records = agents.len(), path = ?input.agents_csv, "loaded agent records");

    let departments = load_departments(&input.departments, &input.department_column)?;
    info!(polygons = departments.len(), path = ?input.departments, "loaded department polygons");

    Ok((agents, departments))
}

pub fn load_agents(path: &Path, columns: &AgentColumns) -> Result<Vec<AgentRecord>, LoadError> {
    let file = File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_agents(file, path, columns)
}

struct AgentColumnIndex {
    department: usize,
    agent_type: usize,
    name: usize,
    longitude: usize,
    latitude: usize,
}

fn read_agents<R: Read>(
    reader: R,
    path: &Path,
    columns: &AgentColumns,
) -> Result<Vec<AgentRecord>, LoadError> {
    let csv_err = |source| LoadError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut rdr = ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(reader);
    let headers = rdr.headers().map_err(csv_err)?.clone();

    let find = |column: &str| {
        headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| LoadError::MissingColumn {
                path: path.to_path_buf(),
                column: column.to_string(),
            })
    };

    let idx = AgentColumnIndex {
        department: find(&columns.department)?,
        agent_type: find(&columns.agent_type)?,
        name: find(&columns.name)?,
        longitude: find(&columns.longitude)?,
        latitude: find(&columns.latitude)?,
    };
    let core = [idx.department, idx.agent_type, idx.name, idx.longitude, idx.latitude];

    let mut agents = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(csv_err)?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        let coordinate = |i: usize, column: &str| -> Result<Option<f64>, LoadError> {
            let raw = record.get(i).unwrap_or("");
            parse_coordinate(raw).map_err(|_| LoadError::InvalidValue {
                path: path.to_path_buf(),
                line,
                column: column.to_string(),
                value: raw.to_string(),
            })
        };

        agents.push(AgentRecord {
            name: field(&record, idx.name),
            department: field(&record, idx.department),
            agent_type: field(&record, idx.agent_type),
            longitude: coordinate(idx.longitude, &columns.longitude)?,
            latitude: coordinate(idx.latitude, &columns.latitude)?,
            extra: headers
                .iter()
                .enumerate()
                .filter(|(i, _)| !core.contains(i))
                .map(|(i, h)| (h.to_string(), field(&record, i)))
                .collect(),
        });
    }

    Ok(agents)
}

fn field(record: &StringRecord, i: usize) -> String {
    record.get(i).unwrap_or("").trim().to_string()
}

/// Accepts either '.' or ',' as the decimal separator. An empty cell is `Ok(None)`.
fn parse_coordinate(raw: &str) -> Result<Option<f64>, ()> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.replace(',', ".").parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(()),
    }
}

pub fn load_departments(
    path: &Path,
    name_column: &str,
) -> Result<Vec<DepartmentPolygon>, LoadError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| LoadError::UnsupportedFormat(path.to_path_buf()))?;

    match extension.as_str() {
        "shp" => load_shapefile(path, name_column),
        "json" | "geojson" => load_geojson(path, name_column),
        _ => Err(LoadError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn load_shapefile(path: &Path, name_column: &str) -> Result<Vec<DepartmentPolygon>, LoadError> {
    let shp_err = |source| LoadError::Shapefile {
        path: path.to_path_buf(),
        source,
    };
    let geometry_err = |message: String| LoadError::Geometry {
        path: path.to_path_buf(),
        message,
    };

    let mut reader = Reader::from_path(path).map_err(shp_err)?;
    let mut departments = Vec::new();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result.map_err(shp_err)?;

        let name = match record.get(name_column) {
            Some(shapefile::dbase::FieldValue::Character(Some(s))) => s.trim().to_string(),
            Some(shapefile::dbase::FieldValue::Character(None)) => String::new(),
            Some(_) => {
                return Err(geometry_err(format!("column '{}' must be a string", name_column)))
            }
            None => {
                return Err(LoadError::MissingColumn {
                    path: path.to_path_buf(),
                    column: name_column.to_string(),
                })
            }
        };

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon
                .try_into()
                .map_err(|e| geometry_err(format!("failed to convert polygon: {:?}", e)))?,
            shapefile::Shape::PolygonM(polygon) => polygon
                .try_into()
                .map_err(|e| geometry_err(format!("failed to convert polygonM: {:?}", e)))?,
            shapefile::Shape::PolygonZ(polygon) => polygon
                .try_into()
                .map_err(|e| geometry_err(format!("failed to convert polygonZ: {:?}", e)))?,
            other => {
                return Err(geometry_err(format!(
                    "department '{}' is a {:?} shape, expected a polygon",
                    name,
                    other.shapetype()
                )))
            }
        };

        departments.push(DepartmentPolygon { name, geometry });
    }

    Ok(departments)
}

fn load_geojson(path: &Path, name_column: &str) -> Result<Vec<DepartmentPolygon>, LoadError> {
    use geojson::GeoJson;

    let file = File::open(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let geojson =
        GeoJson::from_reader(BufReader::new(file)).map_err(|source| LoadError::GeoJson {
            path: path.to_path_buf(),
            source: geojson::Error::MalformedJson(source),
        })?;
    departments_from_geojson(geojson, path, name_column)
}

fn departments_from_geojson(
    geojson: geojson::GeoJson,
    path: &Path,
    name_column: &str,
) -> Result<Vec<DepartmentPolygon>, LoadError> {
    let geometry_err = |message: String| LoadError::Geometry {
        path: path.to_path_buf(),
        message,
    };

    let collection = match geojson {
        geojson::GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(geometry_err("GeoJSON must be a FeatureCollection".to_string())),
    };

    let mut departments = Vec::new();

    for feature in collection.features {
        let name = match feature.properties.as_ref().and_then(|props| props.get(name_column)) {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Null) => String::new(),
            Some(other) => other.to_string(),
            None => {
                return Err(LoadError::MissingColumn {
                    path: path.to_path_buf(),
                    column: name_column.to_string(),
                })
            }
        };

        let geometry = match feature.geometry {
            Some(geometry) => {
                let geometry: geo::Geometry<f64> = geometry.value.try_into().map_err(|e| {
                    geometry_err(format!("failed to convert geometry of '{}': {:?}", name, e))
                })?;

                match geometry {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => {
                        return Err(geometry_err(format!("department '{}' is not a polygon", name)))
                    }
                }
            }
            None => {
                return Err(geometry_err(format!("department '{}' has no geometry", name)))
            }
        };

        departments.push(DepartmentPolygon { name, geometry });
    }

    Ok(departments)
}
