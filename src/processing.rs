use crate::config::NormalizationConfig;
use crate::types::{
    AgentRecord, CanonicalName, DepartmentCount, DepartmentPolygon, JoinedDepartment,
};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{info, warn};

/// Spelling variants seen in the agent CSV and the MGN department shapefile.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("bogota d.c.", "bogotá, d.c."),
    ("bogota, d.c.", "bogotá, d.c."),
    ("atlantico", "atlántico"),
    ("cordoba", "córdoba"),
    ("bolivar", "bolívar"),
    ("boyaca", "boyacá"),
    ("caqueta", "caquetá"),
    ("quindio", "quindío"),
    ("guajira", "la guajira"),
    ("valle", "valle del cauca"),
    ("magdalena", "magdalena"),
    ("nariño", "nariño"),
    ("putumayo", "putumayo"),
    ("santander", "santander"),
    ("sucre", "sucre"),
    ("tolima", "tolima"),
    ("meta", "meta"),
    ("cundinamarca", "cundinamarca"),
    ("antioquia", "antioquia"),
    ("risaralda", "risaralda"),
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("alias '{variant}' maps to '{canonical}', which is itself mapped to '{further}'")]
pub struct AliasConflict {
    pub variant: String,
    pub canonical: String,
    pub further: String,
}

/// Immutable variant -> canonical lookup used on both sides of the join.
///
/// Keys and values are stored cleaned (lowercase, trimmed, single spaces), and
/// no canonical value is a key that maps somewhere else, so normalizing an
/// already normalized name is a no-op.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    aliases: HashMap<String, String>,
}

impl NameTable {
    pub fn new<I, K, V>(pairs: I) -> Result<Self, AliasConflict>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let aliases: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (clean(k.as_ref()), clean(v.as_ref())))
            .collect();

        for (variant, canonical) in &aliases {
            if let Some(further) = aliases.get(canonical) {
                if further != canonical {
                    return Err(AliasConflict {
                        variant: variant.clone(),
                        canonical: canonical.clone(),
                        further: further.clone(),
                    });
                }
            }
        }

        Ok(Self { aliases })
    }

    pub fn builtin() -> Self {
        Self::new(BUILTIN_ALIASES.iter().copied()).expect("builtin alias table is consistent")
    }

    /// Builtin table (unless disabled) with the configured aliases layered on top.
    pub fn from_config(config: &NormalizationConfig) -> Result<Self, AliasConflict> {
        let mut pairs: BTreeMap<String, String> = BTreeMap::new();
        if config.use_builtin {
            for (k, v) in BUILTIN_ALIASES {
                pairs.insert(clean(k), clean(v));
            }
        }
        for (k, v) in &config.aliases {
            pairs.insert(clean(k), clean(v));
        }
        Self::new(pairs)
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    fn lookup<'a>(&'a self, cleaned: &'a str) -> &'a str {
        self.aliases.get(cleaned).map(String::as_str).unwrap_or(cleaned)
    }
}

fn clean(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn normalize(raw: &str, table: &NameTable) -> CanonicalName {
    let cleaned = clean(raw);
    CanonicalName(table.lookup(&cleaned).to_string())
}

/// Agent counts per canonical department, sorted by name.
pub fn aggregate(agents: &[AgentRecord], table: &NameTable) -> Vec<DepartmentCount> {
    let mut counts: BTreeMap<CanonicalName, u32> = BTreeMap::new();
    for agent in agents {
        *counts.entry(normalize(&agent.department, table)).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .map(|(department, count)| DepartmentCount { department, count })
        .collect()
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// One entry per input polygon, in input order.
    pub departments: Vec<JoinedDepartment>,
    /// Agent departments with no polygon. Not shown on the map.
    pub unmatched: Vec<DepartmentCount>,
}

/// Left join of the counts onto the polygons; polygons without agents get 0.
pub fn join(
    polygons: &[DepartmentPolygon],
    counts: &[DepartmentCount],
    table: &NameTable,
) -> JoinOutcome {
    let by_name: HashMap<&CanonicalName, u32> =
        counts.iter().map(|c| (&c.department, c.count)).collect();

    let departments: Vec<JoinedDepartment> = polygons
        .iter()
        .map(|polygon| {
            let canonical = normalize(&polygon.name, table);
            let count = by_name.get(&canonical).copied().unwrap_or(0);
            JoinedDepartment {
                name: polygon.name.clone(),
                canonical,
                geometry: polygon.geometry.clone(),
                count,
            }
        })
        .collect();

    let unmatched: Vec<DepartmentCount> = counts
        .iter()
        .filter(|c| !departments.iter().any(|d| d.canonical == c.department))
        .cloned()
        .collect();

    for orphan in &unmatched {
        warn!(
            department = %orphan.department,
            agents = orphan.count,
            "department has agents but no polygon; left off the map"
        );
    }

    let with_agents = departments.iter().filter(|d| d.count > 0).count();
    info!(
        polygons = departments.len(),
        with_agents,
        unmatched = unmatched.len(),
        "joined agent counts onto departments"
    );

    JoinOutcome { departments, unmatched }
}
