use geo::MultiPolygon;
use serde::Serialize;
use std::fmt;

/// One row of the agent CSV.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub name: String,
    pub department: String, // free text, as found in the file
    pub agent_type: String,
    // Blank cells stay None; the agent is still counted and listed
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    // Any other CSV columns, in header order
    pub extra: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct DepartmentPolygon {
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

/// Department name after normalization. Only `processing::normalize` builds these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CanonicalName(pub(crate) String);

impl CanonicalName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepartmentCount {
    pub department: CanonicalName,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct JoinedDepartment {
    pub name: String,
    pub canonical: CanonicalName,
    pub geometry: MultiPolygon<f64>,
    pub count: u32,
}
