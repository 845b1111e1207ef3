//! Data products behind the four dashboard views.
//!
//! Each product is a plain serializable value; the front-end decides colours,
//! layout and chart styling.

use crate::processing::{self, JoinOutcome, NameTable};
use crate::types::{AgentRecord, DepartmentCount, DepartmentPolygon, JoinedDepartment};
use anyhow::{Context, Result};
use geo::{BoundingRect, Rect};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarEntry {
    pub department: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScatterPoint {
    pub longitude: f64,
    pub latitude: f64,
    pub name: String,
    pub department: String,
}

/// Scatter points keyed by agent type; one colour series per key.
pub type ScatterSeries = BTreeMap<String, Vec<ScatterPoint>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    pub name: String,
    pub department: String,
    pub agent_type: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    // Extra CSV columns in file order
    pub extra: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortColumn {
    Name,
    Department,
    AgentType,
    Longitude,
    Latitude,
}

/// Filter, sort and paging for the table view. Text filters are case-insensitive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableQuery {
    pub department: Option<String>,
    pub agent_type: Option<String>,
    pub q: Option<String>,
    pub sort: Option<SortColumn>,
    #[serde(default)]
    pub desc: bool,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TablePage<'a> {
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub rows: Vec<&'a TableRow>,
}

pub struct Dashboard {
    pub departments: Vec<JoinedDepartment>,
    pub unmatched: Vec<DepartmentCount>,
    pub map: FeatureCollection,
    pub bars: Vec<BarEntry>,
    pub scatter: ScatterSeries,
    pub table: Vec<TableRow>,
}

impl Dashboard {
    pub fn build(
        agents: &[AgentRecord],
        polygons: &[DepartmentPolygon],
        names: &NameTable,
    ) -> Self {
        let counts = processing::aggregate(agents, names);
        let JoinOutcome { departments, unmatched } = processing::join(polygons, &counts, names);

        // Independent of each other; build side by side.
        let ((map, bars), (scatter, table)) = rayon::join(
            || (choropleth(&departments), bar_entries(&counts)),
            || (scatter_series(agents, names), table_rows(agents, names)),
        );

        info!(
            features = map.features.len(),
            bars = bars.len(),
            agent_types = scatter.len(),
            rows = table.len(),
            "dashboard data ready"
        );

        Self {
            departments,
            unmatched,
            map,
            bars,
            scatter,
            table,
        }
    }

    pub fn query_table(&self, query: &TableQuery, default_page_size: usize) -> TablePage<'_> {
        let rows = filter_rows(&self.table, query);
        let total = rows.len();
        let page_size = query.page_size.unwrap_or(default_page_size).max(1);
        let page = query.page.unwrap_or(0);

        TablePage {
            total,
            page,
            page_size,
            rows: rows.into_iter().skip(page.saturating_mul(page_size)).take(page_size).collect(),
        }
    }

    /// Writes every data product into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {:?}", dir))?;

        let map_path = dir.join("departments.geojson");
        fs::write(&map_path, serde_json::to_string(&self.map)?)
            .with_context(|| format!("Failed to write {:?}", map_path))?;

        write_json(&dir.join("department_counts.json"), &self.bars)?;
        write_json(&dir.join("agents_by_type.json"), &self.scatter)?;

        let csv_path = dir.join("agents.csv");
        let all: Vec<&TableRow> = self.table.iter().collect();
        let csv = rows_to_csv(&all)?;
        fs::write(&csv_path, csv).with_context(|| format!("Failed to write {:?}", csv_path))?;

        info!(dir = ?dir, "wrote dashboard exports");
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    fs::write(path, body).with_context(|| format!("Failed to write {:?}", path))
}

/// One feature per department, carrying its count. The collection bbox spans
/// every geometry so the map can fit itself to Colombia.
pub fn choropleth(departments: &[JoinedDepartment]) -> FeatureCollection {
    let features: Vec<Feature> = departments
        .iter()
        .map(|department| {
            let mut properties = JsonObject::new();
            properties.insert("name".to_string(), department.name.clone().into());
            properties.insert("canonical".to_string(), department.canonical.as_str().into());
            properties.insert("count".to_string(), department.count.into());

            Feature {
                bbox: None,
                geometry: Some(Geometry::new(Value::from(&department.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    let bbox = departments
        .iter()
        .filter_map(|d| d.geometry.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                (a.min().x.min(b.min().x), a.min().y.min(b.min().y)),
                (a.max().x.max(b.max().x), a.max().y.max(b.max().y)),
            )
        })
        .map(|r| vec![r.min().x, r.min().y, r.max().x, r.max().y]);

    FeatureCollection {
        bbox,
        features,
        foreign_members: None,
    }
}

/// Every counted department, busiest first. Includes departments with no polygon.
pub fn bar_entries(counts: &[DepartmentCount]) -> Vec<BarEntry> {
    let mut bars: Vec<BarEntry> = counts
        .iter()
        .map(|c| BarEntry {
            department: c.department.to_string(),
            count: c.count,
        })
        .collect();
    bars.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.department.cmp(&b.department)));
    bars
}

/// Agents without both coordinates are left off the scatter.
pub fn scatter_series(agents: &[AgentRecord], names: &NameTable) -> ScatterSeries {
    let mut series = ScatterSeries::new();
    for agent in agents {
        let (Some(longitude), Some(latitude)) = (agent.longitude, agent.latitude) else {
            continue;
        };
        series.entry(agent.agent_type.clone()).or_default().push(ScatterPoint {
            longitude,
            latitude,
            name: agent.name.clone(),
            department: processing::normalize(&agent.department, names).to_string(),
        });
    }
    series
}

pub fn table_rows(agents: &[AgentRecord], names: &NameTable) -> Vec<TableRow> {
    agents
        .iter()
        .map(|agent| TableRow {
            name: agent.name.clone(),
            department: processing::normalize(&agent.department, names).to_string(),
            agent_type: agent.agent_type.clone(),
            longitude: agent.longitude,
            latitude: agent.latitude,
            extra: agent.extra.clone(),
        })
        .collect()
}

pub fn filter_rows<'a>(rows: &'a [TableRow], query: &TableQuery) -> Vec<&'a TableRow> {
    let lower = |s: &Option<String>| {
        s.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    };
    let department = lower(&query.department);
    let agent_type = lower(&query.agent_type);
    let text = lower(&query.q);

    let mut matched: Vec<&TableRow> = rows
        .iter()
        .filter(|row| department.as_ref().map_or(true, |d| row.department.to_lowercase() == *d))
        .filter(|row| agent_type.as_ref().map_or(true, |t| row.agent_type.to_lowercase() == *t))
        .filter(|row| {
            text.as_ref()
                .map_or(true, |q| row.name.to_lowercase().contains(q.as_str()))
        })
        .collect();

    if let Some(column) = query.sort {
        // Stable sort, ties keep file order.
        matched.sort_by(|a, b| {
            let ordering = match column {
                SortColumn::Name => a.name.cmp(&b.name),
                SortColumn::Department => a.department.cmp(&b.department),
                SortColumn::AgentType => a.agent_type.cmp(&b.agent_type),
                SortColumn::Longitude => return blank_last(a.longitude, b.longitude, query.desc),
                SortColumn::Latitude => return blank_last(a.latitude, b.latitude, query.desc),
            };
            if query.desc {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }

    matched
}

/// Orders coordinates with blanks after every value, whichever the direction.
fn blank_last(a: Option<f64>, b: Option<f64>, desc: bool) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) if desc => b.total_cmp(&a),
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// CSV export of table rows; extra columns follow the five core ones, in file order.
pub fn rows_to_csv(rows: &[&TableRow]) -> Result<Vec<u8>> {
    let extra_columns: Vec<&str> = rows
        .first()
        .map(|row| row.extra.iter().map(|(column, _)| column.as_str()).collect())
        .unwrap_or_default();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["name", "department", "agent_type", "longitude", "latitude"];
    header.extend(extra_columns.iter().copied());
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![
            row.name.clone(),
            row.department.clone(),
            row.agent_type.clone(),
            row.longitude.map(|v| v.to_string()).unwrap_or_default(),
            row.latitude.map(|v| v.to_string()).unwrap_or_default(),
        ];
        record.extend(extra_columns.iter().map(|column| {
            row.extra
                .iter()
                .find(|(c, _)| c == column)
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        }));
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV export: {}", e.error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};

    fn agent(name: &str, department: &str, agent_type: &str, lon: f64) -> AgentRecord {
        AgentRecord {
            name: name.to_string(),
            department: department.to_string(),
            agent_type: agent_type.to_string(),
            longitude: Some(lon),
            latitude: Some(5.0),
            extra: vec![
                ("MUNICIPIO".to_string(), format!("m-{name}")),
                ("DIRECCION".to_string(), "Calle 1".to_string()),
            ],
        }
    }

    fn square(name: &str, x: f64) -> DepartmentPolygon {
        DepartmentPolygon {
            name: name.to_string(),
            geometry: MultiPolygon::new(vec![polygon![
                (x: x, y: 0.0),
                (x: x + 1.0, y: 0.0),
                (x: x + 1.0, y: 1.0),
                (x: x, y: 1.0)
            ]]),
        }
    }

    fn sample() -> Dashboard {
        let agents = vec![
            agent("Terpel Norte", "Antioquia", "EDS", -75.5),
            agent("Gazel Sur", "ANTIOQUIA", "EDS", -75.6),
            agent("Vanti", "Bogota D.C.", "Distribuidor", -74.1),
            agent("Llanogas", "Meta", "Distribuidor", -73.6),
            agent("Gas Yopal", "Casanare", "EDS", -72.4),
        ];
        let polygons = vec![
            square("ANTIOQUIA", 0.0),
            square("BOGOTA, D.C.", 2.0),
            square("VAUPÉS", 5.0),
        ];
        Dashboard::build(&agents, &polygons, &NameTable::builtin())
    }

    #[test]
    fn map_has_one_feature_per_polygon_with_counts() {
        let dashboard = sample();
        assert_eq!(dashboard.map.features.len(), 3);

        let counts: Vec<u64> = dashboard
            .map
            .features
            .iter()
            .map(|f| f.property("count").and_then(|v| v.as_u64()).unwrap())
            .collect();
        assert_eq!(counts, vec![2, 1, 0]);
        assert_eq!(
            dashboard.map.features[1].property("canonical").and_then(|v| v.as_str()),
            Some("bogotá, d.c.")
        );
        assert_eq!(dashboard.map.bbox, Some(vec![0.0, 0.0, 6.0, 1.0]));
    }

    #[test]
    fn bars_are_busiest_first_and_include_unmatched() {
        let dashboard = sample();
        let bars: Vec<(&str, u32)> =
            dashboard.bars.iter().map(|b| (b.department.as_str(), b.count)).collect();
        assert_eq!(
            bars,
            vec![("antioquia", 2), ("bogotá, d.c.", 1), ("casanare", 1), ("meta", 1)]
        );
        let unmatched: Vec<&str> =
            dashboard.unmatched.iter().map(|c| c.department.as_str()).collect();
        assert_eq!(unmatched, vec!["casanare", "meta"]);
    }

    #[test]
    fn scatter_groups_by_agent_type() {
        let dashboard = sample();
        assert_eq!(dashboard.scatter.len(), 2);
        assert_eq!(dashboard.scatter["EDS"].len(), 3);
        assert_eq!(dashboard.scatter["Distribuidor"][0].department, "bogotá, d.c.");
    }

    #[test]
    fn table_filters_sorts_and_pages() {
        let dashboard = sample();

        let query = TableQuery {
            agent_type: Some(" eds ".to_string()),
            sort: Some(SortColumn::Longitude),
            ..Default::default()
        };
        let page = dashboard.query_table(&query, 2);
        assert_eq!(page.total, 3);
        let names: Vec<&str> = page.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Gazel Sur", "Terpel Norte"]);

        let second = dashboard.query_table(&TableQuery { page: Some(1), ..query.clone() }, 2);
        assert_eq!(second.rows.len(), 1);
        assert_eq!(second.rows[0].name, "Gas Yopal");

        let past_end = dashboard.query_table(&TableQuery { page: Some(9), ..query }, 2);
        assert_eq!(past_end.total, 3);
        assert!(past_end.rows.is_empty());
    }

    #[test]
    fn table_text_search_and_department_filter() {
        let dashboard = sample();
        let query = TableQuery {
            department: Some("BOGOTÁ, D.C.".to_string()),
            ..Default::default()
        };
        assert_eq!(dashboard.query_table(&query, 10).total, 1);

        let query = TableQuery {
            q: Some("gas".to_string()),
            sort: Some(SortColumn::Name),
            desc: true,
            ..Default::default()
        };
        let page = dashboard.query_table(&query, 10);
        let names: Vec<&str> = page.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Llanogas", "Gas Yopal"]);
    }

    #[test]
    fn csv_export_has_core_then_extra_columns() {
        let dashboard = sample();
        let rows: Vec<&TableRow> = dashboard.table.iter().take(1).collect();
        let csv = String::from_utf8(rows_to_csv(&rows).unwrap()).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("name,department,agent_type,longitude,latitude,MUNICIPIO,DIRECCION")
        );
        assert_eq!(
            lines.next(),
            Some("Terpel Norte,antioquia,EDS,-75.5,5,m-Terpel Norte,Calle 1")
        );
    }

    #[test]
    fn agent_without_coordinates_is_counted_but_not_plotted() {
        let mut unplaced = agent("Sin Ubicacion", "Meta", "EDS", 0.0);
        unplaced.longitude = None;
        unplaced.latitude = None;
        let agents = vec![agent("Llanogas", "Meta", "Distribuidor", -73.6), unplaced];
        let dashboard = Dashboard::build(&agents, &[square("META", 0.0)], &NameTable::builtin());

        assert_eq!(dashboard.departments[0].count, 2);
        assert_eq!(dashboard.bars, vec![BarEntry { department: "meta".to_string(), count: 2 }]);
        assert_eq!(dashboard.scatter.len(), 1);
        assert!(!dashboard.scatter.contains_key("EDS"));
        assert_eq!(dashboard.table.len(), 2);

        let by_longitude = TableQuery {
            sort: Some(SortColumn::Longitude),
            desc: true,
            ..Default::default()
        };
        let page = dashboard.query_table(&by_longitude, 10);
        let names: Vec<&str> = page.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Llanogas", "Sin Ubicacion"]);

        let csv = String::from_utf8(rows_to_csv(&page.rows).unwrap()).unwrap();
        assert_eq!(
            csv.lines().nth(2),
            Some("Sin Ubicacion,meta,EDS,,,m-Sin Ubicacion,Calle 1")
        );
    }
}
