use crate::config::AppConfig;
use crate::render::{self, Dashboard, TableQuery};
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use geo::algorithm::contains::Contains;
use geo::{BoundingRect, Point};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

// Bounding box of one joined department, pointing back into `Dashboard::departments`
pub struct DepartmentIndex {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for DepartmentIndex {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

pub struct AppState {
    pub dashboard: Dashboard,
    pub tree: RTree<DepartmentIndex>,
    pub page_size: usize,
}

impl AppState {
    pub fn new(dashboard: Dashboard, page_size: usize) -> Self {
        let items: Vec<DepartmentIndex> = dashboard
            .departments
            .iter()
            .enumerate()
            .filter_map(|(index, department)| {
                let rect = department.geometry.bounding_rect()?;
                Some(DepartmentIndex {
                    index,
                    aabb: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();

        Self {
            tree: RTree::bulk_load(items),
            dashboard,
            page_size,
        }
    }
}

#[derive(Deserialize)]
pub struct LocateParams {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct LocateResponse {
    pub name: String,
    pub canonical: String,
    pub count: u32,
}

pub fn router(state: Arc<AppState>, static_dir: &std::path::Path) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/map", get(map_handler))
        .route("/api/departments", get(departments_handler))
        .route("/api/agents", get(agents_handler))
        .route("/api/table", get(table_handler))
        .route("/api/table.csv", get(table_csv_handler))
        .route("/api/locate", get(locate_handler))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}

pub async fn start_server(config: AppConfig, dashboard: Dashboard) -> Result<()> {
    let state = Arc::new(AppState::new(dashboard, config.server.page_size));
    info!(departments = state.tree.size(), "spatial index built");

    let app = router(state, &config.server.static_dir);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
        })
        .await?;
    Ok(())
}

async fn map_handler(State(state): State<Arc<AppState>>) -> Response {
    match serde_json::to_string(&state.dashboard.map) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/geo+json")], body).into_response(),
        Err(e) => {
            error!("failed to encode map: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn departments_handler(State(state): State<Arc<AppState>>) -> Json<Vec<render::BarEntry>> {
    Json(state.dashboard.bars.clone())
}

async fn agents_handler(State(state): State<Arc<AppState>>) -> Json<render::ScatterSeries> {
    Json(state.dashboard.scatter.clone())
}

async fn table_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TableQuery>,
) -> Response {
    Json(state.dashboard.query_table(&query, state.page_size)).into_response()
}

async fn table_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TableQuery>,
) -> Response {
    let rows = render::filter_rows(&state.dashboard.table, &query);
    match render::rows_to_csv(&rows) {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"agentes_gnv.csv\""),
            ],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("failed to export table: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn locate_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LocateParams>,
) -> Json<Option<LocateResponse>> {
    Json(locate(&state, params.lon, params.lat))
}

/// The joined department containing the point, if any.
pub fn locate(state: &AppState, lon: f64, lat: f64) -> Option<LocateResponse> {
    let point = Point::new(lon, lat);
    let envelope = AABB::from_point([lon, lat]);

    state
        .tree
        .locate_in_envelope_intersecting(&envelope)
        .filter_map(|candidate| state.dashboard.departments.get(candidate.index))
        .find(|department| department.geometry.contains(&point))
        .map(|department| LocateResponse {
            name: department.name.clone(),
            canonical: department.canonical.to_string(),
            count: department.count,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::NameTable;
    use crate::types::{AgentRecord, DepartmentPolygon};
    use geo::{polygon, MultiPolygon};

    fn state() -> Arc<AppState> {
        let agents: Vec<AgentRecord> = (0..3)
            .map(|i| AgentRecord {
                name: format!("EDS {i}"),
                department: "Antioquia".to_string(),
                agent_type: "EDS".to_string(),
                longitude: Some(-75.5),
                latitude: Some(6.2),
                extra: Vec::new(),
            })
            .collect();
        let polygons = vec![
            DepartmentPolygon {
                name: "ANTIOQUIA".to_string(),
                geometry: MultiPolygon::new(vec![polygon![
                    (x: -77.0, y: 5.0),
                    (x: -74.0, y: 5.0),
                    (x: -74.0, y: 8.0),
                    (x: -77.0, y: 8.0)
                ]]),
            },
            DepartmentPolygon {
                name: "META".to_string(),
                geometry: MultiPolygon::new(vec![polygon![
                    (x: -74.0, y: 2.0),
                    (x: -71.0, y: 2.0),
                    (x: -71.0, y: 4.5),
                    (x: -74.0, y: 4.5)
                ]]),
            },
        ];
        let dashboard = Dashboard::build(&agents, &polygons, &NameTable::builtin());
        Arc::new(AppState::new(dashboard, 10))
    }

    #[test]
    fn locate_finds_containing_department() {
        let state = state();
        assert_eq!(
            locate(&state, -75.5, 6.2),
            Some(LocateResponse {
                name: "ANTIOQUIA".to_string(),
                canonical: "antioquia".to_string(),
                count: 3,
            })
        );
        assert_eq!(locate(&state, -72.0, 3.0).map(|r| r.count), Some(0));
    }

    #[test]
    fn locate_outside_every_department_is_none() {
        let state = state();
        assert_eq!(locate(&state, -60.0, 0.0), None);
        // between the two polygons
        assert_eq!(locate(&state, -73.0, 5.5), None);
    }

    #[tokio::test]
    async fn locate_handler_wraps_lookup() {
        let Json(found) = locate_handler(
            State(state()),
            Query(LocateParams { lat: 3.0, lon: -72.5 }),
        )
        .await;
        assert_eq!(found.map(|r| r.canonical), Some("meta".to_string()));
    }

    #[tokio::test]
    async fn departments_handler_returns_bars() {
        let Json(bars) = departments_handler(State(state())).await;
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].count, 3);
    }
}
