use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::analysis::{AnalysisIndex, KernelKind};
use crate::hub::HubHandle;
use crate::infrastructure::config::ServerSettings;
use crate::kernel::{KernelStatus, StatusBoard};
use crate::ws::handler::{upgrade, ws_router};

/// What `GET /` lists.
#[derive(Debug, Clone, Default)]
pub struct IndexPage {
    title: Option<String>,
    description: Option<String>,
    names: HashSet<String>,
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize)]
struct IndexEntry {
    name: String,
    title: Option<String>,
    description: Option<String>,
    kernel: KernelKind,
    #[serde(skip)]
    show_in_index: bool,
}

#[derive(Debug, Serialize)]
struct IndexEntryView<'a> {
    #[serde(flatten)]
    entry: &'a IndexEntry,
    available: bool,
    kernel_status: Option<KernelStatus>,
}

#[derive(Debug, Serialize)]
struct IndexView<'a> {
    title: Option<&'a str>,
    description: Option<&'a str>,
    analyses: Vec<IndexEntryView<'a>>,
}

impl IndexPage {
    /// Builds the page from a loaded index.
    #[must_use]
    pub fn from_index(index: &AnalysisIndex) -> Self {
        let entries: Vec<IndexEntry> = index
            .analyses
            .iter()
            .map(|a| IndexEntry {
                name: a.name.clone(),
                title: a.title.clone(),
                description: a.description.clone(),
                kernel: a.kernel,
                show_in_index: a.show_in_index,
            })
            .collect();
        Self {
            title: index.title.clone(),
            description: index.description.clone(),
            names: entries.iter().map(|e| e.name.clone()).collect(),
            entries,
        }
    }

    /// Returns true if `name` is a declared analysis.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// Shared state of every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    hub: HubHandle,
    index: Arc<IndexPage>,
    statuses: StatusBoard,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Bundles the handles the HTTP layer needs.
    #[must_use]
    pub fn new(
        hub: HubHandle,
        index: IndexPage,
        statuses: StatusBoard,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            hub,
            index: Arc::new(index),
            statuses,
            metrics,
        }
    }

    /// Hub handle for browser connections.
    #[must_use]
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Declared analyses.
    #[must_use]
    pub fn index(&self) -> &IndexPage {
        &self.index
    }
}

async fn health_check() -> &'static str {
    "OK"
}

async fn readiness(State(state): State<AppState>) -> Response {
    match state.hub.availability().await {
        Ok(_) => "OK".into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn metrics_page(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn index_page(State(state): State<AppState>) -> Response {
    let availability = match state.hub.availability().await {
        Ok(availability) => availability,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };
    let page = &state.index;
    let view = IndexView {
        title: page.title.as_deref(),
        description: page.description.as_deref(),
        analyses: page
            .entries
            .iter()
            .filter(|e| e.show_in_index)
            .map(|entry| IndexEntryView {
                entry,
                available: availability.get(&entry.name).copied().unwrap_or(false),
                kernel_status: state.statuses.get(&entry.name),
            })
            .collect(),
    };
    Json(view).into_response()
}

/// Builds the full application router.
///
/// `extra_routes` are nested under `/<name>/`; each nested router also gets
/// the analysis' `/ws` endpoint, so extra routes must not define `/ws`.
pub fn build_router(state: AppState, extra_routes: Vec<(String, Router)>) -> Router {
    let control_plane = Router::new()
        .route("/", get(index_page))
        .route("/health/live", get(health_check))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(metrics_page))
        .with_state(state.clone());

    let mut app = control_plane.merge(ws_router(state.clone()));

    for (name, routes) in extra_routes {
        let ws_state = state.clone();
        let ws_name = name.clone();
        let ws_route = Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| {
                let (name, state) = (ws_name.clone(), ws_state.clone());
                async move { upgrade(ws, name, state) }
            }),
        );
        tracing::debug!(analysis = %name, "extra routes mounted");
        app = app.nest(&format!("/{name}"), routes.merge(ws_route));
    }
    app
}

/// Serves `app` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails to start or encounters an error while running.
pub async fn run_server(
    config: &ServerSettings,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config.bind_address().parse()?;

    tracing::info!("Dashboard listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
