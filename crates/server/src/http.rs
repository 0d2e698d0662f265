//! HTTP surface: health and readiness checks, version, metrics export and the
//! gateway upgrade route.

use std::{sync::Arc, time::Instant};

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header::HeaderName, HeaderMap, HeaderValue},
    response::Response,
    routing::get,
    Json, Router,
};
#[cfg(feature = "metrics")]
use axum::{
    extract::{MatchedPath, Request},
    http::{header::CONTENT_TYPE, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
};
use homeward_storage::StoragePool;
use serde::Serialize;
#[cfg(feature = "metrics")]
use std::net::SocketAddr;
#[cfg(feature = "metrics")]
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    config::ServerConfig,
    socket::{SocketParams, SocketService},
    telemetry::{self, REQUEST_ID_HEADER},
};

const SECURITY_HEADERS: [(&str, &str); 4] = [
    (
        "content-security-policy",
        "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'",
    ),
    ("referrer-policy", "no-referrer"),
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
];

/// Where durable state lives for this process.
#[derive(Clone)]
pub enum Database {
    /// No `database_url`; the gateway runs on the in-memory store.
    InMemory,
    Connected(StoragePool),
    Failed(String),
}

impl Database {
    pub fn pool(&self) -> Option<StoragePool> {
        match self {
            Database::Connected(pool) => Some(pool.clone()),
            Database::InMemory | Database::Failed(_) => None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self, Database::Connected(_))
    }

    fn component(&self) -> ComponentStatus {
        let (status, details) = match self {
            Database::InMemory => (
                "pending",
                "database_url not configured; using in-memory store".to_string(),
            ),
            Database::Connected(_) => ("configured", "connection established".to_string()),
            Database::Failed(message) => ("error", message.clone()),
        };
        ComponentStatus {
            name: "database",
            status,
            details: Some(details),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    started_at: Instant,
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    config: Arc<ServerConfig>,
    database: Database,
    sockets: Arc<SocketService>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    pub fn new(config: Arc<ServerConfig>, database: Database, sockets: Arc<SocketService>) -> Self {
        Self {
            started_at: Instant::now(),
            config,
            database,
            sockets,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics served on the main listener rather than a dedicated one.
    #[cfg(feature = "metrics")]
    fn exports_metrics_inline(&self) -> bool {
        self.config.metrics.enabled && self.config.metrics.bind_addr.is_none()
    }

    fn gateway_component(&self) -> ComponentStatus {
        let capacity = self.sockets.gateway().config().max_connections;
        let free = self.sockets.available_permits();
        ComponentStatus {
            name: "gateway",
            status: if free > 0 { "accepting" } else { "saturated" },
            details: Some(format!("{free} of {capacity} connection slots free")),
        }
    }
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

pub fn router(state: AppState) -> Router {
    let socket = record_http_metrics(
        Router::new().route("/socket", get(gateway_socket)),
        &state,
    );

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut checks = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version));
    #[cfg(feature = "metrics")]
    if state.exports_metrics_inline() {
        checks = checks.route("/metrics", get(export_metrics));
    }

    let mut router = record_http_metrics(checks, &state)
        .merge(socket.clone())
        .nest("/client/v1", socket);

    for (name, value) in SECURITY_HEADERS {
        router = router.layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ));
    }

    // The request id must exist before the trace span opens.
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(PropagateHeaderLayer::new(request_id))
                .layer(telemetry::http_trace_layer()),
        )
        .with_state(state)
}

#[cfg(feature = "metrics")]
fn record_http_metrics(routes: Router<AppState>, state: &AppState) -> Router<AppState> {
    routes.route_layer(middleware::from_fn_with_state(state.clone(), observe_request))
}

#[cfg(not(feature = "metrics"))]
fn record_http_metrics(routes: Router<AppState>, _state: &AppState) -> Router<AppState> {
    routes
}

#[cfg(feature = "metrics")]
async fn observe_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path().to_string(), |path| path.as_str().to_string());
    let started = Instant::now();
    let response = next.run(request).await;
    if let Some(metrics) = &state.metrics {
        metrics.record_http_request(&route, response.status().as_u16(), started.elapsed());
    }
    response
}

async fn health() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = &state.metrics {
        metrics.set_db_ready(state.database.is_connected());
    }

    Json(ReadinessResponse {
        status: if state.database.is_connected() {
            "ready"
        } else {
            "degraded"
        },
        uptime_seconds: state.started_at.elapsed().as_secs(),
        components: vec![state.database.component(), state.gateway_component()],
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn gateway_socket(
    State(state): State<AppState>,
    Query(params): Query<SocketParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    state.sockets.clone().open(params.into_handshake(&headers), ws)
}

#[cfg(feature = "metrics")]
async fn export_metrics(State(state): State<AppState>) -> Response {
    let Some(metrics) = state.metrics.as_ref().filter(|_| state.config.metrics.enabled) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match metrics.encode() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
pub fn metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(export_metrics))
        .with_state(state)
}

/// Serve `/metrics` alone on `bind_addr`.
#[cfg(feature = "metrics")]
pub async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listening");
    axum::serve(listener, metrics_router(state).into_make_service()).await?;
    Ok(())
}
