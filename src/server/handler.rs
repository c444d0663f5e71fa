// Axum request handlers: translate player HTTP requests into gateway operations.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use super::range::Negotiated;
use crate::config::STREAM_CONTENT_TYPE;
use crate::engine::gateway::Gateway;
use crate::error::GatewayError;

pub struct GatewayServer {
    port: u16,
    gateway: Arc<Gateway>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    serve_task: JoinHandle<()>,
    maintenance: Vec<JoinHandle<()>>,
}

impl GatewayServer {
    /// Bind `addr`, start serving and start the background sweepers.
    pub async fn start(gateway: Arc<Gateway>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(Arc::clone(&gateway));

        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("http server stopped: {}", e);
            }
        });
        let maintenance = gateway.spawn_maintenance();
        info!("gateway listening on {}:{}", addr.ip(), port);

        Ok(Self {
            port,
            gateway,
            shutdown_tx: Some(shutdown_tx),
            serve_task,
            maintenance,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Build a local stream URL for `magnet`.
    pub fn url_for_magnet(&self, magnet: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("magnet", magnet)
            .finish();
        format!("http://127.0.0.1:{}/stream?{}", self.port, query)
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// End live streams, stop accepting requests and wait for the server task.
    pub async fn shutdown(mut self) {
        self.gateway.shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.serve_task).await {
            warn!("server task ended abnormally: {}", e);
        }
        for task in self.maintenance.drain(..) {
            let _ = task.await;
        }
    }
}

/// Routes: `GET|HEAD /stream?magnet=...` and `GET /health`.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/stream", get(stream_handler).head(head_handler))
        .route("/health", get(health_handler))
        .layer(middleware::map_response(add_cors_headers))
        .with_state(gateway)
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    magnet: Option<String>,
}

/// GET /stream: resolve the magnet and stream the negotiated window.
async fn stream_handler(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let range = range_header(&headers);
    let prepared = match gateway.prepare(query.magnet.as_deref(), range).await {
        Ok(prepared) => prepared,
        Err(e) => return error_response(e),
    };

    let negotiated = prepared.negotiated;
    let (status, resp_headers) = stream_head(&gateway, &negotiated);

    match gateway.open_stream(prepared).await {
        Ok(Some(bridge)) => {
            debug!(
                "connection {} streaming {} bytes",
                bridge.connection().id(),
                negotiated.content_length()
            );
            (status, resp_headers, Body::from_stream(bridge)).into_response()
        }
        Ok(None) => (status, resp_headers, Body::empty()).into_response(),
        Err(e) => error_response(e),
    }
}

/// HEAD /stream: same negotiation as GET without opening a byte source.
async fn head_handler(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let range = range_header(&headers);
    match gateway.prepare(query.magnet.as_deref(), range).await {
        Ok(prepared) => {
            let (status, resp_headers) = stream_head(&gateway, &prepared.negotiated);
            (status, resp_headers).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

fn stream_head(gateway: &Gateway, negotiated: &Negotiated) -> (StatusCode, HeaderMap) {
    let status = if negotiated.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut resp_headers = HeaderMap::new();
    resp_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(STREAM_CONTENT_TYPE),
    );
    resp_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    resp_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(negotiated.content_length()),
    );
    if let Some(content_range) = negotiated.content_range() {
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            resp_headers.insert(header::CONTENT_RANGE, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&format!(
        "public, max-age={}",
        gateway.config().session_ttl_secs
    )) {
        resp_headers.insert(header::CACHE_CONTROL, value);
    }
    (status, resp_headers)
}

fn error_response(err: GatewayError) -> Response {
    match &err {
        GatewayError::InvalidLocator(_)
        | GatewayError::ContentBlocked { .. }
        | GatewayError::RangeNotSatisfiable { .. } => debug!("request rejected: {}", err),
        _ => warn!("request failed: {}", err),
    }
    err.into_response()
}

async fn add_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD"),
    );
    response
}
