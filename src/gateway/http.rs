//! axum front end for the gateway.
//!
//! Every path and method is routed to [`Gateway::handle`]. Pool calls block,
//! so they run on the blocking thread pool via `spawn_blocking`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::{RequestId, request_id_middleware};
use super::{Gateway, GatewayRequest, GatewayResponse, Headers};
use crate::error::Result;

/// Headers the HTTP layer computes itself; values sent by workers are ignored.
const MANAGED_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

struct HttpState {
    gateway: Arc<Gateway>,
    max_request: usize,
}

/// Build the catch-all router.
pub fn router(gateway: Arc<Gateway>, max_request: usize) -> Router {
    let state = Arc::new(HttpState {
        gateway,
        max_request,
    });
    Router::new()
        .fallback(handle)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_request))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn handle(State(state): State<Arc<HttpState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.max_request).await {
        Ok(body) => body,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response();
        }
    };

    let mut headers = Headers::new();
    for (name, value) in &parts.headers {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let request = GatewayRequest {
        remote_addr: parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.to_string())
            .unwrap_or_default(),
        protocol: format!("{:?}", parts.version),
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        headers,
        request_id: parts.extensions.get::<RequestId>().map(|id| id.0.clone()),
        body: body.to_vec(),
    };

    let gateway = Arc::clone(&state.gateway);
    match tokio::task::spawn_blocking(move || gateway.handle(&request)).await {
        Ok(response) => into_http(response),
        Err(e) => {
            error!(error = %e, "Gateway task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

fn into_http(response: GatewayResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http = Response::new(Body::from(response.body));
    *http.status_mut() = status;

    let headers = http.headers_mut();
    for (name, values) in response.headers {
        if MANAGED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.append(name.clone(), value);
            }
        }
    }
    http
}

/// Serve the gateway on `address` until `shutdown` resolves.
pub async fn serve<F>(
    address: SocketAddr,
    gateway: Arc<Gateway>,
    max_request: usize,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "HTTP gateway listening");

    axum::serve(
        listener,
        router(gateway, max_request).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("HTTP gateway stopped");
    Ok(())
}
