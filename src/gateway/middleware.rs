//! Request correlation ids for the HTTP gateway.

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

/// Header carrying the correlation id.
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Longest client-supplied id that is reused as-is.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id stored in request extensions and forwarded to workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Client-supplied id, if it is short printable ASCII.
fn incoming_id(request: &Request<Body>) -> Option<String> {
    let id = request.headers().get(&X_REQUEST_ID)?.to_str().ok()?;
    let usable = !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id.bytes().all(|b| b.is_ascii_graphic());
    usable.then(|| id.to_string())
}

/// Tag each request with a correlation id.
///
/// Reuses a well-formed incoming `X-Request-ID`, otherwise generates a UUIDv4.
/// The id lands in request extensions and on the request span, and is echoed
/// in the response header.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = incoming_id(&request).unwrap_or_else(|| Uuid::new_v4().to_string());
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let span = tracing::info_span!(
        "gateway_request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), value);
    }
    response
}
