//! Request gateway in front of a worker pool.
//!
//! The gateway is transport-neutral: [`Gateway::handle`] takes a
//! [`GatewayRequest`] and returns a [`GatewayResponse`]. The axum adapter in
//! [`http`] converts to and from real HTTP.

pub mod http;
pub mod middleware;

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::RelayvisorError;
use crate::events::{EventBus, EventContext, EventKind};
use crate::payload::Payload;
use crate::pool::Pool;

/// Header map keyed by lowercase name; repeated headers keep every value.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Inbound request as seen by middleware and workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRequest {
    pub remote_addr: String,
    pub protocol: String,
    pub method: String,
    pub uri: String,
    pub path: String,
    pub query: String,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl GatewayRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (uri.clone(), String::new()),
        };
        Self {
            protocol: "HTTP/1.1".to_string(),
            method: method.into(),
            uri,
            path,
            query,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Encode as a pool payload: JSON metadata in the context, raw body as body.
    fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        Ok(Payload::new(serde_json::to_vec(self)?, self.body.clone()))
    }
}

/// Outbound response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl GatewayResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Plain-text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, body.into()).with_header("content-type", "text/plain; charset=utf-8")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Response metadata a worker returns in the payload context.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResponseContext {
    status: Option<u16>,
    headers: Headers,
}

/// Inspects a request before it reaches the pool.
///
/// Returning a response short-circuits the chain; the pool is not touched.
pub trait Middleware: Send + Sync {
    fn handle(&self, request: &GatewayRequest) -> Option<GatewayResponse>;
}

impl<F> Middleware for F
where
    F: Fn(&GatewayRequest) -> Option<GatewayResponse> + Send + Sync,
{
    fn handle(&self, request: &GatewayRequest) -> Option<GatewayResponse> {
        self(request)
    }
}

pub struct Gateway {
    pool: RwLock<Arc<Pool>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    events: EventBus,
}

impl Gateway {
    pub fn new(pool: Arc<Pool>, events: EventBus) -> Self {
        Self {
            pool: RwLock::new(pool),
            middleware: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Append a middleware; middleware runs in registration order.
    pub fn add_middleware(&self, middleware: impl Middleware + 'static) {
        self.middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(middleware));
    }

    /// Current pool.
    pub fn pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Route new requests to `pool` and return the previous one.
    ///
    /// Requests already running on the old pool are unaffected.
    pub fn swap_pool(&self, pool: Arc<Pool>) -> Arc<Pool> {
        let mut current = self.pool.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, pool)
    }

    /// Serve one request. Blocks while the pool runs the job.
    pub fn handle(&self, request: &GatewayRequest) -> GatewayResponse {
        let chain: Vec<Arc<dyn Middleware>> = self
            .middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for middleware in chain {
            if let Some(response) = middleware.handle(request) {
                debug!(path = %request.path, status = response.status, "Request handled by middleware");
                return response;
            }
        }

        let payload = match request.to_payload() {
            Ok(payload) => payload,
            Err(e) => return self.fail(request, &RelayvisorError::Json(e)),
        };

        let pool = self.pool();
        match pool.exec(&payload) {
            Ok(response) => match into_response(response) {
                Ok(response) => response,
                Err(e) => self.fail(request, &e),
            },
            Err(e) => self.fail(request, &e),
        }
    }

    fn fail(&self, request: &GatewayRequest, err: &RelayvisorError) -> GatewayResponse {
        let status = if err.is_backpressure() { 503 } else { 500 };
        if status == 503 {
            warn!(method = %request.method, uri = %request.uri, error = %err, "Request rejected");
        } else {
            error!(method = %request.method, uri = %request.uri, error = %err, "Request failed");
        }
        self.events.emit(
            EventKind::Error,
            EventContext::Error {
                message: format!("{} {}: {}", request.method, request.uri, err),
            },
        );

        let message = if status == 503 {
            "Service Unavailable"
        } else {
            "Internal Server Error"
        };
        GatewayResponse::text(status, message)
    }
}

/// Decode a worker payload into a response.
fn into_response(payload: Payload) -> Result<GatewayResponse, RelayvisorError> {
    let (context, body) = payload.into_parts();
    let context: ResponseContext = if context.is_empty() {
        ResponseContext::default()
    } else {
        serde_json::from_slice(&context).map_err(|e| {
            RelayvisorError::Job(format!("invalid response context from worker: {}", e))
        })?
    };
    Ok(GatewayResponse {
        status: context.status.unwrap_or(200),
        headers: context.headers,
        body,
    })
}
