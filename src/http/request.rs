//! Per-request context and request ids.
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing (outermost layer)
//! - A client-supplied `x-request-id` is kept
//! - The context lives only as long as the request

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::extract::ConnectInfo;
use axum::http::{header, HeaderValue, Method, Request};
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Generates UUID v4 request ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// How a client-facing request ended. One label per request on `edge_requests_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// First attempt succeeded.
    Success,
    /// Succeeded after at least one failed attempt.
    Retry,
    /// Every attempt failed, or the request itself was unacceptable.
    Failure,
    RateLimited,
    /// No route, or no eligible backend behind it.
    NoRoute,
}

impl RequestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Retry => "retry",
            RequestOutcome::Failure => "failure",
            RequestOutcome::RateLimited => "rate_limited",
            RequestOutcome::NoRoute => "no_route",
        }
    }
}

/// What the proxy knows about a request while handling it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_ip: Option<IpAddr>,
    pub method: Method,
    pub host: Option<String>,
    pub path: String,
    pub start: Instant,
    pub route: Option<String>,
    /// Backends tried, in order.
    pub backends: Vec<String>,
    pub outcome: RequestOutcome,
    /// Why the request failed, if it did.
    pub error: Option<String>,
}

impl RequestContext {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let request_id = request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| request.uri().authority().map(|a| a.as_str()))
            .map(str::to_string);

        Self {
            request_id,
            client_ip,
            method: request.method().clone(),
            host,
            path: request.uri().path().to_string(),
            start: Instant::now(),
            route: None,
            backends: Vec::new(),
            outcome: RequestOutcome::Failure,
            error: None,
        }
    }

    /// Rate limiting key: the peer IP.
    pub fn client_key(&self) -> String {
        self.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn attempts(&self) -> usize {
        self.backends.len()
    }
}
