//! Forwarding to backends with retry.
//!
//! # Responsibilities
//! - Build the outbound request for each attempt
//! - Enforce connect and send deadlines per attempt
//! - Walk the rotation plan, one backend per attempt
//! - Report every failed attempt to the health monitor

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{request::Parts, HeaderMap, Method, Request};
use axum::response::Response;
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{self, connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;

use crate::health::passive::HealthReporter;
use crate::http::request::RequestContext;
use crate::http::response;
use crate::load_balancer::backend::Backend;
use crate::observability::metrics;
use crate::resilience::{AttemptPhase, PhaseTimeouts, RetryPolicy};
use crate::security::headers::{apply_forwarded, strip_hop_by_hop};

pub type UpstreamClient = Client<HttpConnector, Body>;

/// Pooled HTTP client with the connect deadline applied.
pub fn build_client(timeouts: &PhaseTimeouts) -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(timeouts.connect));
    connector.set_nodelay(true);
    Client::builder(TokioExecutor::new()).build(connector)
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connect to {backend} failed: {source}")]
    Connect {
        backend: String,
        source: legacy::Error,
    },

    #[error("{backend} sent no response head within {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("request to {backend} failed: {source}")]
    Upstream {
        backend: String,
        source: legacy::Error,
    },

    #[error("could not build upstream request: {0}")]
    Build(#[from] axum::http::Error),

    #[error("no backend to try")]
    NoBackend,
}

impl ForwardError {
    /// The attempt phase that failed. `None` when no attempt reached the network.
    pub fn phase(&self) -> Option<AttemptPhase> {
        match self {
            ForwardError::Connect { .. } => Some(AttemptPhase::Connect),
            ForwardError::Timeout { .. } | ForwardError::Upstream { .. } => Some(AttemptPhase::Send),
            ForwardError::Build(_) | ForwardError::NoBackend => None,
        }
    }
}

/// The replayable part of a client request.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn new(parts: &Parts, body: Bytes, client_ip: Option<IpAddr>) -> Self {
        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        apply_forwarded(&mut headers, client_ip, "http");

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            method: parts.method.clone(),
            path_and_query,
            headers,
            body,
        }
    }

    fn to_backend(&self, backend: &Backend) -> Result<Request<Body>, axum::http::Error> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(format!("http://{}{}", backend.address, self.path_and_query));
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers.clone());
        }
        builder.body(Body::from(self.body.clone()))
    }
}

/// Sends requests to backends, retrying transport failures on the next backend.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: UpstreamClient,
    retry: RetryPolicy,
    timeouts: PhaseTimeouts,
    reporter: HealthReporter,
}

impl Forwarder {
    pub fn new(retry: RetryPolicy, timeouts: PhaseTimeouts, reporter: HealthReporter) -> Self {
        Self {
            client: build_client(&timeouts),
            retry,
            timeouts,
            reporter,
        }
    }

    /// Forward along `plan`. Attempt `n` goes to `plan[n % plan.len()]`.
    pub async fn forward(
        &self,
        ctx: &mut RequestContext,
        request: &ForwardRequest,
        plan: &[Arc<Backend>],
    ) -> Result<Response, ForwardError> {
        if plan.is_empty() {
            return Err(ForwardError::NoBackend);
        }

        let mut attempt: u32 = 0;
        loop {
            let backend = &plan[attempt as usize % plan.len()];
            attempt += 1;
            ctx.backends.push(backend.id.clone());
            metrics::record_attempt(&backend.id);

            let (error, phase) = match self.attempt(backend, request).await {
                Ok(upstream) => return Ok(self.stream_back(ctx, backend, upstream)),
                Err(error) => match error.phase() {
                    Some(phase) => (error, phase),
                    None => return Err(error),
                },
            };

            metrics::record_backend_failure(&backend.id);
            self.reporter.report_failure(&backend.id);

            let retry = self.retry.should_retry(&request.method, phase, attempt);
            tracing::warn!(
                request_id = %ctx.request_id,
                backend = %backend.id,
                attempt,
                phase = phase.as_str(),
                error = %error,
                retry,
                "Backend attempt failed"
            );
            if !retry {
                return Err(error);
            }

            let delay = self.retry.delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn attempt(
        &self,
        backend: &Backend,
        request: &ForwardRequest,
    ) -> Result<hyper::Response<Incoming>, ForwardError> {
        let outbound = request.to_backend(backend)?;
        let deadline = self.timeouts.head_deadline();

        match tokio::time::timeout(deadline, self.client.request(outbound)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) if source.is_connect() => Err(ForwardError::Connect {
                backend: backend.id.clone(),
                source,
            }),
            Ok(Err(source)) => Err(ForwardError::Upstream {
                backend: backend.id.clone(),
                source,
            }),
            Err(_) => Err(ForwardError::Timeout {
                backend: backend.id.clone(),
                timeout: deadline,
            }),
        }
    }

    fn stream_back(
        &self,
        ctx: &RequestContext,
        backend: &Backend,
        upstream: hyper::Response<Incoming>,
    ) -> Response {
        let reporter = self.reporter.clone();
        let backend_id = backend.id.clone();
        let request_id = ctx.request_id.clone();

        response::from_backend(upstream, self.timeouts.receive, move || {
            tracing::warn!(
                request_id = %request_id,
                backend = %backend_id,
                "Response body stalled or broke, stream aborted"
            );
            metrics::record_backend_failure(&backend_id);
            reporter.report_failure(&backend_id);
        })
    }
}
