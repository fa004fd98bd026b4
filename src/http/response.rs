//! Response construction.
//!
//! # Design Decisions
//! - Backend responses stream through; only hop-by-hop headers are removed
//! - Proxy-generated errors are short plain-text bodies
//! - Status passed through unchanged, 5xx included

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::body::Incoming;

use crate::resilience::timeouts::with_receive_timeout;
use crate::security::headers::strip_hop_by_hop;

/// A proxy-generated error response.
pub fn error_response(status: StatusCode, message: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], message).into_response()
}

/// 429 with a whole-second `Retry-After`.
pub fn too_many_requests(retry_after: Duration) -> Response {
    let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    let secs = retry_after.as_secs().max(1);
    if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

/// Turn a backend response into the client response. `on_receive_failure` runs if the
/// body stalls for longer than `receive_idle` or breaks mid-stream.
pub fn from_backend<F>(
    response: hyper::Response<Incoming>,
    receive_idle: Duration,
    on_receive_failure: F,
) -> Response
where
    F: FnOnce() + Send + 'static,
{
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    let body = with_receive_timeout(Body::new(body), receive_idle, on_receive_failure);
    Response::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_is_at_least_one_second() {
        let response = too_many_requests(Duration::from_millis(10));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");

        let response = too_many_requests(Duration::from_secs(3));
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }

    #[test]
    fn errors_are_plain_text() {
        let response = error_response(StatusCode::SERVICE_UNAVAILABLE, "No healthy backends");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
