//! Request body limits.
//!
//! Bodies are buffered so a retry can replay them, which makes the size limit a memory
//! bound as well. A declared `Content-Length` above the limit is rejected before reading.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap};
use futures_util::StreamExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    Read(String),
}

/// True when the declared length is already over `limit`.
pub fn declared_too_large(headers: &HeaderMap, limit: usize) -> bool {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|len| len > limit as u64)
}

/// Buffer the whole body, failing once it grows past `limit`.
pub async fn read_body(body: Body, limit: usize) -> Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buffered = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BodyError::Read(e.to_string()))?;
        if buffered.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge { limit });
        }
        buffered.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn reads_body_within_limit() {
        let bytes = read_body(Body::from("hello"), 5).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let result = read_body(Body::from(vec![0u8; 11]), 10).await;
        assert!(matches!(result, Err(BodyError::TooLarge { limit: 10 })));
    }

    #[test]
    fn declared_length_check() {
        let mut headers = HeaderMap::new();
        assert!(!declared_too_large(&headers, 10));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("11"));
        assert!(declared_too_large(&headers, 10));
        assert!(!declared_too_large(&headers, 11));
    }
}
