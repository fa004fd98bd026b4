//! Timeout enforcement.
//!
//! # Responsibilities
//! - Per-attempt connect and send deadlines
//! - Idle deadline between response body chunks
//! - Overall request deadline
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - A body that stalls after the response head is cut off and reported

use std::time::Duration;

use axum::body::{Body, Bytes};
use futures_util::{stream, Stream, StreamExt};
use thiserror::Error;

use crate::config::TimeoutConfig;

/// Where an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    /// Establishing the TCP connection.
    Connect,
    /// Writing the request until the response head arrives.
    Send,
    /// Streaming the response body.
    Receive,
}

impl AttemptPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptPhase::Connect => "connect",
            AttemptPhase::Send => "send",
            AttemptPhase::Receive => "receive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub connect: Duration,
    pub send: Duration,
    pub receive: Duration,
    /// Deadline for the whole client-facing request.
    pub request: Duration,
}

impl PhaseTimeouts {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_secs),
            send: Duration::from_secs(config.send_secs),
            receive: Duration::from_secs(config.receive_secs),
            request: Duration::from_secs(config.request_secs),
        }
    }

    /// Budget for connecting plus writing, until the response head.
    pub fn head_deadline(&self) -> Duration {
        self.connect + self.send
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("no response data for {0:?}")]
    Idle(Duration),

    #[error("upstream body error: {0}")]
    Upstream(String),
}

struct Receive<S, F> {
    inner: S,
    idle: Duration,
    on_failure: Option<F>,
    done: bool,
}

/// Wrap a response body so that an idle gap longer than `idle` ends the stream with an
/// error. `on_failure` runs once if the body times out or breaks.
pub fn with_receive_timeout<F>(body: Body, idle: Duration, on_failure: F) -> Body
where
    F: FnOnce() + Send + 'static,
{
    let inner = body.into_data_stream();
    let state = Receive {
        inner,
        idle,
        on_failure: Some(on_failure),
        done: false,
    };
    Body::from_stream(receive_stream(state))
}

fn receive_stream<S, E, F>(state: Receive<S, F>) -> impl Stream<Item = Result<Bytes, ReceiveError>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
    F: FnOnce(),
{
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let error = match tokio::time::timeout(state.idle, state.inner.next()).await {
            Ok(Some(Ok(chunk))) => return Some((Ok(chunk), state)),
            Ok(None) => return None,
            Ok(Some(Err(e))) => ReceiveError::Upstream(e.to_string()),
            Err(_) => ReceiveError::Idle(state.idle),
        };
        state.done = true;
        if let Some(on_failure) = state.on_failure.take() {
            on_failure();
        }
        Some((Err(error), state))
    })
}
