//! Passive health checking (failure detection on the request path).
//!
//! The router never touches pool state directly. Failed attempts are sent to the health
//! monitor as messages; the monitor applies them through the same update call as probe
//! outcomes.

use tokio::sync::mpsc;

use crate::health::state::HealthOutcome;

/// One observation about a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub backend_id: String,
    pub outcome: HealthOutcome,
}

/// Cloneable handle the request path uses to report failed attempts.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    tx: mpsc::UnboundedSender<HealthReport>,
}

impl HealthReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HealthReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report_failure(&self, backend_id: &str) {
        let report = HealthReport {
            backend_id: backend_id.to_string(),
            outcome: HealthOutcome::RequestFailed,
        };
        if self.tx.send(report).is_err() {
            tracing::debug!(backend = %backend_id, "Health monitor stopped, dropping failure report");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_arrive_in_order() {
        let (reporter, mut rx) = HealthReporter::channel();
        reporter.report_failure("b1");
        reporter.clone().report_failure("b2");

        assert_eq!(rx.recv().await.unwrap().backend_id, "b1");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.backend_id, "b2");
        assert_eq!(second.outcome, HealthOutcome::RequestFailed);
    }

    #[test]
    fn reporting_after_monitor_stops_is_harmless() {
        let (reporter, rx) = HealthReporter::channel();
        drop(rx);
        reporter.report_failure("b1");
    }
}
