//! Canary analysis: error thresholds over a balancer's traffic.

use std::sync::Arc;
use std::time::Duration;

use stackshift_cloud::metrics::{epoch_secs, TimeWindow};
use stackshift_cloud::TrafficMetrics;
use stackshift_core::{DeployError, DeployResult, MetricThreshold, RouteIdentifier, ThresholdKind};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Outcome of one threshold check.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    /// Nothing to judge yet (no requests for a rate threshold).
    Skip,
    Breach(String),
}

/// Judge request and error counts against the threshold.
pub fn evaluate(threshold: &MetricThreshold, requests: u64, errors: u64) -> Verdict {
    match threshold.kind {
        ThresholdKind::Absolute => {
            if errors as f64 > threshold.value {
                Verdict::Breach(format!("{errors} errors exceed the limit of {}", threshold.value))
            } else {
                Verdict::Pass
            }
        }
        ThresholdKind::Percentage => {
            if requests == 0 {
                return Verdict::Skip;
            }
            let rate = errors as f64 / requests as f64 * 100.0;
            if rate > threshold.value {
                Verdict::Breach(format!(
                    "error rate {rate:.2}% ({errors}/{requests}) exceeds {}%",
                    threshold.value
                ))
            } else {
                Verdict::Pass
            }
        }
    }
}

/// Watch one balancer for `duration`, checking the threshold every
/// `poll_interval` over the window since the watch began.
pub async fn watch(
    identifier: RouteIdentifier,
    metrics: Arc<dyn TrafficMetrics>,
    threshold: MetricThreshold,
    duration: Duration,
    poll_interval: Duration,
    phase: String,
) -> DeployResult<()> {
    let window_start = epoch_secs();
    let started = Instant::now();

    loop {
        let remaining = duration.saturating_sub(started.elapsed());
        sleep(poll_interval.min(remaining)).await;

        let window = TimeWindow::since(window_start);
        let requests = metrics.request_count(window).await?;
        let errors = metrics.error_count(window).await?;

        match evaluate(&threshold, requests, errors) {
            Verdict::Breach(detail) => {
                warn!(
                    route = %identifier,
                    load_balancer = metrics.load_balancer(),
                    %phase,
                    %detail,
                    "canary threshold breached"
                );
                return Err(DeployError::CanaryBreach {
                    identifier,
                    phase,
                    detail,
                });
            }
            verdict => {
                debug!(route = %identifier, requests, errors, ?verdict, "canary check");
            }
        }

        if started.elapsed() >= duration {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(kind: ThresholdKind, value: f64) -> MetricThreshold {
        MetricThreshold { kind, value }
    }

    #[test]
    fn absolute_threshold_counts_errors() {
        let t = threshold(ThresholdKind::Absolute, 5.0);
        assert_eq!(evaluate(&t, 0, 5), Verdict::Pass);
        assert!(matches!(evaluate(&t, 0, 6), Verdict::Breach(_)));
    }

    #[test]
    fn percentage_threshold_skips_without_requests() {
        let t = threshold(ThresholdKind::Percentage, 5.0);
        assert_eq!(evaluate(&t, 0, 3), Verdict::Skip);
        assert_eq!(evaluate(&t, 100, 5), Verdict::Pass);
        match evaluate(&t, 100, 6) {
            Verdict::Breach(detail) => assert_eq!(detail, "error rate 6.00% (6/100) exceeds 5%"),
            other => panic!("expected breach, got {other:?}"),
        }
    }
}
