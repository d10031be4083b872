//! Metric sums and the family-agnostic traffic view.
//!
//! Classic and application load balancers publish request and error
//! counts under different namespaces, metric names and dimensions.
//! `TrafficMetrics` hides that so canary analysis and health waits never
//! branch on the family.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackshift_core::{CloudResult, LoadBalancerFamily};

use crate::balancer::LoadBalancerClient;

/// Half-open interval `[start, end)` in seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: u64,
    pub end: u64,
}

impl TimeWindow {
    /// From `start` until now.
    pub fn since(start: u64) -> Self {
        Self {
            start,
            end: epoch_secs().max(start),
        }
    }
}

/// Current wall-clock time in seconds since the epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub namespace: String,
    pub metric: String,
    pub dimension: String,
    pub dimension_value: String,
    pub window: TimeWindow,
}

#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Sum of the metric over the window. No datapoints sums to zero.
    async fn sum(&self, query: &MetricQuery) -> CloudResult<f64>;
}

/// Request, error and health counts of one load balancer.
#[async_trait]
pub trait TrafficMetrics: Send + Sync {
    fn load_balancer(&self) -> &str;

    async fn request_count(&self, window: TimeWindow) -> CloudResult<u64>;

    /// Server errors, whether returned by the targets or the balancer.
    async fn error_count(&self, window: TimeWindow) -> CloudResult<u64>;

    async fn healthy_target_count(&self) -> CloudResult<u32>;
}

/// Metric names of one load balancer family.
struct MetricNames {
    namespace: &'static str,
    dimension: &'static str,
    requests: &'static str,
    errors: [&'static str; 2],
}

static CLASSIC: MetricNames = MetricNames {
    namespace: "AWS/ELB",
    dimension: "LoadBalancerName",
    requests: "RequestCount",
    errors: ["HTTPCode_Backend_5XX", "HTTPCode_ELB_5XX"],
};

static APPLICATION: MetricNames = MetricNames {
    namespace: "AWS/ApplicationELB",
    dimension: "LoadBalancer",
    requests: "RequestCount",
    errors: ["HTTPCode_Target_5XX_Count", "HTTPCode_ELB_5XX_Count"],
};

/// Shared plumbing of the two family implementations.
struct BalancerMetrics {
    names: &'static MetricNames,
    load_balancer: String,
    metrics: Arc<dyn MetricsClient>,
    balancers: Arc<dyn LoadBalancerClient>,
}

impl BalancerMetrics {
    fn query(&self, metric: &str, window: TimeWindow) -> MetricQuery {
        MetricQuery {
            namespace: self.names.namespace.to_string(),
            metric: metric.to_string(),
            dimension: self.names.dimension.to_string(),
            dimension_value: self.load_balancer.clone(),
            window,
        }
    }

    async fn count(&self, metric: &str, window: TimeWindow) -> CloudResult<u64> {
        let sum = self.metrics.sum(&self.query(metric, window)).await?;
        Ok(sum.max(0.0).round() as u64)
    }

    async fn request_count(&self, window: TimeWindow) -> CloudResult<u64> {
        self.count(self.names.requests, window).await
    }

    async fn error_count(&self, window: TimeWindow) -> CloudResult<u64> {
        let mut total = 0;
        for metric in self.names.errors {
            total += self.count(metric, window).await?;
        }
        Ok(total)
    }

    async fn healthy_target_count(&self) -> CloudResult<u32> {
        Ok(self.balancers.target_health(&self.load_balancer).await?.healthy)
    }
}

/// Traffic metrics of a classic load balancer.
pub struct ClassicMetrics(BalancerMetrics);

impl ClassicMetrics {
    pub fn new(
        load_balancer: impl Into<String>,
        metrics: Arc<dyn MetricsClient>,
        balancers: Arc<dyn LoadBalancerClient>,
    ) -> Self {
        Self(BalancerMetrics {
            names: &CLASSIC,
            load_balancer: load_balancer.into(),
            metrics,
            balancers,
        })
    }
}

#[async_trait]
impl TrafficMetrics for ClassicMetrics {
    fn load_balancer(&self) -> &str {
        &self.0.load_balancer
    }

    async fn request_count(&self, window: TimeWindow) -> CloudResult<u64> {
        self.0.request_count(window).await
    }

    async fn error_count(&self, window: TimeWindow) -> CloudResult<u64> {
        self.0.error_count(window).await
    }

    async fn healthy_target_count(&self) -> CloudResult<u32> {
        self.0.healthy_target_count().await
    }
}

/// Traffic metrics of an application load balancer.
pub struct ApplicationMetrics(BalancerMetrics);

impl ApplicationMetrics {
    pub fn new(
        load_balancer: impl Into<String>,
        metrics: Arc<dyn MetricsClient>,
        balancers: Arc<dyn LoadBalancerClient>,
    ) -> Self {
        Self(BalancerMetrics {
            names: &APPLICATION,
            load_balancer: load_balancer.into(),
            metrics,
            balancers,
        })
    }
}

#[async_trait]
impl TrafficMetrics for ApplicationMetrics {
    fn load_balancer(&self) -> &str {
        &self.0.load_balancer
    }

    async fn request_count(&self, window: TimeWindow) -> CloudResult<u64> {
        self.0.request_count(window).await
    }

    async fn error_count(&self, window: TimeWindow) -> CloudResult<u64> {
        self.0.error_count(window).await
    }

    async fn healthy_target_count(&self) -> CloudResult<u32> {
        self.0.healthy_target_count().await
    }
}

/// The traffic view matching a balancer's family.
pub fn traffic_metrics(
    family: LoadBalancerFamily,
    load_balancer: &str,
    metrics: Arc<dyn MetricsClient>,
    balancers: Arc<dyn LoadBalancerClient>,
) -> Arc<dyn TrafficMetrics> {
    match family {
        LoadBalancerFamily::Classic => Arc::new(ClassicMetrics::new(load_balancer, metrics, balancers)),
        LoadBalancerFamily::Application => {
            Arc::new(ApplicationMetrics::new(load_balancer, metrics, balancers))
        }
    }
}
