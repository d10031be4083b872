//! Cloud clients and the per-invocation deploy context.

use std::sync::Arc;

use stackshift_cloud::{
    traffic_metrics, ComputeClient, DnsClient, LoadBalancerClient, MetricsClient, SandboxCloud,
    TrafficMetrics,
};
use stackshift_core::Settings;
use stackshift_state::{DeploymentState, LoadBalancerRecord};
use stackshift_tasks::PollingWaiter;

/// The cloud services an operation talks to.
#[derive(Clone)]
pub struct CloudClients {
    pub compute: Arc<dyn ComputeClient>,
    pub balancers: Arc<dyn LoadBalancerClient>,
    pub dns: Arc<dyn DnsClient>,
    pub metrics: Arc<dyn MetricsClient>,
}

impl CloudClients {
    /// Every client served by one sandbox cloud.
    pub fn sandbox(cloud: Arc<SandboxCloud>) -> Self {
        Self {
            compute: cloud.clone(),
            balancers: cloud.clone(),
            dns: cloud.clone(),
            metrics: cloud,
        }
    }

    /// The family-specific traffic view of a recorded balancer.
    pub fn traffic(&self, balancer: &LoadBalancerRecord) -> Arc<dyn TrafficMetrics> {
        traffic_metrics(
            balancer.family,
            &balancer.name,
            self.metrics.clone(),
            self.balancers.clone(),
        )
    }
}

/// Everything one CLI invocation operates on.
///
/// Built once at process start; the caller persists `state` when the
/// operation finishes, fails or is interrupted.
pub struct DeployContext {
    pub clients: CloudClients,
    pub settings: Settings,
    pub state: DeploymentState,
}

impl DeployContext {
    pub fn new(clients: CloudClients, settings: Settings, state: DeploymentState) -> Self {
        Self {
            clients,
            settings,
            state,
        }
    }

    /// A waiter polling at the configured interval.
    pub fn waiter(&self) -> PollingWaiter {
        PollingWaiter::new(self.settings.poll_interval())
    }
}
