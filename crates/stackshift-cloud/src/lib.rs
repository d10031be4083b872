//! stackshift-cloud: the cloud services the deploy engine talks to.
//!
//! The engine only sees these traits. Each is shared as
//! `Arc<dyn Trait>` between the orchestrating flow and its worker tasks,
//! and reports failures as `CloudError`, whose `NotFound` variant is the
//! not-found signal the reconciler relies on.
//!
//! - **`compute`**: launch templates, compute groups, instance refresh
//! - **`balancer`**: load balancers, target health, capacity units
//! - **`dns`**: weighted records and change batches
//! - **`metrics`**: raw metric sums and the family-agnostic
//!   `TrafficMetrics` view used by canary analysis and health waits
//! - **`sandbox`**: an in-memory provider implementing every trait

pub mod balancer;
pub mod compute;
pub mod dns;
pub mod metrics;
pub mod sandbox;

pub use balancer::{CapacityStatus, LoadBalancerClient, LoadBalancerDescription, LoadBalancerSpec, TargetHealth};
pub use compute::{
    ComputeClient, GroupDescription, GroupSpec, RefreshStatus, TemplateDescription, TemplateSpec,
};
pub use dns::{ChangeStatus, DnsClient, WeightedRecord};
pub use metrics::{
    traffic_metrics, ApplicationMetrics, ClassicMetrics, MetricQuery, MetricsClient, TimeWindow,
    TrafficMetrics,
};
pub use sandbox::{SandboxCloud, SandboxOptions};
