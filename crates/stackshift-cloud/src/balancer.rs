//! Load balancers fronting the compute groups.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackshift_core::{CloudResult, LoadBalancerFamily};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    pub name: String,
    pub family: LoadBalancerFamily,
    /// Reachable only from inside the network.
    pub internal: bool,
    pub health_check_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerDescription {
    pub name: String,
    pub dns_name: String,
    pub family: LoadBalancerFamily,
    pub capacity_units: u32,
}

/// Registered targets by health state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHealth {
    pub healthy: u32,
    pub unhealthy: u32,
    pub draining: u32,
}

impl TargetHealth {
    /// Targets still receiving or finishing traffic.
    pub fn non_draining(&self) -> u32 {
        self.healthy + self.unhealthy
    }
}

/// Whether requested capacity units are in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityStatus {
    Pending,
    Provisioned,
}

#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> CloudResult<LoadBalancerDescription>;

    async fn describe_load_balancer(&self, name: &str) -> CloudResult<LoadBalancerDescription>;

    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()>;

    async fn target_health(&self, name: &str) -> CloudResult<TargetHealth>;

    /// Reserve capacity units. Zero releases any reservation.
    async fn set_capacity_units(&self, name: &str, units: u32) -> CloudResult<()>;

    async fn capacity_status(&self, name: &str) -> CloudResult<CapacityStatus>;
}
