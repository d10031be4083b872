//! Compute groups and the launch templates they are created from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackshift_core::CloudResult;

/// Request to create a launch template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    #[serde(default)]
    pub user_data: Option<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDescription {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub fingerprint: String,
}

/// Request to create a compute group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub template: String,
    pub desired_capacity: u32,
    pub health_check_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDescription {
    pub name: String,
    pub template: String,
    pub desired_capacity: u32,
    /// Instances the group itself reports as healthy.
    pub healthy_count: u32,
    /// Load balancers the group is registered with.
    pub load_balancers: Vec<String>,
}

impl GroupDescription {
    /// Whether the group receives traffic from any balancer.
    pub fn is_attached(&self) -> bool {
        !self.load_balancers.is_empty()
    }
}

/// Progress of an instance refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Pending,
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

impl RefreshStatus {
    /// Whether the refresh has stopped, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RefreshStatus::Successful | RefreshStatus::Failed | RefreshStatus::Cancelled
        )
    }
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn create_template(&self, spec: &TemplateSpec) -> CloudResult<TemplateDescription>;

    async fn describe_template(&self, name: &str) -> CloudResult<TemplateDescription>;

    async fn delete_template(&self, name: &str) -> CloudResult<()>;

    /// Create a group. It is not registered with any balancer yet.
    async fn create_group(&self, spec: &GroupSpec) -> CloudResult<GroupDescription>;

    async fn describe_group(&self, name: &str) -> CloudResult<GroupDescription>;

    /// Register the group with the given balancers. Already registered
    /// balancers are left alone.
    async fn attach_load_balancers(&self, group: &str, load_balancers: &[String]) -> CloudResult<()>;

    async fn set_desired_capacity(&self, group: &str, capacity: u32) -> CloudResult<()>;

    async fn delete_group(&self, name: &str) -> CloudResult<()>;

    /// Replace every instance of the group, keeping at least
    /// `min_healthy_percent` of its capacity in service. Returns the
    /// refresh id.
    async fn start_instance_refresh(&self, group: &str, min_healthy_percent: u32) -> CloudResult<String>;

    async fn describe_instance_refresh(&self, group: &str, refresh_id: &str) -> CloudResult<RefreshStatus>;
}
