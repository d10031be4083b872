//! Records held in the deployment state document.
//!
//! Every record is keyed by a logical identifier (slot, route identifier
//! or resource name) so the reconciler can prune it independently of the
//! others.

use serde::{Deserialize, Serialize};
use stackshift_core::config::LoadBalancerFamily;
use stackshift_core::{DeployConfig, RouteIdentifier, Slot};

/// The persisted state of one application deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeploymentState {
    /// Incremented once per CLI invocation.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub compute_groups: Vec<ComputeGroupRecord>,
    #[serde(default)]
    pub templates: Vec<TemplateRecord>,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerRecord>,
    #[serde(default)]
    pub routes: Vec<RouteRecord>,
    /// Configuration applied by the last successful deploy.
    #[serde(default)]
    pub deploy_config: Option<DeployConfig>,
}

/// A compute group created for a slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeGroupRecord {
    pub slot: Slot,
    pub name: String,
    /// Name of the launch template the group was created from.
    pub template: String,
    pub fingerprint: String,
    /// State version of the invocation that created the group.
    pub created_version: u64,
}

/// A launch template backing a compute group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateRecord {
    pub name: String,
    pub slot: Slot,
    pub fingerprint: String,
}

/// A load balancer fronting one slot in one DNS namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerRecord {
    pub route: RouteIdentifier,
    pub name: String,
    pub dns_name: String,
    pub family: LoadBalancerFamily,
}

/// A weighted DNS record; `route` doubles as its set identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteRecord {
    pub route: RouteIdentifier,
    pub zone_id: String,
    pub name: String,
    /// DNS name the record points at.
    pub target: String,
    pub ttl: u32,
}

impl DeploymentState {
    /// Whether no cloud resource is recorded.
    pub fn is_empty(&self) -> bool {
        self.compute_groups.is_empty()
            && self.templates.is_empty()
            && self.load_balancers.is_empty()
            && self.routes.is_empty()
    }

    // ── Compute groups ─────────────────────────────────────────────

    /// Newest group recorded for `slot`.
    pub fn group(&self, slot: Slot) -> Option<&ComputeGroupRecord> {
        self.compute_groups
            .iter()
            .filter(|g| g.slot == slot)
            .max_by_key(|g| g.created_version)
    }

    /// Every group recorded for `slot`, oldest first.
    pub fn groups_in(&self, slot: Slot) -> Vec<&ComputeGroupRecord> {
        let mut groups: Vec<_> = self.compute_groups.iter().filter(|g| g.slot == slot).collect();
        groups.sort_by_key(|g| g.created_version);
        groups
    }

    /// Insert or replace a group by name.
    pub fn upsert_group(&mut self, record: ComputeGroupRecord) {
        match self.compute_groups.iter_mut().find(|g| g.name == record.name) {
            Some(existing) => *existing = record,
            None => self.compute_groups.push(record),
        }
    }

    pub fn remove_group(&mut self, name: &str) -> Option<ComputeGroupRecord> {
        let index = self.compute_groups.iter().position(|g| g.name == name)?;
        Some(self.compute_groups.remove(index))
    }

    // ── Templates ──────────────────────────────────────────────────

    pub fn template(&self, name: &str) -> Option<&TemplateRecord> {
        self.templates.iter().find(|t| t.name == name)
    }

    pub fn upsert_template(&mut self, record: TemplateRecord) {
        match self.templates.iter_mut().find(|t| t.name == record.name) {
            Some(existing) => *existing = record,
            None => self.templates.push(record),
        }
    }

    pub fn remove_template(&mut self, name: &str) -> Option<TemplateRecord> {
        let index = self.templates.iter().position(|t| t.name == name)?;
        Some(self.templates.remove(index))
    }

    // ── Load balancers ─────────────────────────────────────────────

    pub fn load_balancer(&self, route: RouteIdentifier) -> Option<&LoadBalancerRecord> {
        self.load_balancers.iter().find(|lb| lb.route == route)
    }

    pub fn upsert_load_balancer(&mut self, record: LoadBalancerRecord) {
        match self.load_balancers.iter_mut().find(|lb| lb.route == record.route) {
            Some(existing) => *existing = record,
            None => self.load_balancers.push(record),
        }
    }

    pub fn remove_load_balancer(&mut self, route: RouteIdentifier) -> Option<LoadBalancerRecord> {
        let index = self.load_balancers.iter().position(|lb| lb.route == route)?;
        Some(self.load_balancers.remove(index))
    }

    // ── Routes ─────────────────────────────────────────────────────

    pub fn route(&self, route: RouteIdentifier) -> Option<&RouteRecord> {
        self.routes.iter().find(|r| r.route == route)
    }

    pub fn upsert_route(&mut self, record: RouteRecord) {
        match self.routes.iter_mut().find(|r| r.route == record.route) {
            Some(existing) => *existing = record,
            None => self.routes.push(record),
        }
    }

    pub fn remove_route(&mut self, route: RouteIdentifier) -> Option<RouteRecord> {
        let index = self.routes.iter().position(|r| r.route == route)?;
        Some(self.routes.remove(index))
    }
}
