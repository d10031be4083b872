//! SandboxCloud: an in-memory provider for every collaborator trait.
//!
//! Resources behave like an idealised cloud: groups report every desired
//! instance healthy at once, a balancer's healthy targets are the desired
//! capacity of the groups attached to it, and capacity units provision
//! immediately. DNS changes can be made to lag for a configurable number
//! of status polls. A change is forgotten once a status poll has seen it
//! in sync; polling it again reports not found.
//!
//! The resource tables serialize to JSON so the CLI can keep the sandbox
//! alive across invocations. Metric samples, injected failures and the
//! weight history are test instrumentation and are not persisted.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackshift_core::{CloudError, CloudResult, ResourceKind};
use tracing::debug;

use crate::balancer::{
    CapacityStatus, LoadBalancerClient, LoadBalancerDescription, LoadBalancerSpec, TargetHealth,
};
use crate::compute::{
    ComputeClient, GroupDescription, GroupSpec, RefreshStatus, TemplateDescription, TemplateSpec,
};
use crate::dns::{ChangeStatus, DnsClient, WeightedRecord};
use crate::metrics::{MetricQuery, MetricsClient};

/// Behaviour knobs of the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxOptions {
    /// Status polls a DNS change reports `Pending` before `InSync`.
    pub dns_sync_polls: u32,
    /// Terminal status of every instance refresh.
    pub refresh_outcome: RefreshStatus,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            dns_sync_polls: 0,
            refresh_outcome: RefreshStatus::Successful,
        }
    }
}

/// Requests and server errors a balancer reports for any window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct MetricSample {
    requests: f64,
    errors: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Refresh {
    group: String,
    polls: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SandboxData {
    #[serde(default)]
    options: SandboxOptions,
    #[serde(default)]
    templates: BTreeMap<String, TemplateDescription>,
    #[serde(default)]
    groups: BTreeMap<String, GroupDescription>,
    #[serde(default)]
    balancers: BTreeMap<String, LoadBalancerDescription>,
    /// zone id → record key → record
    #[serde(default)]
    zones: BTreeMap<String, BTreeMap<String, WeightedRecord>>,
    /// pending change id → status polls remaining before in sync
    #[serde(default)]
    changes: BTreeMap<String, u32>,
    #[serde(default)]
    refreshes: BTreeMap<String, Refresh>,
    #[serde(default)]
    next_id: u64,

    #[serde(skip)]
    metric_samples: BTreeMap<String, MetricSample>,
    #[serde(skip)]
    metric_queries: u64,
    #[serde(skip)]
    failures: BTreeMap<String, String>,
    #[serde(skip)]
    weight_history: BTreeMap<String, Vec<u32>>,
    #[serde(skip)]
    changes_issued: u64,
}

impl SandboxData {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:06}", self.next_id)
    }

    fn check(&self, operation: &str) -> CloudResult<()> {
        match self.failures.get(operation) {
            Some(message) => Err(CloudError::api(operation, message.clone())),
            None => Ok(()),
        }
    }

    fn new_change(&mut self) -> String {
        let id = self.next_id("change");
        self.changes.insert(id.clone(), self.options.dns_sync_polls);
        self.changes_issued += 1;
        id
    }

    fn group_mut(&mut self, name: &str) -> CloudResult<&mut GroupDescription> {
        self.groups
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(ResourceKind::ComputeGroup, name))
    }

    fn balancer(&self, name: &str) -> CloudResult<&LoadBalancerDescription> {
        self.balancers
            .get(name)
            .ok_or_else(|| CloudError::not_found(ResourceKind::LoadBalancer, name))
    }
}

fn record_key(name: &str, set_identifier: &str) -> String {
    format!("{name}#{set_identifier}")
}

/// In-memory cloud. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct SandboxCloud {
    data: Mutex<SandboxData>,
}

impl SandboxCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SandboxOptions) -> Self {
        let cloud = Self::default();
        cloud.data().options = options;
        cloud
    }

    /// Load a persisted sandbox. A missing file is an empty cloud.
    pub fn load(path: &Path) -> CloudResult<Self> {
        let data = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| CloudError::api("load sandbox", e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SandboxData::default(),
            Err(e) => return Err(CloudError::api("load sandbox", e.to_string())),
        };
        debug!(?path, "sandbox cloud loaded");
        Ok(Self {
            data: Mutex::new(data),
        })
    }

    pub fn save(&self, path: &Path) -> CloudResult<()> {
        let raw = serde_json::to_string_pretty(&*self.data())
            .map_err(|e| CloudError::api("save sandbox", e.to_string()))?;
        fs::write(path, raw).map_err(|e| CloudError::api("save sandbox", e.to_string()))?;
        debug!(?path, "sandbox cloud saved");
        Ok(())
    }

    fn data(&self) -> MutexGuard<'_, SandboxData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Instrumentation ────────────────────────────────────────────

    /// Make every call of `operation` (a trait method name) fail.
    pub fn fail_operation(&self, operation: &str, message: &str) {
        self.data()
            .failures
            .insert(operation.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, operation: &str) {
        self.data().failures.remove(operation);
    }

    /// Requests and errors the balancer reports for every window.
    pub fn set_metric_sample(&self, load_balancer: &str, requests: u64, errors: u64) {
        self.data().metric_samples.insert(
            load_balancer.to_string(),
            MetricSample {
                requests: requests as f64,
                errors: errors as f64,
            },
        );
    }

    /// Number of metric sums served so far.
    pub fn metric_queries(&self) -> u64 {
        self.data().metric_queries
    }

    /// Every weight written to records with this set identifier, oldest first.
    pub fn weight_history(&self, set_identifier: &str) -> Vec<u32> {
        self.data()
            .weight_history
            .get(set_identifier)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record(&self, zone_id: &str, name: &str, set_identifier: &str) -> Option<WeightedRecord> {
        self.data()
            .zones
            .get(zone_id)?
            .get(&record_key(name, set_identifier))
            .cloned()
    }

    pub fn group(&self, name: &str) -> Option<GroupDescription> {
        self.data().groups.get(name).cloned()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.data().groups.keys().cloned().collect()
    }

    pub fn template_names(&self) -> Vec<String> {
        self.data().templates.keys().cloned().collect()
    }

    pub fn balancer_names(&self) -> Vec<String> {
        self.data().balancers.keys().cloned().collect()
    }

    /// DNS change batches submitted since this sandbox was created or loaded.
    pub fn changes_issued(&self) -> u64 {
        self.data().changes_issued
    }

    /// Changes not yet observed in sync.
    pub fn pending_changes(&self) -> usize {
        self.data().changes.len()
    }

    pub fn record_count(&self) -> usize {
        self.data().zones.values().map(BTreeMap::len).sum()
    }

    /// Delete a group behind the engine's back.
    pub fn remove_group_out_of_band(&self, name: &str) -> bool {
        self.data().groups.remove(name).is_some()
    }
}

#[async_trait]
impl ComputeClient for SandboxCloud {
    async fn create_template(&self, spec: &TemplateSpec) -> CloudResult<TemplateDescription> {
        let mut data = self.data();
        data.check("create_template")?;
        if data.templates.contains_key(&spec.name) {
            return Err(CloudError::AlreadyExists {
                kind: ResourceKind::LaunchTemplate,
                name: spec.name.clone(),
            });
        }
        let template = TemplateDescription {
            name: spec.name.clone(),
            image_id: spec.image_id.clone(),
            instance_type: spec.instance_type.clone(),
            fingerprint: spec.fingerprint.clone(),
        };
        data.templates.insert(spec.name.clone(), template.clone());
        Ok(template)
    }

    async fn describe_template(&self, name: &str) -> CloudResult<TemplateDescription> {
        let data = self.data();
        data.check("describe_template")?;
        data.templates
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(ResourceKind::LaunchTemplate, name))
    }

    async fn delete_template(&self, name: &str) -> CloudResult<()> {
        let mut data = self.data();
        data.check("delete_template")?;
        data.templates
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(ResourceKind::LaunchTemplate, name))
    }

    async fn create_group(&self, spec: &GroupSpec) -> CloudResult<GroupDescription> {
        let mut data = self.data();
        data.check("create_group")?;
        if data.groups.contains_key(&spec.name) {
            return Err(CloudError::AlreadyExists {
                kind: ResourceKind::ComputeGroup,
                name: spec.name.clone(),
            });
        }
        if !data.templates.contains_key(&spec.template) {
            return Err(CloudError::not_found(ResourceKind::LaunchTemplate, &spec.template));
        }
        let group = GroupDescription {
            name: spec.name.clone(),
            template: spec.template.clone(),
            desired_capacity: spec.desired_capacity,
            healthy_count: spec.desired_capacity,
            load_balancers: Vec::new(),
        };
        data.groups.insert(spec.name.clone(), group.clone());
        Ok(group)
    }

    async fn describe_group(&self, name: &str) -> CloudResult<GroupDescription> {
        let data = self.data();
        data.check("describe_group")?;
        data.groups
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(ResourceKind::ComputeGroup, name))
    }

    async fn attach_load_balancers(&self, group: &str, load_balancers: &[String]) -> CloudResult<()> {
        let mut data = self.data();
        data.check("attach_load_balancers")?;
        for lb in load_balancers {
            data.balancer(lb)?;
        }
        let group = data.group_mut(group)?;
        for lb in load_balancers {
            if !group.load_balancers.contains(lb) {
                group.load_balancers.push(lb.clone());
            }
        }
        Ok(())
    }

    async fn set_desired_capacity(&self, group: &str, capacity: u32) -> CloudResult<()> {
        let mut data = self.data();
        data.check("set_desired_capacity")?;
        let group = data.group_mut(group)?;
        group.desired_capacity = capacity;
        group.healthy_count = capacity;
        Ok(())
    }

    async fn delete_group(&self, name: &str) -> CloudResult<()> {
        let mut data = self.data();
        data.check("delete_group")?;
        data.groups
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found(ResourceKind::ComputeGroup, name))
    }

    async fn start_instance_refresh(&self, group: &str, _min_healthy_percent: u32) -> CloudResult<String> {
        let mut data = self.data();
        data.check("start_instance_refresh")?;
        data.group_mut(group)?;
        let id = data.next_id("refresh");
        data.refreshes.insert(
            id.clone(),
            Refresh {
                group: group.to_string(),
                polls: 0,
            },
        );
        Ok(id)
    }

    async fn describe_instance_refresh(&self, group: &str, refresh_id: &str) -> CloudResult<RefreshStatus> {
        let mut data = self.data();
        data.check("describe_instance_refresh")?;
        let outcome = data.options.refresh_outcome;
        let refresh = data
            .refreshes
            .get_mut(refresh_id)
            .filter(|r| r.group == group)
            .ok_or_else(|| CloudError::not_found(ResourceKind::InstanceRefresh, refresh_id))?;
        refresh.polls += 1;
        // The first poll always sees the refresh running.
        Ok(if refresh.polls == 1 {
            RefreshStatus::InProgress
        } else {
            outcome
        })
    }
}

#[async_trait]
impl LoadBalancerClient for SandboxCloud {
    async fn create_load_balancer(&self, spec: &LoadBalancerSpec) -> CloudResult<LoadBalancerDescription> {
        let mut data = self.data();
        data.check("create_load_balancer")?;
        if data.balancers.contains_key(&spec.name) {
            return Err(CloudError::AlreadyExists {
                kind: ResourceKind::LoadBalancer,
                name: spec.name.clone(),
            });
        }
        let scheme = if spec.internal { "internal" } else { "external" };
        let balancer = LoadBalancerDescription {
            name: spec.name.clone(),
            dns_name: format!("{}.{scheme}.lb.sandbox", spec.name),
            family: spec.family,
            capacity_units: 0,
        };
        data.balancers.insert(spec.name.clone(), balancer.clone());
        Ok(balancer)
    }

    async fn describe_load_balancer(&self, name: &str) -> CloudResult<LoadBalancerDescription> {
        let data = self.data();
        data.check("describe_load_balancer")?;
        data.balancer(name).cloned()
    }

    async fn delete_load_balancer(&self, name: &str) -> CloudResult<()> {
        let mut data = self.data();
        data.check("delete_load_balancer")?;
        data.balancers
            .remove(name)
            .ok_or_else(|| CloudError::not_found(ResourceKind::LoadBalancer, name))?;
        for group in data.groups.values_mut() {
            group.load_balancers.retain(|lb| lb != name);
        }
        Ok(())
    }

    async fn target_health(&self, name: &str) -> CloudResult<TargetHealth> {
        let data = self.data();
        data.check("target_health")?;
        data.balancer(name)?;
        let healthy = data
            .groups
            .values()
            .filter(|g| g.load_balancers.iter().any(|lb| lb == name))
            .map(|g| g.healthy_count)
            .sum();
        Ok(TargetHealth {
            healthy,
            unhealthy: 0,
            draining: 0,
        })
    }

    async fn set_capacity_units(&self, name: &str, units: u32) -> CloudResult<()> {
        let mut data = self.data();
        data.check("set_capacity_units")?;
        let balancer = data
            .balancers
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(ResourceKind::LoadBalancer, name))?;
        balancer.capacity_units = units;
        Ok(())
    }

    async fn capacity_status(&self, name: &str) -> CloudResult<CapacityStatus> {
        let data = self.data();
        data.check("capacity_status")?;
        data.balancer(name)?;
        Ok(CapacityStatus::Provisioned)
    }
}

#[async_trait]
impl DnsClient for SandboxCloud {
    async fn get_record(&self, zone_id: &str, name: &str, set_identifier: &str) -> CloudResult<WeightedRecord> {
        let data = self.data();
        data.check("get_record")?;
        data.zones
            .get(zone_id)
            .and_then(|zone| zone.get(&record_key(name, set_identifier)))
            .cloned()
            .ok_or_else(|| {
                CloudError::not_found(ResourceKind::DnsRecord, format!("{name} ({set_identifier})"))
            })
    }

    async fn upsert_records(&self, zone_id: &str, records: &[WeightedRecord]) -> CloudResult<String> {
        let mut data = self.data();
        data.check("upsert_records")?;
        if let Some(record) = records.iter().find(|r| r.weight > 100) {
            return Err(CloudError::api(
                "upsert_records",
                format!("weight {} out of range", record.weight),
            ));
        }
        for record in records {
            data.weight_history
                .entry(record.set_identifier.clone())
                .or_default()
                .push(record.weight);
            data.zones
                .entry(zone_id.to_string())
                .or_default()
                .insert(record_key(&record.name, &record.set_identifier), record.clone());
        }
        Ok(data.new_change())
    }

    async fn delete_records(&self, zone_id: &str, records: &[WeightedRecord]) -> CloudResult<String> {
        let mut data = self.data();
        data.check("delete_records")?;
        let zone = data
            .zones
            .get_mut(zone_id)
            .ok_or_else(|| CloudError::not_found(ResourceKind::DnsRecord, zone_id))?;
        for record in records {
            zone.remove(&record_key(&record.name, &record.set_identifier))
                .ok_or_else(|| CloudError::not_found(ResourceKind::DnsRecord, &record.name))?;
        }
        Ok(data.new_change())
    }

    async fn change_status(&self, change_id: &str) -> CloudResult<ChangeStatus> {
        let mut data = self.data();
        data.check("change_status")?;
        let changes = &mut data.changes;
        match changes.get(change_id).copied() {
            None => Err(CloudError::not_found(ResourceKind::DnsChange, change_id)),
            Some(0) => {
                changes.remove(change_id);
                Ok(ChangeStatus::InSync)
            }
            Some(remaining) => {
                changes.insert(change_id.to_string(), remaining - 1);
                Ok(ChangeStatus::Pending)
            }
        }
    }
}

#[async_trait]
impl MetricsClient for SandboxCloud {
    async fn sum(&self, query: &MetricQuery) -> CloudResult<f64> {
        let mut data = self.data();
        data.check("sum")?;
        data.metric_queries += 1;
        let sample = data
            .metric_samples
            .get(&query.dimension_value)
            .copied()
            .unwrap_or_default();
        // Balancer-generated errors are never simulated.
        Ok(match query.metric.as_str() {
            "RequestCount" => sample.requests,
            metric if metric.starts_with("HTTPCode_ELB") => 0.0,
            _ => sample.errors,
        })
    }
}
