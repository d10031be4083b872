//! Deploy configuration and engine settings.
//!
//! `DeployConfig` is the JSON document describing what should be running.
//! It arrives per invocation (usually via `STACKSHIFT_CONFIG`) and is
//! deep-merged over the configuration persisted by the last successful
//! deploy, so partial documents like `{"compute": {"image_id": "..."}}`
//! are enough for incremental operations.
//!
//! `Settings` holds engine tunables (poll interval, wait budgets) read
//! from an optional TOML file.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DeployError, DeployResult};
use crate::types::RouteType;

const APP_NAME_PATTERN: &str = r"^[a-z][a-z0-9-]{0,31}$";

/// Upper bound on stacks; weights are whole percentages.
pub const MAX_STACKS: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    pub app_name: String,
    #[serde(default = "default_stacks")]
    pub stacks: u32,
    pub compute: ComputeConfig,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    /// Weighted DNS routing. Absent means a single, non-discoverable stack.
    #[serde(default)]
    pub dns: Option<DnsConfig>,
    #[serde(default)]
    pub canary: CanaryConfig,
    #[serde(default)]
    pub passive_downscale: PassiveDownscaleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeConfig {
    pub image_id: String,
    pub instance_type: String,
    /// Capacity each new group starts with before being scaled out.
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: u32,
    /// Total capacity across all stacks.
    pub desired_capacity: u32,
    #[serde(default)]
    pub user_data: Option<String>,
}

/// Load balancer family; decides which metric names are queried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerFamily {
    Classic,
    #[default]
    Application,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub family: LoadBalancerFamily,
    /// Total reserved capacity units, split across stacks by weight.
    #[serde(default)]
    pub capacity_units: u32,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            family: LoadBalancerFamily::default(),
            capacity_units: 0,
            health_check_path: default_health_check_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsConfig {
    #[serde(default)]
    pub internal: Option<ZoneConfig>,
    #[serde(default)]
    pub external: Option<ZoneConfig>,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneConfig {
    pub zone_id: String,
    pub domain: String,
}

/// Stepped, metric-gated traffic shift settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanaryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_canary_steps")]
    pub steps: u32,
    /// Share of each stack's full weight moved per step.
    #[serde(default = "default_step_weight_percent")]
    pub step_weight_percent: u32,
    /// Length of the analysis window after each step.
    #[serde(default = "default_step_duration_secs")]
    pub step_duration_secs: u64,
    #[serde(default)]
    pub threshold: MetricThreshold,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            steps: default_canary_steps(),
            step_weight_percent: default_step_weight_percent(),
            step_duration_secs: default_step_duration_secs(),
            threshold: MetricThreshold::default(),
        }
    }
}

impl CanaryConfig {
    pub fn step_duration(&self) -> Duration {
        Duration::from_secs(self.step_duration_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    /// Fail when the error count exceeds the value.
    Absolute,
    /// Fail when errors as a percentage of requests exceed the value.
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub kind: ThresholdKind,
    pub value: f64,
}

impl Default for MetricThreshold {
    fn default() -> Self {
        Self {
            kind: ThresholdKind::Percentage,
            value: 5.0,
        }
    }
}

/// Scale the previously active side to zero after a cutover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassiveDownscaleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_downscale_delay_secs")]
    pub delay_secs: u64,
}

impl Default for PassiveDownscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: default_downscale_delay_secs(),
        }
    }
}

impl PassiveDownscaleConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

fn default_stacks() -> u32 {
    1
}

fn default_initial_capacity() -> u32 {
    1
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_ttl() -> u32 {
    60
}

fn default_canary_steps() -> u32 {
    3
}

fn default_step_weight_percent() -> u32 {
    25
}

fn default_step_duration_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_downscale_delay_secs() -> u64 {
    300
}

impl DeployConfig {
    /// Build the effective configuration for this invocation.
    ///
    /// `overlay` (a JSON document) is merged over `persisted`; objects merge
    /// key by key, every other value replaces. The result is validated.
    pub fn resolve(persisted: Option<&DeployConfig>, overlay: Option<&str>) -> DeployResult<Self> {
        let mut merged = match persisted {
            Some(config) => serde_json::to_value(config)
                .map_err(|e| DeployError::Internal(format!("serialize persisted config: {e}")))?,
            None => Value::Null,
        };

        if let Some(raw) = overlay.filter(|raw| !raw.trim().is_empty()) {
            let overlay: Value = serde_json::from_str(raw)
                .map_err(|e| DeployError::InvalidConfig(format!("config is not valid JSON: {e}")))?;
            merge_json(&mut merged, overlay);
        }

        if merged.is_null() {
            return Err(DeployError::InvalidConfig(
                "no deploy configuration supplied and none persisted".to_string(),
            ));
        }

        let config: DeployConfig = serde_json::from_value(merged)
            .map_err(|e| DeployError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the constraints serde cannot express.
    pub fn validate(&self) -> DeployResult<()> {
        let invalid = |msg: String| -> DeployResult<()> { Err(DeployError::InvalidConfig(msg)) };

        let app_name = Regex::new(APP_NAME_PATTERN)
            .map_err(|e| DeployError::Internal(format!("app name pattern: {e}")))?;
        if !app_name.is_match(&self.app_name) {
            return invalid(format!(
                "app_name {:?} must be lowercase alphanumeric/dashes, at most 32 chars",
                self.app_name
            ));
        }
        if self.stacks == 0 || self.stacks > MAX_STACKS {
            return invalid(format!("stacks must be between 1 and {MAX_STACKS}, got {}", self.stacks));
        }
        if let Some(dns) = &self.dns
            && dns.internal.is_none()
            && dns.external.is_none()
        {
            return invalid("dns needs an internal or external zone".to_string());
        }
        if !self.discoverable() && self.stacks != 1 {
            return invalid("multiple stacks require dns routing".to_string());
        }
        if self.canary.enabled {
            if self.canary.steps == 0 {
                return invalid("canary.steps must be at least 1".to_string());
            }
            if self.canary.step_weight_percent == 0 || self.canary.step_weight_percent > 100 {
                return invalid("canary.step_weight_percent must be within 1..=100".to_string());
            }
            if self.canary.threshold.value < 0.0 {
                return invalid("canary.threshold.value must not be negative".to_string());
            }
        }
        Ok(())
    }

    /// Whether traffic reaches this deployment through weighted DNS.
    pub fn discoverable(&self) -> bool {
        self.dns
            .as_ref()
            .is_some_and(|dns| dns.internal.is_some() || dns.external.is_some())
    }

    /// Route types with a configured zone, internal first.
    pub fn route_types(&self) -> Vec<RouteType> {
        RouteType::ALL
            .into_iter()
            .filter(|rt| self.zone(*rt).is_some())
            .collect()
    }

    pub fn zone(&self, route_type: RouteType) -> Option<&ZoneConfig> {
        let dns = self.dns.as_ref()?;
        match route_type {
            RouteType::Internal => dns.internal.as_ref(),
            RouteType::External => dns.external.as_ref(),
        }
    }

    pub fn ttl(&self) -> u32 {
        self.dns.as_ref().map(|dns| dns.ttl).unwrap_or_else(default_ttl)
    }
}

/// Merge `overlay` into `base`: objects recursively, anything else replaces.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_json(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Engine tunables. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub poll_interval_secs: u64,
    pub health_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub capacity_timeout_secs: u64,
    pub dns_sync_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub canary_stabilization_secs: u64,
    pub refresh_min_healthy_percent: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            health_timeout_secs: 20 * 60,
            drain_timeout_secs: 10 * 60,
            capacity_timeout_secs: 30 * 60,
            dns_sync_timeout_secs: 10 * 60,
            refresh_timeout_secs: 60 * 60,
            canary_stabilization_secs: 90,
            refresh_min_healthy_percent: 90,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> DeployResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::InvalidConfig(format!("read settings {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> DeployResult<Self> {
        toml::from_str(content).map_err(|e| DeployError::InvalidConfig(format!("settings: {e}")))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn capacity_timeout(&self) -> Duration {
        Duration::from_secs(self.capacity_timeout_secs)
    }

    pub fn dns_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_sync_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn canary_stabilization(&self) -> Duration {
        Duration::from_secs(self.canary_stabilization_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"{
        "app_name": "shop",
        "stacks": 2,
        "compute": { "image_id": "img-1", "instance_type": "m5.large", "desired_capacity": 4 },
        "dns": { "internal": { "zone_id": "Z1", "domain": "internal.example.com" } }
    }"#;

    #[test]
    fn resolve_applies_defaults() {
        let config = DeployConfig::resolve(None, Some(BASE)).unwrap();
        assert_eq!(config.stacks, 2);
        assert_eq!(config.compute.initial_capacity, 1);
        assert!(!config.canary.enabled);
        assert!(config.passive_downscale.enabled);
        assert_eq!(config.ttl(), 60);
        assert_eq!(config.route_types(), vec![RouteType::Internal]);
        assert!(config.discoverable());
    }

    #[test]
    fn overlay_merges_over_persisted_config() {
        let persisted = DeployConfig::resolve(None, Some(BASE)).unwrap();
        let overlay = r#"{ "compute": { "image_id": "img-2" }, "canary": { "enabled": true } }"#;
        let config = DeployConfig::resolve(Some(&persisted), Some(overlay)).unwrap();

        assert_eq!(config.compute.image_id, "img-2");
        assert_eq!(config.compute.instance_type, "m5.large");
        assert_eq!(config.compute.desired_capacity, 4);
        assert!(config.canary.enabled);
        assert_eq!(config.canary.steps, 3);
    }

    #[test]
    fn missing_config_is_a_user_error() {
        let err = DeployConfig::resolve(None, None).unwrap_err();
        assert!(matches!(err, DeployError::InvalidConfig(_)));
        let err = DeployConfig::resolve(None, Some("  ")).unwrap_err();
        assert!(matches!(err, DeployError::InvalidConfig(_)));
    }

    #[test]
    fn validation_rejects_bad_documents() {
        let persisted = DeployConfig::resolve(None, Some(BASE)).unwrap();
        for overlay in [
            r#"{ "app_name": "Shop" }"#,
            r#"{ "stacks": 0 }"#,
            r#"{ "stacks": 101 }"#,
            r#"{ "dns": null }"#,
            r#"{ "dns": { "internal": null } }"#,
            r#"{ "canary": { "enabled": true, "steps": 0 } }"#,
            r#"{ "canary": { "enabled": true, "step_weight_percent": 120 } }"#,
            "not json",
        ] {
            let result = DeployConfig::resolve(Some(&persisted), Some(overlay));
            assert!(result.is_err(), "overlay {overlay} should be rejected");
        }
    }

    #[test]
    fn merge_replaces_non_objects() {
        let mut base = serde_json::json!({ "a": { "b": 1, "c": [1, 2] }, "d": 1 });
        merge_json(&mut base, serde_json::json!({ "a": { "c": [3] }, "d": { "e": 2 } }));
        assert_eq!(base, serde_json::json!({ "a": { "b": 1, "c": [3] }, "d": { "e": 2 } }));
    }

    #[test]
    fn settings_default_and_partial_toml() {
        let settings = Settings::from_toml_str("poll_interval_secs = 5\n").unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_secs(5));
        assert_eq!(settings.canary_stabilization(), Duration::from_secs(90));
        assert_eq!(settings.health_timeout(), Duration::from_secs(1200));
    }

    #[test]
    fn settings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stackshift.toml");
        std::fs::write(&path, "dns_sync_timeout_secs = 30\n").unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.dns_sync_timeout(), Duration::from_secs(30));
        assert!(Settings::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
