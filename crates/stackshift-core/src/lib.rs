//! stackshift-core: shared vocabulary of the blue/green deploy engine.
//!
//! - **`types`**: stacks, blue/green slots, route types and the short
//!   identifiers (`"1ib"`, `"2b"`) used at the DNS and state boundaries
//! - **`config`**: the deploy configuration document and engine settings
//! - **`error`**: `DeployError`, `CloudError` and their categories
//! - **`fingerprint`**: content hashes that decide compute group reuse

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod types;

pub use config::{
    merge_json, CanaryConfig, ComputeConfig, DeployConfig, DnsConfig, LoadBalancerConfig,
    LoadBalancerFamily, MetricThreshold, PassiveDownscaleConfig, Settings, ThresholdKind,
    ZoneConfig, MAX_STACKS,
};
pub use error::{CloudError, CloudResult, DeployError, DeployResult, ErrorCategory, ResourceKind};
pub use fingerprint::compute_fingerprint;
pub use types::*;
