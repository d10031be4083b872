//! Weighted DNS records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackshift_core::CloudResult;

/// One weighted record. `set_identifier` distinguishes the records that
/// share `name`; the engine uses the route identifier (`"1ib"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedRecord {
    pub name: String,
    pub set_identifier: String,
    /// DNS name the record resolves to.
    pub value: String,
    /// Relative weight in `0..=100`.
    pub weight: u32,
    pub ttl: u32,
}

/// Propagation state of a change batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    InSync,
}

#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn get_record(&self, zone_id: &str, name: &str, set_identifier: &str) -> CloudResult<WeightedRecord>;

    /// Create or replace records as one batch. Returns the change id.
    async fn upsert_records(&self, zone_id: &str, records: &[WeightedRecord]) -> CloudResult<String>;

    /// Delete records as one batch. Returns the change id.
    async fn delete_records(&self, zone_id: &str, records: &[WeightedRecord]) -> CloudResult<String>;

    async fn change_status(&self, change_id: &str) -> CloudResult<ChangeStatus>;
}
