//! Content fingerprints for compute groups.
//!
//! A passive slot's group is reused when its fingerprint matches the
//! configuration being deployed, and replaced otherwise. Group names embed
//! the first `SHORT_LEN` hex chars so a retried invocation can find the
//! group it created even if the state record was lost.

use sha2::{Digest, Sha256};

use crate::config::ComputeConfig;

/// Hex characters of the fingerprint used in resource names.
pub const SHORT_LEN: usize = 12;

/// SHA-256 over the compute configuration, optionally salted.
///
/// `redeploy` salts with the state version so an unchanged configuration
/// still produces fresh groups.
pub fn compute_fingerprint(config: &ComputeConfig, salt: Option<u64>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.image_id.as_bytes());
    hasher.update([0]);
    hasher.update(config.instance_type.as_bytes());
    hasher.update([0]);
    if let Some(user_data) = &config.user_data {
        hasher.update(user_data.as_bytes());
    }
    hasher.update([0]);
    if let Some(salt) = salt {
        hasher.update(salt.to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

/// The short form used in group and template names.
pub fn short(fingerprint: &str) -> &str {
    &fingerprint[..SHORT_LEN.min(fingerprint.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compute(image: &str) -> ComputeConfig {
        ComputeConfig {
            image_id: image.to_string(),
            instance_type: "m5.large".to_string(),
            initial_capacity: 1,
            desired_capacity: 4,
            user_data: None,
        }
    }

    #[test]
    fn capacity_does_not_change_the_fingerprint() {
        let mut scaled = compute("img-1");
        scaled.desired_capacity = 40;
        assert_eq!(
            compute_fingerprint(&compute("img-1"), None),
            compute_fingerprint(&scaled, None)
        );
    }

    #[test]
    fn user_data_changes_the_fingerprint() {
        let mut scripted = compute("img-1");
        scripted.user_data = Some("#!/bin/sh\necho hi".to_string());
        assert_ne!(
            compute_fingerprint(&compute("img-1"), None),
            compute_fingerprint(&scripted, None)
        );
    }

    #[test]
    fn image_and_salt_change_the_fingerprint() {
        let base = compute_fingerprint(&compute("img-1"), None);
        assert_ne!(base, compute_fingerprint(&compute("img-2"), None));
        assert_ne!(base, compute_fingerprint(&compute("img-1"), Some(7)));
        assert_eq!(base.len(), 64);
        assert_eq!(short(&base).len(), SHORT_LEN);
    }
}
