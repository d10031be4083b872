//! Deterministic resource names.
//!
//! Names are derived only from the configuration and identifiers, so a
//! retried invocation finds (and adopts) what an interrupted one created
//! even when the state record was never written.

use stackshift_core::fingerprint::short;
use stackshift_core::{RouteIdentifier, Slot};

/// `<app>-<slot>-<fingerprint12>`, e.g. `shop-1b-3f2a9c0d1e4b`.
pub fn group_name(app: &str, slot: Slot, fingerprint: &str) -> String {
    format!("{app}-{slot}-{}", short(fingerprint))
}

pub fn template_name(group: &str) -> String {
    format!("{group}-lt")
}

/// `<app>-<route>`, e.g. `shop-1ib`.
pub fn load_balancer_name(app: &str, route: RouteIdentifier) -> String {
    format!("{app}-{route}")
}

/// Every weighted record of an app shares one name per zone.
pub fn record_name(app: &str, domain: &str) -> String {
    format!("{app}.{domain}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_embed_short_identifiers() {
        let slot: Slot = "2g".parse().unwrap();
        let group = group_name("shop", slot, "0123456789abcdef0123");
        assert_eq!(group, "shop-2g-0123456789ab");
        assert_eq!(template_name(&group), "shop-2g-0123456789ab-lt");
        assert_eq!(load_balancer_name("shop", "2ig".parse().unwrap()), "shop-2ig");
        assert_eq!(record_name("shop", "internal.example.com"), "shop.internal.example.com");
    }
}
