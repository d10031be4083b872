//! stackshift-routing: weighted DNS records as the system of record.
//!
//! Which side of a stack is live is never stored anywhere else: a stack's
//! active deployment stack is the one whose weighted records carry a
//! non-zero weight, and its passive side is the one at zero.
//!
//! - **`distribution`**: the full weight each stack receives
//! - **`store`**: reading records into active/passive maps and writing
//!   new weights, waiting for every change to propagate

pub mod distribution;
pub mod store;

pub use distribution::weight_distribution;
pub use store::{dns_sync_task, wait_for_changes, StackMap, StackWeights, WeightedRouteStore};
