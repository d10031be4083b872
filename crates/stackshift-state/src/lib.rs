//! stackshift-state: the durable deployment state document.
//!
//! The document is the only record of resource identifiers created by
//! earlier invocations. It is read once at process start (bumping the
//! version), mutated in memory by the orchestrating flow, and written once
//! at exit whether the operation succeeded, failed or was interrupted.
//!
//! ```text
//! state.json
//!   ├── version            (one increment per invocation)
//!   ├── compute_groups[]   keyed by slot        ("1b")
//!   ├── templates[]        keyed by name
//!   ├── load_balancers[]   keyed by route id    ("1ib")
//!   ├── routes[]           keyed by route id    ("1ib")
//!   └── deploy_config      last applied DeployConfig
//! ```

pub mod error;
pub mod store;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
