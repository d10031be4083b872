//! stackshift-tasks: parallel fan-out and polling for the deploy engine.
//!
//! Every multi-resource step of a deployment (creating compute groups,
//! waiting for health, waiting for DNS changes, canary analysis) is a set
//! of independent futures joined at a single point. This crate provides
//! the two primitives those steps are built from.
//!
//! # Components
//!
//! - **`coordinator`**: spawn tasks in parallel, join in input order,
//!   fail fast or collect every failure
//! - **`waiter`**: poll a probe until a condition holds or a wall-clock
//!   budget runs out
//!
//! ```text
//! run(tasks, FailFast)
//!   ├── JoinSet (one tokio task per input)
//!   ├── slot[index] ← result          (completion order ignored)
//!   └── first Err → abort siblings → Err
//! ```

pub mod coordinator;
pub mod waiter;

pub use coordinator::{run, settle, BoxTask, FailureMode, TaskError};
pub use waiter::{PollingWaiter, WaitError};
