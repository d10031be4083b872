//! stackshift-deploy: the blue/green deployment engine.
//!
//! Every operation runs against an explicit `DeployContext` (cloud
//! clients, engine settings and the in-memory state document) owned by
//! the caller, which persists the state once the operation returns or is
//! interrupted.
//!
//! # Components
//!
//! - **`context`**: cloud clients and the per-invocation context
//! - **`names`**: deterministic resource names
//! - **`reconciler`**: prunes state entries whose resource is gone
//! - **`provision`**: balancers, weighted records, templates and groups
//! - **`waits`**: health, drain, capacity and refresh waits
//! - **`orchestrator`**: deploy, redeploy, revert, scale, rolling restart
//!   and undeploy
//! - **`status`**: read-only deployment report
//!
//! ```text
//! deploy
//!   ├── correct_state            (prune)
//!   ├── ensure_infrastructure    (balancers + zero-weight records)
//!   ├── passive_stack_map        (weighted records)
//!   ├── provision passive slots  (settle, record, raise)
//!   ├── wait healthy → scale → capacity units → wait healthy
//!   ├── CanaryController::run    (or direct cutover)
//!   └── passive downscale        (after delay)
//! ```

pub mod context;
pub mod names;
pub mod orchestrator;
pub mod provision;
pub mod reconciler;
pub mod status;
pub mod waits;

pub use context::{CloudClients, DeployContext};
pub use orchestrator::{undeploy, DeploymentOrchestrator};
pub use reconciler::StateReconciler;
pub use status::{status, GroupStatus, LoadBalancerStatus, StackStatus, StatusReport};
