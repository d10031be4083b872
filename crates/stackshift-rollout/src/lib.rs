//! stackshift rollout: canary traffic shifting with metric gates.
//!
//! Traffic moves from each stack's active side to its freshly provisioned
//! passive side in fixed steps. After every step the new side's load
//! balancers are watched for server errors; a breach restores the weights
//! recorded before the first step.
//!
//! # Components
//!
//! - **`strategy`**: step weight arithmetic
//! - **`analysis`**: threshold evaluation and the per-balancer watch loop
//! - **`controller`**: the canary state machine (steps, full cutover, rollback)

pub mod analysis;
pub mod controller;
pub mod strategy;

pub use analysis::{evaluate, Verdict};
pub use controller::{CanaryController, CanaryPhase};
pub use strategy::{step_shift, step_weights};
