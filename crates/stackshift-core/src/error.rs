//! Error types for the deploy engine.

use std::fmt;

use stackshift_tasks::{TaskError, WaitError};
use thiserror::Error;

use crate::types::{IdentifierError, RouteIdentifier, RouteType, Stack};

/// Result type alias for cloud collaborator calls.
pub type CloudResult<T> = Result<T, CloudError>;

/// Result type alias for engine operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Kind of cloud resource named in an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ComputeGroup,
    LaunchTemplate,
    LoadBalancer,
    DnsRecord,
    DnsChange,
    InstanceRefresh,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::ComputeGroup => "compute group",
            ResourceKind::LaunchTemplate => "launch template",
            ResourceKind::LoadBalancer => "load balancer",
            ResourceKind::DnsRecord => "dns record",
            ResourceKind::DnsChange => "dns change",
            ResourceKind::InstanceRefresh => "instance refresh",
        };
        f.write_str(name)
    }
}

/// Errors reported by cloud collaborators.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("{operation} failed: {message}")]
    Api { operation: String, message: String },
}

impl CloudError {
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        CloudError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CloudError::Api {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

/// Broad class of a failure, used for exit codes and log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad or inconsistent configuration, including DNS weight state.
    User,
    /// A cloud provider call failed.
    Cloud,
    /// A wait exceeded its budget.
    Timeout,
    /// An invariant was violated inside the engine.
    Internal,
}

/// Errors produced by deploy operations.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation cannot run against the current deployment.
    #[error("cannot proceed: {0}")]
    Precondition(String),

    #[error("inconsistent routing for stack {stack}: {detail}")]
    InconsistentRouting { stack: Stack, detail: String },

    #[error("no passive (zero weight) record for stack {stack}")]
    NoPassiveRecord { stack: Stack },

    #[error("no active (non-zero weight) record for stack {stack}")]
    NoActiveRecord { stack: Stack },

    #[error("multiple active records for stack {stack} in the {route_type} zone")]
    MultipleActiveRecords { stack: Stack, route_type: RouteType },

    #[error("weight {weight} on {identifier} is not part of the distribution for {stacks} stacks")]
    InvalidWeight {
        identifier: RouteIdentifier,
        weight: u32,
        stacks: u32,
    },

    #[error("canary analysis failed on {identifier} during {phase}: {detail}")]
    CanaryBreach {
        identifier: RouteIdentifier,
        phase: String,
        detail: String,
    },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("timed out after {elapsed_minutes:.1} minutes waiting for {what}")]
    Timeout { what: String, elapsed_minutes: f64 },

    #[error("{} parallel tasks failed: {}", .errors.len(), join_messages(.errors))]
    Aggregate { errors: Vec<DeployError> },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DeployError::InvalidConfig(_)
            | DeployError::Precondition(_)
            | DeployError::InconsistentRouting { .. }
            | DeployError::NoPassiveRecord { .. }
            | DeployError::NoActiveRecord { .. }
            | DeployError::MultipleActiveRecords { .. }
            | DeployError::InvalidWeight { .. }
            | DeployError::CanaryBreach { .. } => ErrorCategory::User,
            DeployError::Cloud(_) => ErrorCategory::Cloud,
            DeployError::Timeout { .. } => ErrorCategory::Timeout,
            DeployError::Aggregate { errors } => errors
                .first()
                .map(DeployError::category)
                .unwrap_or(ErrorCategory::Internal),
            DeployError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether this error (or any aggregated error) is a canary breach.
    pub fn is_canary_breach(&self) -> bool {
        match self {
            DeployError::CanaryBreach { .. } => true,
            DeployError::Aggregate { errors } => errors.iter().any(DeployError::is_canary_breach),
            _ => false,
        }
    }
}

fn join_messages(errors: &[DeployError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<TaskError<DeployError>> for DeployError {
    fn from(err: TaskError<DeployError>) -> Self {
        match err {
            TaskError::Failed { error, .. } => error,
            TaskError::Panicked { index, message } => {
                DeployError::Internal(format!("task {index} panicked: {message}"))
            }
            TaskError::Cancelled => DeployError::Internal("task cancelled".to_string()),
            TaskError::Aggregate { failures, .. } => DeployError::Aggregate {
                errors: failures.into_iter().map(DeployError::from).collect(),
            },
        }
    }
}

impl From<WaitError<DeployError>> for DeployError {
    fn from(err: WaitError<DeployError>) -> Self {
        match err {
            WaitError::Timeout { what, elapsed } => DeployError::Timeout {
                what,
                elapsed_minutes: elapsed.as_secs_f64() / 60.0,
            },
            WaitError::Probe(error) => error,
        }
    }
}

impl From<IdentifierError> for DeployError {
    fn from(err: IdentifierError) -> Self {
        DeployError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn routing_errors_are_user_errors() {
        let err = DeployError::NoPassiveRecord {
            stack: Stack::FIRST,
        };
        assert_eq!(err.category(), ErrorCategory::User);
        assert_eq!(err.to_string(), "no passive (zero weight) record for stack 1");
    }

    #[test]
    fn cloud_not_found_is_detectable() {
        let err = CloudError::not_found(ResourceKind::ComputeGroup, "web-1b-abc");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "compute group not found: web-1b-abc");
        assert_eq!(DeployError::from(err).category(), ErrorCategory::Cloud);
    }

    #[test]
    fn aggregate_joins_all_messages() {
        let task_err: TaskError<DeployError> = TaskError::Aggregate {
            failures: vec![
                TaskError::Failed {
                    index: 0,
                    error: DeployError::Cloud(CloudError::api("create group", "quota")),
                },
                TaskError::Failed {
                    index: 2,
                    error: DeployError::Internal("bad slot".into()),
                },
            ],
            total: 3,
        };
        let err = DeployError::from(task_err);
        assert_eq!(
            err.to_string(),
            "2 parallel tasks failed: create group failed: quota; internal error: bad slot"
        );
        assert_eq!(err.category(), ErrorCategory::Cloud);
    }

    #[test]
    fn wait_timeout_becomes_typed_timeout() {
        let err = DeployError::from(WaitError::<DeployError>::Timeout {
            what: "dns change C1 in sync".into(),
            elapsed: Duration::from_secs(90),
        });
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert_eq!(
            err.to_string(),
            "timed out after 1.5 minutes waiting for dns change C1 in sync"
        );
    }

    #[test]
    fn fail_fast_error_is_unwrapped() {
        let err = DeployError::from(TaskError::Failed {
            index: 1,
            error: DeployError::NoActiveRecord {
                stack: Stack::FIRST,
            },
        });
        assert!(matches!(err, DeployError::NoActiveRecord { .. }));
    }
}
