//! Read-only deployment report.
//!
//! Nothing here reconciles or writes: missing resources show up as errors
//! in the report instead of being pruned.

use serde::Serialize;
use stackshift_cloud::GroupDescription;
use stackshift_core::{
    CloudError, DeployConfig, DeployResult, DeploymentStack, RouteIdentifier, Slot, Stack,
};
use stackshift_routing::{StackWeights, WeightedRouteStore};
use stackshift_tasks::{settle, BoxTask};

use crate::context::DeployContext;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub app_name: Option<String>,
    pub version: u64,
    pub discoverable: bool,
    pub stacks: Vec<StackStatus>,
    pub groups: Vec<GroupStatus>,
    pub load_balancers: Vec<LoadBalancerStatus>,
    /// Why active/passive sides could not be derived from the records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackStatus {
    pub stack: Stack,
    pub active: Option<DeploymentStack>,
    pub passive: Option<DeploymentStack>,
    pub weights: StackWeights,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub slot: Slot,
    pub name: String,
    pub fingerprint: String,
    pub desired: Option<u32>,
    pub healthy: Option<u32>,
    pub attached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStatus {
    pub route: RouteIdentifier,
    pub name: String,
    pub dns_name: String,
    pub capacity_units: Option<u32>,
    pub healthy_targets: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Describe every recorded resource and, with weighted routing, which
/// side of each stack is live.
pub async fn status(ctx: &DeployContext, config: Option<&DeployConfig>) -> StatusReport {
    let discoverable = config.is_some_and(DeployConfig::discoverable);
    let (stacks, routing_error) = match config {
        Some(config) if discoverable => match stack_statuses(ctx, config).await {
            Ok(stacks) => (stacks, None),
            Err(err) => (Vec::new(), Some(err.to_string())),
        },
        Some(_) => {
            let active = ctx
                .state
                .group(Slot::new(Stack::FIRST, DeploymentStack::Blue))
                .map(|_| DeploymentStack::Blue);
            let stack = StackStatus {
                stack: Stack::FIRST,
                active,
                passive: None,
                weights: StackWeights::new(),
            };
            (vec![stack], None)
        }
        None => (Vec::new(), None),
    };

    StatusReport {
        app_name: config.map(|c| c.app_name.clone()),
        version: ctx.state.version,
        discoverable,
        stacks,
        groups: group_statuses(ctx).await,
        load_balancers: load_balancer_statuses(ctx).await,
        routing_error,
    }
}

async fn stack_statuses(
    ctx: &DeployContext,
    config: &DeployConfig,
) -> DeployResult<Vec<StackStatus>> {
    let routes = WeightedRouteStore::new(
        ctx.clients.dns.clone(),
        &ctx.state.routes,
        config.route_types(),
        config.stacks,
        ctx.waiter(),
        ctx.settings.dns_sync_timeout(),
    )?;
    let weights = routes.current_weights(None).await?;
    let active = routes.active_stack_map(None, true).await?;
    let passive = routes.passive_stack_map(None).await?;

    Ok(weights
        .into_iter()
        .map(|(stack, weights)| StackStatus {
            stack,
            active: active.get(&stack).copied(),
            passive: passive.get(&stack).copied(),
            weights,
        })
        .collect())
}

async fn group_statuses(ctx: &DeployContext) -> Vec<GroupStatus> {
    let tasks: Vec<BoxTask<GroupDescription, CloudError>> = ctx
        .state
        .compute_groups
        .iter()
        .map(|g| {
            let compute = ctx.clients.compute.clone();
            let name = g.name.clone();
            Box::pin(async move { compute.describe_group(&name).await })
                as BoxTask<GroupDescription, CloudError>
        })
        .collect();

    ctx.state
        .compute_groups
        .iter()
        .zip(settle(tasks).await)
        .map(|(record, described)| {
            let mut status = GroupStatus {
                slot: record.slot,
                name: record.name.clone(),
                fingerprint: record.fingerprint.clone(),
                desired: None,
                healthy: None,
                attached: false,
                error: None,
            };
            match described {
                Ok(group) => {
                    status.desired = Some(group.desired_capacity);
                    status.healthy = Some(group.healthy_count);
                    status.attached = group.is_attached();
                }
                Err(err) => status.error = Some(err.to_string()),
            }
            status
        })
        .collect()
}

async fn load_balancer_statuses(ctx: &DeployContext) -> Vec<LoadBalancerStatus> {
    let tasks: Vec<BoxTask<(u32, u32), CloudError>> = ctx
        .state
        .load_balancers
        .iter()
        .map(|lb| {
            let balancers = ctx.clients.balancers.clone();
            let name = lb.name.clone();
            Box::pin(async move {
                let described = balancers.describe_load_balancer(&name).await?;
                let health = balancers.target_health(&name).await?;
                Ok((described.capacity_units, health.healthy))
            }) as BoxTask<(u32, u32), CloudError>
        })
        .collect();

    ctx.state
        .load_balancers
        .iter()
        .zip(settle(tasks).await)
        .map(|(record, described)| {
            let (capacity_units, healthy_targets, error) = match described {
                Ok((units, healthy)) => (Some(units), Some(healthy), None),
                Err(err) => (None, None, Some(err.to_string())),
            };
            LoadBalancerStatus {
                route: record.route,
                name: record.name.clone(),
                dns_name: record.dns_name.clone(),
                capacity_units,
                healthy_targets,
                error,
            }
        })
        .collect()
}
