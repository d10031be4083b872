//! Provisioning of balancers, weighted records, templates and groups.
//!
//! Every create is preceded by a describe of the deterministic name, so a
//! retried invocation adopts what an interrupted one left behind. Tasks
//! only return records; the caller writes them into the state document
//! after the join, then raises any failure.

use std::collections::BTreeMap;

use stackshift_cloud::{
    GroupSpec, LoadBalancerDescription, LoadBalancerSpec, TemplateSpec, WeightedRecord,
};
use stackshift_core::{
    CloudError, DeployConfig, DeployError, DeployResult, DeploymentStack, RouteIdentifier,
    RouteType, Slot, Stack,
};
use stackshift_routing::wait_for_changes;
use stackshift_state::{ComputeGroupRecord, LoadBalancerRecord, RouteRecord, TemplateRecord};
use stackshift_tasks::{settle, BoxTask, TaskError};
use tracing::{debug, info, warn};

use crate::context::{CloudClients, DeployContext};
use crate::names::{group_name, load_balancer_name, record_name, template_name};

/// Split settled results into successes and one error covering every
/// failure.
pub fn split_settled<T>(
    results: Vec<Result<T, TaskError<DeployError>>>,
) -> (Vec<T>, Option<DeployError>) {
    let mut successes = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => successes.push(value),
            Err(err) => errors.push(DeployError::from(err)),
        }
    }
    let error = match errors.len() {
        0 => None,
        1 => errors.pop(),
        _ => Some(DeployError::Aggregate { errors }),
    };
    (successes, error)
}

/// Ignore `NotFound`: the resource is already gone.
pub fn tolerate_missing(result: Result<(), CloudError>) -> Result<(), CloudError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// Equal share of `total` per stack; the remainder goes one each to the
/// lowest stacks.
pub fn capacity_shares(total: u32, stacks: u32) -> BTreeMap<Stack, u32> {
    if stacks == 0 {
        return BTreeMap::new();
    }
    let base = total / stacks;
    let remainder = total % stacks;
    Stack::all(stacks)
        .map(|stack| {
            let extra = u32::from(stack.number() <= remainder);
            (stack, base + extra)
        })
        .collect()
}

/// Capacity units reserved on a balancer carrying `weight` percent.
pub fn capacity_units_for(total_units: u32, weight: u32) -> u32 {
    (total_units * weight).div_ceil(100)
}

/// Every route identifier the configuration calls for, both sides of
/// every stack.
pub fn all_routes(config: &DeployConfig) -> Vec<RouteIdentifier> {
    let route_types = config.route_types();
    let mut routes = Vec::new();
    for stack in Stack::all(config.stacks) {
        for route_type in &route_types {
            for ds in DeploymentStack::ALL {
                routes.push(RouteIdentifier::new(stack, *route_type, ds));
            }
        }
    }
    routes
}

/// Create (or adopt) a balancer and a weighted record for every route
/// identifier, record both in state and wait for new records to sync.
///
/// Fresh records start at weight 0; adopted records keep their weight.
pub async fn ensure_infrastructure(ctx: &mut DeployContext, config: &DeployConfig) -> DeployResult<()> {
    let routes = all_routes(config);

    let mut tasks: Vec<BoxTask<LoadBalancerRecord, DeployError>> = Vec::new();
    for route in &routes {
        let spec = LoadBalancerSpec {
            name: load_balancer_name(&config.app_name, *route),
            family: config.load_balancer.family,
            internal: route.route_type == RouteType::Internal,
            health_check_path: config.load_balancer.health_check_path.clone(),
        };
        tasks.push(ensure_load_balancer(ctx.clients.clone(), *route, spec));
    }
    let (balancers, error) = split_settled(settle(tasks).await);
    for balancer in balancers {
        ctx.state.upsert_load_balancer(balancer);
    }
    if let Some(err) = error {
        return Err(err);
    }

    let mut tasks: Vec<BoxTask<(RouteRecord, Option<String>), DeployError>> = Vec::new();
    for route in &routes {
        let zone = config.zone(route.route_type).ok_or_else(|| {
            DeployError::Internal(format!("no zone configured for {}", route.route_type))
        })?;
        let balancer = ctx.state.load_balancer(*route).ok_or_else(|| {
            DeployError::Internal(format!("load balancer for {route} missing after provisioning"))
        })?;
        let record = RouteRecord {
            route: *route,
            zone_id: zone.zone_id.clone(),
            name: record_name(&config.app_name, &zone.domain),
            target: balancer.dns_name.clone(),
            ttl: config.ttl(),
        };
        tasks.push(ensure_record(ctx.clients.clone(), record));
    }
    let (records, error) = split_settled(settle(tasks).await);
    let mut changes = Vec::new();
    for (record, change) in records {
        ctx.state.upsert_route(record);
        changes.extend(change);
    }
    if let Some(err) = error {
        return Err(err);
    }

    if !changes.is_empty() {
        info!(changes = changes.len(), "weighted records written, waiting for dns sync");
        wait_for_changes(
            ctx.clients.dns.clone(),
            ctx.waiter(),
            ctx.settings.dns_sync_timeout(),
            changes,
        )
        .await?;
    }
    Ok(())
}

fn ensure_load_balancer(
    clients: CloudClients,
    route: RouteIdentifier,
    spec: LoadBalancerSpec,
) -> BoxTask<LoadBalancerRecord, DeployError> {
    Box::pin(async move {
        let description: LoadBalancerDescription =
            match clients.balancers.describe_load_balancer(&spec.name).await {
                Ok(existing) => {
                    debug!(%route, load_balancer = %spec.name, "adopting existing load balancer");
                    existing
                }
                Err(err) if err.is_not_found() => {
                    info!(%route, load_balancer = %spec.name, "creating load balancer");
                    clients.balancers.create_load_balancer(&spec).await?
                }
                Err(err) => return Err(err.into()),
            };
        Ok(LoadBalancerRecord {
            route,
            name: description.name,
            dns_name: description.dns_name,
            family: description.family,
        })
    })
}

/// Returns the record and, when something was written, its change id.
fn ensure_record(
    clients: CloudClients,
    record: RouteRecord,
) -> BoxTask<(RouteRecord, Option<String>), DeployError> {
    Box::pin(async move {
        let set_identifier = record.route.to_string();
        let weight = match clients
            .dns
            .get_record(&record.zone_id, &record.name, &set_identifier)
            .await
        {
            Ok(existing) if existing.value == record.target && existing.ttl == record.ttl => {
                debug!(route = %record.route, weight = existing.weight, "adopting weighted record");
                return Ok((record, None));
            }
            Ok(existing) => existing.weight,
            Err(err) if err.is_not_found() => 0,
            Err(err) => return Err(err.into()),
        };

        let change = clients
            .dns
            .upsert_records(
                &record.zone_id,
                &[WeightedRecord {
                    name: record.name.clone(),
                    set_identifier,
                    value: record.target.clone(),
                    weight,
                    ttl: record.ttl,
                }],
            )
            .await?;
        info!(route = %record.route, weight, "weighted record written");
        Ok((record, Some(change)))
    })
}

/// What to provision in one slot.
#[derive(Debug, Clone)]
pub struct SlotPlan {
    pub slot: Slot,
    pub fingerprint: String,
    pub group: String,
    pub template: String,
    pub initial_capacity: u32,
    /// Groups in the slot to delete before creating, with their templates.
    pub retire: Vec<(String, String)>,
    /// Balancers the group is attached to.
    pub load_balancers: Vec<String>,
}

impl SlotPlan {
    /// Plan a slot for `config`. Recorded groups of the slot with another
    /// name are retired when `retire_others` is set.
    pub fn new(
        ctx: &DeployContext,
        config: &DeployConfig,
        slot: Slot,
        fingerprint: &str,
        retire_others: bool,
    ) -> Self {
        let group = group_name(&config.app_name, slot, fingerprint);
        let retire = if retire_others {
            ctx.state
                .groups_in(slot)
                .into_iter()
                .filter(|g| g.name != group)
                .map(|g| (g.name.clone(), g.template.clone()))
                .collect()
        } else {
            Vec::new()
        };
        let load_balancers = config
            .route_types()
            .into_iter()
            .filter_map(|rt| ctx.state.load_balancer(slot.route(rt)))
            .map(|lb| lb.name.clone())
            .collect();
        Self {
            slot,
            fingerprint: fingerprint.to_string(),
            template: template_name(&group),
            group,
            initial_capacity: config.compute.initial_capacity,
            retire,
            load_balancers,
        }
    }
}

/// What a provisioning task did.
#[derive(Debug, Clone)]
pub struct SlotOutcome {
    pub group: ComputeGroupRecord,
    pub template: TemplateRecord,
    /// Groups (and their templates) deleted from the slot.
    pub retired: Vec<(String, String)>,
}

/// Bring one slot to a group matching the plan, at least at initial
/// capacity and attached to the slot's balancers.
pub fn provision_slot(
    clients: CloudClients,
    config: DeployConfig,
    plan: SlotPlan,
    version: u64,
) -> BoxTask<SlotOutcome, DeployError> {
    Box::pin(async move {
        let slot = plan.slot;
        for (group, template) in &plan.retire {
            info!(%slot, %group, "deleting compute group with a stale fingerprint");
            tolerate_missing(clients.compute.delete_group(group).await)?;
            tolerate_missing(clients.compute.delete_template(template).await)?;
        }

        match clients.compute.describe_template(&plan.template).await {
            Ok(_) => debug!(%slot, template = %plan.template, "adopting launch template"),
            Err(err) if err.is_not_found() => {
                clients
                    .compute
                    .create_template(&TemplateSpec {
                        name: plan.template.clone(),
                        image_id: config.compute.image_id.clone(),
                        instance_type: config.compute.instance_type.clone(),
                        user_data: config.compute.user_data.clone(),
                        fingerprint: plan.fingerprint.clone(),
                    })
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }

        match clients.compute.describe_group(&plan.group).await {
            Ok(existing) => {
                info!(%slot, group = %plan.group, desired = existing.desired_capacity, "reusing compute group");
                if existing.desired_capacity < plan.initial_capacity {
                    clients
                        .compute
                        .set_desired_capacity(&plan.group, plan.initial_capacity)
                        .await?;
                }
            }
            Err(err) if err.is_not_found() => {
                info!(%slot, group = %plan.group, capacity = plan.initial_capacity, "creating compute group");
                clients
                    .compute
                    .create_group(&GroupSpec {
                        name: plan.group.clone(),
                        template: plan.template.clone(),
                        desired_capacity: plan.initial_capacity,
                        health_check_path: config.load_balancer.health_check_path.clone(),
                    })
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }

        if !plan.load_balancers.is_empty() {
            clients
                .compute
                .attach_load_balancers(&plan.group, &plan.load_balancers)
                .await?;
        }

        Ok(SlotOutcome {
            group: ComputeGroupRecord {
                slot,
                name: plan.group.clone(),
                template: plan.template.clone(),
                fingerprint: plan.fingerprint.clone(),
                created_version: version,
            },
            template: TemplateRecord {
                name: plan.template,
                slot,
                fingerprint: plan.fingerprint,
            },
            retired: plan.retire,
        })
    })
}

/// Provision every plan in parallel. Successful outcomes are recorded
/// before any failure is raised. Returns the recorded groups.
pub async fn provision_slots(
    ctx: &mut DeployContext,
    config: &DeployConfig,
    plans: Vec<SlotPlan>,
) -> DeployResult<Vec<ComputeGroupRecord>> {
    let version = ctx.state.version;
    let tasks: Vec<BoxTask<SlotOutcome, DeployError>> = plans
        .into_iter()
        .map(|plan| provision_slot(ctx.clients.clone(), config.clone(), plan, version))
        .collect();

    let (outcomes, error) = split_settled(settle(tasks).await);
    let mut groups = Vec::new();
    for outcome in outcomes {
        for (group, template) in &outcome.retired {
            ctx.state.remove_group(group);
            ctx.state.remove_template(template);
        }
        // A reused group keeps the version it was created in.
        let mut group = outcome.group;
        if let Some(existing) = ctx.state.compute_groups.iter().find(|g| g.name == group.name) {
            group.created_version = existing.created_version;
        }
        ctx.state.upsert_template(outcome.template);
        ctx.state.upsert_group(group.clone());
        groups.push(group);
    }
    if let Some(err) = error {
        warn!(error = %err, provisioned = groups.len(), "provisioning failed");
        return Err(err);
    }
    Ok(groups)
}

/// Delete groups and their templates, tolerating ones already gone.
/// Deleted groups leave the state document before any failure is raised.
pub async fn delete_groups(ctx: &mut DeployContext, groups: Vec<(String, String)>) -> DeployResult<()> {
    if groups.is_empty() {
        return Ok(());
    }
    let tasks: Vec<BoxTask<(String, String), DeployError>> = groups
        .into_iter()
        .map(|(group, template)| {
            let compute = ctx.clients.compute.clone();
            Box::pin(async move {
                info!(%group, "deleting compute group");
                tolerate_missing(compute.delete_group(&group).await)?;
                tolerate_missing(compute.delete_template(&template).await)?;
                Ok((group, template))
            }) as BoxTask<(String, String), DeployError>
        })
        .collect();

    let (deleted, error) = split_settled(settle(tasks).await);
    for (group, template) in &deleted {
        ctx.state.remove_group(group);
        ctx.state.remove_template(template);
    }
    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
