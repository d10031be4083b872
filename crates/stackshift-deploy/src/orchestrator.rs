//! DeploymentOrchestrator: the operations behind every CLI command.
//!
//! Each mutating operation starts by reconciling the state document with
//! the cloud, fans cloud work out through the task coordinator and writes
//! results into the state only after each join point.

use std::collections::BTreeMap;
use std::sync::Arc;

use stackshift_cloud::TrafficMetrics;
use stackshift_core::fingerprint::short;
use stackshift_core::{
    compute_fingerprint, DeployConfig, DeployError, DeployResult, DeploymentStack, RouteIdentifier,
    Slot, Stack,
};
use stackshift_rollout::CanaryController;
use stackshift_routing::{wait_for_changes, StackMap, WeightedRouteStore};
use stackshift_state::ComputeGroupRecord;
use stackshift_tasks::{run, settle, BoxTask, FailureMode};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::context::DeployContext;
use crate::provision::{
    capacity_shares, capacity_units_for, delete_groups, ensure_infrastructure, provision_slots,
    split_settled, tolerate_missing, SlotPlan,
};
use crate::reconciler::StateReconciler;
use crate::waits::{capacity_provisioned, group_healthy, refresh_complete, targets_drained, targets_healthy};

/// Runs deploy operations for one application against a context.
pub struct DeploymentOrchestrator<'a> {
    ctx: &'a mut DeployContext,
    config: DeployConfig,
}

impl<'a> DeploymentOrchestrator<'a> {
    pub fn new(ctx: &'a mut DeployContext, config: DeployConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Deploy the configuration to the passive side and shift traffic to it.
    pub async fn deploy(&mut self) -> DeployResult<()> {
        self.deploy_with_salt(None).await
    }

    /// Deploy with fresh compute groups even when the configuration is
    /// unchanged.
    pub async fn redeploy(&mut self) -> DeployResult<()> {
        let salt = self.ctx.state.version;
        self.deploy_with_salt(Some(salt)).await
    }

    async fn deploy_with_salt(&mut self, salt: Option<u64>) -> DeployResult<()> {
        self.reconcile().await;
        let fingerprint = compute_fingerprint(&self.config.compute, salt);
        info!(
            app = %self.config.app_name,
            stacks = self.config.stacks,
            discoverable = self.config.discoverable(),
            fingerprint = short(&fingerprint),
            "deploying"
        );

        if self.config.discoverable() {
            self.deploy_discoverable(&fingerprint).await?;
        } else {
            self.deploy_single(&fingerprint).await?;
        }

        self.ctx.state.deploy_config = Some(self.config.clone());
        info!(app = %self.config.app_name, "deploy complete");
        Ok(())
    }

    /// One group in slot `1b`, no balancers or records. The previous group
    /// is deleted once the new one is healthy.
    async fn deploy_single(&mut self, fingerprint: &str) -> DeployResult<()> {
        let slot = Slot::new(Stack::FIRST, DeploymentStack::Blue);
        let plan = SlotPlan::new(self.ctx, &self.config, slot, fingerprint, false);
        let stale: Vec<(String, String)> = self
            .ctx
            .state
            .groups_in(slot)
            .into_iter()
            .filter(|g| g.name != plan.group)
            .map(|g| (g.name.clone(), g.template.clone()))
            .collect();

        let group = provision_slots(self.ctx, &self.config, vec![plan])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DeployError::Internal(format!("no compute group provisioned for {slot}")))?;

        let compute = self.ctx.clients.compute.clone();
        let waiter = self.ctx.waiter();
        let timeout = self.ctx.settings.health_timeout();
        group_healthy(
            compute.clone(),
            waiter,
            timeout,
            group.name.clone(),
            self.config.compute.initial_capacity,
        )
        .await?;

        let desired = self.config.compute.desired_capacity;
        compute.set_desired_capacity(&group.name, desired).await?;
        info!(group = %group.name, desired, "scaled compute group");
        group_healthy(compute, waiter, timeout, group.name.clone(), desired).await?;

        if !stale.is_empty() {
            info!(groups = stale.len(), "removing replaced compute groups");
            delete_groups(self.ctx, stale).await?;
        }
        Ok(())
    }

    async fn deploy_discoverable(&mut self, fingerprint: &str) -> DeployResult<()> {
        // Routing problems must surface before anything is created.
        let planned = self.route_store()?.planned_passive_map(None).await?;
        debug!(?planned, "routing checked");

        ensure_infrastructure(self.ctx, &self.config).await?;
        let routes = self.route_store()?;
        let passive = routes.passive_stack_map(None).await?;
        info!(?passive, "provisioning passive slots");

        let plans: Vec<SlotPlan> = passive
            .iter()
            .map(|(stack, ds)| SlotPlan::new(self.ctx, &self.config, Slot::new(*stack, *ds), fingerprint, true))
            .collect();
        let groups = provision_slots(self.ctx, &self.config, plans).await?;

        let waiter = self.ctx.waiter();
        let health_timeout = self.ctx.settings.health_timeout();
        let initial = self.config.compute.initial_capacity;
        let tasks: Vec<BoxTask<(), DeployError>> = groups
            .iter()
            .map(|g| group_healthy(self.ctx.clients.compute.clone(), waiter, health_timeout, g.name.clone(), initial))
            .collect();
        run(tasks, FailureMode::FailFast).await?;

        let shares = capacity_shares(self.config.compute.desired_capacity, self.config.stacks);
        self.scale_groups(&groups, &shares).await?;
        self.reserve_capacity_units(&routes, &passive).await?;
        self.wait_serving(&passive, &shares).await?;

        let metrics = self.traffic_views(&passive);
        let mut canary = CanaryController::new(
            routes,
            metrics,
            self.config.canary.clone(),
            self.ctx.settings.poll_interval(),
            self.ctx.settings.canary_stabilization(),
        );
        canary.run(&passive).await?;

        if self.config.passive_downscale.enabled {
            let previous: Vec<Slot> = passive
                .iter()
                .map(|(stack, ds)| Slot::new(*stack, ds.sister()))
                .collect();
            self.downscale(previous).await?;
        }
        Ok(())
    }

    /// Route all traffic back to the passive side of every stack.
    pub async fn revert(&mut self) -> DeployResult<()> {
        if !self.config.discoverable() {
            return Err(DeployError::Precondition(
                "revert needs weighted dns routing; a single-stack deployment has no passive side".into(),
            ));
        }
        self.reconcile().await;

        let routes = self.route_store()?;
        let active = routes.active_stack_map(None, false).await?;

        let mut target = StackMap::new();
        let mut tasks: Vec<BoxTask<(Stack, u32), DeployError>> = Vec::new();
        for (stack, ds) in &active {
            let passive_slot = Slot::new(*stack, ds.sister());
            let passive_group = self.ctx.state.group(passive_slot).ok_or_else(|| {
                DeployError::Precondition(format!("no compute group recorded for passive slot {passive_slot}"))
            })?;
            let active_slot = Slot::new(*stack, *ds);
            let active_group = self.ctx.state.group(active_slot).ok_or_else(|| {
                DeployError::Precondition(format!("no compute group recorded for active slot {active_slot}"))
            })?;
            target.insert(*stack, ds.sister());

            let compute = self.ctx.clients.compute.clone();
            let stack = *stack;
            let passive_name = passive_group.name.clone();
            let active_name = active_group.name.clone();
            tasks.push(Box::pin(async move {
                let desired = compute.describe_group(&active_name).await?.desired_capacity;
                compute.set_desired_capacity(&passive_name, desired).await?;
                info!(%stack, group = %passive_name, desired, "upscaled passive compute group");
                Ok::<_, DeployError>((stack, desired))
            }));
        }
        let desired: BTreeMap<Stack, u32> = run(tasks, FailureMode::FailFast).await?.into_iter().collect();

        self.wait_serving(&target, &desired).await?;
        routes.route_full_traffic(&target).await?;
        info!(?target, "traffic reverted");

        if self.config.passive_downscale.enabled {
            let previous: Vec<Slot> = active.iter().map(|(stack, ds)| Slot::new(*stack, *ds)).collect();
            self.downscale(previous).await?;
        }
        Ok(())
    }

    /// Split `capacity` across the active groups and wait for health.
    pub async fn scale(&mut self, capacity: u32) -> DeployResult<()> {
        self.reconcile().await;
        let groups = self.active_groups().await?;
        let shares = capacity_shares(capacity, self.config.stacks);
        info!(capacity, groups = groups.len(), "scaling active compute groups");

        self.scale_groups(&groups, &shares).await?;
        let waiter = self.ctx.waiter();
        let timeout = self.ctx.settings.health_timeout();
        let tasks: Vec<BoxTask<(), DeployError>> = groups
            .iter()
            .map(|g| {
                let share = shares.get(&g.slot.stack).copied().unwrap_or(0);
                group_healthy(self.ctx.clients.compute.clone(), waiter, timeout, g.name.clone(), share)
            })
            .collect();
        run(tasks, FailureMode::FailFast).await?;

        self.config.compute.desired_capacity = capacity;
        self.ctx.state.deploy_config = Some(self.config.clone());
        Ok(())
    }

    /// Replace the instances of every active group in place.
    pub async fn rolling_restart(&mut self) -> DeployResult<()> {
        self.reconcile().await;
        let groups = self.active_groups().await?;
        let min_healthy = self.ctx.settings.refresh_min_healthy_percent;
        let waiter = self.ctx.waiter();
        let timeout = self.ctx.settings.refresh_timeout();

        let tasks: Vec<BoxTask<(), DeployError>> = groups
            .iter()
            .map(|g| {
                let compute = self.ctx.clients.compute.clone();
                let group = g.name.clone();
                Box::pin(async move {
                    let refresh_id = compute.start_instance_refresh(&group, min_healthy).await?;
                    info!(%group, %refresh_id, min_healthy, "instance refresh started");
                    refresh_complete(compute, waiter, timeout, group, refresh_id).await
                }) as BoxTask<(), DeployError>
            })
            .collect();
        run(tasks, FailureMode::FailFast).await?;
        info!(groups = groups.len(), "rolling restart complete");
        Ok(())
    }

    async fn reconcile(&mut self) {
        StateReconciler::new(self.ctx.clients.clone())
            .correct_state(&mut self.ctx.state)
            .await;
    }

    fn route_store(&self) -> DeployResult<WeightedRouteStore> {
        WeightedRouteStore::new(
            self.ctx.clients.dns.clone(),
            &self.ctx.state.routes,
            self.config.route_types(),
            self.config.stacks,
            self.ctx.waiter(),
            self.ctx.settings.dns_sync_timeout(),
        )
    }

    /// The group serving traffic in every stack.
    async fn active_groups(&self) -> DeployResult<Vec<ComputeGroupRecord>> {
        let slots: Vec<Slot> = if self.config.discoverable() {
            let active = self.route_store()?.active_stack_map(None, false).await?;
            active.iter().map(|(stack, ds)| Slot::new(*stack, *ds)).collect()
        } else {
            vec![Slot::new(Stack::FIRST, DeploymentStack::Blue)]
        };

        slots
            .into_iter()
            .map(|slot| {
                self.ctx.state.group(slot).cloned().ok_or_else(|| {
                    DeployError::Precondition(format!("no compute group recorded for active slot {slot}"))
                })
            })
            .collect()
    }

    async fn scale_groups(&self, groups: &[ComputeGroupRecord], shares: &BTreeMap<Stack, u32>) -> DeployResult<()> {
        let tasks: Vec<BoxTask<(), DeployError>> = groups
            .iter()
            .map(|g| {
                let compute = self.ctx.clients.compute.clone();
                let group = g.name.clone();
                let share = shares.get(&g.slot.stack).copied().unwrap_or(0);
                Box::pin(async move {
                    compute.set_desired_capacity(&group, share).await?;
                    info!(%group, desired = share, "scaled compute group");
                    Ok(())
                }) as BoxTask<(), DeployError>
            })
            .collect();
        run(tasks, FailureMode::FailFast).await?;
        Ok(())
    }

    /// Reserve each stack's share of the configured capacity units on the
    /// target slot's balancers. Skipped when no units are configured.
    async fn reserve_capacity_units(&self, routes: &WeightedRouteStore, target: &StackMap) -> DeployResult<()> {
        let total = self.config.load_balancer.capacity_units;
        if total == 0 {
            return Ok(());
        }
        let mut tasks: Vec<BoxTask<(), DeployError>> = Vec::new();
        for route in self.target_routes(target) {
            let Some(balancer) = self.ctx.state.load_balancer(route) else {
                continue;
            };
            let units = capacity_units_for(total, routes.full_weight(route.stack));
            let balancers = self.ctx.clients.balancers.clone();
            let name = balancer.name.clone();
            tasks.push(Box::pin(async move {
                balancers.set_capacity_units(&name, units).await?;
                info!(load_balancer = %name, units, "capacity units requested");
                Ok::<_, DeployError>(())
            }));
        }
        run(tasks, FailureMode::FailFast).await?;
        Ok(())
    }

    /// Wait until the target slot's balancers see `desired` healthy targets
    /// and any requested capacity units are provisioned.
    async fn wait_serving(&self, target: &StackMap, desired: &BTreeMap<Stack, u32>) -> DeployResult<()> {
        let waiter = self.ctx.waiter();
        let health_timeout = self.ctx.settings.health_timeout();
        let capacity_timeout = self.ctx.settings.capacity_timeout();
        let reserve = self.config.load_balancer.capacity_units > 0;

        let mut tasks: Vec<BoxTask<(), DeployError>> = Vec::new();
        for route in self.target_routes(target) {
            let Some(balancer) = self.ctx.state.load_balancer(route) else {
                return Err(DeployError::Precondition(format!("no load balancer recorded for {route}")));
            };
            let count = desired.get(&route.stack).copied().unwrap_or(0);
            tasks.push(targets_healthy(self.ctx.clients.traffic(balancer), waiter, health_timeout, count));
            if reserve {
                tasks.push(capacity_provisioned(
                    self.ctx.clients.balancers.clone(),
                    waiter,
                    capacity_timeout,
                    balancer.name.clone(),
                ));
            }
        }
        run(tasks, FailureMode::FailFast).await?;
        Ok(())
    }

    fn target_routes(&self, target: &StackMap) -> Vec<RouteIdentifier> {
        let route_types = self.config.route_types();
        target
            .iter()
            .flat_map(|(stack, ds)| {
                route_types
                    .iter()
                    .map(move |rt| RouteIdentifier::new(*stack, *rt, *ds))
            })
            .collect()
    }

    /// Traffic views of the target slot's balancers, for canary analysis.
    fn traffic_views(&self, target: &StackMap) -> BTreeMap<RouteIdentifier, Arc<dyn TrafficMetrics>> {
        self.target_routes(target)
            .into_iter()
            .filter_map(|route| {
                let balancer = self.ctx.state.load_balancer(route)?;
                Some((route, self.ctx.clients.traffic(balancer)))
            })
            .collect()
    }

    /// After the configured delay, scale `slots` to zero, wait for their
    /// balancers to drain, then delete recorded groups no balancer uses.
    async fn downscale(&mut self, slots: Vec<Slot>) -> DeployResult<()> {
        let delay = self.config.passive_downscale.delay();
        info!(delay_secs = delay.as_secs(), ?slots, "downscaling previous side after delay");
        sleep(delay).await;

        let waiter = self.ctx.waiter();
        let drain_timeout = self.ctx.settings.drain_timeout();
        let route_types = self.config.route_types();
        let mut tasks: Vec<BoxTask<(), DeployError>> = Vec::new();
        for slot in slots {
            let Some(group) = self.ctx.state.group(slot) else {
                debug!(%slot, "no compute group to downscale");
                continue;
            };
            let drains: Vec<BoxTask<(), DeployError>> = route_types
                .iter()
                .filter_map(|rt| self.ctx.state.load_balancer(slot.route(*rt)))
                .map(|lb| targets_drained(self.ctx.clients.balancers.clone(), waiter, drain_timeout, lb.name.clone()))
                .collect();
            let compute = self.ctx.clients.compute.clone();
            let name = group.name.clone();
            tasks.push(Box::pin(async move {
                compute.set_desired_capacity(&name, 0).await?;
                info!(%slot, group = %name, "scaled previous compute group to zero");
                run(drains, FailureMode::FailFast).await?;
                Ok::<_, DeployError>(())
            }));
        }
        run(tasks, FailureMode::FailFast).await?;

        self.sweep_unattached().await
    }

    /// Delete recorded groups that no balancer routes to.
    async fn sweep_unattached(&mut self) -> DeployResult<()> {
        let tasks: Vec<BoxTask<Option<(String, String)>, DeployError>> = self
            .ctx
            .state
            .compute_groups
            .iter()
            .map(|g| {
                let compute = self.ctx.clients.compute.clone();
                let group = g.name.clone();
                let template = g.template.clone();
                Box::pin(async move {
                    match compute.describe_group(&group).await {
                        Ok(described) if !described.is_attached() => Ok(Some((group, template))),
                        Ok(_) => Ok(None),
                        Err(err) if err.is_not_found() => Ok(None),
                        Err(err) => Err(err.into()),
                    }
                }) as BoxTask<Option<(String, String)>, DeployError>
            })
            .collect();
        let unattached: Vec<(String, String)> = run(tasks, FailureMode::FailFast)
            .await?
            .into_iter()
            .flatten()
            .collect();
        if !unattached.is_empty() {
            info!(groups = unattached.len(), "deleting compute groups without load balancers");
            delete_groups(self.ctx, unattached).await?;
        }
        Ok(())
    }
}

/// Delete every recorded resource and forget the stored configuration.
///
/// Weighted records go first so no traffic is routed to a balancer that
/// is about to disappear.
pub async fn undeploy(ctx: &mut DeployContext) -> DeployResult<()> {
    StateReconciler::new(ctx.clients.clone())
        .correct_state(&mut ctx.state)
        .await;
    info!(
        groups = ctx.state.compute_groups.len(),
        load_balancers = ctx.state.load_balancers.len(),
        routes = ctx.state.routes.len(),
        "undeploying"
    );

    let tasks: Vec<BoxTask<(RouteIdentifier, Option<String>), DeployError>> = ctx
        .state
        .routes
        .iter()
        .map(|record| {
            let dns = ctx.clients.dns.clone();
            let record = record.clone();
            Box::pin(async move {
                let set_identifier = record.route.to_string();
                let live = match dns.get_record(&record.zone_id, &record.name, &set_identifier).await {
                    Ok(live) => live,
                    Err(err) if err.is_not_found() => return Ok((record.route, None)),
                    Err(err) => return Err(err.into()),
                };
                let change = dns.delete_records(&record.zone_id, &[live]).await?;
                info!(route = %record.route, "weighted record deleted");
                Ok((record.route, Some(change)))
            }) as BoxTask<(RouteIdentifier, Option<String>), DeployError>
        })
        .collect();
    let (deleted, error) = split_settled(settle(tasks).await);
    let mut changes = Vec::new();
    for (route, change) in deleted {
        ctx.state.remove_route(route);
        changes.extend(change);
    }
    if let Some(err) = error {
        return Err(err);
    }
    wait_for_changes(
        ctx.clients.dns.clone(),
        ctx.waiter(),
        ctx.settings.dns_sync_timeout(),
        changes,
    )
    .await?;

    let groups: Vec<(String, String)> = ctx
        .state
        .compute_groups
        .iter()
        .map(|g| (g.name.clone(), g.template.clone()))
        .collect();
    delete_groups(ctx, groups).await?;

    let templates: Vec<BoxTask<String, DeployError>> = ctx
        .state
        .templates
        .iter()
        .map(|t| {
            let compute = ctx.clients.compute.clone();
            let name = t.name.clone();
            Box::pin(async move {
                tolerate_missing(compute.delete_template(&name).await)?;
                Ok(name)
            }) as BoxTask<String, DeployError>
        })
        .collect();
    let (deleted, error) = split_settled(settle(templates).await);
    for name in deleted {
        ctx.state.remove_template(&name);
    }
    if let Some(err) = error {
        return Err(err);
    }

    let balancers: Vec<BoxTask<RouteIdentifier, DeployError>> = ctx
        .state
        .load_balancers
        .iter()
        .map(|lb| {
            let client = ctx.clients.balancers.clone();
            let route = lb.route;
            let name = lb.name.clone();
            Box::pin(async move {
                tolerate_missing(client.delete_load_balancer(&name).await)?;
                info!(%route, load_balancer = %name, "load balancer deleted");
                Ok(route)
            }) as BoxTask<RouteIdentifier, DeployError>
        })
        .collect();
    let (deleted, error) = split_settled(settle(balancers).await);
    for route in deleted {
        ctx.state.remove_load_balancer(route);
    }
    if let Some(err) = error {
        warn!(error = %err, "some load balancers could not be deleted");
        return Err(err);
    }

    ctx.state.deploy_config = None;
    info!("undeploy complete");
    Ok(())
}
