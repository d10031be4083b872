//! WeightedRouteStore: active/passive resolution over weighted records.
//!
//! Every stack has one weighted record per (route type, deployment stack),
//! identified by its route identifier (`"1ib"`, `"1ig"`, `"1eb"`, …). The
//! store reads those records to decide which side of each stack is live
//! and rewrites their weights to move traffic.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use stackshift_cloud::{ChangeStatus, DnsClient, WeightedRecord};
use stackshift_core::{DeployError, DeployResult, DeploymentStack, RouteIdentifier, RouteType, Stack};
use stackshift_state::RouteRecord;
use stackshift_tasks::{run, BoxTask, FailureMode, PollingWaiter};
use tracing::{debug, info};

use crate::distribution::{valid_weights, weight_distribution};

/// One deployment stack per stack, e.g. the passive side of each.
pub type StackMap = BTreeMap<Stack, DeploymentStack>;

/// Weights of a stack's deployment stacks.
pub type StackWeights = BTreeMap<DeploymentStack, u32>;

#[derive(Clone)]
pub struct WeightedRouteStore {
    dns: Arc<dyn DnsClient>,
    routes: BTreeMap<RouteIdentifier, RouteRecord>,
    route_types: Vec<RouteType>,
    distribution: BTreeMap<Stack, u32>,
    waiter: PollingWaiter,
    sync_timeout: Duration,
}

impl WeightedRouteStore {
    /// Build a store over the recorded weighted records.
    pub fn new(
        dns: Arc<dyn DnsClient>,
        routes: &[RouteRecord],
        route_types: Vec<RouteType>,
        stacks: u32,
        waiter: PollingWaiter,
        sync_timeout: Duration,
    ) -> DeployResult<Self> {
        if route_types.is_empty() {
            return Err(DeployError::InvalidConfig(
                "weighted routing needs at least one dns zone".to_string(),
            ));
        }
        Ok(Self {
            dns,
            routes: routes.iter().map(|r| (r.route, r.clone())).collect(),
            route_types,
            distribution: weight_distribution(stacks)?,
            waiter,
            sync_timeout,
        })
    }

    pub fn stacks(&self) -> Vec<Stack> {
        self.distribution.keys().copied().collect()
    }

    pub fn distribution(&self) -> &BTreeMap<Stack, u32> {
        &self.distribution
    }

    /// Weight of `stack` when it carries its whole share.
    pub fn full_weight(&self, stack: Stack) -> u32 {
        self.distribution.get(&stack).copied().unwrap_or(0)
    }

    pub fn route_types(&self) -> &[RouteType] {
        &self.route_types
    }

    fn selected(&self, stacks: Option<&[Stack]>) -> Vec<Stack> {
        match stacks {
            Some(stacks) => stacks.to_vec(),
            None => self.stacks(),
        }
    }

    fn route_record(&self, route: RouteIdentifier) -> DeployResult<&RouteRecord> {
        self.routes
            .get(&route)
            .ok_or_else(|| DeployError::InconsistentRouting {
                stack: route.stack,
                detail: format!("no weighted record recorded for {route}"),
            })
    }

    /// Weights of both deployment stacks of `stack`, per route type.
    ///
    /// With `missing_as_zero`, a record that is not recorded or no longer
    /// exists reads as weight 0 instead of failing.
    async fn read_stack(
        &self,
        stack: Stack,
        missing_as_zero: bool,
    ) -> DeployResult<BTreeMap<RouteType, StackWeights>> {
        let mut by_type = BTreeMap::new();
        for route_type in &self.route_types {
            let mut weights = StackWeights::new();
            for ds in DeploymentStack::ALL {
                let route = RouteIdentifier::new(stack, *route_type, ds);
                let record = match self.route_record(route) {
                    Ok(record) => record,
                    Err(_) if missing_as_zero => {
                        weights.insert(ds, 0);
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                let weight = match self
                    .dns
                    .get_record(&record.zone_id, &record.name, &route.to_string())
                    .await
                {
                    Ok(live) => live.weight,
                    Err(err) if missing_as_zero && err.is_not_found() => 0,
                    Err(err) => return Err(err.into()),
                };
                weights.insert(ds, weight);
            }
            by_type.insert(*route_type, weights);
        }
        debug!(%stack, ?by_type, "read weighted records");
        Ok(by_type)
    }

    /// The zero-weight deployment stack of every selected stack.
    ///
    /// When both sides are at zero (nothing deployed yet) blue is passive.
    pub async fn passive_stack_map(&self, stacks: Option<&[Stack]>) -> DeployResult<StackMap> {
        self.resolve_passive(stacks, false).await
    }

    /// The passive map the records would give once every missing record
    /// exists at weight 0. Reads only, so a deploy can reject bad routing
    /// before it creates anything.
    pub async fn planned_passive_map(&self, stacks: Option<&[Stack]>) -> DeployResult<StackMap> {
        self.resolve_passive(stacks, true).await
    }

    async fn resolve_passive(&self, stacks: Option<&[Stack]>, missing_as_zero: bool) -> DeployResult<StackMap> {
        let valid = valid_weights(&self.distribution);
        let mut map = StackMap::new();

        for stack in self.selected(stacks) {
            let by_type = self.read_stack(stack, missing_as_zero).await?;
            let mut zero_sets = Vec::new();
            for (route_type, weights) in &by_type {
                for (ds, weight) in weights {
                    if *weight > 0 && !valid.contains(weight) {
                        return Err(DeployError::InvalidWeight {
                            identifier: RouteIdentifier::new(stack, *route_type, *ds),
                            weight: *weight,
                            stacks: self.distribution.len() as u32,
                        });
                    }
                }
                zero_sets.push((*route_type, matching(weights, |w| w == 0)));
            }

            let zero = agreed(stack, &zero_sets, "zero")?;
            let passive = if zero.contains(&DeploymentStack::Blue) {
                DeploymentStack::Blue
            } else if zero.contains(&DeploymentStack::Green) {
                DeploymentStack::Green
            } else {
                return Err(DeployError::NoPassiveRecord { stack });
            };
            map.insert(stack, passive);
        }
        Ok(map)
    }

    /// The non-zero-weight deployment stack of every selected stack.
    ///
    /// With `allow_zero_weights`, a stack whose records are all at zero is
    /// left out of the map instead of failing.
    pub async fn active_stack_map(
        &self,
        stacks: Option<&[Stack]>,
        allow_zero_weights: bool,
    ) -> DeployResult<StackMap> {
        let mut map = StackMap::new();

        for stack in self.selected(stacks) {
            let by_type = self.read_stack(stack, false).await?;
            let mut active_sets = Vec::new();
            for (route_type, weights) in &by_type {
                let active = matching(weights, |w| w > 0);
                if active.len() > 1 {
                    return Err(DeployError::MultipleActiveRecords {
                        stack,
                        route_type: *route_type,
                    });
                }
                active_sets.push((*route_type, active));
            }

            match agreed(stack, &active_sets, "non-zero")?.first() {
                Some(active) => {
                    map.insert(stack, *active);
                }
                None if allow_zero_weights => {}
                None => return Err(DeployError::NoActiveRecord { stack }),
            }
        }
        Ok(map)
    }

    /// Current weights of every selected stack.
    pub async fn current_weights(&self, stacks: Option<&[Stack]>) -> DeployResult<BTreeMap<Stack, StackWeights>> {
        let mut current = BTreeMap::new();
        for stack in self.selected(stacks) {
            let by_type = self.read_stack(stack, false).await?;
            let weights = by_type.into_values().next().unwrap_or_default();
            current.insert(stack, weights);
        }
        Ok(current)
    }

    /// Rewrite the weights of `stack` in every route type, then wait for
    /// every change to be in sync.
    pub async fn set_weights(&self, stack: Stack, weights: &StackWeights) -> DeployResult<()> {
        if weights.is_empty() {
            return Ok(());
        }

        let mut changes = Vec::new();
        for route_type in &self.route_types {
            let mut zone_id = String::new();
            let mut records = Vec::new();
            for (ds, weight) in weights {
                let route = RouteIdentifier::new(stack, *route_type, *ds);
                let record = self.route_record(route)?;
                zone_id.clone_from(&record.zone_id);
                records.push(WeightedRecord {
                    name: record.name.clone(),
                    set_identifier: route.to_string(),
                    value: record.target.clone(),
                    weight: *weight,
                    ttl: record.ttl,
                });
            }
            changes.push(self.dns.upsert_records(&zone_id, &records).await?);
        }

        info!(%stack, ?weights, changes = changes.len(), "weights written, waiting for dns sync");
        self.wait_for_sync(changes).await
    }

    /// Apply weights to several stacks in parallel.
    pub async fn set_many(&self, weights: &BTreeMap<Stack, StackWeights>) -> DeployResult<()> {
        let tasks: Vec<BoxTask<(), DeployError>> = weights
            .iter()
            .map(|(stack, weights)| {
                let store = self.clone();
                let stack = *stack;
                let weights = weights.clone();
                Box::pin(async move { store.set_weights(stack, &weights).await }) as BoxTask<(), DeployError>
            })
            .collect();
        run(tasks, FailureMode::FailFast).await?;
        Ok(())
    }

    /// Give each mapped deployment stack its full weight and its sister zero.
    pub async fn route_full_traffic(&self, map: &StackMap) -> DeployResult<()> {
        let weights: BTreeMap<Stack, StackWeights> = map
            .iter()
            .map(|(stack, ds)| {
                let weights = StackWeights::from([(*ds, self.full_weight(*stack)), (ds.sister(), 0)]);
                (*stack, weights)
            })
            .collect();
        self.set_many(&weights).await
    }

    /// Wait in parallel until every change is in sync.
    pub async fn wait_for_sync(&self, change_ids: Vec<String>) -> DeployResult<()> {
        wait_for_changes(self.dns.clone(), self.waiter, self.sync_timeout, change_ids).await
    }
}

/// Deployment stacks whose weight satisfies `predicate`.
fn matching(weights: &StackWeights, predicate: impl Fn(u32) -> bool) -> Vec<DeploymentStack> {
    weights
        .iter()
        .filter(|(_, w)| predicate(**w))
        .map(|(ds, _)| *ds)
        .collect()
}

/// The set every route type agrees on, or `InconsistentRouting`.
fn agreed(
    stack: Stack,
    sets: &[(RouteType, Vec<DeploymentStack>)],
    label: &str,
) -> DeployResult<Vec<DeploymentStack>> {
    let Some((_, first)) = sets.first() else {
        return Ok(Vec::new());
    };
    if sets.iter().all(|(_, set)| set == first) {
        return Ok(first.clone());
    }
    let detail = sets
        .iter()
        .map(|(route_type, set)| {
            let names: BTreeSet<String> = set.iter().map(ToString::to_string).collect();
            format!("{route_type} {label} on {names:?}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    Err(DeployError::InconsistentRouting { stack, detail })
}

/// A task that completes once `change_id` is in sync.
pub fn dns_sync_task(
    dns: Arc<dyn DnsClient>,
    waiter: PollingWaiter,
    timeout: Duration,
    change_id: String,
) -> BoxTask<(), DeployError> {
    Box::pin(async move {
        let what = format!("dns change {change_id} in sync");
        waiter
            .wait_until(
                &what,
                timeout,
                || {
                    let dns = dns.clone();
                    let change_id = change_id.clone();
                    async move { dns.change_status(&change_id).await.map_err(DeployError::from) }
                },
                |status| *status == ChangeStatus::InSync,
            )
            .await?;
        Ok(())
    })
}

/// Wait in parallel (fail fast) until every change is in sync.
pub async fn wait_for_changes(
    dns: Arc<dyn DnsClient>,
    waiter: PollingWaiter,
    timeout: Duration,
    change_ids: Vec<String>,
) -> DeployResult<()> {
    let tasks: Vec<BoxTask<(), DeployError>> = change_ids
        .into_iter()
        .map(|id| dns_sync_task(dns.clone(), waiter, timeout, id))
        .collect();
    run(tasks, FailureMode::FailFast).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackshift_cloud::{SandboxCloud, SandboxOptions};
    use stackshift_core::ErrorCategory;

    const POLL: Duration = Duration::from_secs(10);

    fn stack(n: u32) -> Stack {
        Stack::new(n).unwrap()
    }

    fn zone(route_type: RouteType) -> &'static str {
        match route_type {
            RouteType::Internal => "Z-INT",
            RouteType::External => "Z-EXT",
        }
    }

    /// A sandbox with every record of `stacks` stacks, at the given
    /// weights (unlisted identifiers start at zero).
    async fn fixture(
        cloud: Arc<SandboxCloud>,
        stacks: u32,
        route_types: &[RouteType],
        weights: &[(&str, u32)],
    ) -> WeightedRouteStore {
        let mut routes = Vec::new();
        for stack in Stack::all(stacks) {
            for route_type in route_types {
                for ds in DeploymentStack::ALL {
                    let route = RouteIdentifier::new(stack, *route_type, ds);
                    let record = RouteRecord {
                        route,
                        zone_id: zone(*route_type).to_string(),
                        name: format!("shop-{stack}.{route_type}.example.com"),
                        target: format!("shop-{route}.lb.sandbox"),
                        ttl: 60,
                    };
                    let weight = weights
                        .iter()
                        .find(|(id, _)| *id == route.to_string())
                        .map(|(_, w)| *w)
                        .unwrap_or(0);
                    cloud
                        .upsert_records(
                            &record.zone_id,
                            &[WeightedRecord {
                                name: record.name.clone(),
                                set_identifier: route.to_string(),
                                value: record.target.clone(),
                                weight,
                                ttl: 60,
                            }],
                        )
                        .await
                        .unwrap();
                    routes.push(record);
                }
            }
        }
        WeightedRouteStore::new(
            cloud,
            &routes,
            route_types.to_vec(),
            stacks,
            PollingWaiter::new(POLL),
            Duration::from_secs(600),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_records_make_blue_passive() {
        let cloud = Arc::new(SandboxCloud::new());
        let store = fixture(cloud, 2, &RouteType::ALL, &[]).await;

        let passive = store.passive_stack_map(None).await.unwrap();
        assert_eq!(
            passive,
            StackMap::from([(stack(1), DeploymentStack::Blue), (stack(2), DeploymentStack::Blue)])
        );
        assert!(store.active_stack_map(None, true).await.unwrap().is_empty());
        assert!(matches!(
            store.active_stack_map(None, false).await,
            Err(DeployError::NoActiveRecord { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn full_traffic_swaps_active_and_passive() {
        let cloud = Arc::new(SandboxCloud::new());
        let store = fixture(
            cloud.clone(),
            2,
            &RouteType::ALL,
            &[("1ib", 50), ("1eb", 50), ("2ib", 50), ("2eb", 50)],
        )
        .await;

        let passive = store.passive_stack_map(None).await.unwrap();
        assert!(passive.values().all(|ds| *ds == DeploymentStack::Green));

        store.route_full_traffic(&passive).await.unwrap();

        assert_eq!(store.active_stack_map(None, false).await.unwrap(), passive);
        let weights = store.current_weights(None).await.unwrap();
        assert_eq!(
            weights[&stack(1)],
            StackWeights::from([(DeploymentStack::Blue, 0), (DeploymentStack::Green, 50)])
        );
        assert_eq!(cloud.weight_history("2eg"), vec![0, 50]);
        assert_eq!(
            store.passive_stack_map(None).await.unwrap(),
            StackMap::from([(stack(1), DeploymentStack::Blue), (stack(2), DeploymentStack::Blue)])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn route_types_must_agree() {
        let cloud = Arc::new(SandboxCloud::new());
        let store = fixture(cloud, 1, &RouteType::ALL, &[("1ib", 100)]).await;

        let err = store.passive_stack_map(None).await.unwrap_err();
        assert!(matches!(err, DeployError::InconsistentRouting { .. }), "{err}");
        assert_eq!(err.category(), ErrorCategory::User);
        assert!(matches!(
            store.active_stack_map(None, true).await,
            Err(DeployError::InconsistentRouting { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn two_live_sides_have_no_passive_record() {
        let cloud = Arc::new(SandboxCloud::new());
        let store = fixture(
            cloud,
            2,
            &[RouteType::Internal],
            &[("1ib", 50), ("1ig", 50), ("2ib", 50)],
        )
        .await;

        assert!(matches!(
            store.passive_stack_map(Some(&[stack(1)])).await,
            Err(DeployError::NoPassiveRecord { .. })
        ));
        assert!(matches!(
            store.active_stack_map(None, false).await,
            Err(DeployError::MultipleActiveRecords {
                route_type: RouteType::Internal,
                ..
            })
        ));
        let passive = store.passive_stack_map(Some(&[stack(2)])).await.unwrap();
        assert_eq!(passive[&stack(2)], DeploymentStack::Green);
    }

    #[tokio::test(start_paused = true)]
    async fn weights_outside_the_distribution_are_rejected() {
        let cloud = Arc::new(SandboxCloud::new());
        let store = fixture(cloud, 1, &[RouteType::External], &[("1eg", 30)]).await;

        let err = store.passive_stack_map(None).await.unwrap_err();
        assert!(matches!(err, DeployError::InvalidWeight { weight: 30, stacks: 1, .. }));
        assert_eq!(err.to_string(), "weight 30 on 1eg is not part of the distribution for 1 stacks");
    }

    #[tokio::test(start_paused = true)]
    async fn planned_map_reads_missing_records_as_zero() {
        let cloud = Arc::new(SandboxCloud::new());
        let store = fixture(cloud.clone(), 1, &[RouteType::Internal], &[("1ib", 100)]).await;
        // Same records, but a second stack that has none yet.
        let routes: Vec<RouteRecord> = store.routes.values().cloned().collect();
        let grown = WeightedRouteStore::new(
            cloud.clone(),
            &routes,
            vec![RouteType::Internal],
            2,
            PollingWaiter::new(POLL),
            Duration::from_secs(600),
        )
        .unwrap();

        let err = grown.planned_passive_map(None).await.unwrap_err();
        assert!(matches!(err, DeployError::InvalidWeight { weight: 100, stacks: 2, .. }), "{err}");
        assert!(matches!(
            grown.passive_stack_map(Some(&[stack(2)])).await,
            Err(DeployError::InconsistentRouting { .. })
        ));
        assert_eq!(
            grown.planned_passive_map(Some(&[stack(2)])).await.unwrap(),
            StackMap::from([(stack(2), DeploymentStack::Blue)])
        );

        let before = cloud.record_count();
        assert_eq!(
            store.planned_passive_map(None).await.unwrap(),
            StackMap::from([(stack(1), DeploymentStack::Green)])
        );
        assert_eq!(cloud.record_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn set_weights_waits_for_every_change() {
        let cloud = Arc::new(SandboxCloud::with_options(SandboxOptions {
            dns_sync_polls: 3,
            ..SandboxOptions::default()
        }));
        let store = fixture(cloud.clone(), 1, &RouteType::ALL, &[]).await;

        let started = tokio::time::Instant::now();
        store
            .set_weights(stack(1), &StackWeights::from([(DeploymentStack::Blue, 100)]))
            .await
            .unwrap();

        assert!(started.elapsed() >= POLL * 3);
        assert_eq!(cloud.weight_history("1ib"), vec![0, 100]);
        assert_eq!(cloud.weight_history("1eb"), vec![0, 100]);
        // Untouched sides are not rewritten.
        assert_eq!(cloud.weight_history("1ig"), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_change_times_out() {
        let cloud = Arc::new(SandboxCloud::with_options(SandboxOptions {
            dns_sync_polls: u32::MAX,
            ..SandboxOptions::default()
        }));
        let mut store = fixture(cloud, 1, &[RouteType::Internal], &[]).await;
        store.sync_timeout = Duration::from_secs(60);

        let err = store
            .set_weights(stack(1), &StackWeights::from([(DeploymentStack::Green, 100)]))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Timeout);
    }

    #[test]
    fn store_needs_a_route_type() {
        let result = WeightedRouteStore::new(
            Arc::new(SandboxCloud::new()),
            &[],
            Vec::new(),
            1,
            PollingWaiter::new(POLL),
            Duration::from_secs(60),
        );
        assert!(matches!(result, Err(DeployError::InvalidConfig(_))));
    }
}
