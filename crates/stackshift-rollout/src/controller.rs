//! Canary controller: drives the canary state machine.
//!
//! ```text
//! Initial ─► Step(1/n) ─► … ─► Step(n/n) ─► Full ─► Done
//!    └──────────── any failure ──────────► Reverting ─► Failed
//! ```
//!
//! Every step is applied to all stacks at once. A failure at any point
//! after the first write restores the weights recorded before it, then
//! returns the original failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stackshift_cloud::TrafficMetrics;
use stackshift_core::{CanaryConfig, DeployError, DeployResult, RouteIdentifier, Stack};
use stackshift_routing::{StackMap, StackWeights, WeightedRouteStore};
use stackshift_tasks::{run, BoxTask, FailureMode};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::analysis::watch;
use crate::strategy::{step_shift, step_weights};

/// Current phase of a canary rollout.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CanaryPhase {
    /// No weight has moved yet.
    Initial,
    /// Step `current` of `total` applied and under analysis.
    Step { current: u32, total: u32 },
    /// All traffic on the new side, final analysis running.
    Full,
    /// Completed successfully.
    Done,
    /// Restoring the pre-canary weights.
    Reverting,
    /// Rolled back (or failed before any change).
    Failed { reason: String },
}

/// Shifts traffic to the target deployment stack of every stack.
pub struct CanaryController {
    routes: WeightedRouteStore,
    /// Traffic view of each target route's load balancer.
    metrics: BTreeMap<RouteIdentifier, Arc<dyn TrafficMetrics>>,
    config: CanaryConfig,
    poll_interval: Duration,
    stabilization: Duration,
    phase: CanaryPhase,
}

impl CanaryController {
    pub fn new(
        routes: WeightedRouteStore,
        metrics: BTreeMap<RouteIdentifier, Arc<dyn TrafficMetrics>>,
        config: CanaryConfig,
        poll_interval: Duration,
        stabilization: Duration,
    ) -> Self {
        Self {
            routes,
            metrics,
            config,
            poll_interval,
            stabilization,
            phase: CanaryPhase::Initial,
        }
    }

    pub fn phase(&self) -> &CanaryPhase {
        &self.phase
    }

    /// Move all traffic of every stack in `target` to the mapped side.
    ///
    /// With canary disabled this is a direct cutover without analysis.
    pub async fn run(&mut self, target: &StackMap) -> DeployResult<()> {
        if !self.config.enabled {
            info!(stacks = target.len(), "canary disabled, routing full traffic");
            if let Err(err) = self.routes.route_full_traffic(target).await {
                self.phase = CanaryPhase::Failed {
                    reason: err.to_string(),
                };
                return Err(err);
            }
            self.phase = CanaryPhase::Done;
            return Ok(());
        }

        let stacks: Vec<Stack> = target.keys().copied().collect();
        let snapshot = match self.routes.current_weights(Some(&stacks)).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.phase = CanaryPhase::Failed {
                    reason: err.to_string(),
                };
                return Err(err);
            }
        };
        info!(
            steps = self.config.steps,
            step_weight_percent = self.config.step_weight_percent,
            ?snapshot,
            "starting canary"
        );

        match self.shift(target, &snapshot).await {
            Ok(()) => {
                self.phase = CanaryPhase::Done;
                info!("canary completed");
                Ok(())
            }
            Err(err) => {
                self.phase = CanaryPhase::Reverting;
                warn!(error = %err, "canary failed, restoring previous weights");
                if let Err(rollback) = self.routes.set_many(&snapshot).await {
                    error!(error = %rollback, "failed to restore weights after canary failure");
                }
                self.phase = CanaryPhase::Failed {
                    reason: err.to_string(),
                };
                Err(err)
            }
        }
    }

    async fn shift(&mut self, target: &StackMap, snapshot: &BTreeMap<Stack, StackWeights>) -> DeployResult<()> {
        let total = self.config.steps;
        let mut current = snapshot.clone();

        for step in 1..=total {
            self.phase = CanaryPhase::Step {
                current: step,
                total,
            };

            let mut next = BTreeMap::new();
            for (stack, ds) in target {
                let full = self.routes.full_weight(*stack);
                let shift = step_shift(full, self.config.step_weight_percent);
                let weights = current.get(stack).cloned().unwrap_or_default();
                let (to, from) = step_weights(
                    weights.get(ds).copied().unwrap_or(0),
                    weights.get(&ds.sister()).copied().unwrap_or(0),
                    full,
                    shift,
                );
                next.insert(*stack, StackWeights::from([(*ds, to), (ds.sister(), from)]));
            }

            self.routes.set_many(&next).await?;
            info!(step, total, weights = ?next, "canary step applied");
            current.extend(next);

            self.analyze(target, format!("step {step}/{total}")).await?;
        }

        self.phase = CanaryPhase::Full;
        self.routes.route_full_traffic(target).await?;
        info!("canary routed full traffic");
        self.analyze(target, "full traffic".to_string()).await
    }

    /// Stabilize, then watch every target balancer in parallel.
    async fn analyze(&self, target: &StackMap, phase: String) -> DeployResult<()> {
        sleep(self.stabilization).await;

        let mut tasks: Vec<BoxTask<(), DeployError>> = Vec::new();
        for (stack, ds) in target {
            for route_type in self.routes.route_types() {
                let route = RouteIdentifier::new(*stack, *route_type, *ds);
                let metrics = self.metrics.get(&route).cloned().ok_or_else(|| {
                    DeployError::Internal(format!("no traffic metrics for {route}"))
                })?;
                tasks.push(Box::pin(watch(
                    route,
                    metrics,
                    self.config.threshold,
                    self.config.step_duration(),
                    self.poll_interval,
                    phase.clone(),
                )));
            }
        }

        info!(%phase, balancers = tasks.len(), "analyzing canary");
        run(tasks, FailureMode::FailFast).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackshift_cloud::{traffic_metrics, DnsClient, SandboxCloud, WeightedRecord};
    use stackshift_core::{
        DeploymentStack, ErrorCategory, LoadBalancerFamily, MetricThreshold, RouteType, ThresholdKind,
    };
    use stackshift_state::RouteRecord;
    use stackshift_tasks::PollingWaiter;

    const POLL: Duration = Duration::from_secs(10);

    fn stack(n: u32) -> Stack {
        Stack::new(n).unwrap()
    }

    fn lb_name(route: RouteIdentifier) -> String {
        format!("shop-{route}")
    }

    /// Two internal-only stacks, blue live at 50 each, targeting green.
    async fn fixture(cloud: Arc<SandboxCloud>, config: CanaryConfig) -> (CanaryController, StackMap) {
        let mut routes = Vec::new();
        let mut metrics: BTreeMap<RouteIdentifier, Arc<dyn TrafficMetrics>> = BTreeMap::new();
        for stack in Stack::all(2) {
            for ds in DeploymentStack::ALL {
                let route = RouteIdentifier::new(stack, RouteType::Internal, ds);
                let record = RouteRecord {
                    route,
                    zone_id: "Z-INT".into(),
                    name: format!("shop-{stack}.internal.example.com"),
                    target: format!("{}.lb.sandbox", lb_name(route)),
                    ttl: 60,
                };
                let weight = if ds == DeploymentStack::Blue { 50 } else { 0 };
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
                metrics.insert(
                    route,
                    traffic_metrics(
                        LoadBalancerFamily::Application,
                        &lb_name(route),
                        cloud.clone(),
                        cloud.clone(),
                    ),
                );
            }
        }
        let store = WeightedRouteStore::new(
            cloud,
            &routes,
            vec![RouteType::Internal],
            2,
            PollingWaiter::new(POLL),
            Duration::from_secs(600),
        )
        .unwrap();
        let controller = CanaryController::new(store, metrics, config, POLL, Duration::from_secs(90));
        let target = StackMap::from([
            (stack(1), DeploymentStack::Green),
            (stack(2), DeploymentStack::Green),
        ]);
        (controller, target)
    }

    fn enabled(steps: u32, percent: u32, threshold: MetricThreshold) -> CanaryConfig {
        CanaryConfig {
            enabled: true,
            steps,
            step_weight_percent: percent,
            step_duration_secs: 60,
            threshold,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_canary_cuts_over_without_analysis() {
        let cloud = Arc::new(SandboxCloud::new());
        let (mut controller, target) = fixture(cloud.clone(), CanaryConfig::default()).await;

        controller.run(&target).await.unwrap();

        assert_eq!(controller.phase(), &CanaryPhase::Done);
        assert_eq!(cloud.weight_history("1ig"), vec![0, 50]);
        assert_eq!(cloud.weight_history("2ib"), vec![50, 0]);
        assert_eq!(cloud.metric_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_canary_steps_to_full_traffic() {
        let cloud = Arc::new(SandboxCloud::new());
        for route in ["1ig", "2ig"] {
            cloud.set_metric_sample(&format!("shop-{route}"), 1000, 2);
        }
        let threshold = MetricThreshold {
            kind: ThresholdKind::Percentage,
            value: 1.0,
        };
        let (mut controller, target) = fixture(cloud.clone(), enabled(2, 25, threshold)).await;

        let started = tokio::time::Instant::now();
        controller.run(&target).await.unwrap();

        assert_eq!(controller.phase(), &CanaryPhase::Done);
        assert_eq!(cloud.weight_history("1ig"), vec![0, 12, 24, 50]);
        assert_eq!(cloud.weight_history("1ib"), vec![50, 38, 26, 0]);
        assert_eq!(cloud.weight_history("2ig"), vec![0, 12, 24, 50]);
        assert!(cloud.metric_queries() > 0);
        // Three analysis windows, each after a stabilization delay.
        assert!(started.elapsed() >= Duration::from_secs(3 * (90 + 60)));
    }

    #[tokio::test(start_paused = true)]
    async fn breach_restores_the_snapshot() {
        let cloud = Arc::new(SandboxCloud::new());
        cloud.set_metric_sample("shop-1ig", 500, 10);
        let threshold = MetricThreshold {
            kind: ThresholdKind::Absolute,
            value: 5.0,
        };
        let (mut controller, target) = fixture(cloud.clone(), enabled(3, 25, threshold)).await;
        let before = controller.routes.current_weights(None).await.unwrap();

        let err = controller.run(&target).await.unwrap_err();

        match &err {
            DeployError::CanaryBreach { identifier, phase, .. } => {
                assert_eq!(identifier.to_string(), "1ig");
                assert_eq!(phase, "step 1/3");
            }
            other => panic!("expected canary breach, got {other}"),
        }
        assert_eq!(err.category(), ErrorCategory::User);
        assert!(matches!(controller.phase(), CanaryPhase::Failed { .. }));
        assert_eq!(controller.routes.current_weights(None).await.unwrap(), before);
        assert_eq!(cloud.weight_history("1ig"), vec![0, 12, 0]);
        assert_eq!(cloud.weight_history("2ib"), vec![50, 38, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_threshold_ignores_idle_balancers() {
        let cloud = Arc::new(SandboxCloud::new());
        let (mut controller, target) =
            fixture(cloud.clone(), enabled(1, 50, MetricThreshold::default())).await;

        controller.run(&target).await.unwrap();
        assert_eq!(cloud.weight_history("2ig"), vec![0, 25, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn target_weight_never_exceeds_full_share() {
        let cloud = Arc::new(SandboxCloud::new());
        let (mut controller, target) =
            fixture(cloud.clone(), enabled(3, 100, MetricThreshold::default())).await;

        controller.run(&target).await.unwrap();
        assert_eq!(cloud.weight_history("1ig"), vec![0, 50, 50, 50, 50]);
        assert_eq!(cloud.weight_history("1ib"), vec![50, 0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn metric_errors_also_roll_back() {
        let cloud = Arc::new(SandboxCloud::new());
        cloud.fail_operation("sum", "throttled");
        let (mut controller, target) =
            fixture(cloud.clone(), enabled(2, 25, MetricThreshold::default())).await;

        let err = controller.run(&target).await.unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Cloud);
        assert_eq!(cloud.weight_history("1ig"), vec![0, 12, 0]);
    }

    #[test]
    fn phase_serializes_with_its_progress() {
        let phase = CanaryPhase::Step { current: 2, total: 3 };
        let json = serde_json::to_string(&phase).unwrap();
        assert_eq!(json, r#"{"Step":{"current":2,"total":3}}"#);
    }
}
