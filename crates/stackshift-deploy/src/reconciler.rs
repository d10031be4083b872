//! StateReconciler: prunes state entries whose resource no longer exists.
//!
//! Every recorded handle is described concurrently. A `NotFound` answer
//! removes the entry; any other outcome (including other errors) keeps
//! it. Nothing is ever created here, so running it twice is a no-op the
//! second time.

use stackshift_core::{CloudError, RouteIdentifier};
use stackshift_state::DeploymentState;
use stackshift_tasks::{settle, BoxTask, TaskError};
use tracing::{debug, info, warn};

use crate::context::CloudClients;

/// A recorded resource handle.
#[derive(Debug, Clone)]
enum Handle {
    Group(String),
    Template(String),
    LoadBalancer(RouteIdentifier, String),
    Route(RouteIdentifier),
}

impl Handle {
    fn describe(&self) -> String {
        match self {
            Handle::Group(name) => format!("compute group {name}"),
            Handle::Template(name) => format!("launch template {name}"),
            Handle::LoadBalancer(route, name) => format!("load balancer {name} ({route})"),
            Handle::Route(route) => format!("weighted record {route}"),
        }
    }
}

pub struct StateReconciler {
    clients: CloudClients,
}

impl StateReconciler {
    pub fn new(clients: CloudClients) -> Self {
        Self { clients }
    }

    /// Remove every entry whose resource is gone. Returns how many were
    /// pruned.
    pub async fn correct_state(&self, state: &mut DeploymentState) -> usize {
        let mut handles = Vec::new();
        let mut tasks: Vec<BoxTask<(), CloudError>> = Vec::new();

        for group in &state.compute_groups {
            let compute = self.clients.compute.clone();
            let name = group.name.clone();
            handles.push(Handle::Group(name.clone()));
            tasks.push(Box::pin(async move { compute.describe_group(&name).await.map(drop) }));
        }
        for template in &state.templates {
            let compute = self.clients.compute.clone();
            let name = template.name.clone();
            handles.push(Handle::Template(name.clone()));
            tasks.push(Box::pin(async move { compute.describe_template(&name).await.map(drop) }));
        }
        for balancer in &state.load_balancers {
            let balancers = self.clients.balancers.clone();
            let name = balancer.name.clone();
            handles.push(Handle::LoadBalancer(balancer.route, name.clone()));
            tasks.push(Box::pin(async move {
                balancers.describe_load_balancer(&name).await.map(drop)
            }));
        }
        for route in &state.routes {
            let dns = self.clients.dns.clone();
            let record = route.clone();
            handles.push(Handle::Route(route.route));
            tasks.push(Box::pin(async move {
                dns.get_record(&record.zone_id, &record.name, &record.route.to_string())
                    .await
                    .map(drop)
            }));
        }

        let results = settle(tasks).await;
        let mut pruned = 0;
        for (handle, result) in handles.into_iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(TaskError::Failed { error, .. }) if error.is_not_found() => {
                    warn!(resource = %handle.describe(), "resource no longer exists, pruning from state");
                    prune(state, &handle);
                    pruned += 1;
                }
                Err(err) => {
                    debug!(resource = %handle.describe(), error = %err, "describe failed, keeping entry");
                }
            }
        }

        if pruned > 0 {
            info!(pruned, "state reconciled");
        }
        pruned
    }
}

fn prune(state: &mut DeploymentState, handle: &Handle) {
    match handle {
        Handle::Group(name) => {
            state.remove_group(name);
        }
        Handle::Template(name) => {
            state.remove_template(name);
        }
        Handle::LoadBalancer(route, _) => {
            state.remove_load_balancer(*route);
        }
        Handle::Route(route) => {
            state.remove_route(*route);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use stackshift_cloud::{ComputeClient, GroupSpec, SandboxCloud, TemplateSpec};
    use stackshift_state::{ComputeGroupRecord, RouteRecord, TemplateRecord};

    async fn cloud_with_group() -> Arc<SandboxCloud> {
        let cloud = Arc::new(SandboxCloud::new());
        cloud
            .create_template(&TemplateSpec {
                name: "shop-1b-aaaa-lt".into(),
                image_id: "img-1".into(),
                instance_type: "m5.large".into(),
                user_data: None,
                fingerprint: "aaaa".into(),
            })
            .await
            .unwrap();
        cloud
            .create_group(&GroupSpec {
                name: "shop-1b-aaaa".into(),
                template: "shop-1b-aaaa-lt".into(),
                desired_capacity: 1,
                health_check_path: "/health".into(),
            })
            .await
            .unwrap();
        cloud
    }

    fn group(name: &str) -> ComputeGroupRecord {
        ComputeGroupRecord {
            slot: "1b".parse().unwrap(),
            name: name.into(),
            template: format!("{name}-lt"),
            fingerprint: "aaaa".into(),
            created_version: 1,
        }
    }

    fn state() -> DeploymentState {
        let mut state = DeploymentState::default();
        state.upsert_group(group("shop-1b-aaaa"));
        state.upsert_group(group("shop-1b-gone"));
        state.upsert_template(TemplateRecord {
            name: "shop-1b-aaaa-lt".into(),
            slot: "1b".parse().unwrap(),
            fingerprint: "aaaa".into(),
        });
        state.upsert_route(RouteRecord {
            route: "1ib".parse().unwrap(),
            zone_id: "Z1".into(),
            name: "shop.internal.example.com".into(),
            target: "shop-1ib.lb".into(),
            ttl: 60,
        });
        state
    }

    #[tokio::test]
    async fn prunes_missing_resources_once() {
        let cloud = cloud_with_group().await;
        let reconciler = StateReconciler::new(CloudClients::sandbox(cloud));
        let mut state = state();

        assert_eq!(reconciler.correct_state(&mut state).await, 2);
        let names: Vec<&str> = state.compute_groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["shop-1b-aaaa"]);
        assert_eq!(state.templates.len(), 1);
        assert!(state.routes.is_empty());

        let snapshot = state.clone();
        assert_eq!(reconciler.correct_state(&mut state).await, 0);
        assert_eq!(state, snapshot);
    }

    #[tokio::test]
    async fn other_errors_keep_entries() {
        let cloud = cloud_with_group().await;
        cloud.fail_operation("describe_group", "throttled");
        let reconciler = StateReconciler::new(CloudClients::sandbox(cloud));
        let mut state = state();

        reconciler.correct_state(&mut state).await;
        assert_eq!(state.compute_groups.len(), 2);
    }

    #[tokio::test]
    async fn empty_state_is_untouched() {
        let reconciler = StateReconciler::new(CloudClients::sandbox(Arc::new(SandboxCloud::new())));
        let mut state = DeploymentState::default();
        assert_eq!(reconciler.correct_state(&mut state).await, 0);
        assert!(state.is_empty());
    }
}
