//! Wait tasks for health, drain, capacity and instance refresh.
//!
//! Each builder returns a `BoxTask` so callers can fan waits out through
//! the coordinator and join them at one point.

use std::sync::Arc;
use std::time::Duration;

use stackshift_cloud::{CapacityStatus, ComputeClient, LoadBalancerClient, RefreshStatus, TrafficMetrics};
use stackshift_core::{CloudError, DeployError};
use stackshift_tasks::{BoxTask, PollingWaiter};
use tracing::info;

/// Until the group itself reports at least `desired` healthy instances.
pub fn group_healthy(
    compute: Arc<dyn ComputeClient>,
    waiter: PollingWaiter,
    timeout: Duration,
    group: String,
    desired: u32,
) -> BoxTask<(), DeployError> {
    Box::pin(async move {
        let what = format!("{desired} healthy instances in compute group {group}");
        waiter
            .wait_until(
                &what,
                timeout,
                || {
                    let compute = compute.clone();
                    let group = group.clone();
                    async move { Ok::<_, DeployError>(compute.describe_group(&group).await?.healthy_count) }
                },
                |healthy| *healthy >= desired,
            )
            .await?;
        info!(%group, desired, "compute group healthy");
        Ok(())
    })
}

/// Until the balancer reports at least `desired` healthy targets.
pub fn targets_healthy(
    traffic: Arc<dyn TrafficMetrics>,
    waiter: PollingWaiter,
    timeout: Duration,
    desired: u32,
) -> BoxTask<(), DeployError> {
    Box::pin(async move {
        let balancer = traffic.load_balancer().to_string();
        let what = format!("{desired} healthy targets behind {balancer}");
        waiter
            .wait_until(
                &what,
                timeout,
                || {
                    let traffic = traffic.clone();
                    async move { Ok::<_, DeployError>(traffic.healthy_target_count().await?) }
                },
                |healthy| *healthy >= desired,
            )
            .await?;
        info!(load_balancer = %balancer, desired, "targets healthy");
        Ok(())
    })
}

/// Until no target behind the balancer is serving (only draining or gone).
pub fn targets_drained(
    balancers: Arc<dyn LoadBalancerClient>,
    waiter: PollingWaiter,
    timeout: Duration,
    balancer: String,
) -> BoxTask<(), DeployError> {
    Box::pin(async move {
        let what = format!("targets behind {balancer} to drain");
        waiter
            .wait_until(
                &what,
                timeout,
                || {
                    let balancers = balancers.clone();
                    let balancer = balancer.clone();
                    async move { Ok::<_, DeployError>(balancers.target_health(&balancer).await?.non_draining()) }
                },
                |serving| *serving == 0,
            )
            .await?;
        info!(load_balancer = %balancer, "targets drained");
        Ok(())
    })
}

/// Until the balancer's reserved capacity units are provisioned.
pub fn capacity_provisioned(
    balancers: Arc<dyn LoadBalancerClient>,
    waiter: PollingWaiter,
    timeout: Duration,
    balancer: String,
) -> BoxTask<(), DeployError> {
    Box::pin(async move {
        let what = format!("capacity units of {balancer} provisioned");
        waiter
            .wait_until(
                &what,
                timeout,
                || {
                    let balancers = balancers.clone();
                    let balancer = balancer.clone();
                    async move { Ok::<_, DeployError>(balancers.capacity_status(&balancer).await?) }
                },
                |status| *status == CapacityStatus::Provisioned,
            )
            .await?;
        Ok(())
    })
}

/// Until the refresh stops. A failed or cancelled refresh is a cloud error.
pub fn refresh_complete(
    compute: Arc<dyn ComputeClient>,
    waiter: PollingWaiter,
    timeout: Duration,
    group: String,
    refresh_id: String,
) -> BoxTask<(), DeployError> {
    Box::pin(async move {
        let what = format!("instance refresh {refresh_id} of {group}");
        let status = waiter
            .wait_until(
                &what,
                timeout,
                || {
                    let compute = compute.clone();
                    let group = group.clone();
                    let refresh_id = refresh_id.clone();
                    async move {
                        Ok::<_, DeployError>(compute.describe_instance_refresh(&group, &refresh_id).await?)
                    }
                },
                |status: &RefreshStatus| status.is_terminal(),
            )
            .await?;
        if status != RefreshStatus::Successful {
            return Err(CloudError::api(
                "instance refresh",
                format!("refresh {refresh_id} of {group} ended {status:?}"),
            )
            .into());
        }
        info!(%group, %refresh_id, "instance refresh completed");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackshift_cloud::{GroupSpec, SandboxCloud, SandboxOptions, TemplateSpec};
    use stackshift_core::ErrorCategory;

    const POLL: Duration = Duration::from_secs(10);

    async fn cloud(options: SandboxOptions) -> Arc<SandboxCloud> {
        let cloud = Arc::new(SandboxCloud::with_options(options));
        cloud
            .create_template(&TemplateSpec {
                name: "shop-1b-lt".into(),
                image_id: "img".into(),
                instance_type: "t3".into(),
                user_data: None,
                fingerprint: "f".into(),
            })
            .await
            .unwrap();
        cloud
            .create_group(&GroupSpec {
                name: "shop-1b".into(),
                template: "shop-1b-lt".into(),
                desired_capacity: 2,
                health_check_path: "/health".into(),
            })
            .await
            .unwrap();
        cloud
    }

    #[tokio::test(start_paused = true)]
    async fn group_health_is_met_or_times_out() {
        let cloud = cloud(SandboxOptions::default()).await;
        let waiter = PollingWaiter::new(POLL);

        group_healthy(cloud.clone(), waiter, Duration::from_secs(60), "shop-1b".into(), 2)
            .await
            .unwrap();

        let err = group_healthy(cloud, waiter, Duration::from_secs(60), "shop-1b".into(), 3)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_group_aborts_the_wait() {
        let cloud = cloud(SandboxOptions::default()).await;
        let err = group_healthy(
            cloud,
            PollingWaiter::new(POLL),
            Duration::from_secs(600),
            "shop-9g".into(),
            1,
        )
        .await
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Cloud);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_is_a_cloud_error() {
        let cloud = cloud(SandboxOptions {
            refresh_outcome: RefreshStatus::Failed,
            ..SandboxOptions::default()
        })
        .await;
        let id = cloud.start_instance_refresh("shop-1b", 90).await.unwrap();

        let err = refresh_complete(
            cloud,
            PollingWaiter::new(POLL),
            Duration::from_secs(600),
            "shop-1b".into(),
            id,
        )
        .await
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Cloud);
        assert!(err.to_string().contains("ended Failed"));
    }
}
