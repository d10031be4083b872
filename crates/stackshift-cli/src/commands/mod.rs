//! Command execution: load, run the operation, always persist.

mod session;

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use stackshift_core::{DeployConfig, DeployError, ErrorCategory};
use stackshift_deploy::{status, undeploy, DeployContext, DeploymentOrchestrator};
use tracing::{error, info, warn};

use crate::Command;
use session::Session;

/// Global flags shared by every command.
#[derive(Debug, Clone)]
pub struct Options {
    pub state_dir: PathBuf,
    pub settings: Option<PathBuf>,
    /// JSON overlay for the stored deploy configuration.
    pub config: Option<String>,
}

/// Run `command`, then persist state whether it succeeded, failed or was
/// interrupted.
pub async fn execute(options: &Options, command: Command) -> anyhow::Result<()> {
    let mut session = Session::open(options)?;

    let result = tokio::select! {
        result = dispatch(&mut session.ctx, options, &command) => result,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!(?command, "interrupted, saving state");
            Err(anyhow!("interrupted"))
        }
    };

    if let Err(persist) = session.persist() {
        error!(error = format!("{persist:#}"), "failed to save state");
        return match result {
            Ok(()) => Err(persist),
            Err(err) => Err(err),
        };
    }
    result
}

async fn dispatch(ctx: &mut DeployContext, options: &Options, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            let config = stored_or_overlay(ctx, options)?;
            let report = status(ctx, config.as_ref()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Undeploy => {
            undeploy(ctx).await.context("undeploy failed")?;
            Ok(())
        }
        operation => {
            let config = DeployConfig::resolve(ctx.state.deploy_config.as_ref(), options.config.as_deref())?;
            info!(app = %config.app_name, command = ?operation, "running");
            let mut orchestrator = DeploymentOrchestrator::new(ctx, config);
            let result = match operation {
                Command::Deploy => orchestrator.deploy().await,
                Command::Redeploy => orchestrator.redeploy().await,
                Command::Revert => orchestrator.revert().await,
                Command::Scale { capacity } => orchestrator.scale(*capacity).await,
                Command::RollingRestart => orchestrator.rolling_restart().await,
                Command::Status | Command::Undeploy => Ok(()),
            };
            result.with_context(|| format!("{operation:?} failed"))?;
            Ok(())
        }
    }
}

/// The effective configuration, if there is one to show.
fn stored_or_overlay(ctx: &DeployContext, options: &Options) -> anyhow::Result<Option<DeployConfig>> {
    if ctx.state.deploy_config.is_none() && options.config.is_none() {
        return Ok(None);
    }
    Ok(Some(DeployConfig::resolve(
        ctx.state.deploy_config.as_ref(),
        options.config.as_deref(),
    )?))
}

/// Process exit code for a failed command.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<DeployError>().map(DeployError::category) {
        Some(ErrorCategory::User) => 2,
        Some(ErrorCategory::Cloud) => 3,
        Some(ErrorCategory::Timeout) => 4,
        Some(ErrorCategory::Internal) => 5,
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackshift_cloud::SandboxCloud;
    use stackshift_state::{DeploymentState, StateStore};

    const CONFIG: &str = r#"{
        "app_name": "shop",
        "stacks": 2,
        "compute": {"image_id": "img-1", "instance_type": "m5.large", "desired_capacity": 2},
        "dns": {"internal": {"zone_id": "ZINT", "domain": "internal.example.com"}}
    }"#;

    fn options(dir: &tempfile::TempDir, config: Option<&str>) -> Options {
        Options {
            state_dir: dir.path().to_path_buf(),
            settings: None,
            config: config.map(str::to_string),
        }
    }

    fn saved_state(dir: &tempfile::TempDir) -> DeploymentState {
        let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_scale_and_undeploy_persist_between_invocations() {
        let dir = tempfile::tempdir().unwrap();

        execute(&options(&dir, Some(CONFIG)), Command::Deploy).await.unwrap();
        let state = saved_state(&dir);
        assert_eq!(state.version, 1);
        assert_eq!(state.compute_groups.len(), 2);
        assert_eq!(state.deploy_config.as_ref().unwrap().stacks, 2);
        let sandbox = SandboxCloud::load(&dir.path().join("sandbox.json")).unwrap();
        assert_eq!(sandbox.pending_changes(), 0);

        // The stored configuration is used without an overlay.
        execute(&options(&dir, None), Command::Scale { capacity: 6 })
            .await
            .unwrap();
        let state = saved_state(&dir);
        assert_eq!(state.version, 2);
        assert_eq!(state.deploy_config.unwrap().compute.desired_capacity, 6);

        execute(&options(&dir, None), Command::Status).await.unwrap();
        execute(&options(&dir, None), Command::Undeploy).await.unwrap();
        let state = saved_state(&dir);
        assert!(state.is_empty());
        assert!(state.deploy_config.is_none());
        assert_eq!(state.version, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_still_persist_state() {
        let dir = tempfile::tempdir().unwrap();

        let err = execute(&options(&dir, None), Command::Deploy).await.unwrap_err();
        assert_eq!(exit_code(&err), 2);
        assert_eq!(saved_state(&dir).version, 1);

        let store = StateStore::open(&dir.path().join("state.json")).unwrap();
        assert_eq!(store.load().unwrap().version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn revert_without_history_is_a_user_error() {
        let dir = tempfile::tempdir().unwrap();
        execute(&options(&dir, Some(CONFIG)), Command::Deploy).await.unwrap();

        let err = execute(&options(&dir, None), Command::Revert).await.unwrap_err();
        assert_eq!(exit_code(&err), 2);
        assert!(format!("{err:#}").contains("passive slot"));
    }

    #[test]
    fn foreign_errors_exit_with_one() {
        assert_eq!(exit_code(&anyhow!("disk full")), 1);
        let timeout = anyhow::Error::new(DeployError::Timeout {
            what: "dns change".into(),
            elapsed_minutes: 10.0,
        });
        assert_eq!(exit_code(&timeout), 4);
    }
}
