//! Loading and persisting everything one invocation works on.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use stackshift_cloud::SandboxCloud;
use stackshift_core::Settings;
use stackshift_deploy::{CloudClients, DeployContext};
use stackshift_state::StateStore;
use tracing::{debug, info};

use super::Options;

const STATE_FILE: &str = "state.json";
const SANDBOX_FILE: &str = "sandbox.json";

pub struct Session {
    store: StateStore,
    cloud: Arc<SandboxCloud>,
    sandbox_path: PathBuf,
    pub ctx: DeployContext,
}

impl Session {
    /// Load state (bumping its version), the sandbox cloud and settings.
    pub fn open(options: &Options) -> anyhow::Result<Self> {
        let state_path = options.state_dir.join(STATE_FILE);
        let store = StateStore::open(&state_path)
            .with_context(|| format!("open state store at {}", state_path.display()))?;
        let state = store.load().context("load deployment state")?;
        info!(version = state.version, path = %state_path.display(), "state loaded");

        let sandbox_path = options.state_dir.join(SANDBOX_FILE);
        let cloud = Arc::new(
            SandboxCloud::load(&sandbox_path)
                .with_context(|| format!("load sandbox cloud from {}", sandbox_path.display()))?,
        );

        let settings = match &options.settings {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        debug!(?settings, "engine settings");

        let ctx = DeployContext::new(CloudClients::sandbox(cloud.clone()), settings, state);
        Ok(Self {
            store,
            cloud,
            sandbox_path,
            ctx,
        })
    }

    /// Write the state document and the sandbox cloud back to disk.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.store
            .save(&self.ctx.state)
            .context("save deployment state")?;
        self.cloud
            .save(&self.sandbox_path)
            .context("save sandbox cloud")?;
        debug!(version = self.ctx.state.version, "state saved");
        Ok(())
    }
}
