//! StateStore: JSON-file persistence for the deployment state document.
//!
//! The whole document is read at process start and written back at exit.
//! Writes go to a sibling temp file which is then renamed over the target
//! so an interrupted save never leaves a truncated document.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::DeploymentState;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Loads and saves the deployment state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Use (or later create) the state document at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(map_err!(Write))?;
        }
        debug!(?path, "state store opened");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Read the document and bump its version for this invocation.
    ///
    /// A missing document is an empty deployment at version 1.
    pub fn load(&self) -> StateResult<DeploymentState> {
        let mut state = match self.read_raw()? {
            Some(raw) => serde_json::from_str(&raw).map_err(map_err!(Deserialize))?,
            None => DeploymentState::default(),
        };
        state.version += 1;
        debug!(version = state.version, "state loaded");
        Ok(state)
    }

    /// Persist the document.
    pub fn save(&self, state: &DeploymentState) -> StateResult<()> {
        let raw = serde_json::to_string_pretty(state).map_err(map_err!(Serialize))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(map_err!(Write))?;
        fs::rename(&tmp, &self.path).map_err(map_err!(Write))?;
        debug!(version = state.version, "state saved");
        Ok(())
    }

    fn read_raw(&self) -> StateResult<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Read(e.to_string())),
        }
    }
}
