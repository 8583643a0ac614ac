use std::path::{Path, PathBuf};

use anyhow::Context as _;
use margin_core::state::ProcessedState;

use crate::atomic;

/// Durable home of [`ProcessedState`]: one JSON file replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing, empty or unparseable file is treated as empty state.
    pub async fn load(&self) -> ProcessedState {
        let data = match tokio::fs::read(&self.path).await {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return ProcessedState::default();
            }
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to read state file; starting empty"
                );
                return ProcessedState::default();
            }
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            return ProcessedState::default();
        }

        match serde_json::from_slice::<ProcessedState>(&data) {
            Ok(mut state) => {
                state.normalize();
                state
            }
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "state file is corrupt; starting empty"
                );
                ProcessedState::default()
            }
        }
    }

    pub async fn save(&self, state: &ProcessedState) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(state).context("serialize state json")?;
        atomic::write_file(&self.path, &data)
            .await
            .with_context(|| format!("write state: {}", self.path.display()))
    }
}
