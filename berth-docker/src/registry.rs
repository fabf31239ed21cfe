//! Registry credentials
//!
//! Logging in writes credentials into a docker config directory that is
//! unique to one pull. The directory is removed on logout and on a failed
//! login, so credentials never outlive the bracket.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use berth_core::domain::container::Registry;
use berth_core::error::Result;

use crate::command::{CommandRunner, RunOptions, run_docker, to_args};

/// Ephemeral docker config directory holding one registry login
#[derive(Debug)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Logs into `registry` using a fresh config directory under `temp_dir`
    pub async fn login(
        runner: &dyn CommandRunner,
        temp_dir: &Path,
        registry: &Registry,
    ) -> Result<Self> {
        let dir = temp_dir.join(format!(".docker_{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        let store = Self { dir };

        let config = store.dir.to_string_lossy().to_string();
        let mut args = to_args(&["--config", &config, "login"]);
        let opts = match registry.credentials() {
            Some((username, password)) => {
                args.extend(to_args(&["-u", username, "--password-stdin"]));
                RunOptions::with_stdin(password)
            }
            None => RunOptions::default(),
        };
        args.push(registry.server_url.clone());

        info!("Logging into registry {}", registry.server_url);
        if let Err(e) = run_docker(runner, &args, &opts).await {
            store.remove_dir().await;
            return Err(e);
        }
        Ok(store)
    }

    /// The config directory to pass as `--config`
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Logs out and deletes the config directory
    ///
    /// The directory is deleted even when logout fails.
    pub async fn logout(self, runner: &dyn CommandRunner) {
        let config = self.dir.to_string_lossy().to_string();
        let args = to_args(&["--config", &config, "logout"]);
        if let Err(e) = run_docker(runner, &args, &RunOptions::default()).await {
            warn!("Registry logout failed: {}", e);
        }
        self.remove_dir().await;
    }

    async fn remove_dir(&self) {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!("Removed credential store {}", self.dir.display()),
            Err(e) => warn!(
                "Failed to remove credential store {}: {}",
                self.dir.display(),
                e
            ),
        }
    }
}
