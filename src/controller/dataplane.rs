//! Data-plane apply interface
//!
//! The data plane consumes rendered configuration. Applies must be
//! idempotent: retries resend the same artifact.

use crate::controller::synth::ConfigArtifact;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to write configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("reload request failed: {0}")]
    Reload(String),

    #[error("data plane rejected configuration: {0}")]
    Rejected(String),

    #[error("apply timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Hand `artifact` to the data plane and wait until it is live
    async fn apply(&self, artifact: &ConfigArtifact) -> Result<(), ApplyError>;
}

/// Writes the artifact to a file and optionally pokes a reload endpoint
pub struct FileDataPlane {
    path: PathBuf,
    reload_url: Option<String>,
    client: reqwest::Client,
}

impl FileDataPlane {
    pub fn new(path: impl Into<PathBuf>, reload_url: Option<String>) -> Self {
        Self {
            path: path.into(),
            reload_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_atomically(&self, artifact: &ConfigArtifact) -> Result<(), ApplyError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, artifact.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), checksum = %artifact.checksum(), "Wrote configuration");
        Ok(())
    }

    async fn reload(&self, url: &str, artifact: &ConfigArtifact) -> Result<(), ApplyError> {
        let response = self
            .client
            .post(url)
            .header("X-Config-Checksum", artifact.checksum())
            .send()
            .await
            .map_err(|e| ApplyError::Reload(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ApplyError::Rejected(format!("{}: {}", status, body.trim())))
        } else {
            Err(ApplyError::Reload(format!("{}: {}", status, body.trim())))
        }
    }
}

#[async_trait]
impl DataPlane for FileDataPlane {
    async fn apply(&self, artifact: &ConfigArtifact) -> Result<(), ApplyError> {
        self.write_atomically(artifact).await?;
        if let Some(url) = &self.reload_url {
            self.reload(url, artifact).await?;
        }
        info!(
            path = %self.path.display(),
            checksum = %artifact.checksum(),
            hosts = artifact.hosts().len(),
            "Configuration applied"
        );
        Ok(())
    }
}
