//! Environment Deployer contract and a script-backed implementation.
//!
//! The engine never provisions anything itself. Each `Deploy` action becomes a
//! [`DeployRequest`] handed to an [`EnvironmentDeployer`], which must be
//! idempotent: re-invoking it for the same environment and revision is the
//! supported way to retry or roll forward.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use promote_store::{ArtifactKey, RunId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProvisionError;
use crate::model::{Revision, StageId};
use crate::runner::CommandRunner;

/// Address of a deployed environment, produced by a successful deploy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentEndpoint(String);

impl EnvironmentEndpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build output passed along with a deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployArtifact {
    pub key: ArtifactKey,
    pub bytes: Vec<u8>,
}

/// Everything a deployer needs to provision one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub run_id: RunId,
    pub stage: StageId,
    pub action: String,
    pub environment: String,
    pub revision: Revision,
    pub artifact: Option<DeployArtifact>,
}

/// Provisions or updates an environment and returns its endpoint.
#[async_trait]
pub trait EnvironmentDeployer: Send + Sync {
    async fn deploy(&self, request: &DeployRequest) -> Result<EnvironmentEndpoint, ProvisionError>;
}

/// Deployer that delegates to an external command.
///
/// The command receives `PROMOTE_RUN_ID`, `PROMOTE_STAGE`,
/// `PROMOTE_ENVIRONMENT`, `PROMOTE_REVISION` and, when the deploy carries an
/// artifact, `PROMOTE_ARTIFACT` (path to a temp file holding its bytes). The
/// last non-empty line of stdout is taken as the endpoint.
pub struct CommandDeployer {
    command: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl CommandDeployer {
    pub fn new(command: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            command,
            runner,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl EnvironmentDeployer for CommandDeployer {
    async fn deploy(&self, request: &DeployRequest) -> Result<EnvironmentEndpoint, ProvisionError> {
        let mut env = BTreeMap::from([
            ("PROMOTE_RUN_ID".to_string(), request.run_id.to_string()),
            ("PROMOTE_STAGE".to_string(), request.stage.to_string()),
            ("PROMOTE_ENVIRONMENT".to_string(), request.environment.clone()),
            ("PROMOTE_REVISION".to_string(), request.revision.to_string()),
        ]);

        // Held until the command exits; the file is removed on drop.
        let artifact_file = match &request.artifact {
            Some(artifact) => {
                let mut file = tempfile::NamedTempFile::new()
                    .map_err(|e| ProvisionError::new(format!("artifact staging: {e}")))?;
                file.write_all(&artifact.bytes)
                    .map_err(|e| ProvisionError::new(format!("artifact staging: {e}")))?;
                env.insert(
                    "PROMOTE_ARTIFACT".to_string(),
                    file.path().to_string_lossy().into_owned(),
                );
                Some(file)
            }
            None => None,
        };

        let invocation = self.runner.run(&self.command, &env);
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, invocation).await.map_err(|_| {
                ProvisionError::new(format!("deploy command timed out after {}s", limit.as_secs()))
            })?,
            None => invocation.await,
        }
        .map_err(|e| ProvisionError::new(format!("deploy command could not run: {e}")))?;
        drop(artifact_file);

        if !output.passed() {
            return Err(ProvisionError::new(format!(
                "deploy command exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let endpoint = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or_else(|| ProvisionError::new("deploy command printed no endpoint"))?;
        debug!(environment = %request.environment, endpoint = %endpoint, "deploy command finished");
        Ok(EnvironmentEndpoint::new(endpoint))
    }
}
