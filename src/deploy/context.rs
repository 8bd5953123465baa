//! Everything a single deployment run threads through its steps.

use std::path::PathBuf;
use std::time::Duration;

use crate::model::{App, Id, Server, Version};
use crate::ssh::{Auth, ConnectionConfig};

/// Credentials for the one-time superuser bootstrap on first-deploy.
/// Never logged or echoed in progress messages; [`crate::model::redact_map`]
/// is used wherever this is turned into a command's env.
#[derive(Debug, Clone)]
pub struct SuperuserBootstrap {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub bootstrap: Option<SuperuserBootstrap>,
    /// Retries for the health-gate poll (default 10, 2 s apart).
    pub health_gate_attempts: u32,
    pub health_gate_interval: Duration,
}

impl Default for DeployRequest {
    fn default() -> Self {
        Self {
            bootstrap: None,
            health_gate_attempts: 10,
            health_gate_interval: Duration::from_secs(2),
        }
    }
}

pub struct DeployContext {
    pub deployment_id: Id,
    pub server: Server,
    pub app: App,
    pub version: Version,
    pub request: DeployRequest,
    pub local_stage_dir: PathBuf,
}

impl DeployContext {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            port: self.server.port,
            ..ConnectionConfig::new(self.server.host.clone(), self.server.app_user.clone(), Auth::Agent)
        }
    }

    pub fn remote_path(&self) -> &str {
        &self.app.remote_path
    }

    pub fn backup_dir(&self) -> String {
        format!("{}/.backup", self.app.remote_path)
    }

    pub fn service_name(&self) -> &str {
        &self.app.service_name
    }

    pub fn health_url(&self) -> String {
        format!("https://{}/api/health", self.app.domain)
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.local_stage_dir.join(self.deployment_id.to_string())
    }
}
