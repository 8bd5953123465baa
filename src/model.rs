//! The strongly-typed data model and the collaborator traits the core
//! depends on but does not implement: persistent metadata storage and
//! artifact blob storage are owned by the rest of the repo and reach the
//! core only through [`Repository`] and [`ArtifactStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::Result;

pub type Id = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: Id,
    pub host: String,
    pub port: u16,
    pub root_user: String,
    pub app_user: String,
    pub auth_ref: String,
    pub setup_complete: bool,
    pub security_locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppStatus {
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: Id,
    pub name: String,
    pub server_id: Id,
    pub remote_path: String,
    pub service_name: String,
    pub domain: String,
    pub current_version: Option<String>,
    pub status: AppStatus,
    /// Guards concurrent deployments; the CAS target in
    /// [`Repository::cas_app_active_deployment`].
    pub active_deployment_id: Option<Id>,
}

impl App {
    /// `/opt/<root>/apps/<name>` unless the caller overrode `remote_path`.
    pub fn default_remote_path(root: &str, name: &str) -> String {
        format!("/opt/{}/apps/{}", root, name)
    }

    /// `<product>-<name>` unless the caller overrode `service_name`.
    pub fn default_service_name(product: &str, name: &str) -> String {
        format!("{}-{}", product, name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: Id,
    pub app_id: Id,
    pub version_number: String,
    pub artifact_ref: String,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentKind {
    First,
    Update,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl DeploymentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded | DeploymentState::Failed | DeploymentState::RolledBack
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Id,
    pub app_id: Id,
    pub version_id: Id,
    pub kind: DeploymentKind,
    pub state: DeploymentState,
    pub log: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    Running,
    Ok,
    Failed,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub deployment_id: Id,
    pub step: String,
    pub status: ProgressStatus,
    pub message: String,
    /// Monotone non-decreasing within one deployment's stream.
    pub percent: u8,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// A patch applied to a [`Deployment`] record; every field left `None` is
/// left unchanged.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPatch {
    pub state: Option<DeploymentState>,
    pub log_append: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Persistent metadata storage, supplied by the rest of the repo. The core
/// only ever sees this trait; the storage schema is an adapter detail.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_server(&self, id: Id) -> Result<Server>;
    async fn get_app(&self, id: Id) -> Result<App>;
    async fn get_version(&self, id: Id) -> Result<Version>;

    async fn create_deployment(
        &self,
        app_id: Id,
        version_id: Id,
        kind: DeploymentKind,
    ) -> Result<Id>;
    async fn update_deployment(&self, id: Id, patch: DeploymentPatch) -> Result<()>;
    async fn list_active_deployments_for(&self, app_id: Id) -> Result<Vec<Deployment>>;

    /// Compare-and-set `App.active_deployment_id`; the sole concurrency
    /// gate for "at most one running deployment per app".
    async fn cas_app_active_deployment(
        &self,
        app_id: Id,
        expected: Option<Id>,
        new: Option<Id>,
    ) -> Result<bool>;

    async fn set_app_current_version(&self, app_id: Id, version_number: String) -> Result<()>;
}

/// Artifact blob storage, supplied by the rest of the repo.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Open a streamed read of the zip bytes for `artifact_ref`.
    async fn open(&self, artifact_ref: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Env/command maps carried by [`crate::executor::Command`] sometimes hold
/// secrets (e.g. superuser bootstrap credentials); this marker lets callers
/// redact specific keys from logs and progress messages without redacting
/// everything.
pub fn redact_map(map: &HashMap<String, String>, secret_keys: &[&str]) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| {
            if secret_keys.contains(&k.as_str()) {
                (k.clone(), "***".to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}
