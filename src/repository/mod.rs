//! Demo adapters for the two collaborator contracts the core depends on
//! ([`crate::model::Repository`], [`crate::model::ArtifactStore`]) but does
//! not implement. A real deployment of this engine would back these with a
//! database and object storage; this crate ships an in-memory store and a
//! filesystem-backed artifact store so the CLI has something to run
//! against and so the deployment state machines have something to test
//! against.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::model::{App, ArtifactStore, Deployment, DeploymentKind, DeploymentPatch, DeploymentState, Id, Repository, Server, Version};

pub struct InMemoryRepository {
    servers: DashMap<Id, Server>,
    apps: DashMap<Id, App>,
    versions: DashMap<Id, Version>,
    deployments: DashMap<Id, Deployment>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            apps: DashMap::new(),
            versions: DashMap::new(),
            deployments: DashMap::new(),
        }
    }

    pub fn insert_server(&self, server: Server) {
        self.servers.insert(server.id, server);
    }

    pub fn insert_app(&self, app: App) {
        self.apps.insert(app.id, app);
    }

    pub fn insert_version(&self, version: Version) {
        self.versions.insert(version.id, version);
    }

    /// Snapshot of the current row, for callers (like the CLI) that need a
    /// fresh read after the core has mutated it through the trait.
    pub fn app(&self, id: Id) -> Option<App> {
        self.apps.get(&id).map(|e| e.clone())
    }

    /// Snapshot of the current row, mirroring [`Self::app`].
    pub fn server(&self, id: Id) -> Option<Server> {
        self.servers.get(&id).map(|e| e.clone())
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_server(&self, id: Id) -> Result<Server> {
        self.servers.get(&id).map(|e| e.clone()).ok_or_else(|| Error::new(ErrorKind::InvalidConfig, format!("no such server: {}", id)))
    }

    async fn get_app(&self, id: Id) -> Result<App> {
        self.apps.get(&id).map(|e| e.clone()).ok_or_else(|| Error::new(ErrorKind::InvalidConfig, format!("no such app: {}", id)))
    }

    async fn get_version(&self, id: Id) -> Result<Version> {
        self.versions.get(&id).map(|e| e.clone()).ok_or_else(|| Error::new(ErrorKind::InvalidConfig, format!("no such version: {}", id)))
    }

    async fn create_deployment(&self, app_id: Id, version_id: Id, kind: DeploymentKind) -> Result<Id> {
        let id = Uuid::new_v4();
        self.deployments.insert(
            id,
            Deployment {
                id,
                app_id,
                version_id,
                kind,
                state: DeploymentState::Pending,
                log: String::new(),
                started_at: Utc::now(),
                finished_at: None,
            },
        );
        Ok(id)
    }

    async fn update_deployment(&self, id: Id, patch: DeploymentPatch) -> Result<()> {
        let mut entry = self
            .deployments
            .get_mut(&id)
            .ok_or_else(|| Error::new(ErrorKind::InvalidConfig, format!("no such deployment: {}", id)))?;
        if let Some(state) = patch.state {
            if entry.state.is_terminal() {
                return Err(Error::new(ErrorKind::InvalidConfig, format!("deployment {} is already terminal ({:?})", id, entry.state)));
            }
            entry.state = state;
        }
        if let Some(line) = patch.log_append {
            if !entry.log.is_empty() {
                entry.log.push('\n');
            }
            entry.log.push_str(&line);
        }
        if let Some(finished_at) = patch.finished_at {
            entry.finished_at = Some(finished_at);
        }
        Ok(())
    }

    async fn list_active_deployments_for(&self, app_id: Id) -> Result<Vec<Deployment>> {
        Ok(self
            .deployments
            .iter()
            .filter(|e| e.app_id == app_id && !e.state.is_terminal())
            .map(|e| e.clone())
            .collect())
    }

    async fn cas_app_active_deployment(&self, app_id: Id, expected: Option<Id>, new: Option<Id>) -> Result<bool> {
        let mut entry = self
            .apps
            .get_mut(&app_id)
            .ok_or_else(|| Error::new(ErrorKind::InvalidConfig, format!("no such app: {}", app_id)))?;
        if entry.active_deployment_id != expected {
            return Ok(false);
        }
        entry.active_deployment_id = new;
        Ok(true)
    }

    async fn set_app_current_version(&self, app_id: Id, version_number: String) -> Result<()> {
        let mut entry = self
            .apps
            .get_mut(&app_id)
            .ok_or_else(|| Error::new(ErrorKind::InvalidConfig, format!("no such app: {}", app_id)))?;
        entry.current_version = Some(version_number);
        Ok(())
    }
}

/// Resolves `artifact_ref` as a path relative to `root`. Real artifact
/// storage (object storage, a content-addressed blob service) lives
/// outside the core; this is the minimal adapter that lets the CLI point
/// at a directory of pre-built release zips.
pub struct FilesystemArtifactStore {
    root: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn open(&self, artifact_ref: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let path = self.root.join(artifact_ref);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, format!("failed to open artifact {}", path.display()), e))?;
        Ok(Box::new(file))
    }
}

pub type SharedRepository = Arc<dyn Repository>;
pub type SharedArtifactStore = Arc<dyn ArtifactStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AppStatus;

    fn sample_app() -> App {
        App {
            id: Uuid::new_v4(),
            name: "notes".to_string(),
            server_id: Uuid::new_v4(),
            remote_path: "/opt/berth/apps/notes".to_string(),
            service_name: "berth-notes".to_string(),
            domain: "notes.example.com".to_string(),
            current_version: None,
            status: AppStatus::Unknown,
            active_deployment_id: None,
        }
    }

    #[tokio::test]
    async fn cas_only_succeeds_when_expected_matches() {
        let repo = InMemoryRepository::new();
        let app = sample_app();
        let app_id = app.id;
        repo.insert_app(app);

        let dep_id = Uuid::new_v4();
        assert!(repo.cas_app_active_deployment(app_id, None, Some(dep_id)).await.unwrap());
        assert!(!repo.cas_app_active_deployment(app_id, None, Some(Uuid::new_v4())).await.unwrap());
        assert!(repo.cas_app_active_deployment(app_id, Some(dep_id), None).await.unwrap());
    }

    #[tokio::test]
    async fn update_deployment_rejects_mutation_after_terminal_state() {
        let repo = InMemoryRepository::new();
        let app = sample_app();
        let app_id = app.id;
        repo.insert_app(app);
        let version_id = Uuid::new_v4();

        let dep_id = repo.create_deployment(app_id, version_id, DeploymentKind::First).await.unwrap();
        repo.update_deployment(dep_id, DeploymentPatch { state: Some(DeploymentState::Succeeded), ..Default::default() })
            .await
            .unwrap();

        let result = repo.update_deployment(dep_id, DeploymentPatch { state: Some(DeploymentState::Failed), ..Default::default() }).await;
        assert!(result.is_err());
    }
}
