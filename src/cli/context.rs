//! Wires the library's core components together from a loaded
//! [`BerthConfig`]. One `Core` per CLI invocation; nothing here is meant to
//! outlive the process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use berth::config::BerthConfig;
use berth::deploy::DeploymentManager;
use berth::executor::Executor;
use berth::model::{App, AppStatus, Id, Server};
use berth::pool::{ConnectionPool, PoolConfig};
use berth::progress::ProgressBus;
use berth::repository::{FilesystemArtifactStore, InMemoryRepository};
use berth::security::SecurityManager;
use berth::service::ServiceManager;
use berth::setup::SetupManager;
use berth::ssh::factory::ConnectionFactory;
use berth::tracer::Tracer;
use berth::troubleshoot::Troubleshooter;

use crate::cli::LogFormat;

pub struct Core {
    pub repository: Arc<InMemoryRepository>,
    pub progress: ProgressBus,
    pub tracer: Tracer,
    pub setup: SetupManager,
    pub security: SecurityManager,
    pub service: ServiceManager,
    pub deploy: DeploymentManager,
    pub troubleshoot: Troubleshooter,
    pub server_id: Id,
    pub app_id: Id,
}

/// Sets up the one process-wide `tracing_subscriber` exporter every
/// [`berth::tracer::Tracer`] span is eventually recorded through. Format is
/// a boot-time choice, not a per-span one: `console` for a human reading a
/// terminal, `json` for a log shipper that wants one event per line.
pub fn init_tracing(verbosity: u8, format: LogFormat) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    match format {
        LogFormat::Console => {
            tracing_subscriber::fmt().with_env_filter(env_filter).without_time().init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
        }
    }
}

impl Core {
    pub fn bootstrap(config: &BerthConfig, artifacts_dir: PathBuf, stage_dir: PathBuf) -> Result<Self> {
        let tracer = Tracer::always();
        let factory = ConnectionFactory::new(tracer.clone());
        let pool = ConnectionPool::new(factory, PoolConfig::default(), tracer.clone())?;
        let progress = ProgressBus::new();

        let repository = Arc::new(InMemoryRepository::new());
        let artifact_store = Arc::new(FilesystemArtifactStore::new(artifacts_dir));

        let server_id = Uuid::new_v4();
        repository.insert_server(Server {
            id: server_id,
            host: config.server.host.clone(),
            port: config.server.port,
            root_user: config.server.root_user.clone(),
            app_user: config.server.app_user.clone(),
            auth_ref: "cli-config".to_string(),
            setup_complete: false,
            security_locked: false,
        });

        let app_id = Uuid::new_v4();
        repository.insert_app(App {
            id: app_id,
            name: config.app.name.clone(),
            server_id,
            remote_path: config.remote_path(),
            service_name: config.service_name(),
            domain: config.app.domain.clone(),
            current_version: None,
            status: AppStatus::Unknown,
            active_deployment_id: None,
        });

        let setup = SetupManager::new(Executor::new(pool.clone(), tracer.clone()), progress.clone(), tracer.clone());
        let security = SecurityManager::new(Executor::new(pool.clone(), tracer.clone()), progress.clone(), tracer.clone());
        let service = ServiceManager::new(Executor::new(pool.clone(), tracer.clone()), tracer.clone());
        let deploy = DeploymentManager::new(
            repository.clone(),
            artifact_store,
            Executor::new(pool.clone(), tracer.clone()),
            ServiceManager::new(Executor::new(pool.clone(), tracer.clone()), tracer.clone()),
            progress.clone(),
            tracer.clone(),
            stage_dir,
        );
        let troubleshoot = Troubleshooter::new(tracer.clone());

        Ok(Self {
            repository,
            progress,
            tracer,
            setup,
            security,
            service,
            deploy,
            troubleshoot,
            server_id,
            app_id,
        })
    }
}
