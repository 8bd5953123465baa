//! C9 — the deployment state machines: first-deploy, update, rollback.
//!
//! All three share one concurrency guard (compare-and-set on
//! `App.active_deployment_id`), one progress stream keyed by deployment id,
//! and the step functions in [`steps`].

pub mod context;
pub mod steps;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::Executor;
use crate::model::{App, ArtifactStore, DeploymentKind, DeploymentPatch, DeploymentState, Id, ProgressEvent, ProgressStatus, Repository, Server, Version};
use crate::progress::ProgressBus;
use crate::service::ServiceManager;
use crate::tracer::{Field, SpanStatus, Tracer};

use context::{DeployContext, DeployRequest};

/// Cooperative cancellation checked between steps. A deployment step is
/// never interrupted mid-execution; cancellation takes effect at the next
/// step boundary, where the machine then attempts its compensating action.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct DeploymentManager {
    repository: Arc<dyn Repository>,
    artifacts: Arc<dyn ArtifactStore>,
    executor: Executor,
    service: ServiceManager,
    progress: ProgressBus,
    health_client: reqwest::Client,
    tracer: Tracer,
    stage_root: PathBuf,
}

impl DeploymentManager {
    pub fn new(
        repository: Arc<dyn Repository>,
        artifacts: Arc<dyn ArtifactStore>,
        executor: Executor,
        service: ServiceManager,
        progress: ProgressBus,
        tracer: Tracer,
        stage_root: PathBuf,
    ) -> Self {
        Self {
            repository,
            artifacts,
            executor,
            service,
            progress,
            health_client: reqwest::Client::new(),
            tracer: tracer.scoped("deploy"),
            stage_root,
        }
    }

    fn emit(&self, deployment_id: Id, step: &str, status: ProgressStatus, percent: u8, message: impl Into<String>) {
        self.progress.publish(ProgressEvent {
            deployment_id,
            step: step.to_string(),
            status,
            message: message.into(),
            percent,
            error: None,
            at: Utc::now(),
        });
    }

    fn emit_failed(&self, deployment_id: Id, step: &str, percent: u8, err: &Error) {
        self.progress.publish(ProgressEvent {
            deployment_id,
            step: step.to_string(),
            status: ProgressStatus::Failed,
            message: format!("{} failed", step),
            percent,
            error: Some(err.to_string()),
            at: Utc::now(),
        });
    }

    /// Acquires the per-app concurrency guard by creating the Deployment
    /// record and CAS-ing it onto `App.active_deployment_id`. Fails with
    /// `ErrInProgress` if another deployment is already active.
    async fn begin(&self, app: &App, version_id: Id, kind: DeploymentKind) -> Result<Id> {
        let deployment_id = self.repository.create_deployment(app.id, version_id, kind).await?;
        let acquired = self
            .repository
            .cas_app_active_deployment(app.id, app.active_deployment_id, Some(deployment_id))
            .await?;
        if !acquired {
            self.repository
                .update_deployment(
                    deployment_id,
                    DeploymentPatch {
                        state: Some(DeploymentState::Failed),
                        log_append: Some("another deployment is already active for this app".to_string()),
                        finished_at: Some(Utc::now()),
                    },
                )
                .await?;
            return Err(Error::new(ErrorKind::InProgress, "another deployment is already active for this app"));
        }
        self.repository
            .update_deployment(deployment_id, DeploymentPatch { state: Some(DeploymentState::Running), ..Default::default() })
            .await?;
        Ok(deployment_id)
    }

    async fn finish(&self, app: &App, deployment_id: Id, state: DeploymentState, log: impl Into<String>) -> Result<()> {
        self.repository
            .update_deployment(
                deployment_id,
                DeploymentPatch {
                    state: Some(state),
                    log_append: Some(log.into()),
                    finished_at: Some(Utc::now()),
                },
            )
            .await?;
        self.repository.cas_app_active_deployment(app.id, Some(deployment_id), None).await?;
        self.progress.retire(deployment_id);
        Ok(())
    }

    /// `fetch → stage → upload → permissions → write-unit →
    /// bootstrap-superuser → start → health-gate → finalize`.
    pub async fn first_deploy(&self, server: Server, app: App, version: Version, request: DeployRequest, cancel: CancelToken) -> Result<Id> {
        let deployment_id = self.begin(&app, version.id, DeploymentKind::First).await?;
        let span = self.tracer.start("first_deploy");
        span.set("app", Field::Str(app.name.clone()));

        let ctx = DeployContext {
            deployment_id,
            server,
            app,
            version,
            request,
            local_stage_dir: self.stage_root.clone(),
        };
        let conn = ctx.connection_config();

        const PCT: [u8; 8] = [10, 25, 40, 50, 60, 70, 85, 95];
        macro_rules! step {
            ($name:expr, $idx:expr, $body:expr) => {{
                if cancel.is_canceled() {
                    let e = Error::canceled();
                    self.emit_failed(deployment_id, $name, PCT[$idx], &e);
                    self.finish(&ctx.app, deployment_id, DeploymentState::Failed, "canceled").await.ok();
                    span.end(SpanStatus::Canceled);
                    return Err(e);
                }
                self.emit(deployment_id, $name, ProgressStatus::Running, PCT[$idx], $name);
                match $body {
                    Ok(v) => {
                        self.emit(deployment_id, $name, ProgressStatus::Ok, PCT[$idx], $name);
                        v
                    }
                    Err(e) => {
                        self.emit_failed(deployment_id, $name, PCT[$idx], &e);
                        self.finish(&ctx.app, deployment_id, DeploymentState::Failed, e.to_string()).await.ok();
                        span.end(SpanStatus::Error);
                        return Err(e);
                    }
                }
            }};
        }

        let archive = step!("fetch", 0, steps::fetch_and_validate(self.artifacts.as_ref(), &ctx.version, &ctx.stage_dir()).await);
        let extracted = step!("stage", 1, steps::stage(&archive, &ctx.stage_dir()).await);
        step!("upload", 2, steps::upload_tree(&self.executor, conn.clone(), &extracted, ctx.remote_path()).await);
        step!("permissions", 3, steps::apply_permissions(&self.executor, conn.clone(), ctx.remote_path(), &ctx.server.app_user).await);
        step!("write-unit", 4, steps::write_unit(&self.service, conn.clone(), &ctx).await);

        if let Some(bootstrap) = ctx.request.bootstrap.clone() {
            step!("bootstrap-superuser", 4, steps::bootstrap_superuser(&self.executor, conn.clone(), ctx.remote_path(), &bootstrap).await);
        }

        step!("start", 5, steps::start_service(&self.service, conn.clone(), ctx.service_name()).await);
        step!(
            "health-gate",
            6,
            steps::health_gate(&self.health_client, &ctx.health_url(), ctx.request.health_gate_attempts, ctx.request.health_gate_interval).await
        );

        self.repository.set_app_current_version(ctx.app.id, ctx.version.version_number.clone()).await?;
        self.emit(deployment_id, "finalize", ProgressStatus::Ok, 100, "deployment succeeded");
        self.finish(&ctx.app, deployment_id, DeploymentState::Succeeded, "deployment succeeded").await?;
        span.end(SpanStatus::Ok);
        Ok(deployment_id)
    }

    /// `fetch → stage → stop-service → backup → upload → permissions →
    /// start → health-gate → on-success: cleanup-backup → on-failure:
    /// restore-backup → start → mark rolled-back`.
    pub async fn update(&self, server: Server, app: App, version: Version, request: DeployRequest, cancel: CancelToken) -> Result<Id> {
        let deployment_id = self.begin(&app, version.id, DeploymentKind::Update).await?;
        let span = self.tracer.start("update");
        span.set("app", Field::Str(app.name.clone()));

        let ctx = DeployContext {
            deployment_id,
            server,
            app,
            version,
            request,
            local_stage_dir: self.stage_root.clone(),
        };
        let conn = ctx.connection_config();
        let previous_version = ctx.app.current_version.clone();

        let outcome = self.run_update_steps(&ctx, conn.clone(), &cancel).await;
        match outcome {
            Ok(()) => {
                self.repository.set_app_current_version(ctx.app.id, ctx.version.version_number.clone()).await?;
                self.emit(deployment_id, "finalize", ProgressStatus::Ok, 100, "update succeeded");
                self.finish(&ctx.app, deployment_id, DeploymentState::Succeeded, "update succeeded").await?;
                span.end(SpanStatus::Ok);
                Ok(deployment_id)
            }
            Err(e) => {
                self.emit(deployment_id, "restore-backup", ProgressStatus::Running, 90, "restoring previous release after failed update");
                let restore = steps::restore_backup(&self.executor, conn.clone(), ctx.remote_path()).await;
                if let Err(restore_err) = restore {
                    self.emit_failed(deployment_id, "restore-backup", 90, &restore_err);
                    self.finish(&ctx.app, deployment_id, DeploymentState::Failed, format!("update failed ({}), restore also failed ({})", e, restore_err))
                        .await
                        .ok();
                    span.end(SpanStatus::Error);
                    return Err(restore_err);
                }
                let _ = steps::start_service(&self.service, conn, ctx.service_name()).await;
                self.emit(
                    deployment_id,
                    "restore-backup",
                    ProgressStatus::Ok,
                    100,
                    format!("rolled back to {}", previous_version.unwrap_or_default()),
                );
                self.finish(&ctx.app, deployment_id, DeploymentState::RolledBack, format!("update failed: {}", e)).await?;
                span.end(SpanStatus::Error);
                Ok(deployment_id)
            }
        }
    }

    async fn run_update_steps(&self, ctx: &DeployContext, conn: crate::ssh::ConnectionConfig, cancel: &CancelToken) -> Result<()> {
        macro_rules! checked {
            ($name:expr, $pct:expr, $body:expr) => {{
                if cancel.is_canceled() {
                    return Err(Error::canceled());
                }
                self.emit(ctx.deployment_id, $name, ProgressStatus::Running, $pct, $name);
                let v = $body.map_err(|e| {
                    self.emit_failed(ctx.deployment_id, $name, $pct, &e);
                    e
                })?;
                self.emit(ctx.deployment_id, $name, ProgressStatus::Ok, $pct, $name);
                v
            }};
        }

        let archive = checked!("fetch", 10, steps::fetch_and_validate(self.artifacts.as_ref(), &ctx.version, &ctx.stage_dir()).await);
        let extracted = checked!("stage", 20, steps::stage(&archive, &ctx.stage_dir()).await);
        checked!("stop-service", 30, steps::stop_service(&self.service, conn.clone(), ctx.service_name()).await);
        checked!("backup", 40, steps::backup(&self.executor, conn.clone(), ctx.remote_path()).await);
        checked!("upload", 55, steps::upload_tree(&self.executor, conn.clone(), &extracted, ctx.remote_path()).await);
        checked!("permissions", 65, steps::apply_permissions(&self.executor, conn.clone(), ctx.remote_path(), &ctx.server.app_user).await);
        checked!("start", 75, steps::start_service(&self.service, conn.clone(), ctx.service_name()).await);
        checked!(
            "health-gate",
            85,
            steps::health_gate(&self.health_client, &ctx.health_url(), ctx.request.health_gate_attempts, ctx.request.health_gate_interval).await
        );
        checked!("cleanup-backup", 95, steps::cleanup_backup(&self.executor, conn.clone(), ctx.remote_path()).await);
        Ok(())
    }

    /// `resolve-target → fetch → stop-service → swap → permissions →
    /// start → health-gate → finalize`. Rolling back when there is no
    /// prior current version is rejected with `ErrRemote`.
    pub async fn rollback(&self, server: Server, app: App, target: Version, request: DeployRequest, cancel: CancelToken) -> Result<Id> {
        if app.current_version.is_none() {
            return Err(Error::new(ErrorKind::Remote, "no prior version to roll back from"));
        }

        let deployment_id = self.begin(&app, target.id, DeploymentKind::Rollback).await?;
        let span = self.tracer.start("rollback");

        let previous_version = app.current_version.clone();
        let ctx = DeployContext {
            deployment_id,
            server,
            app,
            version: target,
            request,
            local_stage_dir: self.stage_root.clone(),
        };
        let conn = ctx.connection_config();

        let outcome: Result<()> = async {
            if cancel.is_canceled() {
                return Err(Error::canceled());
            }
            self.emit(deployment_id, "resolve-target", ProgressStatus::Ok, 10, format!("rolling back to {}", ctx.version.version_number));

            let archive = steps::fetch_and_validate(self.artifacts.as_ref(), &ctx.version, &ctx.stage_dir()).await?;
            let extracted = steps::stage(&archive, &ctx.stage_dir()).await?;
            self.emit(deployment_id, "fetch", ProgressStatus::Ok, 25, "fetched target version");

            steps::stop_service(&self.service, conn.clone(), ctx.service_name()).await?;
            self.emit(deployment_id, "stop-service", ProgressStatus::Ok, 40, "stopped service");

            let cmd = crate::executor::Command::new(format!("rm -rf {0}/binary {0}/public", shell_quote(ctx.remote_path()))).sudo();
            self.executor.run_command(conn.clone(), &cmd).await?;
            steps::upload_tree(&self.executor, conn.clone(), &extracted, ctx.remote_path()).await?;
            self.emit(deployment_id, "swap", ProgressStatus::Ok, 60, "swapped in target version");

            steps::apply_permissions(&self.executor, conn.clone(), ctx.remote_path(), &ctx.server.app_user).await?;
            self.emit(deployment_id, "permissions", ProgressStatus::Ok, 70, "permissions applied");

            steps::start_service(&self.service, conn.clone(), ctx.service_name()).await?;
            self.emit(deployment_id, "start", ProgressStatus::Ok, 80, "service started");

            steps::health_gate(&self.health_client, &ctx.health_url(), ctx.request.health_gate_attempts, ctx.request.health_gate_interval).await?;
            self.emit(deployment_id, "health-gate", ProgressStatus::Ok, 95, "health gate passed");

            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                self.repository.set_app_current_version(ctx.app.id, ctx.version.version_number.clone()).await?;
                self.emit(deployment_id, "finalize", ProgressStatus::Ok, 100, "rollback succeeded");
                self.finish(
                    &ctx.app,
                    deployment_id,
                    DeploymentState::Succeeded,
                    format!("rolled back from {} to {}", previous_version.unwrap_or_default(), ctx.version.version_number),
                )
                .await?;
                span.end(SpanStatus::Ok);
                Ok(deployment_id)
            }
            Err(e) => {
                self.emit_failed(deployment_id, "rollback", 100, &e);
                self.finish(&ctx.app, deployment_id, DeploymentState::Failed, e.to_string()).await.ok();
                span.end(SpanStatus::Error);
                Err(e)
            }
        }
    }

    /// Startup reconciliation: if `.backup/` still exists on the host for
    /// an app whose last recorded deployment is `Running`, a prior update
    /// was interrupted mid-flight. Attempt the same restore an update's
    /// failure path would have performed.
    pub async fn reconcile_interrupted(&self, server: &Server, remote_path: &str, service_name: &str) -> Result<bool> {
        let conn = crate::ssh::ConnectionConfig {
            port: server.port,
            ..crate::ssh::ConnectionConfig::new(server.host.clone(), server.app_user.clone(), crate::ssh::Auth::Agent)
        };
        if !steps::backup_exists(&self.executor, conn.clone(), remote_path).await? {
            return Ok(false);
        }
        steps::restore_backup(&self.executor, conn.clone(), remote_path).await?;
        steps::start_service(&self.service, conn, service_name).await?;
        Ok(true)
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_starts_uncanceled() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
    }
}
