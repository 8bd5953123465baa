//! C6 — user creation, authorized-keys install, directory provisioning,
//! package install, sudoers entries. Every step is idempotent (re-running
//! the whole sequence continues rather than fails); there is no rollback
//! on partial failure because none is needed.

pub mod packages;

use std::time::Duration;

use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::{Command, Executor};
use crate::model::{Id, ProgressEvent, ProgressStatus};
use crate::progress::ProgressBus;
use crate::ssh::ConnectionConfig;
use crate::tracer::{Field, SpanStatus, Tracer};
use packages::PackageManager;

/// Everything the setup sequence needs about the target app user and host.
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub app_user: String,
    pub authorized_keys: Vec<String>,
    pub app_root: String,
    pub packages: Vec<String>,
    /// Commands the app user may run via sudo without a password, written
    /// verbatim into the sudoers drop-in (e.g. `systemctl restart app`).
    pub sudoers_whitelist: Vec<String>,
}

const STEP_NAMES: [&str; 5] = [
    "ensure-user",
    "authorize-keys",
    "provision-directories",
    "install-packages",
    "configure-sudoers",
];

pub struct SetupManager {
    executor: Executor,
    progress: ProgressBus,
    tracer: Tracer,
}

impl SetupManager {
    pub fn new(executor: Executor, progress: ProgressBus, tracer: Tracer) -> Self {
        Self {
            executor,
            progress,
            tracer: tracer.scoped("setup"),
        }
    }

    fn emit(&self, run_id: Id, step: &str, status: ProgressStatus, percent: u8, message: impl Into<String>) {
        self.progress.publish(ProgressEvent {
            deployment_id: run_id,
            step: step.to_string(),
            status,
            message: message.into(),
            percent,
            error: None,
            at: chrono::Utc::now(),
        });
    }

    fn emit_failed(&self, run_id: Id, step: &str, percent: u8, err: &Error) {
        self.progress.publish(ProgressEvent {
            deployment_id: run_id,
            step: step.to_string(),
            status: ProgressStatus::Failed,
            message: format!("{} failed", step),
            percent,
            error: Some(err.to_string()),
            at: chrono::Utc::now(),
        });
    }

    /// Runs all five steps in order. Returns the run id used for the
    /// progress stream so the caller can subscribe beforehand if desired.
    pub async fn run(&self, config: ConnectionConfig, req: &SetupRequest) -> Result<Id> {
        let run_id = Uuid::new_v4();
        let span = self.tracer.start("run");
        span.set("app_user", Field::Str(req.app_user.clone()));

        let total = STEP_NAMES.len() as u8;
        let pct = |i: usize| ((i as u8 + 1) * 100 / total).min(100);

        if let Err(e) = self.ensure_user(run_id, pct(0), &config, req).await {
            span.end(SpanStatus::Error);
            return Err(e);
        }
        if let Err(e) = self.authorize_keys(run_id, pct(1), &config, req).await {
            span.end(SpanStatus::Error);
            return Err(e);
        }
        if let Err(e) = self.provision_directories(run_id, pct(2), &config, req).await {
            span.end(SpanStatus::Error);
            return Err(e);
        }
        if let Err(e) = self.install_packages(run_id, pct(3), &config, req).await {
            span.end(SpanStatus::Error);
            return Err(e);
        }
        if let Err(e) = self.configure_sudoers(run_id, pct(4), &config, req).await {
            span.end(SpanStatus::Error);
            return Err(e);
        }

        span.end(SpanStatus::Ok);
        self.progress.retire(run_id);
        Ok(run_id)
    }

    async fn ensure_user(&self, run_id: Id, pct: u8, config: &ConnectionConfig, req: &SetupRequest) -> Result<()> {
        let step = STEP_NAMES[0];
        self.emit(run_id, step, ProgressStatus::Running, pct, "creating app user");

        let check = Command::new(format!("id -u {}", shell_quote(&req.app_user))).allow_failure();
        let exists = self.executor.run_command(config.clone(), &check).await?;
        if exists.exit_code == 0 {
            self.emit(run_id, step, ProgressStatus::Ok, pct, "user already exists");
            return Ok(());
        }

        let create = Command::new(format!(
            "useradd --create-home --shell /bin/bash --password '!' {}",
            shell_quote(&req.app_user)
        ))
        .sudo();

        if let Err(e) = self.executor.run_command(config.clone(), &create).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }
        self.emit(run_id, step, ProgressStatus::Ok, pct, "user created");
        Ok(())
    }

    async fn authorize_keys(&self, run_id: Id, pct: u8, config: &ConnectionConfig, req: &SetupRequest) -> Result<()> {
        let step = STEP_NAMES[1];
        self.emit(run_id, step, ProgressStatus::Running, pct, "authorizing keys");

        let home = format!("/home/{}", req.app_user);
        let ssh_dir = format!("{}/.ssh", home);
        let authorized_keys = format!("{}/authorized_keys", ssh_dir);

        let mkdir = Command::new(format!("mkdir -p {}", shell_quote(&ssh_dir))).sudo();
        if let Err(e) = self.executor.run_command(config.clone(), &mkdir).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        // De-duplicate by line: read existing content, union with the
        // requested keys, write back.
        let read = Command::new(format!("cat {} 2>/dev/null || true", shell_quote(&authorized_keys)))
            .sudo()
            .allow_failure();
        let existing = self.executor.run_command(config.clone(), &read).await?;
        let mut lines: Vec<String> = existing.stdout.lines().map(str::to_string).collect();
        for key in &req.authorized_keys {
            if !lines.iter().any(|l| l.trim() == key.trim()) {
                lines.push(key.clone());
            }
        }
        let content = lines.join("\n");

        let write = write_file_command(&authorized_keys, &content, true);
        if let Err(e) = self.executor.run_command(config.clone(), &write).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let perms = Command::new(format!(
            "chmod 0600 {} && chown -R {}:{} {}",
            shell_quote(&authorized_keys),
            shell_quote(&req.app_user),
            shell_quote(&req.app_user),
            shell_quote(&ssh_dir)
        ))
        .sudo();
        if let Err(e) = self.executor.run_command(config.clone(), &perms).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        self.emit(run_id, step, ProgressStatus::Ok, pct, "keys authorized");
        Ok(())
    }

    async fn provision_directories(&self, run_id: Id, pct: u8, config: &ConnectionConfig, req: &SetupRequest) -> Result<()> {
        let step = STEP_NAMES[2];
        self.emit(run_id, step, ProgressStatus::Running, pct, "provisioning directories");

        let apps_root = parent_of(&req.app_root);
        let logs_dir = format!("{}/logs", req.app_root);
        let cmd = Command::new(format!(
            "mkdir -p {} {} {} && chmod 0755 {} {} {} && chown -R {}:{} {}",
            shell_quote(&apps_root),
            shell_quote(&req.app_root),
            shell_quote(&logs_dir),
            shell_quote(&apps_root),
            shell_quote(&req.app_root),
            shell_quote(&logs_dir),
            shell_quote(&req.app_user),
            shell_quote(&req.app_user),
            shell_quote(&req.app_root)
        ))
        .sudo();

        if let Err(e) = self.executor.run_command(config.clone(), &cmd).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }
        self.emit(run_id, step, ProgressStatus::Ok, pct, "directories ready");
        Ok(())
    }

    async fn install_packages(&self, run_id: Id, pct: u8, config: &ConnectionConfig, req: &SetupRequest) -> Result<()> {
        let step = STEP_NAMES[3];
        if req.packages.is_empty() {
            self.emit(run_id, step, ProgressStatus::Ok, pct, "no packages requested");
            return Ok(());
        }
        self.emit(run_id, step, ProgressStatus::Running, pct, "installing packages");

        let pm = match PackageManager::detect(&self.executor, config).await {
            Ok(pm) => pm,
            Err(e) => {
                self.emit_failed(run_id, step, pct, &e);
                return Err(e);
            }
        };
        let cmd = pm.install(&req.packages);
        if let Err(e) = self.executor.run_command(config.clone(), &cmd).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }
        self.emit(run_id, step, ProgressStatus::Ok, pct, "packages installed");
        Ok(())
    }

    async fn configure_sudoers(&self, run_id: Id, pct: u8, config: &ConnectionConfig, req: &SetupRequest) -> Result<()> {
        let step = STEP_NAMES[4];
        self.emit(run_id, step, ProgressStatus::Running, pct, "configuring sudoers");

        let drop_in = format!("/etc/sudoers.d/{}", req.app_user);
        let tmp = format!("{}.tmp", drop_in);

        let lines: Vec<String> = req
            .sudoers_whitelist
            .iter()
            .map(|cmd| format!("{} ALL=(root) NOPASSWD: {}", req.app_user, cmd))
            .collect();
        let content = lines.join("\n");

        let write = write_file_command(&tmp, &content, true);
        if let Err(e) = self.executor.run_command(config.clone(), &write).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let validate = Command::new(format!("visudo -c -f {}", shell_quote(&tmp)))
            .sudo()
            .allow_failure();
        let check = self.executor.run_command(config.clone(), &validate).await?;
        if check.exit_code != 0 {
            let _ = self
                .executor
                .run_command(config.clone(), &Command::new(format!("rm -f {}", shell_quote(&tmp))).sudo())
                .await;
            let e = Error::new(ErrorKind::Remote, format!("visudo validation failed: {}", check.stderr));
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        let commit = Command::new(format!(
            "chmod 0440 {} && mv -f {} {}",
            shell_quote(&tmp),
            shell_quote(&tmp),
            shell_quote(&drop_in)
        ))
        .sudo();
        if let Err(e) = self.executor.run_command(config.clone(), &commit).await {
            self.emit_failed(run_id, step, pct, &e);
            return Err(e);
        }

        self.emit(run_id, step, ProgressStatus::Ok, pct, "sudoers configured");
        Ok(())
    }
}

fn parent_of(path: &str) -> String {
    std::path::Path::new(path)
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or("/opt")
        .to_string()
}

fn write_file_command(remote_path: &str, content: &str, sudo: bool) -> Command {
    let marker = "BERTH_WRITE_EOF";
    let script = format!("cat > {} << '{marker}'\n{}\n{marker}", shell_quote(remote_path), content);
    let mut cmd = Command::new(script);
    if sudo {
        cmd = cmd.sudo();
    }
    cmd.timeout = Duration::from_secs(30);
    cmd
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_app_root_is_apps_parent_dir() {
        assert_eq!(parent_of("/opt/pb/apps/notes"), "/opt/pb/apps");
    }
}
