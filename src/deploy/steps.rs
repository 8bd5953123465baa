//! The individual steps shared by the first-deploy, update, and rollback
//! state machines. Each step is a plain async function taking exactly the
//! collaborators it needs, so the three machines in [`super`] can
//! reorder/reuse them without a shared mutable step object.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::{Command, Executor};
use crate::model::{ArtifactStore, Version};
use crate::service::{ServiceAction, ServiceManager, UnitConfig};
use crate::ssh::{ConnectionConfig, Transfer};

use super::context::{DeployContext, SuperuserBootstrap};

/// Streams the version's zip artifact to a local temp file, then verifies
/// it contains exactly the required top-level members (`binary`,
/// `public/`) and that every entry's CRC matches — `ZipArchive` validates
/// CRC as each entry is read to completion.
pub async fn fetch_and_validate(store: &dyn ArtifactStore, version: &Version, dest: &Path) -> Result<std::path::PathBuf> {
    tokio::fs::create_dir_all(dest).await.map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to create stage dir", e))?;
    let archive_path = dest.join("artifact.zip");

    let mut reader = store.open(&version.artifact_ref).await?;
    let mut file = tokio::fs::File::create(&archive_path)
        .await
        .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to create local artifact file", e))?;
    tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(|e| Error::with_source(ErrorKind::Network, "failed to stream artifact", e))?;
    file.flush().await.ok();

    validate_zip(&archive_path)?;
    Ok(archive_path)
}

fn validate_zip(path: &Path) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to reopen artifact zip", e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "artifact is not a valid zip", e))?;

    let mut has_binary = false;
    let mut has_public_dir = false;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "corrupt zip entry", e))?;
        let name = entry.name().to_string();
        if name == "binary" {
            has_binary = true;
        }
        if name == "public/" || name.starts_with("public/") {
            has_public_dir = true;
        }
        // Reading to completion is what makes ZipArchive check the CRC.
        let mut sink = Vec::new();
        entry
            .read_to_end(&mut sink)
            .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, format!("CRC mismatch or truncated entry: {}", name), e))?;
    }

    if !has_binary {
        return Err(Error::new(ErrorKind::InvalidConfig, "artifact zip missing required member 'binary'"));
    }
    if !has_public_dir {
        return Err(Error::new(ErrorKind::InvalidConfig, "artifact zip missing required member 'public/'"));
    }
    Ok(())
}

/// Extracts `archive_path` into `dest/extracted/`.
pub async fn stage(archive_path: &Path, dest: &Path) -> Result<std::path::PathBuf> {
    let extracted = dest.join("extracted");
    let archive_path = archive_path.to_path_buf();
    let extracted_clone = extracted.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&archive_path).map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to reopen artifact zip", e))?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "artifact is not a valid zip", e))?;
        archive
            .extract(&extracted_clone)
            .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to extract artifact", e))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "extraction task panicked", e))??;

    Ok(extracted)
}

/// Uploads every regular file under `local_dir` to `remote_root`,
/// preserving relative paths, via the Executor's atomic transfer.
pub async fn upload_tree(executor: &Executor, conn: ConnectionConfig, local_dir: &Path, remote_root: &str) -> Result<()> {
    let mut stack = vec![local_dir.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to read staged directory", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to iterate staged directory", e))?
        {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }

    for path in files {
        let rel = path.strip_prefix(local_dir).expect("walked from local_dir");
        let remote_path = format!("{}/{}", remote_root, rel.to_string_lossy().replace('\\', "/"));
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::with_source(ErrorKind::InvalidConfig, "failed to read staged file", e))?;
        let mode = if rel.as_os_str() == "binary" { 0o755 } else { 0o644 };
        let transfer = Transfer::upload_bytes(remote_path, bytes).with_mode(mode);
        executor.transfer_file(conn.clone(), transfer, None).await?;
    }
    Ok(())
}

/// `mkdir -p remotePath/logs` (the unit's `StandardOutput=append:.../logs/std.log`
/// needs the directory to already exist — systemd does not create it),
/// then `chown -R appUser:appUser remotePath; chmod 0755 binary logs`.
pub async fn apply_permissions(executor: &Executor, conn: ConnectionConfig, remote_path: &str, app_user: &str) -> Result<()> {
    let cmd = Command::new(format!(
        "mkdir -p {1}/logs && chown -R {0}:{0} {1} && chmod 0755 {1}/binary {1}/logs",
        shell_quote(app_user),
        shell_quote(remote_path)
    ))
    .sudo();
    executor.run_command(conn, &cmd).await.map(|_| ())
}

pub async fn write_unit(service_manager: &ServiceManager, conn: ConnectionConfig, ctx: &DeployContext) -> Result<()> {
    let config = UnitConfig {
        description: format!("{} application service", ctx.app.name),
        app_user: ctx.server.app_user.clone(),
        app_root: ctx.app.remote_path.clone(),
        domain: ctx.app.domain.clone(),
    };
    service_manager.create_service_file(conn, &ctx.app.service_name, &config).await
}

/// Runs `./binary superuser create <email> <pass>` under `appUser`. The
/// password is passed as a secret-marked env var so [`Command::display_cmd`]
/// redacts it from tracer fields and progress messages.
pub async fn bootstrap_superuser(executor: &Executor, conn: ConnectionConfig, remote_path: &str, bootstrap: &SuperuserBootstrap) -> Result<()> {
    let cmd = Command::new(format!("./binary superuser create {} \"$BERTH_BOOTSTRAP_PASSWORD\"", shell_quote(&bootstrap.email)))
        .with_cwd(remote_path.to_string())
        .with_secret_env("BERTH_BOOTSTRAP_PASSWORD", bootstrap.password.clone());
    let result = executor.run_command(conn, &cmd).await?;
    if result.exit_code != 0 {
        return Err(Error::new(ErrorKind::Remote, "superuser bootstrap exited non-zero"));
    }
    Ok(())
}

pub async fn start_service(service_manager: &ServiceManager, conn: ConnectionConfig, name: &str) -> Result<()> {
    service_manager.manage_service(conn.clone(), ServiceAction::Enable, name).await?;
    service_manager.manage_service(conn.clone(), ServiceAction::Start, name).await?;
    service_manager
        .wait_for_service(conn, name, "active", Duration::from_secs(10))
        .await
        .map(|_| ())
}

pub async fn stop_service(service_manager: &ServiceManager, conn: ConnectionConfig, name: &str) -> Result<()> {
    service_manager.manage_service(conn, ServiceAction::Stop, name).await.map(|_| ())
}

/// `GET <url>`, retrying `attempts` times at `interval`, success on any 2xx.
pub async fn health_gate(client: &reqwest::Client, url: &str, attempts: u32, interval: Duration) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..attempts {
        match client.get(url).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => last_err = Some(format!("unexpected status {}", resp.status())),
            Err(e) => last_err = Some(e.to_string()),
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(Error::new(
        ErrorKind::HealthGate,
        format!("health endpoint did not return 2xx after {} attempts: {}", attempts, last_err.unwrap_or_default()),
    ))
}

/// Move `binary` and `public/` into `.backup/` (rename, atomic on the same
/// filesystem).
pub async fn backup(executor: &Executor, conn: ConnectionConfig, remote_path: &str) -> Result<()> {
    let backup_dir = format!("{}/.backup", remote_path);
    let cmd = Command::new(format!(
        "mkdir -p {0} && mv {1}/binary {0}/binary && mv {1}/public {0}/public",
        shell_quote(&backup_dir),
        shell_quote(remote_path)
    ))
    .sudo();
    executor.run_command(conn, &cmd).await.map(|_| ())
}

/// Inverse of [`backup`]. Idempotent: if `.backup/` is already gone this is
/// a no-op rather than an error, since it only runs on a failure path that
/// may itself be retried.
pub async fn restore_backup(executor: &Executor, conn: ConnectionConfig, remote_path: &str) -> Result<()> {
    let backup_dir = format!("{}/.backup", remote_path);
    let cmd = Command::new(format!(
        "test -d {0} || exit 0; rm -rf {1}/binary {1}/public && mv {0}/binary {1}/binary && mv {0}/public {1}/public && rmdir {0}",
        shell_quote(&backup_dir),
        shell_quote(remote_path)
    ))
    .sudo();
    executor.run_command(conn, &cmd).await.map(|_| ())
}

pub async fn cleanup_backup(executor: &Executor, conn: ConnectionConfig, remote_path: &str) -> Result<()> {
    let backup_dir = format!("{}/.backup", remote_path);
    let cmd = Command::new(format!("rm -rf {}", shell_quote(&backup_dir))).sudo();
    executor.run_command(conn, &cmd).await.map(|_| ())
}

/// Whether `.backup/` currently exists on the host — used both by the
/// update machine's failure path and by startup reconciliation.
pub async fn backup_exists(executor: &Executor, conn: ConnectionConfig, remote_path: &str) -> Result<bool> {
    let backup_dir = format!("{}/.backup", remote_path);
    let cmd = Command::new(format!("test -d {}", shell_quote(&backup_dir))).allow_failure();
    let result = executor.run_command(conn, &cmd).await?;
    Ok(result.exit_code == 0)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("o'brien"), "'o'\\''brien'");
    }
}
