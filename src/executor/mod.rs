//! C5 — the high-level command/script/transfer API built on the
//! [`ConnectionPool`]. Adds `sudo`, env, cwd, timeouts, retries, and
//! streaming on top of the raw [`crate::ssh::SshClient`] primitives.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind, Result, RetryConfig};
use crate::pool::ConnectionPool;
use crate::ssh::exec::RawOutput;
use crate::ssh::{ConnectionConfig, StreamEvent, Transfer};
use crate::tracer::{Field, SpanStatus, Tracer};

/// `{ cmd, sudo, env, cwd?, stdin?, timeout, allowFailure }`.
#[derive(Debug, Clone)]
pub struct Command {
    pub cmd: String,
    pub sudo: bool,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
    pub allow_failure: bool,
    /// Env/command text that should never appear verbatim in tracer
    /// fields or progress messages (e.g. superuser bootstrap credentials).
    pub secret_env_keys: Vec<String>,
    /// Whether a transient failure for this specific command may be retried.
    pub retryable: bool,
}

impl Command {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            sudo: false,
            env: HashMap::new(),
            cwd: None,
            stdin: None,
            timeout: Duration::from_secs(60),
            allow_failure: false,
            secret_env_keys: Vec::new(),
            retryable: false,
        }
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.secret_env_keys.push(key.clone());
        self.env.insert(key, value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// The redacted form used in tracer fields and progress messages.
    pub fn display_cmd(&self) -> String {
        let mut out = self.cmd.clone();
        for key in &self.secret_env_keys {
            if let Some(value) = self.env.get(key) {
                if !value.is_empty() {
                    out = out.replace(value, "***");
                }
            }
        }
        out
    }

    fn build_shell(&self) -> String {
        let mut parts = Vec::new();
        for (k, v) in &self.env {
            parts.push(format!("export {}={}", k, shell_quote(v)));
        }
        if let Some(cwd) = &self.cwd {
            parts.push(format!("cd {} || exit 1", shell_quote(cwd)));
        }
        parts.push("set -e".to_string());
        parts.push(self.cmd.clone());
        let script = parts.join("\n");
        if self.sudo {
            format!("sudo -n bash -c {}", shell_quote(&script))
        } else {
            format!("bash -c {}", shell_quote(&script))
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// `{ exitCode, stdout, stderr, duration, truncated }`.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub truncated: bool,
}

impl CommandResult {
    pub fn is_success(&self, allow_failure: bool) -> bool {
        allow_failure || (self.exit_code == 0 && !self.truncated)
    }
}

impl From<RawOutput> for CommandResult {
    fn from(r: RawOutput) -> Self {
        Self {
            exit_code: r.exit_code,
            stdout: r.stdout_string(),
            stderr: r.stderr_string(),
            duration: r.duration,
            truncated: r.truncated,
        }
    }
}

/// Progress callback for transfers with `progress: true`: bytes sent,
/// total size (if known), elapsed.
pub type TransferProgress = std::sync::Arc<dyn Fn(u64, Option<u64>, Duration) + Send + Sync>;

pub struct Executor {
    pool: ConnectionPool,
    tracer: Tracer,
    retry: RetryConfig,
}

impl Executor {
    pub fn new(pool: ConnectionPool, tracer: Tracer) -> Self {
        Self {
            pool,
            tracer: tracer.scoped("executor"),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn acquire(&self, config: ConnectionConfig) -> Result<crate::ssh::SshClient> {
        self.pool.get(config).await
    }

    /// Run a command against the pooled connection for `config`. Retries only when `cmd.retryable` and
    /// the failure's [`crate::error::ErrorKind`] is retryable, with
    /// exponential backoff + jitter bounded by `RetryConfig`.
    pub async fn run_command(&self, config: ConnectionConfig, cmd: &Command) -> Result<CommandResult> {
        let span = self.tracer.start("run_command");
        span.set("cmd", Field::Str(cmd.display_cmd()));
        span.set("sudo", Field::Bool(cmd.sudo));

        let script = cmd.build_shell();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.run_once(&config, &script, cmd).await;
            match outcome {
                Ok(result) => {
                    span.end(if result.is_success(cmd.allow_failure) { SpanStatus::Ok } else { SpanStatus::Error });
                    return Ok(result);
                }
                Err(e) => {
                    let should_retry = cmd.retryable && e.kind().is_retryable() && attempt < self.retry.max_attempts;
                    if !should_retry {
                        span.end(SpanStatus::Error);
                        return Err(e);
                    }
                    let delay = self.retry.jittered_delay_for(attempt, crate::error::jitter_unit());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Acquires its own client and releases it on every exit path so a
    /// failure partway through never leaves the pool entry stuck `in-use`.
    async fn run_once(&self, config: &ConnectionConfig, script: &str, cmd: &Command) -> Result<CommandResult> {
        let client = self.acquire(config.clone()).await?;
        let outcome = client.execute(script, cmd.timeout).await;
        self.pool.release(&client).await;

        let raw = outcome?;
        if cmd.sudo && raw.exit_code != 0 && raw.stderr_string().contains("a password is required") {
            return Err(Error::new(ErrorKind::Sudo, "sudo requires a password (non-interactive prompt)"));
        }
        let result: CommandResult = raw.into();
        if !result.is_success(cmd.allow_failure) {
            return Err(Error::new(
                ErrorKind::Remote,
                format!("command exited {} (allow_failure=false)", result.exit_code),
            ));
        }
        Ok(result)
    }

    /// Upload `script_body`, chmod +x, run it, delete it on every exit
    /// path (success, failure, or cancellation).
    pub async fn run_script(
        &self,
        config: ConnectionConfig,
        script_body: &str,
        interpreter: &str,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let client = self.acquire(config.clone()).await?;
        let remote_path = format!("/tmp/berth-script-{}", uuid::Uuid::new_v4());
        let transfer = Transfer::upload_bytes(remote_path.clone(), script_body.as_bytes().to_vec()).with_mode(0o700);

        let cleanup = |client: crate::ssh::SshClient, path: String| async move {
            let _ = client.execute(&format!("rm -f {}", path), Duration::from_secs(10)).await;
        };

        if let Err(e) = client.transfer(&transfer).await {
            self.pool.release(&client).await;
            return Err(e);
        }

        let run = client
            .execute(&format!("{} {}", interpreter, remote_path), timeout)
            .await;

        cleanup(client.clone(), remote_path).await;
        self.pool.release(&client).await;

        run.map(CommandResult::from)
    }

    /// Transfer a file over the pooled connection. When `transfer.progress` is set,
    /// `on_progress` is invoked with `(bytes_sent, total, elapsed)`; for the
    /// inline/heredoc path this fires once at completion since there is no
    /// intermediate byte-count to observe, matching how small transfers
    /// are indistinguishable from a single atomic write.
    pub async fn transfer_file(
        &self,
        config: ConnectionConfig,
        transfer: Transfer,
        on_progress: Option<TransferProgress>,
    ) -> Result<()> {
        let client = self.acquire(config).await?;
        let start = std::time::Instant::now();
        let size = transfer.bytes.as_ref().map(|b| b.len() as u64);
        let result = client.transfer(&transfer).await;
        if transfer.progress {
            if let Some(cb) = on_progress {
                cb(size.unwrap_or(0), size, start.elapsed());
            }
        }
        self.pool.release(&client).await;
        result
    }

    /// Run a command with live streamed output. The caller must drain the channel or cancel to
    /// release the pool entry; dropping the receiver closes the channel
    /// and the background task sees the closed `mpsc::Sender` on its next
    /// send attempt and winds itself down.
    pub async fn stream_command(
        &self,
        config: ConnectionConfig,
        cmd: &Command,
        cancel: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let client = self.acquire(config).await?;
        let script = cmd.build_shell();
        let rx = client.execute_stream(&script, cancel).await?;
        self.pool.release(&client).await;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_cmd_redacts_secret_values() {
        let cmd = Command::new("./binary superuser create a@b.com hunter2")
            .with_secret_env("PASS", "hunter2");
        assert!(!cmd.display_cmd().contains("hunter2"));
        assert!(cmd.display_cmd().contains("***"));
    }

    #[test]
    fn build_shell_wraps_sudo_noninteractive() {
        let cmd = Command::new("whoami").sudo();
        let script = cmd.build_shell();
        assert!(script.starts_with("sudo -n bash -c"));
    }

    #[test]
    fn command_result_allow_failure_widens_success() {
        let result = CommandResult {
            exit_code: 7,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            truncated: false,
        };
        assert!(!result.is_success(false));
        assert!(result.is_success(true));
    }
}
