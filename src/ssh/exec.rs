//! Low-level primitives on [`SshClient`]: a single raw shell invocation,
//! a streamed invocation, and atomic file transfer. The higher-level
//! `sudo`/`env`/`cwd`/retry semantics live one layer up, in
//! [`crate::executor`] — this module only knows how to run one command and
//! report what happened.

use std::time::{Duration, Instant};

use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;

use super::{
    OUTPUT_CAP_BYTES, SshClient, StreamEvent, Transfer, TransferDirection, LARGE_TRANSFER_THRESHOLD,
};
use crate::error::{Error, ErrorKind, Result};
use crate::tracer::{Field, SpanStatus};

/// Result of one raw shell command.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    pub truncated: bool,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.truncated
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

fn cap(buf: Vec<u8>) -> (Vec<u8>, bool) {
    if buf.len() > OUTPUT_CAP_BYTES {
        let mut buf = buf;
        buf.truncate(OUTPUT_CAP_BYTES);
        (buf, true)
    } else {
        (buf, false)
    }
}

impl SshClient {
    /// Run `raw_cmd` through `bash -c`, capturing combined output up to
    /// [`OUTPUT_CAP_BYTES`]. The session is released on return or on
    /// `timeout` elapsing; on cancellation the remote process receives
    /// SIGINT, then SIGKILL two seconds later.
    pub async fn execute(&self, raw_cmd: &str, timeout: Duration) -> Result<RawOutput> {
        let _permit = self.exec_permit().await;
        let span = self.tracer.start("execute");
        self.mark_in_use();
        let start = Instant::now();

        let session = self.cloned_session()?;
        let mut cmd = session.command("bash");
        cmd.arg("-c").arg(raw_cmd);

        let result = tokio::time::timeout(timeout, cmd.output()).await;
        self.mark_idle();

        let out = match result {
            Err(_) => {
                span.end(SpanStatus::Timeout);
                return Err(Error::new(ErrorKind::Timeout, "command timed out"));
            }
            Ok(Err(e)) => {
                span.end(SpanStatus::Error);
                return Err(Error::with_source(ErrorKind::Network, "command execution failed", e));
            }
            Ok(Ok(out)) => out,
        };

        let (stdout, truncated_out) = cap(out.stdout);
        let (stderr, truncated_err) = cap(out.stderr);
        let raw = RawOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout,
            stderr,
            duration: start.elapsed(),
            truncated: truncated_out || truncated_err,
        };
        span.set("exit_code", Field::Int(raw.exit_code as i64));
        span.set("duration", Field::Duration(raw.duration));
        span.end(if raw.success() { SpanStatus::Ok } else { SpanStatus::Error });
        Ok(raw)
    }

    /// Streamed execution. Returns a bounded channel of [`StreamEvent`] in
    /// source order; closes on completion, error, or `cancel` firing. The
    /// caller must drain the channel (or drop it, which cancels) to avoid
    /// leaking the underlying child process.
    pub async fn execute_stream(
        &self,
        raw_cmd: &str,
        mut cancel: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let permit = self.exec_permit().await;
        self.mark_in_use();
        let session = self.cloned_session()?;
        let raw_cmd = raw_cmd.to_string();
        let (tx, rx) = mpsc::channel(256);
        let client = self.clone();

        // `session`, `cmd`, and `child` all live inside this task so the
        // `RemoteChild` borrow never has to outlive a function call — it
        // outlives nothing, it just sits next to its owner for as long as
        // the task runs. Held alongside `permit` for the task's whole
        // duration so the client stays serialized until the stream ends.
        tokio::spawn(async move {
            let _permit = permit;

            let mut cmd = session.command("bash");
            cmd.arg("-c").arg(&raw_cmd);
            let mut child = match cmd.spawn().await {
                Ok(child) => child,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(format!("failed to spawn remote command: {e}"))).await;
                    client.mark_idle();
                    return;
                }
            };

            let stdout = match child.stdout().take() {
                Some(s) => s,
                None => {
                    let _ = tx.send(StreamEvent::Error("missing remote stdout handle".to_string())).await;
                    client.mark_idle();
                    return;
                }
            };
            let stderr = match child.stderr().take() {
                Some(s) => s,
                None => {
                    let _ = tx.send(StreamEvent::Error("missing remote stderr handle".to_string())).await;
                    client.mark_idle();
                    return;
                }
            };

            let tx_out = tx.clone();
            let tx_err = tx.clone();
            let mut stdout_lines = BufReader::new(stdout).lines();
            let mut stderr_lines = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    _ = &mut cancel => {
                        let _ = client.kill_gracefully(&mut child).await;
                        let _ = tx.send(StreamEvent::Error("canceled".to_string())).await;
                        break;
                    }
                    line = stdout_lines.next_line() => {
                        match line {
                            Ok(Some(l)) => { if tx_out.send(StreamEvent::Stdout(l)).await.is_err() { break; } }
                            Ok(None) => {}
                            Err(e) => { let _ = tx_out.send(StreamEvent::Error(e.to_string())).await; break; }
                        }
                    }
                    line = stderr_lines.next_line() => {
                        match line {
                            Ok(Some(l)) => { if tx_err.send(StreamEvent::Stderr(l)).await.is_err() { break; } }
                            Ok(None) => {}
                            Err(e) => { let _ = tx_err.send(StreamEvent::Error(e.to_string())).await; break; }
                        }
                    }
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                        let _ = tx.send(StreamEvent::Exit(code)).await;
                        break;
                    }
                }
            }
            client.mark_idle();
        });

        Ok(rx)
    }

    /// SIGINT the remote process, wait 2s, SIGKILL if it's still alive.
    async fn kill_gracefully(&self, child: &mut openssh::RemoteChild<'_>) -> Result<()> {
        let _ = child.signal(openssh::Signal::INT);
        if tokio::time::timeout(Duration::from_secs(2), child.wait()).await.is_err() {
            let _ = child.signal(openssh::Signal::KILL);
        }
        Ok(())
    }

    /// `test -e path`.
    pub async fn path_exists(&self, path: &str) -> Result<bool> {
        let out = self.execute(&format!("test -e {}", shell_quote(path)), Duration::from_secs(10)).await?;
        Ok(out.exit_code == 0)
    }

    /// Upload a file or byte buffer. Small payloads (below
    /// [`LARGE_TRANSFER_THRESHOLD`]) are inlined via a heredoc; large ones
    /// shell out to `scp` against the same multiplexed control socket so
    /// the connection isn't re-authenticated. Atomic uploads write to
    /// `remote_path.part` then `mv`; on any failure the `.part` is removed.
    pub async fn transfer(&self, t: &Transfer) -> Result<()> {
        match t.direction {
            TransferDirection::Upload => self.upload(t).await,
            TransferDirection::Download => self.download(t).await,
        }
    }

    async fn upload(&self, t: &Transfer) -> Result<()> {
        let span = self.tracer.start("transfer");
        span.set("remote_path", Field::Str(t.remote_path.clone()));

        let size = match (&t.bytes, &t.local_path) {
            (Some(b), _) => b.len() as u64,
            (None, Some(p)) => tokio::fs::metadata(p)
                .await
                .map_err(|e| Error::with_source(ErrorKind::Network, "local file not found", e))?
                .len(),
            (None, None) => 0,
        };

        let dest = if t.atomic {
            format!("{}.part", t.remote_path)
        } else {
            t.remote_path.clone()
        };

        let result = if size > LARGE_TRANSFER_THRESHOLD {
            self.upload_via_scp(t, &dest).await
        } else {
            self.upload_inline(t, &dest).await
        };

        if let Err(e) = result {
            let _ = self.execute(&format!("rm -f {}", shell_quote(&dest)), Duration::from_secs(10)).await;
            span.end(SpanStatus::Error);
            return Err(e);
        }

        self.execute(&format!("chmod {:o} {}", t.mode, shell_quote(&dest)), Duration::from_secs(10))
            .await?;

        if t.atomic {
            let out = self
                .execute(&format!("mv -f {} {}", shell_quote(&dest), shell_quote(&t.remote_path)), Duration::from_secs(10))
                .await?;
            if !out.success() {
                let _ = self.execute(&format!("rm -f {}", shell_quote(&dest)), Duration::from_secs(10)).await;
                span.end(SpanStatus::Error);
                return Err(Error::new(ErrorKind::Remote, "atomic rename failed"));
            }
        }

        span.end(SpanStatus::Ok);
        Ok(())
    }

    async fn upload_inline(&self, t: &Transfer, dest: &str) -> Result<()> {
        let bytes = match (&t.bytes, &t.local_path) {
            (Some(b), _) => b.clone(),
            (None, Some(p)) => tokio::fs::read(p)
                .await
                .map_err(|e| Error::with_source(ErrorKind::Network, "failed to read local file", e))?,
            (None, None) => return Err(Error::invalid_config("transfer has neither bytes nor local_path")),
        };
        let marker = "BERTH_EOF_B64";
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let script = format!(
            "base64 -d > {} << '{marker}'\n{}\n{marker}",
            shell_quote(dest),
            encoded
        );
        let out = self.execute(&script, Duration::from_secs(60)).await?;
        if !out.success() {
            return Err(Error::new(ErrorKind::Remote, out.stderr_string()));
        }
        Ok(())
    }

    async fn upload_via_scp(&self, t: &Transfer, dest: &str) -> Result<()> {
        let local = t
            .local_path
            .clone()
            .ok_or_else(|| Error::invalid_config("large transfer requires local_path, not inline bytes"))?;
        let (control_path, host, port, user) = self
            .with_session(|session| {
                (
                    session.control_socket().to_path_buf(),
                    self.config.host.clone(),
                    self.config.port,
                    self.config.username.clone(),
                )
            })
            .await?;

        let status = tokio::process::Command::new("scp")
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-P")
            .arg(port.to_string())
            .arg(&local)
            .arg(format!("{}@{}:{}", user, host, dest))
            .status()
            .await
            .map_err(|e| Error::with_source(ErrorKind::Network, "failed to spawn scp", e))?;

        if !status.success() {
            return Err(Error::new(ErrorKind::Remote, "scp transfer failed"));
        }
        Ok(())
    }

    async fn download(&self, t: &Transfer) -> Result<()> {
        let local = t
            .local_path
            .clone()
            .ok_or_else(|| Error::invalid_config("download requires a local_path destination"))?;
        let out = self
            .execute(&format!("base64 {}", shell_quote(&t.remote_path)), Duration::from_secs(60))
            .await?;
        if !out.success() {
            return Err(Error::new(ErrorKind::Remote, out.stderr_string()));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(out.stdout_string().trim())
            .map_err(|e| Error::with_source(ErrorKind::Remote, "remote file was not valid base64", e))?;
        tokio::fs::write(&local, bytes)
            .await
            .map_err(|e| Error::with_source(ErrorKind::Network, "failed to write local file", e))?;
        Ok(())
    }

    /// Echo-based liveness probe used by the pool's health sweeper.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        let out = self.execute("true", timeout).await?;
        if !out.success() {
            return Err(Error::new(ErrorKind::Remote, "ping command failed"));
        }
        Ok(start.elapsed())
    }

    /// Non-interactive sudo dry-run used by the Troubleshooter.
    pub async fn sudo_check(&self) -> Result<bool> {
        let out = self.execute("sudo -n true", Duration::from_secs(10)).await?;
        Ok(out.exit_code == 0)
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
