//! C11 — connectivity diagnostics. Deliberately independent of the
//! [`crate::pool::ConnectionPool`]: a broken host should be debuggable
//! without first proving the pool machinery works, and a troubleshoot run
//! must never leave a pool entry behind for a host nothing else is using.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use crate::error::ErrorKind;
use crate::ssh::factory::ConnectionFactory;
use crate::ssh::{Auth, ConnectionConfig};
use crate::tracer::Tracer;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BANNER_TIMEOUT: Duration = Duration::from_secs(5);
const TIME_SKEW_WARN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticStatus {
    Ok,
    Warning,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DiagnosticResult {
    pub step: &'static str,
    pub status: DiagnosticStatus,
    pub message: String,
    /// Set on `Warning`/`Failed`; a concrete next action, not a restatement
    /// of the message.
    pub suggestion: Option<String>,
    pub duration: Duration,
}

impl DiagnosticResult {
    fn ok(step: &'static str, message: impl Into<String>, duration: Duration) -> Self {
        Self { step, status: DiagnosticStatus::Ok, message: message.into(), suggestion: None, duration }
    }

    fn warn(step: &'static str, message: impl Into<String>, suggestion: impl Into<String>, duration: Duration) -> Self {
        Self {
            step,
            status: DiagnosticStatus::Warning,
            message: message.into(),
            suggestion: Some(suggestion.into()),
            duration,
        }
    }

    fn failed(step: &'static str, message: impl Into<String>, suggestion: impl Into<String>, duration: Duration) -> Self {
        Self {
            step,
            status: DiagnosticStatus::Failed,
            message: message.into(),
            suggestion: Some(suggestion.into()),
            duration,
        }
    }
}

pub struct Troubleshooter {
    factory: ConnectionFactory,
}

impl Troubleshooter {
    pub fn new(tracer: Tracer) -> Self {
        Self {
            factory: ConnectionFactory::new(tracer.scoped("troubleshoot")),
        }
    }

    /// Raw TCP connect within a short timeout, no SSH involved yet.
    pub async fn check_tcp_reachable(&self, host: &str, port: u16) -> DiagnosticResult {
        let start = Instant::now();
        match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => DiagnosticResult::ok("tcp-connect", format!("TCP connect to {}:{} succeeded", host, port), start.elapsed()),
            Ok(Err(e)) => DiagnosticResult::failed(
                "tcp-connect",
                format!("TCP connect to {}:{} failed: {}", host, port, e),
                "check the host is up and the port is open to this network (security group / firewall rule)",
                start.elapsed(),
            ),
            Err(_) => DiagnosticResult::failed(
                "tcp-connect",
                format!("TCP connect to {}:{} timed out after {:?}", host, port, TCP_CONNECT_TIMEOUT),
                "check for a firewall silently dropping packets rather than rejecting the connection",
                start.elapsed(),
            ),
        }
    }

    /// Reads the raw `SSH-2.0-...` banner line without going through
    /// `openssh`, so a sshd misconfiguration shows up distinctly from an
    /// auth failure.
    pub async fn check_ssh_banner(&self, host: &str, port: u16) -> DiagnosticResult {
        let start = Instant::now();
        let connect = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await;
        let stream = match connect {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return DiagnosticResult::failed(
                    "ssh-banner",
                    format!("could not open TCP connection to read SSH banner: {}", e),
                    "resolve TCP connectivity before diagnosing the SSH service itself",
                    start.elapsed(),
                )
            }
            Err(_) => {
                return DiagnosticResult::failed(
                    "ssh-banner",
                    "TCP connect timed out while attempting to read SSH banner",
                    "resolve TCP connectivity before diagnosing the SSH service itself",
                    start.elapsed(),
                )
            }
        };

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        match tokio::time::timeout(BANNER_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 && line.starts_with("SSH-") => {
                DiagnosticResult::ok("ssh-banner", format!("sshd banner: {}", line.trim_end()), start.elapsed())
            }
            Ok(Ok(0)) => DiagnosticResult::failed(
                "ssh-banner",
                "connection closed before an SSH banner was received",
                "check sshd is running and listening on this port (`systemctl status sshd`)",
                start.elapsed(),
            ),
            Ok(Ok(_)) => DiagnosticResult::failed(
                "ssh-banner",
                format!("unexpected banner line: {}", line.trim_end()),
                "something other than sshd is answering on this port",
                start.elapsed(),
            ),
            Ok(Err(e)) => DiagnosticResult::failed("ssh-banner", format!("error reading banner: {}", e), "retry; if persistent, check network stability", start.elapsed()),
            Err(_) => DiagnosticResult::failed(
                "ssh-banner",
                format!("no SSH banner received within {:?}", BANNER_TIMEOUT),
                "sshd may be overloaded or a middlebox may be intercepting the connection",
                start.elapsed(),
            ),
        }
    }

    /// Connects and immediately closes, to verify the configured auth
    /// method actually authenticates without running any remote command.
    pub async fn check_auth(&self, config: &ConnectionConfig) -> DiagnosticResult {
        let start = Instant::now();
        let client = match self.factory.create(config.clone()) {
            Ok(c) => c,
            Err(e) => return DiagnosticResult::failed("auth", format!("invalid connection config: {}", e), "fix the reported config field and retry", start.elapsed()),
        };
        match client.connect().await {
            Ok(()) => {
                let _ = client.close().await;
                DiagnosticResult::ok("auth", format!("authenticated as {} via {:?}", config.username, auth_kind(&config.auth)), start.elapsed())
            }
            Err(e) if e.kind() == ErrorKind::Auth => DiagnosticResult::failed(
                "auth",
                format!("authentication rejected: {}", e),
                "verify the key/agent/password matches an authorized credential for this user on the host",
                start.elapsed(),
            ),
            Err(e) if e.kind() == ErrorKind::HostKey => DiagnosticResult::failed(
                "auth",
                format!("host key verification failed: {}", e),
                "the host key changed or is unknown; verify out-of-band before accepting it",
                start.elapsed(),
            ),
            Err(e) => DiagnosticResult::failed("auth", format!("connect failed: {}", e), "see the tcp-connect and ssh-banner checks for the underlying cause", start.elapsed()),
        }
    }

    /// `sudo -n true` over a fresh connection; independent of [`check_auth`]
    /// so this still runs (and still reports something actionable) even
    /// when auth itself failed for a different reason.
    pub async fn check_sudo(&self, config: &ConnectionConfig) -> DiagnosticResult {
        let start = Instant::now();
        let client = match self.factory.create(config.clone()) {
            Ok(c) => c,
            Err(e) => return DiagnosticResult::failed("sudo", format!("invalid connection config: {}", e), "fix the reported config field and retry", start.elapsed()),
        };
        if let Err(e) = client.connect().await {
            return DiagnosticResult::failed("sudo", format!("could not connect to check sudo: {}", e), "resolve the auth check first", start.elapsed());
        }
        let result = client.sudo_check().await;
        let _ = client.close().await;
        match result {
            Ok(true) => DiagnosticResult::ok("sudo", "sudo -n true succeeded (passwordless sudo is configured)", start.elapsed()),
            Ok(false) => DiagnosticResult::failed(
                "sudo",
                "sudo -n true exited non-zero",
                "add the app user to the sudoers drop-in with NOPASSWD for the commands it needs",
                start.elapsed(),
            ),
            Err(e) => DiagnosticResult::failed("sudo", format!("sudo check failed: {}", e), "see the auth check for the underlying connectivity cause", start.elapsed()),
        }
    }

    /// Compares the host's clock to this process's clock via `date -u +%s`;
    /// a skew beyond [`TIME_SKEW_WARN_SECS`] is a warning, not a failure —
    /// it commonly still works but will eventually break TLS/host-key
    /// validity windows.
    pub async fn check_time_skew(&self, config: &ConnectionConfig) -> DiagnosticResult {
        let start = Instant::now();
        let client = match self.factory.create(config.clone()) {
            Ok(c) => c,
            Err(e) => return DiagnosticResult::failed("time-skew", format!("invalid connection config: {}", e), "fix the reported config field and retry", start.elapsed()),
        };
        if let Err(e) = client.connect().await {
            return DiagnosticResult::failed("time-skew", format!("could not connect to check clock skew: {}", e), "resolve the auth check first", start.elapsed());
        }
        let remote_now = client.execute("date -u +%s", Duration::from_secs(10)).await;
        let _ = client.close().await;

        let remote_secs: i64 = match remote_now {
            Ok(out) if out.success() => match out.stdout_string().trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    return DiagnosticResult::failed("time-skew", "could not parse remote clock output", "check `date` is the standard coreutils binary on the host", start.elapsed())
                }
            },
            Ok(out) => return DiagnosticResult::failed("time-skew", format!("`date -u +%s` exited {}", out.exit_code), "check the host has a working `date` binary", start.elapsed()),
            Err(e) => return DiagnosticResult::failed("time-skew", format!("could not read remote clock: {}", e), "see the auth check for the underlying connectivity cause", start.elapsed()),
        };

        let local_secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
        let skew = (remote_secs - local_secs).abs();
        if skew > TIME_SKEW_WARN_SECS {
            DiagnosticResult::warn(
                "time-skew",
                format!("host clock differs from local by {} s", skew),
                "enable/verify chrony or systemd-timesyncd on the host",
                start.elapsed(),
            )
        } else {
            DiagnosticResult::ok("time-skew", format!("host clock within {} s of local", skew), start.elapsed())
        }
    }

    /// Runs all five checks in order regardless of earlier failures: an
    /// auth failure for one reason (e.g. a revoked key) shouldn't hide an
    /// independently useful sudo or time-skew diagnosis.
    pub async fn run_all(&self, config: &ConnectionConfig) -> Vec<DiagnosticResult> {
        vec![
            self.check_tcp_reachable(&config.host, config.port).await,
            self.check_ssh_banner(&config.host, config.port).await,
            self.check_auth(config).await,
            self.check_sudo(config).await,
            self.check_time_skew(config).await,
        ]
    }
}

fn auth_kind(auth: &Auth) -> &'static str {
    match auth {
        Auth::Agent => "agent",
        Auth::Key { .. } => "key",
        Auth::Password { .. } => "password",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_result_ok_has_no_suggestion() {
        let r = DiagnosticResult::ok("tcp-connect", "fine", Duration::ZERO);
        assert_eq!(r.status, DiagnosticStatus::Ok);
        assert!(r.suggestion.is_none());
    }

    #[test]
    fn diagnostic_result_failed_carries_a_suggestion() {
        let r = DiagnosticResult::failed("auth", "nope", "try again", Duration::ZERO);
        assert_eq!(r.status, DiagnosticStatus::Failed);
        assert_eq!(r.suggestion.as_deref(), Some("try again"));
    }

    #[tokio::test]
    async fn tcp_check_fails_fast_against_a_closed_port() {
        let tracer = Tracer::always();
        let ts = Troubleshooter::new(tracer);
        // Port 0 never accepts connections; exercises the failure path
        // without depending on external network state.
        let result = ts.check_tcp_reachable("127.0.0.1", 0).await;
        assert_eq!(result.status, DiagnosticStatus::Failed);
    }
}
