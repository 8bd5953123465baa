//! C2 — a single authenticated SSH session to one host.
//!
//! [`SshClient`] wraps one `openssh::Session`: connect, exec, stream,
//! transfer, close. Multiple `execute*` calls on one client are serialized
//! through an internal mutex so the client presents FIFO ordering: one
//! writer at a time per client.

pub mod exec;
pub mod factory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use openssh::{KnownHosts, Session, SessionBuilder};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, ErrorKind, Result};
use crate::tracer::{Field, SpanStatus, Tracer};

/// How a client authenticates to the remote host.
#[derive(Debug, Clone)]
pub enum Auth {
    Agent,
    Key {
        private_key: String,
        passphrase: Option<String>,
    },
    Password {
        password: String,
    },
}

impl Auth {
    fn kind_str(&self) -> &'static str {
        match self {
            Auth::Agent => "agent",
            Auth::Key { .. } => "key",
            Auth::Password { .. } => "password",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyMode {
    Strict,
    KnownHosts,
    InsecureAccept,
}

/// Immutable once constructed; validated by [`factory::ConnectionFactory`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: Auth,
    pub timeout: Duration,
    pub host_key_mode: HostKeyMode,
    pub keepalive: Duration,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: Auth) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
            timeout: Duration::from_secs(30),
            host_key_mode: HostKeyMode::KnownHosts,
            keepalive: Duration::from_secs(15),
        }
    }

    /// Canonical `user@host[:port]` cache key (port omitted iff 22).
    pub fn key(&self) -> ConnectionKey {
        let s = if self.port == 22 {
            format!("{}@{}", self.username, self.host)
        } else {
            format!("{}@{}:{}", self.username, self.host, self.port)
        };
        ConnectionKey(s)
    }
}

/// Canonical pool cache key. Two configs with an identical key must be
/// interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(pub String);

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ConnectionKey {
    /// Parse `user@host[:port]` back into a `(username, host, port)` triple,
    /// used by the pool when it needs to reconstruct a config from a bare
    /// key (e.g. after an eviction forces a reconnect with only the key on
    /// hand).
    pub fn parse(&self) -> Result<(String, String, u16)> {
        let (user, rest) = self
            .0
            .split_once('@')
            .ok_or_else(|| Error::new(ErrorKind::InvalidKey, format!("malformed key: {}", self.0)))?;
        if let Some((host, port)) = rest.rsplit_once(':') {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidKey, format!("bad port in key: {}", self.0)))?;
            Ok((user.to_string(), host.to_string(), port))
        } else {
            Ok((user.to_string(), rest.to_string(), 22))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Idle,
    InUse,
    Closing,
    Closed,
    Errored,
}

/// `{ stdout(line) | stderr(line) | exit(code) | error(err) }`, produced in
/// source order per stream. stdout and stderr may interleave.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Stdout(String),
    Stderr(String),
    Exit(i32),
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// A file transfer request. Atomic uploads write to `remote_path + ".part"`
/// then rename; on any error the `.part` is removed.
pub struct Transfer {
    pub local_path: Option<std::path::PathBuf>,
    pub bytes: Option<Vec<u8>>,
    pub remote_path: String,
    pub direction: TransferDirection,
    pub mode: u32,
    pub atomic: bool,
    pub progress: bool,
}

impl Transfer {
    pub fn upload_bytes(remote_path: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            local_path: None,
            bytes: Some(bytes),
            remote_path: remote_path.into(),
            direction: TransferDirection::Upload,
            mode: 0o644,
            atomic: true,
            progress: false,
        }
    }

    pub fn upload_file(remote_path: impl Into<String>, local_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            local_path: Some(local_path.into()),
            bytes: None,
            remote_path: remote_path.into(),
            direction: TransferDirection::Upload,
            mode: 0o644,
            atomic: true,
            progress: false,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// Files larger than this use a whole-file `scp`-style transfer instead of
/// inlining bytes through a shell heredoc.
pub const LARGE_TRANSFER_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Output capture cap; overflow sets [`crate::executor::CommandResult::truncated`].
pub const OUTPUT_CAP_BYTES: usize = 1024 * 1024;

struct Inner {
    // Wrapped in an `Arc` so `cloned_session` can hand out an owned,
    // independently-borrowable handle to callers that need the session to
    // stay alive across an `.await` (openssh's `Command`/`RemoteChild`
    // borrow from it), without taking it away from the client itself.
    session: Option<Arc<Session>>,
    state: ClientState,
}

/// A single authenticated SSH session. Cheap to clone (an `Arc` handle);
/// all clones share one underlying connection and its serializing mutex.
#[derive(Clone)]
pub struct SshClient {
    inner: Arc<Mutex<Inner>>,
    /// Serializes `execute*` calls so the client presents FIFO ordering.
    exec_lock: Arc<AsyncMutex<()>>,
    config: ConnectionConfig,
    tracer: Tracer,
}

impl SshClient {
    /// Construct an unconnected client bound to `config` and `tracer`.
    /// Produced by [`factory::ConnectionFactory`]; actual connection
    /// happens in [`SshClient::connect`].
    pub(crate) fn unconnected(config: ConnectionConfig, tracer: Tracer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                session: None,
                state: ClientState::Disconnected,
            })),
            exec_lock: Arc::new(AsyncMutex::new(())),
            config,
            tracer: tracer.scoped("ssh"),
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.config.key()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<()> {
        let span = self.tracer.start("connect");
        span.set("host", Field::Str(self.config.host.clone()));
        span.set("user", Field::Str(self.config.username.clone()));

        {
            let mut g = self.inner.lock();
            g.state = ClientState::Connecting;
        }

        let mut builder = SessionBuilder::default();
        builder.user(self.config.username.clone());
        builder.port(self.config.port);
        builder.connect_timeout(self.config.timeout);
        builder.known_hosts_check(match self.config.host_key_mode {
            HostKeyMode::Strict => KnownHosts::Strict,
            HostKeyMode::KnownHosts => KnownHosts::Add,
            HostKeyMode::InsecureAccept => KnownHosts::Accept,
        });
        if let Auth::Key { private_key, .. } = &self.config.auth {
            builder.keyfile(private_key);
        }
        span.set("auth", Field::Str(self.config.auth.kind_str().to_string()));

        let result = tokio::time::timeout(self.config.timeout, builder.connect(&self.config.host)).await;

        let session = match result {
            Err(_) => {
                self.mark_errored();
                span.end(SpanStatus::Timeout);
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("connect to {} timed out", self.config.host),
                ));
            }
            Ok(Err(e)) => {
                self.mark_errored();
                span.end(SpanStatus::Error);
                return Err(classify_connect_error(&e));
            }
            Ok(Ok(session)) => session,
        };

        {
            let mut g = self.inner.lock();
            g.session = Some(Arc::new(session));
            g.state = ClientState::Connected;
        }
        span.end(SpanStatus::Ok);
        Ok(())
    }

    fn mark_errored(&self) {
        let mut g = self.inner.lock();
        g.state = ClientState::Errored;
        g.session = None;
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ClientState::Connected | ClientState::Idle | ClientState::InUse
        )
    }

    pub fn mark_idle(&self) {
        let mut g = self.inner.lock();
        if matches!(g.state, ClientState::InUse | ClientState::Connected) {
            g.state = ClientState::Idle;
        }
    }

    pub fn mark_in_use(&self) {
        let mut g = self.inner.lock();
        if matches!(g.state, ClientState::Idle | ClientState::Connected) {
            g.state = ClientState::InUse;
        }
    }

    /// Idempotent close. If another in-flight `execute*` call still holds
    /// a cloned session handle, the underlying connection is torn down
    /// once that last handle drops rather than forced closed out from
    /// under it.
    pub async fn close(&self) -> Result<()> {
        let span = self.tracer.start("close");
        let session = {
            let mut g = self.inner.lock();
            if g.state == ClientState::Closed {
                return Ok(());
            }
            g.state = ClientState::Closing;
            g.session.take()
        };
        if let Some(session) = session {
            match Arc::try_unwrap(session) {
                Ok(session) => {
                    let _ = session.close().await;
                }
                Err(_still_shared) => {
                    // Other holders are mid-command; they'll release their
                    // reference when done and the connection closes then.
                }
            }
        }
        let mut g = self.inner.lock();
        g.state = ClientState::Closed;
        span.end(SpanStatus::Ok);
        Ok(())
    }

    pub(crate) async fn with_session<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Session) -> R,
    {
        let _permit = self.exec_lock.lock().await;
        let g = self.inner.lock();
        match &g.session {
            Some(session) => Ok(f(session)),
            None => Err(Error::new(ErrorKind::Network, "client is not connected")),
        }
    }

    /// An owned, cheaply-cloned handle to the underlying session. Used
    /// wherever a command needs to stay alive across an `.await` boundary:
    /// `openssh::Command`/`RemoteChild` borrow from `&Session`, and that
    /// borrow must be taken from a binding that outlives the whole
    /// operation, not from a guard that is dropped as soon as this method
    /// returns.
    pub(crate) fn cloned_session(&self) -> Result<Arc<Session>> {
        let g = self.inner.lock();
        match &g.session {
            Some(session) => Ok(session.clone()),
            None => Err(Error::new(ErrorKind::Network, "client is not connected")),
        }
    }

    /// Acquire the per-client serialization permit held across one whole
    /// `execute*` call, giving the client FIFO ordering: only one command
    /// runs at a time regardless of how many callers hold this `SshClient`.
    pub(crate) async fn exec_permit(&self) -> tokio::sync::OwnedMutexGuard<()> {
        self.exec_lock.clone().lock_owned().await
    }
}

fn classify_connect_error(e: &openssh::Error) -> Error {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("host key") || lower.contains("known_hosts") {
        Error::with_source(ErrorKind::HostKey, "host key verification failed", openssh_err(e))
    } else if lower.contains("permission denied") || lower.contains("authentication") {
        Error::with_source(ErrorKind::Auth, "authentication failed", openssh_err(e))
    } else if lower.contains("timed out") || lower.contains("timeout") {
        Error::with_source(ErrorKind::Timeout, "connection timed out", openssh_err(e))
    } else {
        Error::with_source(ErrorKind::Network, "failed to connect", openssh_err(e))
    }
}

fn openssh_err(e: &openssh::Error) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_omits_default_port() {
        let cfg = ConnectionConfig::new("example.com", "deploy", Auth::Agent);
        assert_eq!(cfg.key().0, "deploy@example.com");
    }

    #[test]
    fn key_includes_nonstandard_port() {
        let mut cfg = ConnectionConfig::new("example.com", "deploy", Auth::Agent);
        cfg.port = 2222;
        assert_eq!(cfg.key().0, "deploy@example.com:2222");
    }

    #[test]
    fn key_round_trips_through_parse() {
        let key = ConnectionKey("deploy@example.com:2222".to_string());
        let (user, host, port) = key.parse().unwrap();
        assert_eq!(user, "deploy");
        assert_eq!(host, "example.com");
        assert_eq!(port, 2222);
    }

    #[test]
    fn key_parse_defaults_port_22() {
        let key = ConnectionKey("deploy@example.com".to_string());
        let (_, _, port) = key.parse().unwrap();
        assert_eq!(port, 22);
    }

    #[test]
    fn key_parse_rejects_missing_at() {
        let key = ConnectionKey("example.com".to_string());
        assert!(key.parse().is_err());
    }
}
