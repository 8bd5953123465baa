//! Typed error taxonomy shared by every core component.
//!
//! Callers classify failures by [`ErrorKind`], never by message text —
//! the [`Executor`](crate::executor::Executor) retry policy and the
//! deployment state machines both switch on `kind()` rather than on
//! `Display` output.

use std::fmt;
use std::time::Duration;

/// Stable classification tag carried by every [`Error`].
///
/// Leaves attach a kind and source; intermediate layers wrap with
/// additional context but never change the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    Auth,
    HostKey,
    Sudo,
    InvalidConfig,
    InvalidKey,
    PoolExhausted,
    Remote,
    WouldLockout,
    InProgress,
    HealthGate,
    Canceled,
}

impl ErrorKind {
    /// Whether the [`Executor`](crate::executor::Executor) is allowed to
    /// retry an operation that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::PoolExhausted
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::HostKey => "host_key",
            ErrorKind::Sudo => "sudo",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Remote => "remote",
            ErrorKind::WouldLockout => "would_lockout",
            ErrorKind::InProgress => "in_progress",
            ErrorKind::HealthGate => "health_gate",
            ErrorKind::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// The crate's single error type. Always carries a [`ErrorKind`] plus a
/// human-readable message; optionally wraps a source error for `?`-chains.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Wrap this error with additional context, preserving `kind`.
    pub fn context(self, message: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            message: format!("{}: {}", message.into(), self.message),
            source: self.source,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "operation canceled")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Exponential backoff with jitter, shared by the Executor's retry loop and
/// the Service Manager's transient-dbus-error retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fractional jitter applied symmetrically, e.g. 0.2 == +/-20%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay before the `attempt`-th retry (1-indexed), without jitter applied.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let millis = (self.base_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Delay with jitter applied; `unit` is expected to be in `[0.0, 1.0)`
    /// (a caller-supplied source of randomness so this stays deterministic
    /// and testable without pulling in a `rand` dependency — see
    /// [`jitter_unit`] for the production entropy source).
    pub fn jittered_delay_for(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay_for(attempt).as_millis() as f64;
        let spread = base * self.jitter;
        let offset = (unit * 2.0 - 1.0) * spread;
        Duration::from_millis((base + offset).max(0.0) as u64)
    }
}

/// A `[0.0, 1.0)` jitter unit derived from the current instant's
/// sub-millisecond timer resolution, rehashed through a fixed-seed
/// `SipHash` so back-to-back calls on the same thread don't land on the
/// same bucket. Not cryptographic; only used to spread retry attempts
/// across concurrent callers without pulling in a `rand` dependency for
/// one `f64` draw.
pub fn jitter_unit() -> f64 {
    use std::hash::{Hash, Hasher};
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    nanos.hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() % 1_000_000) as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_grows_exponentially_and_caps_at_max() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.base_delay_for(1), Duration::from_millis(500));
        assert_eq!(cfg.base_delay_for(2), Duration::from_millis(1000));
        assert_eq!(cfg.base_delay_for(3), Duration::from_millis(2000));
        assert_eq!(cfg.base_delay_for(20), cfg.max_delay);
    }

    #[test]
    fn jittered_delay_stays_within_spread() {
        let cfg = RetryConfig::default();
        let base = cfg.base_delay_for(2).as_millis() as f64;
        let spread = base * cfg.jitter;
        for unit in [0.0, 0.25, 0.5, 0.75, 0.999] {
            let delay = cfg.jittered_delay_for(2, unit).as_millis() as f64;
            assert!(delay >= base - spread - 1.0 && delay <= base + spread + 1.0);
        }
    }

    #[test]
    fn jitter_unit_is_in_range() {
        for _ in 0..10 {
            let u = jitter_unit();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn error_context_preserves_kind() {
        let e = Error::new(ErrorKind::Network, "connection reset").context("uploading artifact");
        assert_eq!(e.kind(), ErrorKind::Network);
        assert!(e.to_string().contains("uploading artifact"));
    }
}
