//! C1 — structured span/event observability.
//!
//! A thin, typed façade over [`tracing`]: every other component gets a
//! [`Tracer`] at construction (never a global), starts a [`SpanHandle`] for
//! each operation, attaches typed [`Field`]s, and ends the span with a
//! [`SpanStatus`]. Specialized tracers (`ssh`, `pool`, `security`,
//! `service`) are prefix wrappers, not separate implementations — see
//! [`scoped`].

use std::fmt;
use std::time::Duration;

use tracing::field::Empty;
use tracing::Span;

/// One field attached to a span or event. Kept as a closed enum (rather
/// than going through `tracing`'s `Value` trait directly) so callers at the
/// component layer don't need to depend on `tracing`'s field machinery.
#[derive(Debug, Clone)]
pub enum Field {
    Str(String),
    Int(i64),
    Bool(bool),
    Duration(Duration),
    Error(String),
    /// Anything serializable to a one-line debug string; used for
    /// ids, enums, and other small values that don't warrant their own
    /// variant.
    Any(String),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Str(s) => f.write_str(s),
            Field::Int(i) => write!(f, "{i}"),
            Field::Bool(b) => write!(f, "{b}"),
            Field::Duration(d) => write!(f, "{:?}", d),
            Field::Error(e) => f.write_str(e),
            Field::Any(a) => f.write_str(a),
        }
    }
}

/// Terminal status of a span, recorded on [`SpanHandle::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
    Canceled,
    Timeout,
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpanStatus::Ok => "ok",
            SpanStatus::Error => "error",
            SpanStatus::Canceled => "canceled",
            SpanStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Sampling decision, checked once per span start. Pluggable so a caller
/// can dial observability volume without touching call sites.
pub trait Sampler: Send + Sync {
    fn should_sample(&self, operation: &str) -> bool;
}

pub struct AlwaysSample;
impl Sampler for AlwaysSample {
    fn should_sample(&self, _operation: &str) -> bool {
        true
    }
}

pub struct NeverSample;
impl Sampler for NeverSample {
    fn should_sample(&self, _operation: &str) -> bool {
        false
    }
}

/// Simple deterministic probabilistic sampler: samples every `1-in-n`
/// operations (no RNG dependency, so behavior is reproducible in tests).
pub struct EveryNth {
    n: u64,
    counter: std::sync::atomic::AtomicU64,
}

impl EveryNth {
    pub fn new(n: u64) -> Self {
        Self {
            n: n.max(1),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Sampler for EveryNth {
    fn should_sample(&self, _operation: &str) -> bool {
        let c = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        c % self.n == 0
    }
}

/// A live span. Dropping without calling [`SpanHandle::end`] is fine — the
/// underlying `tracing::Span` still closes normally — but `end` is how a
/// terminal [`SpanStatus`] gets recorded.
pub struct SpanHandle {
    span: Span,
    sampled: bool,
}

impl SpanHandle {
    fn noop() -> Self {
        Self {
            span: Span::none(),
            sampled: false,
        }
    }

    pub fn set(&self, key: &'static str, value: Field) {
        if !self.sampled {
            return;
        }
        match value {
            Field::Str(s) => self.span.record(key, s.as_str()),
            Field::Int(i) => self.span.record(key, i),
            Field::Bool(b) => self.span.record(key, b),
            Field::Duration(d) => self.span.record(key, tracing::field::debug(d)),
            Field::Error(e) => self.span.record(key, e.as_str()),
            Field::Any(a) => self.span.record(key, a.as_str()),
        };
    }

    pub fn event(&self, message: &str) {
        if !self.sampled {
            return;
        }
        let _enter = self.span.enter();
        tracing::event!(tracing::Level::INFO, message);
    }

    pub fn child(&self, operation: &str) -> SpanHandle {
        if !self.sampled {
            return Self::noop();
        }
        let _enter = self.span.enter();
        let span = tracing::info_span!(
            "child",
            operation,
            status = Empty,
            app = Empty,
            key = Empty,
            cmd = Empty,
            sudo = Empty,
            name = Empty,
            action = Empty,
            host = Empty,
            user = Empty,
            auth = Empty,
            exit_code = Empty,
            duration = Empty,
            remote_path = Empty,
            app_user = Empty,
        );
        SpanHandle {
            span,
            sampled: true,
        }
    }

    pub fn end(&self, status: SpanStatus) {
        if !self.sampled {
            return;
        }
        self.span.record("status", tracing::field::display(status));
        if status == SpanStatus::Error || status == SpanStatus::Timeout {
            tracing::event!(tracing::Level::WARN, %status, "span ended");
        }
    }
}

/// Entry point every component is constructed with. Exporter wiring
/// (JSON / console) happens once at process boot via
/// `tracing_subscriber`; this type's job is span creation and sampling,
/// not transport, so exporter-level errors are `tracing_subscriber` layer
/// errors, which that crate already swallows after logging once rather
/// than propagating.
#[derive(Clone)]
pub struct Tracer {
    sampler: std::sync::Arc<dyn Sampler>,
    prefix: &'static str,
}

impl Tracer {
    pub fn new(sampler: impl Sampler + 'static) -> Self {
        Self {
            sampler: std::sync::Arc::new(sampler),
            prefix: "",
        }
    }

    pub fn always() -> Self {
        Self::new(AlwaysSample)
    }

    /// Build a specialized tracer (ssh/pool/security/service/...) that
    /// tags every span it starts with a `component` field, e.g.
    /// `scoped("ssh")` attaches `component = "ssh"` to its `connect` span
    /// rather than renaming the operation itself.
    pub fn scoped(&self, prefix: &'static str) -> Tracer {
        Tracer {
            sampler: self.sampler.clone(),
            prefix,
        }
    }

    pub fn start(&self, operation: &'static str) -> SpanHandle {
        let full = operation;
        if !self.sampler.should_sample(full) {
            return SpanHandle::noop();
        }
        let span = if self.prefix.is_empty() {
            tracing::info_span!(
                "op",
                operation = full,
                status = Empty,
                app = Empty,
                key = Empty,
                cmd = Empty,
                sudo = Empty,
                name = Empty,
                action = Empty,
                host = Empty,
                user = Empty,
                auth = Empty,
                exit_code = Empty,
                duration = Empty,
                remote_path = Empty,
                app_user = Empty,
            )
        } else {
            tracing::info_span!(
                "op",
                operation = full,
                component = self.prefix,
                status = Empty,
                app = Empty,
                key = Empty,
                cmd = Empty,
                sudo = Empty,
                name = Empty,
                action = Empty,
                host = Empty,
                user = Empty,
                auth = Empty,
                exit_code = Empty,
                duration = Empty,
                remote_path = Empty,
                app_user = Empty,
            )
        };
        SpanHandle {
            span,
            sampled: true,
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::always()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_nth_samples_deterministically() {
        let s = EveryNth::new(3);
        let hits: Vec<bool> = (0..6).map(|_| s.should_sample("x")).collect();
        assert_eq!(hits, vec![true, false, false, true, false, false]);
    }

    #[test]
    fn never_sample_produces_noop_span() {
        let t = Tracer::new(NeverSample);
        let span = t.start("anything");
        // Should not panic even though nothing is sampled.
        span.set("k", Field::Int(1));
        span.end(SpanStatus::Ok);
    }

    /// Regression test for a prior bug where `start`/`child` only declared
    /// `operation`/`component`/`status` at span-creation time, so
    /// `SpanHandle::set` calls for every other field name (`host`, `cmd`,
    /// `exit_code`, ...) were silently dropped by `tracing::Span::record` —
    /// a declared-but-unrecorded field must actually reach a subscriber.
    #[test]
    fn set_records_into_a_field_declared_at_span_creation() {
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::layer::{Context, Layer};
        use tracing_subscriber::prelude::*;

        #[derive(Default)]
        struct Captured(Mutex<Vec<(String, String)>>);

        struct CaptureLayer(Arc<Captured>);

        struct Visitor<'a>(&'a Captured);
        impl tracing::field::Visit for Visitor<'_> {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                self.0 .0.lock().unwrap().push((field.name().to_string(), format!("{:?}", value)));
            }
            fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                self.0 .0.lock().unwrap().push((field.name().to_string(), value.to_string()));
            }
        }

        impl<S: tracing::Subscriber> Layer<S> for CaptureLayer {
            fn on_record(&self, _id: &tracing::span::Id, values: &tracing::span::Record<'_>, _ctx: Context<'_, S>) {
                values.record(&mut Visitor(&self.0));
            }
        }

        let captured = Arc::new(Captured::default());
        let subscriber = tracing_subscriber::registry().with(CaptureLayer(captured.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let tracer = Tracer::always();
            let span = tracer.start("test_op");
            span.set("host", Field::Str("example.com".to_string()));
            span.set("exit_code", Field::Int(7));
            span.end(SpanStatus::Ok);
        });

        let recs = captured.0.lock().unwrap();
        assert!(recs.iter().any(|(k, v)| k == "host" && v == "example.com"));
        assert!(recs.iter().any(|(k, v)| k == "exit_code" && v == "7"));
    }
}
