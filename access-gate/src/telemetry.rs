//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events. Binaries embedding the
//! gate can call [`init_subscriber`] (or the configurable variant) once at
//! startup to get them on stderr.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TracingFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,

    /// Single-line output.
    Compact,

    /// JSON lines, for log shipping.
    Json,
}

/// Subscriber configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Filter directive such as `"debug"` or `"access_gate=trace"`.
    ///
    /// If None, uses RUST_LOG or defaults to "info".
    pub filter: Option<String>,

    pub format: TracingFormat,

    pub timestamps: bool,

    /// Include target module names.
    pub target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            format: TracingFormat::Pretty,
            timestamps: true,
            target: true,
        }
    }
}

fn env_filter(directive: Option<&str>) -> EnvFilter {
    match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Initialize a subscriber with defaults (RUST_LOG, falling back to "info").
///
/// Does nothing if a global subscriber is already set.
pub fn init_subscriber() {
    init_subscriber_with_config(TracingConfig::default());
}

/// Initialize a subscriber with custom configuration.
///
/// Does nothing if a global subscriber is already set.
///
/// # Example
///
/// ```ignore
/// use access_gate::telemetry::{init_subscriber_with_config, TracingConfig, TracingFormat};
///
/// init_subscriber_with_config(TracingConfig {
///     format: TracingFormat::Json,
///     filter: Some("access_gate=debug".into()),
///     ..Default::default()
/// });
/// ```
pub fn init_subscriber_with_config(config: TracingConfig) {
    let base = fmt::layer().with_target(config.target);

    let layer = match (config.format, config.timestamps) {
        (TracingFormat::Pretty, true) => base.pretty().boxed(),
        (TracingFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (TracingFormat::Compact, true) => base.compact().boxed(),
        (TracingFormat::Compact, false) => base.compact().without_time().boxed(),
        (TracingFormat::Json, true) => base.json().boxed(),
        (TracingFormat::Json, false) => base.json().without_time().boxed(),
    };

    let result = tracing_subscriber::registry()
        .with(env_filter(config.filter.as_deref()))
        .with(layer)
        .try_init();

    if result.is_err() {
        tracing::debug!("Tracing subscriber already initialized");
    }
}
