//! Tracing configuration and initialization.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration for tracing initialization.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Output JSON instead of the human-readable console format.
    pub json_output: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_output: false,
        }
    }
}

impl TracingConfig {
    pub fn new(log_level: impl Into<String>, format: &str) -> Self {
        Self {
            log_level: log_level.into(),
            json_output: format.eq_ignore_ascii_case("json"),
        }
    }

    fn build_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Initialize tracing with the given configuration.
///
/// This should be called once at application startup. `RUST_LOG` overrides
/// the configured level when set.
pub fn init_tracing(config: TracingConfig) {
    let filter = config.build_filter();

    if config.json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }

    tracing::info!(level = %config.log_level, "Tracing initialized");
}
