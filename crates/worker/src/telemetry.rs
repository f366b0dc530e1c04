// Logging setup for the worker binary
// Decision: Console logging only; the filter comes from RUST_LOG, then LOG_LEVEL

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when RUST_LOG is not set
pub fn default_filter(log_level: Option<&str>) -> String {
    let level = log_level.unwrap_or("info");
    format!("appraisal_worker={level},appraisal_workflow={level}")
}

/// Install the global tracing subscriber
pub fn init_telemetry() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").ok();
        EnvFilter::new(default_filter(level.as_deref()))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}
