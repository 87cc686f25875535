//! Logging setup.
//!
//! Logs go to stderr so command output stays clean. The filter comes from
//! `RUST_LOG`, then `STOPCTL_LOG_LEVEL`, then a default. Set
//! `STOPCTL_LOG_FORMAT=json` for structured JSON lines.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn default_filter() -> EnvFilter {
    EnvFilter::new("info,stopctl=debug,stopctl_drain=debug")
}

fn build_log_filter() -> EnvFilter {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
    }

    if let Ok(level_or_filter) = std::env::var("STOPCTL_LOG_LEVEL") {
        let level_or_filter = level_or_filter.trim();
        if !level_or_filter.is_empty() {
            let filter = if level_or_filter.contains('=') || level_or_filter.contains(',') {
                level_or_filter.to_string()
            } else {
                format!(
                    "{level},stopctl={level},stopctl_drain={level}",
                    level = level_or_filter
                )
            };
            return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
        }
    }

    default_filter()
}

/// Install the global subscriber.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json = std::env::var("STOPCTL_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(build_log_filter())
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
