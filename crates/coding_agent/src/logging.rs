use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILTER_ENV_VAR: &str = "CODING_AGENT_LOG";
const DEFAULT_FILTER: &str = "info";

/// Installs a stderr `fmt` subscriber filtered by `CODING_AGENT_LOG`.
///
/// Stdout belongs to the console host. Calling this twice is harmless; the
/// second subscriber is not installed.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_env(LOG_FILTER_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init()
        .ok();
}
