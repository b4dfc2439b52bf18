use anyhow::{anyhow, Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use dexops_sync::ServiceConfig;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
/// Output goes to stderr so command results on stdout stay parseable.
pub fn init_logging(config: &ServiceConfig) -> Result<()> {
    let filter = build_env_filter(&config.log_level)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.log_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|err| anyhow!("installing tracing subscriber: {err}"))
}

fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if std::env::var_os("RUST_LOG").is_some() {
        return EnvFilter::try_from_default_env().context("parsing RUST_LOG");
    }
    EnvFilter::try_new(level).with_context(|| format!("invalid log level '{level}'"))
}
