use anyhow::Context;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

const TRACING_ENV: &str = "FERROBIT_LOG";

/// Logs go to stderr, so JSON progress lines on stdout stay machine-readable
pub fn setup_logger() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_env_var(TRACING_ENV)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("error setting a global tracing subscriber")
}
