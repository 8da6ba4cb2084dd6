//! Tracing setup shared by the bridge binary and tests.

use clap::Args;
use tracing_subscriber::EnvFilter;

/// Logging configuration, flattenable into any binary's CLI.
#[derive(Clone, Debug, Default, Args)]
pub struct Config {
    /// Filter directives, e.g. `info` or `adit_bridge=debug`. Falls back to
    /// `RUST_LOG`, then to the given default level.
    #[clap(long = "log-filter", env = "ADIT_LOG_FILTER")]
    pub filter: Option<String>,

    /// Emit logs as single-line JSON.
    #[clap(long = "log-json", env = "ADIT_LOG_JSON")]
    pub json: bool,
}

impl Config {
    pub fn init(&self, default_level: &str) {
        let filter = match &self.filter {
            Some(directives) => EnvFilter::new(directives),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        };
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        // try_init so repeated initialization (tests) is harmless.
        let result = if self.json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }
}

/// Test bootstrap: install a default subscriber honoring `RUST_LOG`.
pub fn setup_test() {
    Config::default().init("info");
}
