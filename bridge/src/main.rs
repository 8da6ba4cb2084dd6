use std::sync::Arc;

use adit_bridge::{Orchestrator, TracingHost};
use adit_types::Options;
use anyhow::Context;
use bridge_utils::logging;
use clap::Parser;

/// AdIT console bridge.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[clap(flatten)]
    options: Options,

    #[clap(flatten)]
    logging: logging::Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let default_level = if args.options.verbose { "debug" } else { "info" };
    args.logging.init(default_level);

    let orchestrator = Orchestrator::new(args.options, Arc::new(TracingHost));
    orchestrator.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed waiting for shutdown signal")?;
    tracing::info!("shutting down");
    orchestrator.stop();
    Ok(())
}
