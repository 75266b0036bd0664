use std::path::PathBuf;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tracing::{info, warn};

use quarkdb::node::RunOutcome;
use quarkdb::prelude::*;
use quarkdb::QuarkDbNode;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Path to the node configuration file.
    #[clap(long, short, default_value = "quarkdb.toml")]
    config: PathBuf,
}

#[tokio::main]
pub async fn run(args: &Args) -> Result<(), Error> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .finish(),
    )
    .map_err(Error::server)?;

    let config = super::load_config(&args.config)?;

    // resilvering replaces the shard contents under our feet; when that
    // happens the node asks to be reopened against the new store
    loop {
        let node = QuarkDbNode::spinup(config.clone())?;
        node.start_workers();

        let all_drivers = FuturesUnordered::new();
        quarkdb::serve::load_drivers(&all_drivers, node.clone(), node.cancel_token());

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                node.spindown().await;
                RunOutcome::Shutdown
            }
            outcome = node.run_to_completion() => {
                node.spindown().await;
                outcome
            }
        };

        let mut drivers = all_drivers;
        while let Some(finished) = drivers.next().await {
            match finished {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "driver ended with error"),
                Err(err) => warn!(error = %err, "driver panicked"),
            }
        }

        match outcome {
            RunOutcome::Shutdown => return Ok(()),
            RunOutcome::Reopen => {
                info!("reopening after resilvering");
                continue;
            }
        }
    }
}
