use std::path::PathBuf;

use rand::RngCore;
use tracing::info;

use quarkdb::prelude::*;
use quarkdb::shard::ShardDirectory;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Path to the node configuration file.
    #[clap(long, short, default_value = "quarkdb.toml")]
    config: PathBuf,

    /// Cluster identity shared by all members; generated when omitted.
    #[clap(long)]
    cluster_id: Option<String>,
}

pub fn run(args: &Args) -> Result<(), Error> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    )
    .ok();

    let config = super::load_config(&args.config)?;
    config.validate().map_err(Error::config)?;

    let cluster_id = args.cluster_id.clone().unwrap_or_else(generate_cluster_id);
    let shard = ShardDirectory::initialize(&config.shard_directory, &cluster_id)?;

    // the state machine store, so the first daemon start finds a
    // well-formed format marker
    let machine = quarkdb_machine::StateMachine::open(
        shard.state_machine_path(),
        quarkdb_machine::StateMachineOptions::default(),
    )?;
    drop(machine);

    if config.mode == NodeMode::Raft {
        let membership = Membership::new(config.nodes.clone(), Vec::new());
        if membership.members.is_empty() {
            return Err(Error::config("raft mode requires a non-empty node list"));
        }
        quarkdb_raft::RaftJournal::create(shard.journal_path(), &cluster_id, membership)?;
    }

    info!(
        cluster_id,
        shard = %config.shard_directory.display(),
        "shard initialised; start the daemon to serve"
    );
    Ok(())
}

fn generate_cluster_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
