use clap::Parser;
use miette::{IntoDiagnostic, Result};

mod daemon;
mod init;

#[derive(Parser)]
#[clap(name = "QuarkDB")]
#[clap(bin_name = "quarkdb")]
#[clap(author, version, about, long_about = None)]
enum QuarkDb {
    /// Initialise a brand-new shard directory and journal.
    Init(init::Args),
    /// Run the server.
    Daemon(daemon::Args),
}

fn main() -> Result<()> {
    let args = QuarkDb::parse();

    match args {
        QuarkDb::Init(x) => init::run(&x).into_diagnostic()?,
        QuarkDb::Daemon(x) => daemon::run(&x).into_diagnostic()?,
    };

    Ok(())
}

/// Load the node configuration from a TOML file.
pub(crate) fn load_config(path: &std::path::Path) -> Result<quarkdb::prelude::NodeConfig, quarkdb::Error> {
    config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(quarkdb::Error::config)?
        .try_deserialize()
        .map_err(quarkdb::Error::config)
}
