mod run;
mod setup;
mod status;

use std::path::PathBuf;

use canopy_network::Address;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "canopy", version, about = "Run and inspect canopy overlay nodes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a key pair and the config files of a new node.
    Setup {
        /// Address other nodes reach this one at, e.g. tcp://10.0.0.1:7770.
        #[arg(long)]
        address: Address,
        /// Free-form description shown in status reports.
        #[arg(long, default_value = "")]
        description: String,
        /// Private config to write. The public group file goes next to it.
        #[arg(long, default_value = "private.toml")]
        out: PathBuf,
    },

    /// Run a node until interrupted.
    Run {
        /// Private config written by `setup`.
        #[arg(long, default_value = "private.toml")]
        config: PathBuf,
        /// Directory for the node's database.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Ask every member of a group for its status, one JSON line each.
    Status {
        /// Group file listing the nodes.
        #[arg(long, default_value = "public.toml")]
        group: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Setup {
            address,
            description,
            out,
        } => {
            setup::run(address, &description, &out)?;
        }

        Command::Run { config, data_dir } => {
            run::run(&config, data_dir).await?;
        }

        Command::Status { group } => {
            status::run(&group).await?;
        }
    }

    Ok(())
}
