use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dgramtun::{
    config::{Config, DEFAULT_CONFIG_PATH},
    daemon::{run_daemon, DaemonConfig},
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dgramtun", version, about = "IP tunnel over a datagram overlay network")]
struct Cli {
    /// Path to the config file (JSON)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    conf: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the tunnel in the foreground
    Run,

    /// Write a config with a random local address
    Generate {
        /// Overlay destination other tunnel ends use to reach this one
        destination: String,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Generate { destination, force } => {
            if cli.conf.exists() && !force {
                bail!(
                    "config already exists at {} (use --force to overwrite)",
                    cli.conf.display()
                );
            }
            let config = Config::generate(destination);
            config.save(&cli.conf)?;
            if let Some(address) = config.interface.address {
                println!("our ip is {address}");
            }
            println!("saved initial config to {}", cli.conf.display());
            Ok(())
        }
        Command::Run => {
            let config = Config::load(&cli.conf)
                .with_context(|| format!("failed to load {}", cli.conf.display()))?;
            init_logging(config.debug);
            run_daemon(DaemonConfig {
                path: cli.conf,
                config,
            })
            .await?;
            Ok(())
        }
    }
}

/// `RUST_LOG` wins; otherwise `debug` when the config asks for it, else `warn`.
fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
