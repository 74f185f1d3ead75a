use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tessera-node", version, about = "Tessera consensus node")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Creates the genesis block in the node's storage.
    Init {
        #[arg(long, short, default_value = "node.json")]
        config: PathBuf,
        /// Wipes an existing chain first.
        #[arg(long)]
        force: bool,
    },
    /// Starts the node.
    Run {
        #[arg(long, short, default_value = "node.json")]
        config: PathBuf,
    },
    /// Prints a new private/public key pair.
    Keygen {
        /// `btc` or `ed25519`
        #[arg(long, default_value = "btc")]
        kind: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_force() {
        let args = Args::try_parse_from(["tessera-node", "init", "--config", "n0.json", "--force"]).unwrap();
        match args.command {
            Command::Init { config, force } => {
                assert_eq!(config, PathBuf::from("n0.json"));
                assert!(force);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_run_default_config() {
        let args = Args::try_parse_from(["tessera-node", "run"]).unwrap();
        assert!(matches!(args.command, Command::Run { config } if config == PathBuf::from("node.json")));
    }
}
