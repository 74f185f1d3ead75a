use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use tessera_common::crypto::{KeyKind, Privatekey};
use tessera_common::error::{Result, TesseraError};
use tessera_node::cli::{Args, Command};
use tessera_node::setup::{init_stdout_tracing, init_tracing};
use tessera_node::{build_runtime, exit_code, init_genesis, NodeDesign};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match execute(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "tessera-node failed");
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Keygen { kind } => keygen(&kind),
        Command::Init { config, force } => {
            let design = NodeDesign::load_from_file(&config)?;
            let _guard = init_tracing(&design.data_dir, &design.address)?;
            let block = init_genesis(&design, force).await?;
            info!(target: "consensus", block = %block.hash(), "genesis written");
            println!("{}", block.hash());
            Ok(())
        }
        Command::Run { config } => {
            let design = NodeDesign::load_from_file(&config)?;
            let _guard = init_tracing(&design.data_dir, &design.address)?;
            info!(node = %design.address, network_id = %design.network_id, "starting tessera node");

            let mut runtime = build_runtime(&design).await?;
            let stopped = tokio::select! {
                r = runtime.wait() => r,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    Ok(())
                }
            };
            let shutdown = runtime.shutdown().await;
            stopped.and(shutdown)
        }
    }
}

fn keygen(kind: &str) -> Result<()> {
    init_stdout_tracing();
    let kind = match kind {
        "btc" => KeyKind::Btc,
        "ed25519" | "ed" => KeyKind::Ed25519,
        other => return Err(TesseraError::Config(format!("unknown key kind {other:?}"))),
    };
    let key = Privatekey::generate(kind);
    println!("privatekey: {key}");
    println!("publickey:  {}", key.publickey());
    Ok(())
}
