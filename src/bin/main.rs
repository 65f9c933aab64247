use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dapwire::config::{LoadedSettings, load_settings};
use dapwire::scheduler::Policy;
use dapwire::{Engine, EngineExit, HandlerTable, RpcError, parse_params};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{stdin, stdout};
use tokio_util::sync::CancellationToken;

/// Transport and dispatch engine for debug-adapter style protocols
#[derive(Parser)]
#[command(name = "dapwire")]
#[command(version)]
#[command(about = "Transport and dispatch engine for debug-adapter style protocols")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demonstration adapter over stdio
    Serve {
        /// Settings file (default: $XDG_CONFIG_HOME/dapwire/dapwire.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the resolved settings as TOML
    PrintConfig {
        /// Settings file (default: $XDG_CONFIG_HOME/dapwire/dapwire.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeArguments {
    adapter_id: String,
}

async fn initialize(params: Value, _token: CancellationToken) -> Result<Value, RpcError> {
    let args: InitializeArguments = parse_params(params)?;
    log::info!(target: "dapwire::serve", "Initializing for client adapter {}", args.adapter_id);
    Ok(json!({
        "supportsConfigurationDoneRequest": true,
        "supportsCancelRequest": true,
    }))
}

async fn echo(params: Value, token: CancellationToken) -> Result<Value, RpcError> {
    let delay_ms = params.get("delayMs").and_then(Value::as_u64).unwrap_or(0);
    if delay_ms > 0 {
        tokio::select! {
            _ = token.cancelled() => return Err(RpcError::cancelled()),
            _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {}
        }
    }
    Ok(params)
}

async fn acknowledge(_params: Value, _token: CancellationToken) -> Result<Value, RpcError> {
    Ok(Value::Null)
}

fn demo_registry() -> HandlerTable {
    HandlerTable::new()
        .with("initialize", Policy::Exclusive, initialize)
        .with("echo", Policy::Serial, echo)
        .with("cancel", Policy::Parallel, acknowledge)
        .with("configurationDone", Policy::Exclusive, acknowledge)
}

fn resolve_settings(config: Option<PathBuf>) -> LoadedSettings {
    match load_settings(config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::PrintConfig { config }) => {
            let loaded = resolve_settings(config);
            match loaded.settings.to_toml() {
                Ok(text) => {
                    if let Some(source) = &loaded.source {
                        println!("# source: {}", source.display());
                    }
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Serve { config }) => serve(config).await,
        None => serve(None).await,
    }
}

async fn serve(config: Option<PathBuf>) {
    let loaded = resolve_settings(config);

    // stdout carries the protocol; logs go to stderr.
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(loaded.settings.log_filter.as_str()),
    )
    .target(env_logger::Target::Stderr)
    .init();

    if let Some(source) = &loaded.source {
        log::info!(target: "dapwire::config", "Loaded settings from {}", source.display());
    }

    let engine = Engine::new(Arc::new(demo_registry()))
        .with_settings(loaded.settings)
        .announce_initialized(true);
    let handle = engine.start(stdin(), stdout());

    let exit = tokio::select! {
        exit = handle.finished() => exit,
        _ = tokio::signal::ctrl_c() => {
            log::info!(target: "dapwire::serve", "Interrupted");
            EngineExit::Stopped
        }
    };
    handle.shutdown().await;

    if let EngineExit::Fault(e) = exit {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
