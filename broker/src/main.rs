//! CLI entry point: run the broker, dump config, or manage key material.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{ensure, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use broker_shared::config::{parse_config_sources, Config};
use broker_shared::token::load_token_from_env;
use semgrep_network_broker::{orchestrator, wireguard};

#[derive(Parser)]
#[command(name = "semgrep-network-broker")]
#[command(version)]
#[command(about = "Brokers network access to and from the Semgrep backend")]
struct Cli {
    /// Config file(s), deep-merged in order
    #[arg(short, long = "config")]
    config: Vec<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_log: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Fetch this deployment's default config and merge it lowest-priority
    #[arg(long)]
    deployment_id: Option<u64>,

    /// Replica index override (wins over hostname regex and config)
    #[arg(long)]
    broker_index: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective config to stdout as JSON
    Dump,
    /// Generate private keys for N replicas and print them as one base64 string
    Genkey {
        /// Number of broker replicas to support
        #[arg(short, long, default_value_t = 3)]
        replica_count: usize,
    },
    /// Read concatenated base64 private keys from stdin, print the public keys
    Pubkey,
    /// Run only the outbound relay
    Relay,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_log, cli.debug);

    match &cli.command {
        Some(Commands::Dump) => dump(&cli).await,
        Some(Commands::Genkey { replica_count }) => genkey(*replica_count),
        Some(Commands::Pubkey) => pubkey(),
        Some(Commands::Relay) => run(&cli, true).await,
        None => run(&cli, false).await,
    }
}

fn init_tracing(json_log: bool, debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json_log {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Run until SIGINT/SIGTERM; SIGHUP swaps in a freshly loaded stack.
async fn run(cli: &Cli, relay_only: bool) -> anyhow::Result<()> {
    let config = load_config(cli, relay_only).await?;
    let mut stack = orchestrator::start_broker(&config, cli.broker_index).await?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!(signal = "SIGINT", "broker.shutdown");
                break;
            }
            _ = sigterm.recv() => {
                info!(signal = "SIGTERM", "broker.shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("broker.reload");
                let new_config = match load_config(cli, relay_only).await {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(error = %e, "reload.config_error");
                        continue;
                    }
                };
                // The new stack is fully listening before the old one goes
                // away; a failed start leaves the old stack untouched.
                match orchestrator::start_broker(&new_config, cli.broker_index).await {
                    Ok(new_stack) => {
                        let old = std::mem::replace(&mut stack, new_stack);
                        old.teardown().await;
                        info!("reload.complete");
                    }
                    Err(e) => warn!(error = %e, "reload.start_error"),
                }
            }
        }
    }

    stack.teardown().await;
    Ok(())
}

async fn dump(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli, false).await?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn genkey(replica_count: usize) -> anyhow::Result<()> {
    ensure!(
        (1..=16).contains(&replica_count),
        "replica count must be between 1 and 16"
    );
    let keys = wireguard::generate_private_keys(replica_count);
    println!("{}", BASE64.encode(keys));
    Ok(())
}

fn pubkey() -> anyhow::Result<()> {
    let mut encoded = String::new();
    std::io::stdin().read_to_string(&mut encoded)?;
    let private_keys = BASE64
        .decode(encoded.trim().as_bytes())
        .context("failed to decode private keys")?;
    let public_keys = wireguard::derive_public_keys(&private_keys)?;
    println!("{}", BASE64.encode(public_keys));
    Ok(())
}

async fn load_config(cli: &Cli, relay_only: bool) -> anyhow::Result<Config> {
    let mut sources = Vec::new();

    if let Some(deployment_id) = cli.deployment_id {
        if deployment_id > 0 {
            sources.push((
                "default-config".to_string(),
                fetch_default_config(deployment_id).await?,
            ));
        }
    }

    for path in &cli.config {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        sources.push((path.display().to_string(), content));
    }

    let mut config = parse_config_sources(&sources)?;
    if relay_only {
        config.inbound = None;
    }
    Ok(config)
}

async fn fetch_default_config(deployment_id: u64) -> anyhow::Result<String> {
    let hostname =
        std::env::var("SEMGREP_HOSTNAME").unwrap_or_else(|_| "semgrep.dev".to_string());
    let url = format!("https://{hostname}/api/broker/{deployment_id}/default-config");

    let mut request = reqwest::Client::new().get(&url);
    if let Some(token) = load_token_from_env()? {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("failed to request default broker config from {hostname}"))?;
    ensure!(
        response.status().is_success(),
        "failed to request default config from {url}: HTTP {}",
        response.status()
    );

    Ok(response.text().await?)
}
