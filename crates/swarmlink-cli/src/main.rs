//! SwarmLink CLI: run a peer on a channel from the terminal.
//!
//! `swarmlink run` joins a channel, drives the coordinator on a fixed tick
//! and broadcasts a [`PeerStatus`] heartbeat, logging every peer that joins
//! or leaves.

mod cli;

use crate::cli::{Cli, Commands, Overrides};
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use swarmlink_kernel::config::load_config;
use swarmlink_kernel::{CoordinatorEvent, SwarmClient, SwarmEvent};
use swarmlink_types::CoordinatorConfig;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Heartbeat payload every CLI peer broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    /// Display name from `--name`.
    pub name: String,
    /// Heartbeat counter, starting at 1.
    pub seq: u64,
    /// When this peer joined the channel.
    pub started_at: DateTime<Utc>,
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    if let Err(e) = dispatch(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run {
            overrides,
            name,
            interval_ms,
        } => {
            let config = effective_config(cli.config.as_deref(), &overrides);
            let name = name.unwrap_or_else(|| config.instance_id());
            if interval_ms == 0 {
                bail!("--interval-ms must be positive");
            }
            let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            rt.block_on(cmd_run(config, name, Duration::from_millis(interval_ms)))
        }
        Commands::Config { overrides } => {
            let config = effective_config(cli.config.as_deref(), &overrides);
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn effective_config(path: Option<&Path>, overrides: &Overrides) -> CoordinatorConfig {
    let mut config = load_config(path);
    overrides.apply(&mut config);
    config
}

async fn cmd_run(config: CoordinatorConfig, name: String, interval: Duration) -> anyhow::Result<()> {
    let channel = config.channel_name().to_string();
    let transport = config.transport;
    let swarm = SwarmClient::<PeerStatus>::new(config).context("Failed to open channel")?;
    let mut events = swarm.subscribe();
    let mut diagnostics = swarm.coordinator().subscribe();

    if !swarm.start().await {
        bail!("client endpoint for channel '{channel}' is not operational");
    }
    info!(
        channel = %channel,
        %transport,
        identity = %swarm.identity(),
        address = %swarm.client_address().unwrap_or_default(),
        "Joined channel, press Ctrl+C to leave"
    );

    let started_at = Utc::now();
    let mut seq = 0u64;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                swarm.update().await;
                seq += 1;
                let status = PeerStatus { name: name.clone(), seq, started_at };
                if let Err(e) = swarm.send(&status, None, None).await {
                    warn!(error = %e, "Heartbeat not sent");
                }
            }
            event = events.recv() => match event {
                Ok(event) => log_swarm_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Swarm events dropped"),
                Err(RecvError::Closed) => break,
            },
            event = diagnostics.recv() => {
                if let Ok(CoordinatorEvent::Diagnostic(detail)) = event {
                    debug!(%detail, "Coordinator diagnostic");
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, leaving channel");
                break;
            }
        }
    }

    let peers = swarm.len();
    swarm.shutdown().await;
    info!(channel = %channel, peers, "Left channel");
    Ok(())
}

fn log_swarm_event(event: &SwarmEvent<PeerStatus>) {
    match event {
        SwarmEvent::Added { peer, .. } => {
            info!(peer = %peer.identity(), "Peer joined");
        }
        SwarmEvent::Expired { peer, payload } => {
            let name = payload.as_ref().map(|p| p.name.as_str()).unwrap_or("-");
            info!(peer = %peer.identity(), name, "Peer expired");
        }
        SwarmEvent::Message { peer, payload, .. } => {
            debug!(
                peer = %peer.identity(),
                name = %payload.name,
                seq = payload.seq,
                "Heartbeat"
            );
        }
        SwarmEvent::Rejected { envelope, reason } => {
            warn!(from = %envelope.from, %reason, "Rejected swarm message");
        }
        SwarmEvent::Changed { .. } | SwarmEvent::Updated => {}
    }
}
