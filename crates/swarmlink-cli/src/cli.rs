//! Clap CLI definitions for SwarmLink.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use swarmlink_types::{CoordinatorConfig, TransportKind};

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  swarmlink run --channel Lobby                 Join the Lobby channel over TCP
  swarmlink run --channel Lobby --transport local --instance a
  swarmlink config --channel Lobby              Print the effective configuration";

/// SwarmLink: serverless peer rendezvous for a named channel.
#[derive(Parser)]
#[command(name = "swarmlink", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Join a channel and broadcast a heartbeat until interrupted.
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// Display name carried in the heartbeat [default: instance id].
        #[arg(long)]
        name: Option<String>,
        /// Milliseconds between update ticks.
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line settings that take precedence over the config file.
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Channel to join.
    #[arg(long)]
    pub channel: Option<String>,
    /// Byte transport: `network` or `local`.
    #[arg(long)]
    pub transport: Option<TransportKind>,
    /// Host socket address (`host:port`) for the network transport.
    #[arg(long)]
    pub host: Option<String>,
    /// Instance id, to run several peers from one machine.
    #[arg(long)]
    pub instance: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut CoordinatorConfig) {
        if let Some(channel) = &self.channel {
            config.channel = channel.clone();
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(host) = &self.host {
            config.host_address = Some(host.clone());
        }
        if let Some(instance) = &self.instance {
            config.instance = Some(instance.clone());
        }
    }
}
