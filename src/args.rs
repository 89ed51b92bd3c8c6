use clap::{Parser, Subcommand};
use std::path::PathBuf;

use relay_signal::config;

#[derive(Parser, Debug)]
#[command(name = "relay-signal")]
#[command(author = "Relay Signal Team")]
#[command(version = "0.1.0")]
#[command(about = "Signaling client for relayed WebRTC sessions", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/relay-signal.toml")]
    pub config: PathBuf,

    /// Relay control channel URL (ws:// or wss://)
    #[arg(long, env = "RELAY_SIGNAL_URL")]
    pub url: Option<String>,

    /// Channel to activate
    #[arg(long)]
    pub channel: Option<String>,

    /// Channel secret
    #[arg(long, env = "RELAY_SIGNAL_CHANNEL_KEY")]
    pub channel_key: Option<String>,

    /// Client id presented on activation
    #[arg(long)]
    pub client_id: Option<String>,

    /// UDP address to read RTP from for push/broadcast
    #[arg(long)]
    pub source: Option<String>,

    /// UDP address to write received RTP to
    #[arg(long)]
    pub sink: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Activate the channel and push the local RTP source
    Push,
    /// Activate the channel and pull its media into the RTP sink
    Pull,
    /// Pull, then forward the received media to the relay
    Forward,
    /// Activate and only answer sessions the relay opens
    Serve,
    /// One-shot HTTP broadcast of the local RTP source
    Broadcast,
    /// One-shot HTTP view into the RTP sink
    View,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the file configuration
    pub fn apply(&self, config: &mut config::Config) {
        if let Some(ref url) = self.url {
            config.relay.url = url.clone();
        }
        if let Some(ref channel) = self.channel {
            config.relay.channel_id = channel.clone();
        }
        if let Some(ref key) = self.channel_key {
            config.relay.channel_key = key.clone();
        }
        if let Some(ref client_id) = self.client_id {
            config.relay.client_id = client_id.clone();
        }
        if let Some(ref source) = self.source {
            config.media.source_addr = Some(source.clone());
        }
        if let Some(ref sink) = self.sink {
            config.media.sink_addr = Some(sink.clone());
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}
