//! relay-signal - Main entry point
//!
//! Connects to the relay, activates a channel and runs push/pull/forward
//! sessions between local UDP RTP endpoints and the relay.

mod args;

use args::{Args, Command};
use clap::Parser;
use log::{debug, error, info, warn};
use relay_signal::capture::{UdpRtpSink, UdpRtpSource};
use relay_signal::config::Config;
use relay_signal::metrics::Metrics;
use relay_signal::transport::http_fallback::BootstrapSession;
use relay_signal::transport::{websocket, BootstrapRole, HttpBootstrap};
use relay_signal::webrtc::manager::SessionManagerConfig;
use relay_signal::webrtc::peer_connection::WebRtcTransportFactory;
use relay_signal::webrtc::signaling::ChannelIdentity;
use relay_signal::webrtc::{ManagerEvent, SessionManager, SessionRole, SessionState, TransportEvent};
use std::env;
use std::error::Error;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse command line arguments
    let args = Args::parse();

    let (mut config, load_error) = match args.load_config() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e.to_string())),
    };
    args.apply(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&env::var("RELAY_SIGNAL_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("relay-signal v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        Some(e) => warn!("Failed to load config: {}, using defaults", e),
        None => info!("Loaded configuration from {:?}", args.config),
    }

    if config.relay.client_id.is_empty() {
        config.relay.client_id = uuid::Uuid::new_v4().to_string();
        debug!("Generated client id {}", config.relay.client_id);
    }
    config.validate()?;

    let factory = Arc::new(WebRtcTransportFactory::new(config.webrtc.clone()));

    match args.command {
        Command::Broadcast => run_bootstrap(BootstrapRole::Broadcast, &config, factory).await,
        Command::View => run_bootstrap(BootstrapRole::View, &config, factory).await,
        command => run_channel(command, &config, factory).await,
    }
}

/// Control channel mode: activate, start the requested flow and follow
/// manager events until ctrl-c or channel loss
async fn run_channel(
    command: Command,
    config: &Config,
    factory: Arc<WebRtcTransportFactory>,
) -> Result<(), Box<dyn Error>> {
    let (link, inbound) = websocket::connect(&config.relay.url).await?;

    let metrics = Arc::new(Metrics::new());
    let identity = ChannelIdentity {
        channel_id: config.relay.channel_id.clone(),
        channel_key: config.relay.channel_key.clone(),
        client_id: config.relay.client_id.clone(),
    };
    let manager = SessionManager::new(
        identity,
        SessionManagerConfig::from_config(config),
        link,
        factory,
        metrics.clone(),
    );
    let mut events = manager.subscribe();

    let run_manager = manager.clone();
    let mut run_handle = task::spawn(async move { run_manager.run(inbound).await });

    manager.activate().await?;
    info!("Channel {} activated as {}", config.relay.channel_id, config.relay.client_id);

    let source = match command {
        Command::Push => Some(bind_source(config).await?),
        _ => None,
    };
    let sink = match config.media.sink_addr {
        Some(ref addr) => Some(UdpRtpSink::connect(addr).await?),
        None => None,
    };

    // Session whose end stops the process
    let mut primary = match (command, source.as_ref()) {
        (Command::Push, Some(source)) => Some(manager.push(source.stream())?),
        (Command::Pull | Command::Forward, _) => Some(manager.pull()?),
        _ => None,
    };
    let mut forward_started = false;

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    let result: Result<(), Box<dyn Error>> = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break Ok(());
            }
            result = &mut run_handle => {
                break match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(e.into()),
                };
            }
            event = events.recv() => match event {
                Ok(ManagerEvent::Activated) => debug!("Activation confirmed"),
                Ok(ManagerEvent::StateChanged { session_id, role, state }) => {
                    info!("Session {} ({}) -> {:?}", session_id, role, state);
                    if primary.as_deref() == Some(session_id.as_str()) && state.is_terminal() {
                        // Closed pulls are replaced by the manager
                        if !(role == SessionRole::Pull && state == SessionState::Closed) {
                            warn!("Session {} ended as {:?}", session_id, state);
                            break Ok(());
                        }
                    }
                }
                Ok(ManagerEvent::StreamReceived { session_id, track, relayed }) => {
                    info!("Session {} delivered {} track {}", session_id, track.kind(), track.id());
                    // Relayed packets already reach the sink through the earlier track
                    match sink {
                        Some(ref sink) if !relayed => sink.attach(&track),
                        _ => {}
                    }
                    if command == Command::Forward && !forward_started {
                        match manager.forward() {
                            Ok(id) => {
                                info!("Forwarding received media on session {}", id);
                                forward_started = true;
                            }
                            Err(e) => warn!("Forward not started: {}", e),
                        }
                    }
                }
                Ok(ManagerEvent::Forwarding(id)) => info!("Relay forwarding session {}", id),
                Ok(ManagerEvent::Forwarded(id)) => info!("Relay forwarded session {}", id),
                Ok(ManagerEvent::RelayFailure { session_id, reason }) => {
                    warn!(
                        "Relay reported failure for {}: {}",
                        session_id.as_deref().unwrap_or("channel"),
                        reason.as_deref().unwrap_or("no reason")
                    );
                }
                Ok(ManagerEvent::PullRestarted { previous, session_id }) => {
                    info!("Pull {} replaced by {}", previous, session_id);
                    if primary.as_deref() == Some(previous.as_str()) {
                        primary = Some(session_id);
                    }
                }
                Ok(ManagerEvent::ChannelClosed) => {
                    info!("Control channel closed");
                    break Ok(());
                }
                Err(RecvError::Lagged(n)) => warn!("Event subscriber lagged by {} events", n),
                Err(RecvError::Closed) => break Ok(()),
            }
        }
    };

    info!("Stopping all sessions...");
    manager.shutdown().await;
    if !run_handle.is_finished() {
        run_handle.abort();
        let _ = run_handle.await;
    }

    if let Some(source) = source {
        info!("RTP source stats: {:?}", source.stats());
    }
    if let Some(sink) = sink {
        info!("RTP sink stats: {:?}", sink.stats());
    }
    info!("Final metrics:\n{}", metrics.render());
    info!("relay-signal stopped");

    if let Err(ref e) = result {
        error!("Stopped with error: {}", e);
    }
    result
}

/// HTTP bootstrap mode: one negotiated session, no control channel
async fn run_bootstrap(
    role: BootstrapRole,
    config: &Config,
    factory: Arc<WebRtcTransportFactory>,
) -> Result<(), Box<dyn Error>> {
    let base = config
        .relay
        .http_base_url
        .clone()
        .ok_or("relay.http_base_url must be set for broadcast and view")?;
    let bootstrap = HttpBootstrap::new(
        base,
        config.relay.channel_id.clone(),
        config.relay.channel_key.clone(),
        config.relay.client_id.clone(),
    );

    let source = match role {
        BootstrapRole::Broadcast => Some(bind_source(config).await?),
        BootstrapRole::View => None,
    };
    let sink = match (role, config.media.sink_addr.as_ref()) {
        (BootstrapRole::View, Some(addr)) => Some(UdpRtpSink::connect(addr).await?),
        (BootstrapRole::View, None) => return Err("media.sink_addr must be set for view".into()),
        _ => None,
    };

    let receive = SessionManagerConfig::from_config(config).receive;
    let BootstrapSession {
        mut session,
        mut events,
    } = bootstrap
        .open(role, factory.as_ref(), source.as_ref().map(UdpRtpSource::stream), &receive)
        .await?;

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Some(TransportEvent::Track(track)) => {
                    info!("Session {} received {} track {}", session.id(), track.kind(), track.id());
                    if let Some(ref sink) = sink {
                        sink.attach(&track);
                    }
                }
                Some(TransportEvent::Connectivity(report)) => {
                    if let Some(state) = session.on_connectivity(report) {
                        info!("Session {} -> {:?}", session.id(), state);
                        if state.is_terminal() {
                            break;
                        }
                    }
                }
                // Already embedded in the offer
                Some(TransportEvent::Candidate(_)) => {}
                None => break,
            }
        }
    }

    session.close(SessionState::Closed).await;
    if let Some(sink) = sink {
        info!("RTP sink stats: {:?}", sink.stats());
    }
    Ok(())
}

async fn bind_source(config: &Config) -> Result<UdpRtpSource, Box<dyn Error>> {
    let addr = config
        .media
        .source_addr
        .as_deref()
        .ok_or("media.source_addr must be set to push media")?;
    Ok(UdpRtpSource::bind(addr, config.media.codec).await?)
}
