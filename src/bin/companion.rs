//! Companion Application
//!
//! Pairs with a presenter, forwards playback commands from its control
//! surface and mirrors the presenter's playback state.
//!
//! Usage: `companion [presenter id or name]` pairs automatically with the
//! matching presenter as soon as it is discovered.

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livesync::{
    config::AppConfig,
    discovery::BeaconDirectory,
    network::SystemAddresses,
    playback::{PresenterMessage, RemoteCommand},
    protocol::DeviceType,
    session::{self, CoordinatorEvent, CoordinatorHandle, CoordinatorRuntime},
    ui::{AppState, PlaybackControl, WebServer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LiveSync companion");

    let config = AppConfig::load_or_create(DeviceType::Connector)?;
    let auto_pair = std::env::args().nth(1);
    if let Some(target) = &auto_pair {
        tracing::info!("Will pair with presenter '{}' when discovered", target);
    }

    let (directory, directory_events) = BeaconDirectory::bind(
        config.network.discovery_port,
        config.device.id.clone(),
        config.beacon_interval(),
    )?;

    let CoordinatorRuntime {
        handle,
        mut events,
        task,
    } = session::spawn(
        config.runtime_options(),
        Box::new(directory),
        directory_events,
        Box::new(SystemAddresses),
    )
    .await?;

    let state = Arc::new(AppState::new(handle.clone(), PlaybackControl::Remote));
    let web_server = WebServer::new(config.ui.clone(), state.clone());
    let _web_handle = web_server.start_background();
    tracing::info!("Web UI available at http://{}:{}", config.ui.bind_address, config.ui.http_port);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(event) = state.absorb(event) {
                    handle_event(&handle, &state, auto_pair.as_deref(), event).await;
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                handle.shutdown();
                break;
            }
        }
    }

    let _ = task.await;
    tracing::info!("Companion stopped");
    Ok(())
}

async fn handle_event(handle: &CoordinatorHandle, state: &AppState, auto_pair: Option<&str>, event: CoordinatorEvent) {
    match event {
        CoordinatorEvent::DiscoverableDeviceFound(device) => {
            tracing::info!(device_id = %device.device_id, name = %device.device_name, "Presenter discovered");
            let wanted = auto_pair.is_some_and(|target| target == device.device_id || target == device.device_name);
            if wanted {
                if let Err(e) = handle.pair_with(&device.device_id).await {
                    tracing::warn!("Auto-pairing failed: {}", e);
                }
            }
        }
        CoordinatorEvent::DeviceConnected(device) => {
            tracing::info!(device_id = %device.device_id, name = %device.device_name, "Connected to presenter");
            if let Err(e) = handle.send_message(RemoteCommand::RequestCurrentSong.to_value()).await {
                tracing::debug!("Could not request current song: {}", e);
            }
        }
        CoordinatorEvent::Message { data, .. } => match PresenterMessage::parse(&data) {
            Some(PresenterMessage::PlaybackState(snapshot)) => state.publish_playback(snapshot),
            Some(PresenterMessage::CurrentSong(song)) => {
                tracing::info!(song = ?song.map(|s| s.title), "Presenter song");
            }
            Some(PresenterMessage::Playlist(songs)) => {
                tracing::info!("Presenter playlist has {} songs", songs.len());
            }
            None => tracing::debug!("Unhandled message: {}", data),
        },
        CoordinatorEvent::DeviceDisconnected { device, reason } => {
            tracing::info!(device_id = %device.device_id, reason = reason.as_str(), "Presenter disconnected");
        }
        CoordinatorEvent::PairingFailed { device_id, reason } => {
            tracing::warn!(%device_id, "Pairing failed: {}", reason);
        }
        CoordinatorEvent::SessionError { device_id, error } => {
            tracing::warn!(?device_id, "Session error: {}", error);
        }
        CoordinatorEvent::Error(error) => {
            tracing::warn!("Coordinator error: {}", error);
        }
        other => tracing::trace!(?other, "Coordinator event"),
    }
}
