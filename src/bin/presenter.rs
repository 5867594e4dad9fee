//! Presenter Application
//!
//! Owns the playback clock, accepts pairing from a companion, applies its
//! remote commands and keeps it updated with the playback state.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livesync::{
    config::AppConfig,
    discovery::udp::BeaconDirectory,
    network::addresses::SystemAddresses,
    playback::{PlaybackClock, PlaybackSnapshot, PresenterMessage, RemoteCommand},
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

    tracing::info!("Starting LiveSync presenter");

    let config = AppConfig::load_or_create(DeviceType::Main)?;
    tracing::info!(
        device_id = %config.device.id,
        name = %config.device.name,
        "Loaded configuration"
    );

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
    tracing::info!("Sessions listening on port {}", handle.listen_port());

    let (snapshot_tx, mut snapshots) = mpsc::unbounded_channel();
    let clock = PlaybackClock::new(
        handle.clock(),
        Box::new(move |snapshot: &PlaybackSnapshot| {
            let _ = snapshot_tx.send(snapshot.clone());
        }),
    );
    let clock = Arc::new(Mutex::new(clock));
    let state = Arc::new(AppState::new(handle.clone(), PlaybackControl::Local(clock.clone())));

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
                    handle_event(&handle, &clock, event).await;
                }
            }
            Some(snapshot) = snapshots.recv() => {
                state.publish_playback(snapshot.clone());
                send_to_companion(&handle, PresenterMessage::PlaybackState(snapshot)).await;
            }
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                handle.shutdown();
                break;
            }
        }
    }

    let _ = task.await;
    tracing::info!("Presenter stopped");
    Ok(())
}

async fn handle_event(handle: &CoordinatorHandle, clock: &Mutex<PlaybackClock>, event: CoordinatorEvent) {
    match event {
        CoordinatorEvent::Message {
            device_id,
            data,
            received_at,
            ..
        } => {
            let Some(command) = RemoteCommand::parse(&data) else {
                tracing::debug!(%device_id, "Unhandled message: {}", data);
                return;
            };
            if command.is_host_request() {
                answer_host_request(handle, clock, command).await;
            } else {
                let changed = command.apply(&mut clock.lock(), received_at);
                tracing::debug!(?command, changed, "Applied remote command");
            }
        }
        CoordinatorEvent::DeviceConnected(device) => {
            tracing::info!(device_id = %device.device_id, name = %device.device_name, "Companion connected");
            let snapshot = clock.lock().snapshot();
            send_to_companion(handle, PresenterMessage::PlaybackState(snapshot)).await;
        }
        CoordinatorEvent::DeviceDisconnected { device, reason } => {
            tracing::info!(device_id = %device.device_id, reason = reason.as_str(), "Companion disconnected");
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

async fn answer_host_request(handle: &CoordinatorHandle, clock: &Mutex<PlaybackClock>, command: RemoteCommand) {
    match command {
        RemoteCommand::RequestCurrentSong => {
            let song = clock.lock().song().cloned();
            send_to_companion(handle, PresenterMessage::CurrentSong(song)).await;
        }
        RemoteCommand::RequestPlaylist => {
            let songs = clock.lock().song().cloned().into_iter().collect();
            send_to_companion(handle, PresenterMessage::Playlist(songs)).await;
        }
        RemoteCommand::SelectSong { payload } => {
            tracing::info!(song_id = %payload.song_id, "Companion requested a song");
        }
        other => tracing::debug!(?other, "Not a host request"),
    }
}

async fn send_to_companion(handle: &CoordinatorHandle, message: PresenterMessage) {
    if let Err(e) = handle.send_message(message.to_value()).await {
        tracing::trace!("Not forwarded to companion: {}", e);
    }
}
