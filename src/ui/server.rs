//! Control surface server and shared UI state

use axum::{
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::config::UiConfig;
use crate::error::{NetworkError, PairingError};
use crate::playback::{PlaybackClock, PlaybackSnapshot, RemoteCommand, SongMeta, MeasureMap};
use crate::protocol::DeviceIdentity;
use crate::session::{CoordinatorEvent, CoordinatorHandle, PairingTicket, RttReport};
use crate::ui::{handlers, websocket};

/// Capacity of the UI event fan-out
const UI_EVENT_CAPACITY: usize = 256;

/// Who owns the playback clock
pub enum PlaybackControl {
    /// Commands apply to the clock held here
    Local(Arc<Mutex<PlaybackClock>>),
    /// Commands are forwarded to the paired device
    Remote,
}

/// Event pushed to WebSocket clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UiEvent {
    DeviceFound {
        device: DeviceIdentity,
    },
    DeviceLost {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    PairingRequest {
        #[serde(rename = "ticketId")]
        ticket_id: u64,
        device: DeviceIdentity,
    },
    PairingExpired {
        #[serde(rename = "ticketId")]
        ticket_id: u64,
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    Connected {
        device: DeviceIdentity,
    },
    Disconnected {
        device: DeviceIdentity,
        reason: String,
    },
    PairingFailed {
        #[serde(rename = "deviceId")]
        device_id: String,
        reason: String,
    },
    Rtt {
        reports: Vec<RttReport>,
    },
    Playback {
        snapshot: PlaybackSnapshot,
    },
    Error {
        message: String,
    },
}

/// Pairing request awaiting a decision
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub ticket_id: u64,
    pub device: DeviceIdentity,
}

/// Shared state for HTTP handlers and WebSocket sessions
pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub playback: PlaybackControl,
    tickets: Mutex<BTreeMap<u64, PairingTicket>>,
    snapshot: watch::Sender<Option<PlaybackSnapshot>>,
    events: broadcast::Sender<UiEvent>,
}

impl AppState {
    pub fn new(coordinator: CoordinatorHandle, playback: PlaybackControl) -> Self {
        let initial = match &playback {
            PlaybackControl::Local(clock) => Some(clock.lock().snapshot()),
            PlaybackControl::Remote => None,
        };
        let (snapshot, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(UI_EVENT_CAPACITY);
        Self {
            coordinator,
            playback,
            tickets: Mutex::new(BTreeMap::new()),
            snapshot,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub fn notify(&self, event: UiEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn latest_playback(&self) -> Option<PlaybackSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn publish_playback(&self, snapshot: PlaybackSnapshot) {
        self.snapshot.send_replace(Some(snapshot.clone()));
        self.notify(UiEvent::Playback { snapshot });
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.tickets
            .lock()
            .values()
            .map(|ticket| PendingRequest {
                ticket_id: ticket.id(),
                device: ticket.device().clone(),
            })
            .collect()
    }

    pub fn take_ticket(&self, ticket_id: u64) -> Option<PairingTicket> {
        self.tickets.lock().remove(&ticket_id)
    }

    /// Mirror a coordinator event to UI clients. Pairing tickets are kept
    /// here until a client decides; every other event is handed back for
    /// the host to act on.
    pub fn absorb(&self, event: CoordinatorEvent) -> Option<CoordinatorEvent> {
        match event {
            CoordinatorEvent::PairingRequest(ticket) => {
                self.notify(UiEvent::PairingRequest {
                    ticket_id: ticket.id(),
                    device: ticket.device().clone(),
                });
                self.tickets.lock().insert(ticket.id(), ticket);
                None
            }
            CoordinatorEvent::PairingRequestExpired { ticket_id, device_id } => {
                self.tickets.lock().remove(&ticket_id);
                self.notify(UiEvent::PairingExpired { ticket_id, device_id });
                None
            }
            CoordinatorEvent::RttUpdated(reports) => {
                self.notify(UiEvent::Rtt { reports });
                None
            }
            event => {
                let mirrored = match &event {
                    CoordinatorEvent::DiscoverableDeviceFound(device) => Some(UiEvent::DeviceFound {
                        device: device.clone(),
                    }),
                    CoordinatorEvent::DiscoverableDeviceLost { device_id } => Some(UiEvent::DeviceLost {
                        device_id: device_id.clone(),
                    }),
                    CoordinatorEvent::DeviceConnected(device) => Some(UiEvent::Connected { device: device.clone() }),
                    CoordinatorEvent::DeviceDisconnected { device, reason } => Some(UiEvent::Disconnected {
                        device: device.clone(),
                        reason: reason.as_str().to_string(),
                    }),
                    CoordinatorEvent::PairingFailed { device_id, reason } => Some(UiEvent::PairingFailed {
                        device_id: device_id.clone(),
                        reason: reason.clone(),
                    }),
                    CoordinatorEvent::Error(error) => Some(UiEvent::Error {
                        message: error.to_string(),
                    }),
                    _ => None,
                };
                if let Some(mirrored) = mirrored {
                    self.notify(mirrored);
                }
                Some(event)
            }
        }
    }

    /// Run a playback command from a local client. Returns whether the
    /// local clock changed (always true once forwarded).
    pub async fn apply_command(&self, command: RemoteCommand) -> Result<bool, PairingError> {
        match &self.playback {
            PlaybackControl::Local(clock) => {
                let now = self.coordinator.clock().now_ms();
                let changed = {
                    let mut clock = clock.lock();
                    command.apply(&mut clock, now)
                };
                Ok(changed)
            }
            PlaybackControl::Remote => {
                self.coordinator.send_message(command.to_value()).await?;
                Ok(true)
            }
        }
    }

    /// Load a song into the local clock. `false` when playback is remote.
    pub fn load_song(&self, meta: SongMeta, measures: MeasureMap) -> bool {
        match &self.playback {
            PlaybackControl::Local(clock) => {
                clock.lock().load_song(meta, measures);
                true
            }
            PlaybackControl::Remote => false,
        }
    }

    pub fn unload_song(&self) -> bool {
        match &self.playback {
            PlaybackControl::Local(clock) => {
                clock.lock().unload_song();
                true
            }
            PlaybackControl::Remote => false,
        }
    }
}

/// HTTP + WebSocket control surface
pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/devices", get(handlers::get_devices))
            .route("/api/devices/:id/pair", post(handlers::pair_device))
            .route("/api/devices/:id/cancel", post(handlers::cancel_pairing))
            .route("/api/disconnect", post(handlers::disconnect))
            .route("/api/pairing/requests", get(handlers::get_pairing_requests))
            .route("/api/pairing/requests/:id", post(handlers::decide_pairing))
            .route("/api/rtt", get(handlers::get_rtt))
            .route("/api/playback", get(handlers::get_playback))
            .route("/api/playback/command", post(handlers::playback_command))
            .route("/api/playback/song", post(handlers::load_song).delete(handlers::unload_song))
            .route("/ws", get(websocket::ws_handler))
            .layer(cors)
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> crate::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|e| crate::Error::Config(format!("invalid ui address: {}", e)))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

        tracing::info!("Control surface listening on http://{}", addr);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Web server error: {}", e);
            }
        })
    }
}
