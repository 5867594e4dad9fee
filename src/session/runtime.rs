//! Tokio task hosting the [`SessionCoordinator`]
//!
//! All protocol state lives inside one task. Socket drivers, the service
//! directory and the application talk to it through channels only.

use serde_json::Value;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::constants::COORDINATOR_TICK_MS;
use crate::discovery::{DirectoryEvent, ServiceDirectory};
use crate::error::{NetworkError, PairingError};
use crate::network::addresses::AddressSource;
use crate::network::link::{run_listener, spawn_connect, LinkReceiver, NetEvent, NetEventSender, SessionId, SessionIds};
use crate::protocol::DeviceIdentity;
use crate::session::coordinator::{
    Connector, CoordinatorEvent, CoordinatorStatus, CoordinatorTimings, PairingTicket, SessionCoordinator,
};
use crate::time::MonotonicClock;

/// Opens real TCP connections through the link driver
pub struct TcpConnector {
    enable_stream: bool,
    events: NetEventSender,
}

impl TcpConnector {
    pub fn new(enable_stream: bool, events: NetEventSender) -> Self {
        Self { enable_stream, events }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, session_id: SessionId, target: SocketAddr, rx: LinkReceiver) {
        spawn_connect(session_id, target, self.enable_stream, rx, self.events.clone());
    }
}

/// Settings for [`spawn`]
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub identity: DeviceIdentity,
    /// Session listener address; port 0 picks a free port
    pub listen_addr: SocketAddr,
    pub enable_stream: bool,
    pub timings: CoordinatorTimings,
}

enum Command {
    PairWith {
        device_id: String,
        reply: oneshot::Sender<Result<(), PairingError>>,
    },
    CancelPairing {
        device_id: String,
        reply: oneshot::Sender<Result<(), PairingError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), PairingError>>,
    },
    Decide {
        ticket: PairingTicket,
        accept: bool,
        reply: oneshot::Sender<Result<(), PairingError>>,
    },
    SendMessage {
        data: Value,
        reply: oneshot::Sender<Result<String, PairingError>>,
    },
    SendStream {
        data: Value,
        reply: oneshot::Sender<Result<usize, PairingError>>,
    },
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    Shutdown,
}

/// Cloneable handle for driving a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    identity: DeviceIdentity,
    listen_port: u16,
    clock: MonotonicClock,
}

impl CoordinatorHandle {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Clock every coordinator timestamp is expressed on
    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, PairingError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| PairingError::Stopped)?;
        rx.await.map_err(|_| PairingError::Stopped)
    }

    pub async fn pair_with(&self, device_id: &str) -> Result<(), PairingError> {
        let device_id = device_id.to_string();
        self.request(|reply| Command::PairWith { device_id, reply }).await?
    }

    pub async fn cancel_pairing(&self, device_id: &str) -> Result<(), PairingError> {
        let device_id = device_id.to_string();
        self.request(|reply| Command::CancelPairing { device_id, reply }).await?
    }

    pub async fn disconnect(&self) -> Result<(), PairingError> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    pub async fn decide_pairing(&self, ticket: PairingTicket, accept: bool) -> Result<(), PairingError> {
        self.request(|reply| Command::Decide { ticket, accept, reply }).await?
    }

    /// Returns the message id on success
    pub async fn send_message(&self, data: Value) -> Result<String, PairingError> {
        self.request(|reply| Command::SendMessage { data, reply }).await?
    }

    /// Returns the number of paths the payload went out on
    pub async fn send_stream(&self, data: Value) -> Result<usize, PairingError> {
        self.request(|reply| Command::SendStream { data, reply }).await?
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, PairingError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Ask the coordinator to unpair, close everything and stop
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// A running coordinator task
pub struct CoordinatorRuntime {
    pub handle: CoordinatorHandle,
    pub events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    pub task: JoinHandle<()>,
}

/// Bind the session listener and start the coordinator task
pub async fn spawn(
    options: RuntimeOptions,
    directory: Box<dyn ServiceDirectory>,
    directory_events: mpsc::UnboundedReceiver<DirectoryEvent>,
    addresses: Box<dyn AddressSource>,
) -> Result<CoordinatorRuntime, NetworkError> {
    let listener = TcpListener::bind(options.listen_addr)
        .await
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", options.listen_addr, e)))?;
    let listen_port = listener
        .local_addr()
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?
        .port();
    tracing::info!("Session listener on {}:{}", options.listen_addr.ip(), listen_port);

    let ids = SessionIds::new();
    let clock = MonotonicClock::new();
    let (net_tx, net_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let listener_task = tokio::spawn(run_listener(listener, ids.clone(), options.enable_stream, net_tx.clone()));

    let coordinator = SessionCoordinator::new(
        options.identity.clone(),
        options.enable_stream,
        options.timings,
        clock,
        ids,
        Box::new(TcpConnector::new(options.enable_stream, net_tx)),
        directory,
        addresses,
    );

    let task = tokio::spawn(run_coordinator(
        coordinator,
        listen_port,
        net_rx,
        directory_events,
        command_rx,
        event_tx,
        listener_task,
    ));

    Ok(CoordinatorRuntime {
        handle: CoordinatorHandle {
            commands: command_tx,
            identity: options.identity,
            listen_port,
            clock,
        },
        events: event_rx,
        task,
    })
}

async fn run_coordinator(
    mut coordinator: SessionCoordinator,
    listen_port: u16,
    mut net_rx: mpsc::UnboundedReceiver<NetEvent>,
    mut directory_rx: mpsc::UnboundedReceiver<DirectoryEvent>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    listener_task: JoinHandle<()>,
) {
    coordinator.start(listen_port, Instant::now());
    forward(&mut coordinator, &events);

    let mut ticker = tokio::time::interval(Duration::from_millis(COORDINATOR_TICK_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(event) = net_rx.recv() => {
                coordinator.handle_net_event(event, Instant::now());
            }
            Some(event) = directory_rx.recv() => {
                coordinator.handle_directory_event(event, Instant::now());
            }
            command = command_rx.recv() => {
                match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => handle_command(&mut coordinator, command),
                }
            }
            _ = ticker.tick() => {
                coordinator.tick(Instant::now());
            }
        }
        forward(&mut coordinator, &events);
    }

    coordinator.shutdown(Instant::now());
    forward(&mut coordinator, &events);
    listener_task.abort();
    tracing::info!("Coordinator task stopped");
}

fn handle_command(coordinator: &mut SessionCoordinator, command: Command) {
    let now = Instant::now();
    match command {
        Command::PairWith { device_id, reply } => {
            let _ = reply.send(coordinator.pair_with(&device_id, now));
        }
        Command::CancelPairing { device_id, reply } => {
            let _ = reply.send(coordinator.cancel_pairing(&device_id, now));
        }
        Command::Disconnect { reply } => {
            let _ = reply.send(coordinator.disconnect_from_paired(now));
        }
        Command::Decide { ticket, accept, reply } => {
            let _ = reply.send(coordinator.decide_pairing(ticket, accept, now));
        }
        Command::SendMessage { data, reply } => {
            let _ = reply.send(coordinator.send_message(data));
        }
        Command::SendStream { data, reply } => {
            let _ = reply.send(coordinator.send_stream(data));
        }
        Command::Status { reply } => {
            let _ = reply.send(coordinator.status());
        }
        Command::Shutdown => {}
    }
}

fn forward(coordinator: &mut SessionCoordinator, events: &mpsc::UnboundedSender<CoordinatorEvent>) {
    for event in coordinator.take_events() {
        // The application may have stopped listening; keep running regardless
        let _ = events.send(event);
    }
}
