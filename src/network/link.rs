//! Tokio I/O driver for one session's TCP stream and UDP side channel
//!
//! Protocol logic never touches sockets directly. Each session owns a
//! [`Link`] (a command queue) and the driver tasks spawned here turn socket
//! activity into [`NetEvent`]s for the coordinator task.

use bytes::Bytes;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::constants::{CONNECT_TIMEOUT_MS, MAX_FRAME_LEN, MAX_PACKET_SIZE, READ_BUFFER_SIZE};
use crate::error::NetworkError;
use crate::network::datagram::{split_message, DatagramChunk, SenderTable};

/// Identifies one physical connection for its whole lifetime
pub type SessionId = u64;

/// Hands out process-unique session ids to the listener and connector
#[derive(Debug, Clone, Default)]
pub struct SessionIds(Arc<AtomicU64>);

impl SessionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SessionId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Work queued for a link's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    /// A fully framed TCP write
    Frame(Bytes),
    /// A side-channel payload to chunk and send
    Datagram { payload: Bytes, target: SocketAddr },
    /// Flush what is queued, then shut the connection down
    Close,
}

/// Sending half of a session's command queue
#[derive(Debug, Clone)]
pub struct Link {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

/// Receiving half, consumed by the writer task
pub type LinkReceiver = mpsc::UnboundedReceiver<LinkCommand>;

impl Link {
    pub fn channel() -> (Link, LinkReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Link { tx }, rx)
    }

    /// Queue a framed write. Returns false once the driver is gone.
    pub fn send_frame(&self, frame: Bytes) -> bool {
        self.tx.send(LinkCommand::Frame(frame)).is_ok()
    }

    pub fn send_datagram(&self, payload: Bytes, target: SocketAddr) -> bool {
        self.tx.send(LinkCommand::Datagram { payload, target }).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(LinkCommand::Close);
    }
}

/// Socket activity reported to the coordinator
#[derive(Debug)]
pub enum NetEvent {
    /// A peer connected to our listener
    Accepted {
        session_id: SessionId,
        link: Link,
        peer: SocketAddr,
        stream_port: Option<u16>,
    },
    /// An outgoing connection completed its TCP connect
    Connected {
        session_id: SessionId,
        stream_port: Option<u16>,
    },
    ConnectFailed {
        session_id: SessionId,
        error: NetworkError,
    },
    Data {
        session_id: SessionId,
        bytes: Bytes,
    },
    Datagram {
        session_id: SessionId,
        payload: Bytes,
        from: SocketAddr,
    },
    Closed {
        session_id: SessionId,
        error: Option<NetworkError>,
    },
}

pub type NetEventSender = mpsc::UnboundedSender<NetEvent>;

/// Accept loop for inbound sessions
pub async fn run_listener(
    listener: TcpListener,
    ids: SessionIds,
    enable_stream: bool,
    events: NetEventSender,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let session_id = ids.next();
        tracing::debug!(session_id, %peer, "New incoming connection");

        let udp = match prepare_stream(&stream, enable_stream).await {
            Ok(udp) => udp,
            Err(e) => {
                tracing::warn!(session_id, "Stream socket bind failed: {}", e);
                continue;
            }
        };
        let stream_port = local_port(udp.as_ref());

        let (link, rx) = Link::channel();
        if events
            .send(NetEvent::Accepted {
                session_id,
                link,
                peer,
                stream_port,
            })
            .is_err()
        {
            break;
        }
        tokio::spawn(run_io(session_id, stream, udp, rx, events.clone()));
    }
}

/// Start an outgoing connection driven by `rx`.
///
/// Commands queued before the connect completes are held in the channel.
pub fn spawn_connect(
    session_id: SessionId,
    target: SocketAddr,
    enable_stream: bool,
    rx: LinkReceiver,
    events: NetEventSender,
) {
    tokio::spawn(async move {
        let connect = tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            TcpStream::connect(target),
        );
        let stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = events.send(NetEvent::ConnectFailed {
                    session_id,
                    error: NetworkError::ConnectionFailed(format!("{}: {}", target, e)),
                });
                return;
            }
            Err(_) => {
                let _ = events.send(NetEvent::ConnectFailed {
                    session_id,
                    error: NetworkError::Timeout(target),
                });
                return;
            }
        };

        let udp = match prepare_stream(&stream, enable_stream).await {
            Ok(udp) => udp,
            Err(e) => {
                let _ = events.send(NetEvent::ConnectFailed {
                    session_id,
                    error: NetworkError::BindFailed(format!("stream socket: {}", e)),
                });
                return;
            }
        };

        let stream_port = local_port(udp.as_ref());
        if events
            .send(NetEvent::Connected {
                session_id,
                stream_port,
            })
            .is_ok()
        {
            run_io(session_id, stream, udp, rx, events).await;
        }
    });
}

async fn prepare_stream(stream: &TcpStream, enable_stream: bool) -> std::io::Result<Option<UdpSocket>> {
    stream.set_nodelay(true)?;
    if !enable_stream {
        return Ok(None);
    }
    // The side channel binds on the same interface the TCP path uses
    let local_ip = stream.local_addr()?.ip();
    UdpSocket::bind(SocketAddr::new(local_ip, 0)).await.map(Some)
}

fn local_port(udp: Option<&UdpSocket>) -> Option<u16> {
    udp.and_then(|s| s.local_addr().ok()).map(|a| a.port())
}

async fn run_io(
    session_id: SessionId,
    stream: TcpStream,
    udp: Option<UdpSocket>,
    mut rx: LinkReceiver,
    events: NetEventSender,
) {
    let (mut reader, mut writer) = stream.into_split();
    let udp = udp.map(Arc::new);

    let read_events = events.clone();
    let reader_task = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = read_events.send(NetEvent::Closed {
                        session_id,
                        error: None,
                    });
                    break;
                }
                Ok(n) => {
                    let bytes = Bytes::copy_from_slice(&buf[..n]);
                    if read_events.send(NetEvent::Data { session_id, bytes }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = read_events.send(NetEvent::Closed {
                        session_id,
                        error: Some(NetworkError::ReceiveFailed(e.to_string())),
                    });
                    break;
                }
            }
        }
    });

    let udp_task = udp.clone().map(|socket| {
        let udp_events = events.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE * 2];
            let mut senders = SenderTable::new();
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) if is_transient(&e) => {
                        tracing::trace!(session_id, "Stream socket receive error: {}", e);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(session_id, "Stream socket failed, side channel stopped: {}", e);
                        break;
                    }
                };
                let chunk = match DatagramChunk::decode(&buf[..n]) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::trace!(session_id, %from, "Dropping datagram: {}", e);
                        continue;
                    }
                };
                if let Some(payload) = senders.accept(from, chunk) {
                    let event = NetEvent::Datagram {
                        session_id,
                        payload: Bytes::from(payload),
                        from,
                    };
                    if udp_events.send(event).is_err() {
                        break;
                    }
                }
            }
        })
    });

    let mut next_message_id: u64 = 0;
    while let Some(command) = rx.recv().await {
        match command {
            LinkCommand::Frame(frame) => {
                if let Err(e) = writer.write_all(&frame).await {
                    let _ = events.send(NetEvent::Closed {
                        session_id,
                        error: Some(NetworkError::SendFailed(e.to_string())),
                    });
                    break;
                }
            }
            LinkCommand::Datagram { payload, target } => {
                let Some(socket) = udp.as_ref() else {
                    continue;
                };
                if payload.len() > MAX_FRAME_LEN {
                    tracing::warn!(session_id, len = payload.len(), "Side-channel payload too large, dropped");
                    continue;
                }
                next_message_id = next_message_id.wrapping_add(1);
                let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                for chunk in split_message(next_message_id, timestamp, &payload) {
                    match chunk.encode() {
                        Ok(bytes) => {
                            if let Err(e) = socket.send_to(&bytes, target).await {
                                tracing::trace!(session_id, %target, "Datagram send failed: {}", e);
                            }
                        }
                        Err(e) => tracing::warn!(session_id, "Datagram encode failed: {}", e),
                    }
                }
            }
            LinkCommand::Close => break,
        }
    }

    let _ = writer.shutdown().await;
    reader_task.abort();
    if let Some(task) = udp_task {
        task.abort();
    }
    tracing::trace!(session_id, "Link driver finished");
}

/// Errors a UDP socket reports for one packet (ICMP unreachable feedback,
/// signals) rather than for the socket itself
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Resolve the address a session's side-channel datagrams should go to
pub fn stream_target(remote_ip: IpAddr, stream_port: u16) -> SocketAddr {
    SocketAddr::new(remote_ip, stream_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::framing::{encode_frame, FrameDecoder};

    #[tokio::test]
    async fn test_accepted_link_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_listener(listener, SessionIds::new(), true, events_tx));

        let mut client = TcpStream::connect(addr).await.unwrap();

        let (session_id, link, stream_port) = match events_rx.recv().await.unwrap() {
            NetEvent::Accepted {
                session_id,
                link,
                stream_port,
                ..
            } => (session_id, link, stream_port),
            other => panic!("unexpected {:?}", other),
        };
        assert!(stream_port.is_some());

        client.write_all(&encode_frame(b"{\"type\":\"ping\"}")).await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        while frames.is_empty() {
            match events_rx.recv().await.unwrap() {
                NetEvent::Data { session_id: id, bytes } => {
                    assert_eq!(id, session_id);
                    frames.extend(decoder.decode(&bytes).unwrap());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(&frames[0][..], b"{\"type\":\"ping\"}");

        assert!(link.send_frame(encode_frame(b"pong")));
        link.close();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, encode_frame(b"pong").to_vec());
    }

    #[test]
    fn test_transient_receive_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::NotConnected)));
        assert!(!is_transient(&io::Error::new(io::ErrorKind::Other, "bad fd")));
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_link, rx) = Link::channel();
        spawn_connect(9, SocketAddr::from(([127, 0, 0, 1], port)), false, rx, events_tx);

        match events_rx.recv().await.unwrap() {
            NetEvent::ConnectFailed { session_id, error } => {
                assert_eq!(session_id, 9);
                assert!(matches!(error, NetworkError::ConnectionFailed(_)), "{:?}", error);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
