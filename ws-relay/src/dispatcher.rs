//! Per-connection lifecycle: register, relay, deregister.
//!
//! Every accepted socket gets its own dispatcher task. The task splits the socket: the read half
//! stays in the receive loop, the write half moves into a writer task that drains the
//! connection's outbound queue. Other connections never touch the socket directly, they only
//! push frames into that queue through a [`PeerHandle`].

use std::{net::SocketAddr, time::Duration};

use futures_util::{
    SinkExt, StreamExt,
    future::join_all,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        self, Message as Frame, Utf8Bytes,
        error::ProtocolError,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    message::{DecodeError, Message},
    registry::{ConnectionId, DeliveryError, PeerHandle, Registry, RegistryError},
    server::RelayConfig,
};

/// How long a closing connection waits for its writer to flush the close frame.
const WRITER_CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closed,
}

/// Why a connection left the `Active` state.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer sent a close frame.
    PeerClosed(Option<CloseFrame>),
    /// The stream ended without a close frame.
    EndOfStream,
    Transport(tungstenite::Error),
    /// The writer task stopped, so nothing more can be delivered to this peer.
    WriterStopped,
    /// A sender gave up waiting for room in this peer's queue.
    Overrun,
    Shutdown,
    RegistryUnavailable,
}

/// What a single inbound frame means for the receive loop.
#[derive(Debug)]
pub enum Inbound {
    Payload(Message),
    Malformed(DecodeError),
    /// Ping, pong and raw frames. The transport answers pings itself.
    Control,
    Close(Option<CloseFrame>),
}

/// Outcome of relaying one message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

pub fn classify(frame: Frame) -> Inbound {
    let decoded = match frame {
        Frame::Text(text) => Message::decode(text.as_str()),
        Frame::Binary(bytes) => Message::decode_bytes(&bytes),
        Frame::Close(close) => return Inbound::Close(close),
        Frame::Ping(_) | Frame::Pong(_) | Frame::Frame(_) => return Inbound::Control,
    };

    match decoded {
        Ok(message) => Inbound::Payload(message),
        Err(err) => Inbound::Malformed(err),
    }
}

/// Sends `message` to every registered peer except `sender`.
///
/// Recipients are written to concurrently, each waiting up to `wait` for room in its queue. A
/// recipient that stays full for that long is disconnected instead of skipped, so every peer that
/// remains registered has seen every message. The call returns once each recipient either took the
/// frame or was given up on.
pub async fn fan_out(
    registry: &Registry,
    sender: ConnectionId,
    message: &Message,
    wait: Duration,
) -> Result<FanOut, RegistryError> {
    let frame = message.encode();
    let peers = registry.snapshot().await?;
    let deliveries = peers
        .iter()
        .filter(|peer| peer.id() != sender)
        .map(|peer| {
            let frame = frame.clone();
            async move { (peer.id(), peer.deliver(frame, wait).await) }
        });

    let mut outcome = FanOut::default();
    for (to, result) in join_all(deliveries).await {
        match result {
            Ok(()) => outcome.delivered += 1,
            Err(DeliveryError::Overrun) => {
                outcome.dropped += 1;
                warn!(from = sender, to, ?wait, "peer is not keeping up; disconnecting it");
            }
            Err(DeliveryError::Closed) => {
                outcome.dropped += 1;
                debug!(from = sender, to, "peer already disconnected");
            }
        }
    }

    Ok(outcome)
}

/// Runs one connection from registration until it closes.
///
/// Returns once the connection has been deregistered. The only error is a registry that is no
/// longer running, which means the connection never became active.
pub async fn serve<S>(
    socket: WebSocketStream<S>,
    peer: Option<SocketAddr>,
    registry: Registry,
    config: &RelayConfig,
    shutdown: CancellationToken,
) -> Result<CloseReason, RegistryError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = registry.next_id();
    let mut state = ConnectionState::Connecting;
    trace!(conn = id, ?state, "connection accepted");

    let (handle, outbound) = PeerHandle::new(id, peer, config.outbound_capacity);
    let overrun = handle.overrun_signal();
    let (sink, mut stream) = socket.split();
    let (close_tx, close_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_loop(id, sink, outbound, close_rx, config.ping_interval));

    let registration = match registry.register(handle).await {
        Ok(registration) => registration,
        Err(err) => {
            writer.abort();
            return Err(err);
        }
    };
    state = ConnectionState::Active;
    info!(
        conn = registration.id(),
        ?peer,
        ?state,
        online = registration.online_at_join(),
        "connection active"
    );

    let links = Links {
        writer: &mut writer,
        shutdown: &shutdown,
        overrun: &overrun,
    };
    let reason = relay_loop(id, &registry, &mut stream, links, config.delivery_timeout).await;

    drop(registration);
    state = ConnectionState::Closed;
    log_close(id, peer, state, &reason);

    if !matches!(reason, CloseReason::WriterStopped) {
        let close_frame = match reason {
            CloseReason::Shutdown => Some(CloseFrame {
                code: CloseCode::Away,
                reason: Utf8Bytes::from("server shutting down".to_string()),
            }),
            CloseReason::Overrun => Some(CloseFrame {
                code: CloseCode::Again,
                reason: Utf8Bytes::from("too slow to keep up".to_string()),
            }),
            _ => None,
        };
        let _ = close_tx.send(close_frame);
        finish_writer(id, writer).await;
    }

    Ok(reason)
}

/// Everything besides the socket that can end a connection.
struct Links<'a> {
    writer: &'a mut JoinHandle<()>,
    shutdown: &'a CancellationToken,
    overrun: &'a CancellationToken,
}

async fn relay_loop<S>(
    id: ConnectionId,
    registry: &Registry,
    stream: &mut SplitStream<WebSocketStream<S>>,
    links: Links<'_>,
    delivery_timeout: Duration,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Links {
        writer,
        shutdown,
        overrun,
    } = links;

    loop {
        select! {
            biased;
            _ = shutdown.cancelled() => return CloseReason::Shutdown,
            _ = &mut *writer => return CloseReason::WriterStopped,
            _ = overrun.cancelled() => return CloseReason::Overrun,
            next = stream.next() => {
                let frame = match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => return CloseReason::Transport(err),
                    None => return CloseReason::EndOfStream,
                };

                match classify(frame) {
                    Inbound::Payload(message) => {
                        match fan_out(registry, id, &message, delivery_timeout).await {
                            Ok(outcome) => debug!(
                                conn = id,
                                delivered = outcome.delivered,
                                dropped = outcome.dropped,
                                "relayed message"
                            ),
                            Err(err) => {
                                warn!(conn = id, error = %err, "registry unavailable during fan-out");
                                return CloseReason::RegistryUnavailable;
                            }
                        }
                    }
                    Inbound::Malformed(err) => {
                        warn!(conn = id, error = %err, "dropping malformed payload");
                    }
                    Inbound::Control => {}
                    Inbound::Close(frame) => return CloseReason::PeerClosed(frame),
                }
            }
        }
    }
}

async fn write_loop<S>(
    id: ConnectionId,
    mut sink: SplitSink<WebSocketStream<S>, Frame>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    mut close: oneshot::Receiver<Option<CloseFrame>>,
    ping_interval: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut heartbeat = ping_interval.map(|period| {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        select! {
            biased;
            request = &mut close => {
                if let Ok(Some(frame)) = request {
                    if let Err(err) = sink.send(Frame::Close(Some(frame))).await {
                        trace!(conn = id, error = ?err, "close frame not delivered");
                    }
                }
                break;
            }
            next = outbound.recv() => {
                let Some(text) = next else { break };
                if let Err(err) = sink.send(Frame::Text(text)).await {
                    debug!(conn = id, error = ?err, "failed to deliver message to client");
                    return;
                }
            }
            _ = tick(&mut heartbeat) => {
                if let Err(err) = sink.send(Frame::Ping(Default::default())).await {
                    debug!(conn = id, error = ?err, "heartbeat failed");
                    return;
                }
            }
        }
    }

    if let Err(err) = sink.close().await {
        trace!(conn = id, error = ?err, "socket already closed");
    }
}

async fn tick(heartbeat: &mut Option<time::Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn finish_writer(id: ConnectionId, mut writer: JoinHandle<()>) {
    if time::timeout(WRITER_CLOSE_GRACE, &mut writer).await.is_err() {
        debug!(conn = id, "writer did not finish closing in time");
        writer.abort();
    }
}

fn log_close(
    id: ConnectionId,
    peer: Option<SocketAddr>,
    state: ConnectionState,
    reason: &CloseReason,
) {
    match reason {
        CloseReason::Transport(err) if is_ordinary_disconnect(err) => {
            debug!(conn = id, ?peer, ?state, error = %err, "connection dropped");
        }
        CloseReason::Transport(err) => {
            warn!(conn = id, ?peer, ?state, error = %err, "connection failed");
        }
        reason => debug!(conn = id, ?peer, ?state, ?reason, "connection closed"),
    }
}

fn is_ordinary_disconnect(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Io(_)
            | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}
