use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{dispatcher, registry::Registry};

pub const DEFAULT_PORT: u16 = 8765;

/// Runtime settings for the relay. `Default` matches the CLI defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Frames buffered per recipient before senders start waiting on it.
    pub outbound_capacity: usize,
    /// How long a sender waits on a full recipient queue before disconnecting that recipient.
    pub delivery_timeout: Duration,
    /// Server-initiated pings; `None` disables the heartbeat.
    pub ping_interval: Option<Duration>,
    pub handshake_timeout: Duration,
    /// How long shutdown waits for connections to close before aborting them.
    pub drain_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            outbound_capacity: 64,
            delivery_timeout: Duration::from_secs(5),
            ping_interval: Some(Duration::from_secs(30)),
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    registry: Registry,
    config: Arc<RelayConfig>,
}

impl Relay {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    /// Wraps an already bound listener. Must be called inside a tokio runtime.
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let (registry, _actor) = Registry::spawn();
        Self {
            listener,
            registry,
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the live connection set, mainly for observing membership.
    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Accepts connections until `shutdown` resolves, then closes every connection and waits
    /// for them to deregister.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            registry,
            config,
        } = self;
        let token = CancellationToken::new();
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &mut connections, &registry, &config, &token);
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_task_exit(joined);
                }
            }
        }

        drop(listener);
        token.cancel();
        drain_connections(connections, config.drain_timeout).await;

        match registry.count().await {
            Ok(0) => debug!("all connections deregistered"),
            Ok(remaining) => warn!(remaining, "connections still registered after drain"),
            Err(err) => warn!(error = %err, "registry unavailable after drain"),
        }

        Ok(())
    }

    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    connections: &mut JoinSet<()>,
    registry: &Registry,
    config: &Arc<RelayConfig>,
    token: &CancellationToken,
) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, connections, registry, config, token),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connections: &mut JoinSet<()>,
    registry: &Registry,
    config: &Arc<RelayConfig>,
    token: &CancellationToken,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = ?err, "failed to set TCP_NODELAY");
    }

    let registry = registry.clone();
    let config = Arc::clone(config);
    let shutdown = token.child_token();

    connections.spawn(async move {
        let handshake = timeout(
            config.handshake_timeout,
            tokio_tungstenite::accept_async(stream),
        );
        let socket = select! {
            _ = shutdown.cancelled() => return,
            result = handshake => match result {
                Ok(Ok(socket)) => socket,
                Ok(Err(err)) => {
                    debug!(%peer, error = %err, "websocket handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(%peer, "websocket handshake timed out");
                    return;
                }
            },
        };

        if let Err(err) = dispatcher::serve(socket, Some(peer), registry, &config, shutdown).await
        {
            warn!(%peer, error = %err, "connection could not be registered");
        }
    });
}

async fn drain_connections(mut connections: JoinSet<()>, grace: Duration) {
    if connections.is_empty() {
        return;
    }

    info!(open = connections.len(), "waiting for connections to close");
    let drained = timeout(grace, async {
        while let Some(joined) = connections.join_next().await {
            log_task_exit(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "connections did not close in time; aborting"
        );
        connections.shutdown().await;
    }
}

fn log_task_exit(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "connection task panicked");
        } else {
            debug!(error = %err, "connection task cancelled");
        }
    }
}
