use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::RangedU64ValueParser};

use crate::server::{DEFAULT_PORT, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, forwarding every JSON message to all other connected clients.
    Serve(ServeArgs),
    /// Connect to a relay and exchange messages from the terminal.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Interface to bind.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Messages buffered per client before senders have to wait for it.
    #[arg(long, default_value_t = 64, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub outbound_capacity: usize,

    /// Milliseconds a full client queue may hold up a sender before that client is disconnected.
    #[arg(long, default_value_t = 5_000, value_parser = RangedU64ValueParser::<u64>::new().range(1..))]
    pub delivery_timeout_ms: u64,

    /// Seconds between server pings. 0 disables the heartbeat.
    #[arg(long, default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Seconds a new connection has to complete the WebSocket handshake.
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Seconds to wait for connections to close on shutdown.
    #[arg(long, default_value_t = 5)]
    pub drain_timeout_secs: u64,
}

impl ServeArgs {
    pub fn to_config(&self) -> RelayConfig {
        RelayConfig {
            listen: SocketAddr::new(self.host, self.port),
            outbound_capacity: self.outbound_capacity,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            ping_interval: (self.ping_interval_secs > 0)
                .then(|| Duration::from_secs(self.ping_interval_secs)),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// WebSocket URL of the relay.
    #[arg(long, default_value = "ws://127.0.0.1:8765")]
    pub url: String,
}
