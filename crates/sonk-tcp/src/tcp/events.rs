//! Per-event callback slots.
//!
//! The engine delivers into whichever slots are filled; an empty slot costs
//! nothing. Fragment callbacks receive an ephemeral view that must not be
//! retained past the callback's return; registering a packet callback is
//! what turns on whole-packet accumulation.

use std::sync::Arc;

use crate::tcp::connection::TcpConnection;
use crate::tcp::error::TcpError;
use crate::tcp::fragment::Fragment;

pub type FragmentCallback = Arc<dyn Fn(&TcpConnection, &Fragment) + Send + Sync>;
pub type PacketCallback = Arc<dyn Fn(&TcpConnection, Vec<u8>) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;
pub type ReceiveErrorCallback = Arc<dyn Fn(&TcpConnection, &TcpError) + Send + Sync>;
pub type SslErrorCallback = Arc<dyn Fn(&TcpError) + Send + Sync>;

/// Callbacks shared by client- and server-side connections.
#[derive(Clone, Default)]
pub struct ConnectionEvents {
    pub(crate) fragment: Option<FragmentCallback>,
    pub(crate) packet: Option<PacketCallback>,
    pub(crate) disconnected: Option<ConnectionCallback>,
    pub(crate) receive_error: Option<ReceiveErrorCallback>,
    pub(crate) ssl_error: Option<SslErrorCallback>,
}

impl ConnectionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payload window, as it arrives.
    pub fn on_fragment(mut self, f: impl Fn(&TcpConnection, &Fragment) + Send + Sync + 'static) -> Self {
        self.fragment = Some(Arc::new(f));
        self
    }

    /// Completed packets as single contiguous buffers. Registering this
    /// enables whole-packet accumulation.
    pub fn on_packet(mut self, f: impl Fn(&TcpConnection, Vec<u8>) + Send + Sync + 'static) -> Self {
        self.packet = Some(Arc::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn(&TcpConnection) + Send + Sync + 'static) -> Self {
        self.disconnected = Some(Arc::new(f));
        self
    }

    pub fn on_receive_error(
        mut self,
        f: impl Fn(&TcpConnection, &TcpError) + Send + Sync + 'static,
    ) -> Self {
        self.receive_error = Some(Arc::new(f));
        self
    }

    pub fn on_ssl_error(mut self, f: impl Fn(&TcpError) + Send + Sync + 'static) -> Self {
        self.ssl_error = Some(Arc::new(f));
        self
    }
}

/// Server-side callbacks: the shared connection set plus accept-time events.
#[derive(Clone, Default)]
pub struct ServerEvents {
    pub(crate) connection: ConnectionEvents,
    pub(crate) connected: Option<ConnectionCallback>,
    pub(crate) max_clients: Option<ConnectionCallback>,
}

impl ServerEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(mut self, events: ConnectionEvents) -> Self {
        self.connection = events;
        self
    }

    pub fn on_connected(mut self, f: impl Fn(&TcpConnection) + Send + Sync + 'static) -> Self {
        self.connected = Some(Arc::new(f));
        self
    }

    /// Fired for a connection turned away at the client cap; its transport
    /// is closed without registration.
    pub fn on_max_clients_reached(
        mut self,
        f: impl Fn(&TcpConnection) + Send + Sync + 'static,
    ) -> Self {
        self.max_clients = Some(Arc::new(f));
        self
    }
}
