//! Accepting side: capped client registry, fan-out, lifecycle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use sonk_core::KeyedMutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsStream};

use crate::tcp::connection::{ConnectionRole, FileSendOptions, TcpConnection};
use crate::tcp::error::{TcpError, TcpResult};
use crate::tcp::events::ServerEvents;
use crate::tcp::stream;
use crate::tcp::tls::{self, ServerCertificate};
use crate::tcp::types::{default_buffer_size, default_max_clients};

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub length_in_one_frame: bool,
    /// Accepted connections beyond this cap are turned away.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Per-connection read timeout in milliseconds; zero or negative
    /// disables.
    #[serde(default)]
    pub idle_timeout_ms: i64,
}

struct ServerInner {
    config: TcpServerConfig,
    events: ServerEvents,
    certificate: Option<ServerCertificate>,
    clients: StdMutex<HashMap<SocketAddr, TcpConnection>>,
    listening: AtomicBool,
    /// Guards start/stop transitions.
    state: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    write_lock: Arc<KeyedMutex>,
}

/// TCP server owning a registry of accepted connections.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn new(config: TcpServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                events: ServerEvents::default(),
                certificate: None,
                clients: StdMutex::new(HashMap::new()),
                listening: AtomicBool::new(false),
                state: tokio::sync::Mutex::new(None),
                local_addr: StdMutex::new(None),
                write_lock: Arc::new(KeyedMutex::new()),
            }),
        }
    }

    /// Register the event callbacks. Call before `start`.
    pub fn events(self, events: ServerEvents) -> Self {
        // Sole handle at build time; the Arc has not been shared yet.
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.events = events;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                log::warn!("[tcp] events() ignored on a shared server handle");
                Self { inner }
            }
        }
    }

    /// Serve TLS with the given certificate. Call before `start`.
    pub fn certificate(self, certificate: ServerCertificate) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.certificate = Some(certificate);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                log::warn!("[tcp] certificate() ignored on a shared server handle");
                Self { inner }
            }
        }
    }

    /// Bind and begin accepting. Idempotent.
    pub async fn start(&self) -> TcpResult<()> {
        let mut state = self.inner.state.lock().await;
        if self.inner.listening.load(Ordering::SeqCst) {
            return Ok(());
        }

        let acceptor = match &self.inner.certificate {
            Some(cert) => Some(tls::build_acceptor(cert)?),
            None => None,
        };

        let addr = format!("{}:{}", self.inner.config.bind_address, self.inner.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TcpError::dial(format!("bind {}: {}", addr, e)))?;
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = listener.local_addr().ok();

        self.inner.listening.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        *state = Some(tokio::spawn(async move {
            accept_loop(inner, listener, acceptor).await;
        }));
        log::info!("[tcp] listening on {}", addr);
        Ok(())
    }

    /// Stop accepting. Existing receive loops run until their streams close.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if !self.inner.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = state.take() {
            task.abort();
        }
        log::info!("[tcp] stopped listening");
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .inner
            .local_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn client_count(&self) -> usize {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn client(&self, peer: SocketAddr) -> Option<TcpConnection> {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .cloned()
    }

    pub fn clients(&self) -> Vec<TcpConnection> {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    // ── Sending ──────────────────────────────────────────────────────

    pub async fn send_to(&self, peer: SocketAddr, payload: &[u8]) -> TcpResult<()> {
        self.require_client(peer)?.send(payload).await
    }

    pub async fn send_file_to(
        &self,
        peer: SocketAddr,
        path: &Path,
        options: &FileSendOptions,
    ) -> TcpResult<u64> {
        self.require_client(peer)?.send_file(path, options).await
    }

    /// Broadcast one packet to every registered client. Iterates a snapshot;
    /// per-connection failures are collected, not fatal.
    pub async fn send_all(&self, payload: &[u8]) -> Vec<(SocketAddr, TcpError)> {
        let mut failures = Vec::new();
        for conn in self.clients() {
            if let Err(e) = conn.send(payload).await {
                log::warn!("[tcp] broadcast to {} failed: {}", conn.peer(), e);
                failures.push((conn.peer(), e));
            }
        }
        failures
    }

    /// Broadcast a file frame to every registered client.
    pub async fn send_all_file(
        &self,
        path: &Path,
        options: &FileSendOptions,
    ) -> Vec<(SocketAddr, TcpError)> {
        let mut failures = Vec::new();
        for conn in self.clients() {
            if let Err(e) = conn.send_file(path, options).await {
                log::warn!("[tcp] file broadcast to {} failed: {}", conn.peer(), e);
                failures.push((conn.peer(), e));
            }
        }
        failures
    }

    // ── Disconnecting ────────────────────────────────────────────────

    pub async fn disconnect_client(&self, peer: SocketAddr) -> bool {
        match self.client(peer) {
            Some(conn) => {
                conn.disconnect().await;
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        for conn in self.clients() {
            conn.disconnect().await;
        }
    }

    fn require_client(&self, peer: SocketAddr) -> TcpResult<TcpConnection> {
        self.client(peer)
            .ok_or_else(|| TcpError::not_connected())
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
    loop {
        if !inner.listening.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept().await {
            Ok((socket, peer)) => {
                socket.set_nodelay(true).ok();
                let inner = inner.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    handle_accept(inner, socket, peer, acceptor).await;
                });
            }
            Err(e) => {
                log::error!("[tcp] accept failed: {}", e);
                break;
            }
        }
    }
}

async fn handle_accept(
    inner: Arc<ServerInner>,
    socket: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    let (reader, writer) = match acceptor {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(tls_stream) => stream::split_tls(TlsStream::from(tls_stream)),
            Err(e) => {
                let err = TcpError::tls(format!("handshake with {}: {}", peer, e));
                log::warn!("[tcp] {}", err);
                if let Some(f) = &inner.events.connection.ssl_error {
                    f(&err);
                }
                return;
            }
        },
        None => stream::split_plain(socket),
    };

    let conn = TcpConnection::new(
        writer,
        peer,
        ConnectionRole::Accepted,
        inner.config.buffer_size,
        inner.config.length_in_one_frame,
        inner.config.idle_timeout_ms,
        inner.events.connection.clone(),
        inner.write_lock.clone(),
    );

    // Cap check and insertion share one critical section, so the registry
    // can never exceed the cap.
    enum Outcome {
        Registered,
        Full,
        Duplicate,
    }
    let outcome = {
        let mut clients = inner.clients.lock().unwrap_or_else(|e| e.into_inner());
        if clients.len() >= inner.config.max_clients {
            Outcome::Full
        } else if clients.contains_key(&peer) {
            Outcome::Duplicate
        } else {
            clients.insert(peer, conn.clone());
            Outcome::Registered
        }
    };

    match outcome {
        Outcome::Full => {
            log::warn!("[tcp] client cap reached, turning away {}", peer);
            if let Some(f) = &inner.events.max_clients {
                f(&conn);
            }
            conn.disconnect().await;
        }
        Outcome::Duplicate => {
            log::warn!("[tcp] duplicate registration for {}", peer);
            conn.disconnect().await;
        }
        Outcome::Registered => {
            log::info!("[tcp] accepted {}", peer);
            if let Some(f) = &inner.events.connected {
                f(&conn);
            }
            let registry = inner.clone();
            conn.start_receive(
                reader,
                Some(Box::new(move |closed: &TcpConnection| {
                    registry
                        .clients
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&closed.peer());
                })),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_apply() {
        let cfg: TcpServerConfig = serde_json::from_str(r#"{"port":5555}"#).unwrap();
        assert_eq!(cfg.bind_address, "0.0.0.0");
        assert_eq!(cfg.buffer_size, 4096);
        assert_eq!(cfg.max_clients, 1024);
        assert_eq!(cfg.idle_timeout_ms, 0);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears() {
        let server = TcpServer::new(TcpServerConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            buffer_size: 256,
            length_in_one_frame: false,
            max_clients: 4,
            idle_timeout_ms: 0,
        });
        server.start().await.unwrap();
        assert!(server.is_listening());
        let addr = server.local_addr().unwrap();
        // Second start must not rebind.
        server.start().await.unwrap();
        assert_eq!(server.local_addr().unwrap(), addr);
        server.stop().await;
        assert!(!server.is_listening());
        server.stop().await;
    }
}
