//! Dialing side of the framing engine.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use sonk_core::KeyedMutex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsStream;

use crate::tcp::connection::{ConnectionRole, FileSendOptions, TcpConnection};
use crate::tcp::error::{TcpError, TcpResult};
use crate::tcp::events::ConnectionEvents;
use crate::tcp::stream;
use crate::tcp::tls::{self, ClientTlsOptions};
use crate::tcp::types::{default_buffer_size, default_connect_timeout};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpClientConfig {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Concatenate header and payload into a single write.
    #[serde(default)]
    pub length_in_one_frame: bool,
    /// Hostname to validate the server certificate against; setting it
    /// turns on TLS.
    #[serde(default)]
    pub ssl_target_host: Option<String>,
    /// Idle timeout in milliseconds; zero or negative disables.
    #[serde(default)]
    pub idle_timeout_ms: i64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
}

/// TCP client owning a single connection at a time.
///
/// After a disconnection, `connect` builds a fresh socket and connection;
/// the defunct one is replaced, never reused.
pub struct TcpClient {
    config: TcpClientConfig,
    events: ConnectionEvents,
    tls_options: ClientTlsOptions,
    conn: StdMutex<Option<TcpConnection>>,
    last_connect_error: StdMutex<Option<TcpError>>,
    write_lock: Arc<KeyedMutex>,
}

impl TcpClient {
    pub fn new(config: TcpClientConfig) -> Self {
        Self {
            config,
            events: ConnectionEvents::default(),
            tls_options: ClientTlsOptions::default(),
            conn: StdMutex::new(None),
            last_connect_error: StdMutex::new(None),
            write_lock: Arc::new(KeyedMutex::new()),
        }
    }

    /// Register the event callbacks. Applies to connections made afterwards.
    pub fn events(mut self, events: ConnectionEvents) -> Self {
        self.events = events;
        self
    }

    pub fn tls_options(mut self, options: ClientTlsOptions) -> Self {
        self.tls_options = options;
        self
    }

    /// Dial, optionally upgrade to TLS, and start the framing engine.
    ///
    /// Returns whether the connection came up; on failure the cause is
    /// retained on [`last_connect_error`](Self::last_connect_error).
    pub async fn connect(&self) -> bool {
        // A fresh connect replaces whatever connection came before it.
        if let Some(old) = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take() {
            old.disconnect().await;
        }

        match self.dial().await {
            Ok(conn) => {
                *self.conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn);
                *self
                    .last_connect_error
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = None;
                true
            }
            Err(e) => {
                log::warn!(
                    "[tcp] connect to {}:{} failed: {}",
                    self.config.address,
                    self.config.port,
                    e
                );
                if e.kind == crate::tcp::error::TcpErrorKind::Tls {
                    if let Some(f) = &self.events.ssl_error {
                        f(&e);
                    }
                }
                *self
                    .last_connect_error
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(e);
                false
            }
        }
    }

    async fn dial(&self) -> TcpResult<TcpConnection> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        let dur = Duration::from_secs(self.config.connect_timeout_sec);
        let tcp = timeout(dur, TcpStream::connect(&addr))
            .await
            .map_err(|_| TcpError::dial(format!("connect to {} timed out", addr)))?
            .map_err(|e| TcpError::dial(format!("connect to {}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();
        let peer = tcp
            .peer_addr()
            .map_err(|e| TcpError::dial(format!("peer address: {}", e)))?;

        let (reader, writer) = match &self.config.ssl_target_host {
            Some(host) => {
                let connector = tls::build_client_connector(&self.tls_options)?;
                let name = ServerName::try_from(host.clone())
                    .map_err(|e| TcpError::tls(format!("bad TLS target host: {}", e)))?;
                let tls_stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| TcpError::tls(format!("handshake with {}: {}", host, e)))?;
                stream::split_tls(TlsStream::from(tls_stream))
            }
            None => stream::split_plain(tcp),
        };

        let conn = TcpConnection::new(
            writer,
            peer,
            ConnectionRole::Dialed,
            self.config.buffer_size,
            self.config.length_in_one_frame,
            self.config.idle_timeout_ms,
            self.events.clone(),
            self.write_lock.clone(),
        );
        conn.start_receive(reader, None);
        log::info!("[tcp] connected to {}", peer);
        Ok(conn)
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<TcpConnection> {
        self.conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|c| c.is_connected())
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    pub fn last_connect_error(&self) -> Option<TcpError> {
        self.last_connect_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Send one 32-bit length-prefixed packet.
    pub async fn send(&self, payload: &[u8]) -> TcpResult<()> {
        self.require_connection()?.send(payload).await
    }

    /// Send bytes without a length prefix.
    pub async fn send_raw(&self, payload: &[u8]) -> TcpResult<()> {
        self.require_connection()?.send_raw(payload).await
    }

    /// Stream a file; see [`TcpConnection::send_file`].
    pub async fn send_file(
        &self,
        path: &std::path::Path,
        options: &FileSendOptions,
    ) -> TcpResult<u64> {
        self.require_connection()?.send_file(path, options).await
    }

    /// Idempotent.
    pub async fn disconnect(&self) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(conn) = conn {
            conn.disconnect().await;
        }
    }

    fn require_connection(&self) -> TcpResult<TcpConnection> {
        self.connection().ok_or_else(TcpError::not_connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_apply() {
        let cfg: TcpClientConfig =
            serde_json::from_str(r#"{"address":"127.0.0.1","port":5555}"#).unwrap();
        assert_eq!(cfg.buffer_size, 4096);
        assert!(!cfg.length_in_one_frame);
        assert!(cfg.ssl_target_host.is_none());
        assert_eq!(cfg.idle_timeout_ms, 0);
        assert_eq!(cfg.connect_timeout_sec, 15);
    }

    #[tokio::test]
    async fn failed_connect_retains_cause() {
        let client = TcpClient::new(TcpClientConfig {
            address: "127.0.0.1".into(),
            // Reserved port nothing listens on.
            port: 1,
            buffer_size: 64,
            length_in_one_frame: false,
            ssl_target_host: None,
            idle_timeout_ms: 0,
            connect_timeout_sec: 2,
        });
        assert!(!client.connect().await);
        let err = client.last_connect_error().expect("cause retained");
        assert_eq!(err.kind, crate::tcp::error::TcpErrorKind::Dial);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn send_without_connection_errors() {
        let client = TcpClient::new(TcpClientConfig {
            address: "127.0.0.1".into(),
            port: 1,
            buffer_size: 64,
            length_in_one_frame: false,
            ssl_target_host: None,
            idle_timeout_ms: 0,
            connect_timeout_sec: 1,
        });
        let err = client.send(b"nope").await.unwrap_err();
        assert_eq!(err.kind, crate::tcp::error::TcpErrorKind::NotConnected);
    }
}
