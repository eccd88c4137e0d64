//! Datagram handler: one socket, one optional receive loop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Receive buffer covering the practical datagram maximum.
const RECV_BUFFER: usize = 65536;

#[derive(Debug, Clone)]
pub struct UdpError {
    pub kind: UdpErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpErrorKind {
    Bind,
    Send,
    /// The socket was disposed by `listen(false)`.
    Disposed,
}

pub type UdpResult<T> = Result<T, UdpError>;

impl UdpError {
    fn bind(msg: impl Into<String>) -> Self {
        Self {
            kind: UdpErrorKind::Bind,
            message: msg.into(),
        }
    }

    fn send(msg: impl Into<String>) -> Self {
        Self {
            kind: UdpErrorKind::Send,
            message: msg.into(),
        }
    }

    fn disposed() -> Self {
        Self {
            kind: UdpErrorKind::Disposed,
            message: "socket disposed".into(),
        }
    }
}

impl fmt::Display for UdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[UDP {:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for UdpError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpHandlerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// One received datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

type ReceivedCallback = Arc<dyn Fn(Datagram) + Send + Sync>;

struct UdpInner {
    config: UdpHandlerConfig,
    socket: StdMutex<Option<Arc<UdpSocket>>>,
    /// Set by `listen(false)`; sends fail until the socket is re-opened.
    disposed: AtomicBool,
    listening: AtomicBool,
    task: StdMutex<Option<JoinHandle<()>>>,
    on_received: StdMutex<Option<ReceivedCallback>>,
}

/// Datagram handler bound to one local endpoint.
#[derive(Clone)]
pub struct UdpHandler {
    inner: Arc<UdpInner>,
}

impl UdpHandler {
    pub fn new(config: UdpHandlerConfig) -> Self {
        Self {
            inner: Arc::new(UdpInner {
                config,
                socket: StdMutex::new(None),
                disposed: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                task: StdMutex::new(None),
                on_received: StdMutex::new(None),
            }),
        }
    }

    pub fn on_received(&self, f: impl Fn(Datagram) + Send + Sync + 'static) {
        *self
            .inner
            .on_received
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(f));
    }

    /// Send one datagram. `length` caps how much of `payload` goes out;
    /// anything beyond it is cut off.
    pub async fn send(
        &self,
        payload: &[u8],
        to: SocketAddr,
        length: Option<usize>,
    ) -> UdpResult<usize> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(UdpError::disposed());
        }
        let take = length.unwrap_or(payload.len()).min(payload.len());
        let socket = self.ensure_socket().await?;
        socket
            .send_to(&payload[..take], to)
            .await
            .map_err(|e| UdpError::send(format!("send to {}: {}", to, e)))
    }

    /// Start or stop the receive loop. Idempotent per state. Disabling
    /// disposes the socket; re-enabling opens a fresh one on the same
    /// endpoint.
    pub async fn listen(&self, enable: bool) -> UdpResult<()> {
        if enable {
            self.inner.disposed.store(false, Ordering::SeqCst);
            if self.inner.listening.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let socket = match self.ensure_socket().await {
                Ok(s) => s,
                Err(e) => {
                    self.inner.listening.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            };
            let inner = self.inner.clone();
            let handle = tokio::spawn(async move {
                receive_loop(inner, socket).await;
            });
            *self.inner.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            Ok(())
        } else {
            if !self.inner.listening.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(task) = self.inner.task.lock().unwrap_or_else(|e| e.into_inner()).take()
            {
                task.abort();
            }
            self.dispose();
            Ok(())
        }
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// The bound address, once the socket exists.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner
            .socket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    async fn ensure_socket(&self) -> UdpResult<Arc<UdpSocket>> {
        {
            let socket = self.inner.socket.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(socket) = socket.as_ref() {
                return Ok(socket.clone());
            }
        }
        let addr = format!(
            "{}:{}",
            self.inner.config.bind_address, self.inner.config.port
        );
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| UdpError::bind(format!("bind {}: {}", addr, e)))?;
        let socket = Arc::new(socket);
        let mut slot = self.inner.socket.lock().unwrap_or_else(|e| e.into_inner());
        // Someone else may have bound concurrently; keep the first.
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        *slot = Some(socket.clone());
        Ok(socket)
    }
}

async fn receive_loop(inner: Arc<UdpInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let callback = inner
                    .on_received
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(f) = callback {
                    f(Datagram {
                        data: buf[..n].to_vec(),
                        from,
                    });
                }
            }
            Err(e) => {
                // Terminal for the loop; dispose so the state is explicit.
                log::error!("[udp] receive failed: {}", e);
                inner.listening.store(false, Ordering::SeqCst);
                inner.disposed.store(true, Ordering::SeqCst);
                inner
                    .socket
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn loopback(port: u16) -> UdpHandlerConfig {
        UdpHandlerConfig {
            bind_address: "127.0.0.1".into(),
            port,
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Datagram>) -> Datagram {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for datagram")
            .expect("channel closed")
    }

    #[test]
    fn config_defaults() {
        let cfg: UdpHandlerConfig = serde_json::from_str(r#"{"port":9}"#).unwrap();
        assert_eq!(cfg.bind_address, "0.0.0.0");
    }

    #[tokio::test]
    async fn send_and_receive_roundtrip() {
        let receiver = UdpHandler::new(loopback(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.on_received(move |d| {
            let _ = tx.send(d);
        });
        receiver.listen(true).await.unwrap();
        let to = receiver.local_addr().unwrap();

        let sender = UdpHandler::new(loopback(0));
        let sent = sender.send(b"ping", to, None).await.unwrap();
        assert_eq!(sent, 4);

        let datagram = recv(&mut rx).await;
        assert_eq!(datagram.data, b"ping");

        receiver.listen(false).await.unwrap();
    }

    #[tokio::test]
    async fn length_caps_the_payload() {
        let receiver = UdpHandler::new(loopback(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.on_received(move |d| {
            let _ = tx.send(d);
        });
        receiver.listen(true).await.unwrap();
        let to = receiver.local_addr().unwrap();

        let sender = UdpHandler::new(loopback(0));
        let sent = sender.send(b"truncate-me", to, Some(8)).await.unwrap();
        assert_eq!(sent, 8);
        assert_eq!(recv(&mut rx).await.data, b"truncate".to_vec());

        receiver.listen(false).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_socket_rejects_sends_until_reopened() {
        let handler = UdpHandler::new(loopback(0));
        handler.listen(true).await.unwrap();
        let to = handler.local_addr().unwrap();
        handler.listen(false).await.unwrap();
        assert!(!handler.is_listening());

        let err = handler.send(b"x", to, None).await.unwrap_err();
        assert_eq!(err.kind, UdpErrorKind::Disposed);

        // Re-enabling opens a fresh socket on the same endpoint config.
        handler.listen(true).await.unwrap();
        assert!(handler.is_listening());
        let to = handler.local_addr().unwrap();
        handler.send(b"x", to, None).await.unwrap();
        handler.listen(false).await.unwrap();
    }

    #[tokio::test]
    async fn listen_is_idempotent_per_state() {
        let handler = UdpHandler::new(loopback(0));
        handler.listen(true).await.unwrap();
        handler.listen(true).await.unwrap();
        assert!(handler.is_listening());
        handler.listen(false).await.unwrap();
        handler.listen(false).await.unwrap();
        assert!(!handler.is_listening());
    }
}
