//! Connection handle, receive loop, and send paths.
//!
//! Each connection owns one recycled fragment and one split stream: the
//! read half lives inside the spawned receive loop, the write half sits
//! behind a mutex and every logical send additionally holds the
//! connection's key in the shared [`KeyedMutex`], so a send's header and
//! payload can never interleave with another sender's frames.

use std::any::Any;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use sonk_core::KeyedMutex;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::tcp::error::{TcpError, TcpResult};
use crate::tcp::events::ConnectionEvents;
use crate::tcp::fragment::{Delivery, Framer};
use crate::tcp::stream::{StreamReader, StreamWriter};
use crate::tcp::timer::IdleTimer;

/// How this connection came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We dialed out.
    Dialed,
    /// A server accepted it.
    Accepted,
}

/// Knobs for a file send.
#[derive(Default)]
pub struct FileSendOptions {
    /// Prefix the body with a 64-bit length header. The receiving side must
    /// arm `read_next_as_long` before the frame arrives.
    pub length_prefixed: bool,
    /// Extra bytes around the file body, understood by the cooperating peer.
    pub pre_buffer: Option<Vec<u8>>,
    pub post_buffer: Option<Vec<u8>>,
    /// Whether the pre-buffer goes before the length header or between the
    /// header and the body.
    pub pre_buffer_before_length: bool,
}

impl FileSendOptions {
    pub fn length_prefixed() -> Self {
        Self {
            length_prefixed: true,
            ..Self::default()
        }
    }
}

pub(crate) struct ConnectionInner {
    peer: SocketAddr,
    role: ConnectionRole,
    writer: Mutex<StreamWriter>,
    write_lock: Arc<KeyedMutex>,
    write_key: String,
    connected: AtomicBool,
    disconnect_reported: AtomicBool,
    read_next_as_long: AtomicBool,
    read_next_not_buffered: AtomicBool,
    length_in_one_frame: bool,
    buffer_size: usize,
    idle: IdleTimer,
    tag: StdMutex<Option<Box<dyn Any + Send>>>,
    events: ConnectionEvents,
}

/// Cloneable handle to a live connection.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<ConnectionInner>,
}

impl TcpConnection {
    pub(crate) fn new(
        writer: StreamWriter,
        peer: SocketAddr,
        role: ConnectionRole,
        buffer_size: usize,
        length_in_one_frame: bool,
        idle_timeout_ms: i64,
        events: ConnectionEvents,
        write_lock: Arc<KeyedMutex>,
    ) -> Self {
        let inner = Arc::new(ConnectionInner {
            peer,
            role,
            writer: Mutex::new(writer),
            write_lock,
            write_key: peer.to_string(),
            connected: AtomicBool::new(true),
            disconnect_reported: AtomicBool::new(false),
            read_next_as_long: AtomicBool::new(false),
            read_next_not_buffered: AtomicBool::new(false),
            length_in_one_frame,
            buffer_size: buffer_size.max(1),
            idle: IdleTimer::new(idle_timeout_ms),
            tag: StdMutex::new(None),
            events,
        });

        let weak = Arc::downgrade(&inner);
        inner.idle.set_action(move || {
            if let Some(strong) = weak.upgrade() {
                if strong.connected.load(Ordering::SeqCst) {
                    let conn = TcpConnection { inner: strong };
                    log::warn!("[tcp:{}] idle timeout, disconnecting", conn.inner.write_key);
                    tokio::spawn(async move {
                        conn.disconnect().await;
                    });
                }
            }
        });

        Self { inner }
    }

    /// Spawn the receive loop. Called once, after the owner has registered
    /// the connection wherever it needs to be visible.
    pub(crate) fn start_receive(
        &self,
        reader: StreamReader,
        on_closed: Option<Box<dyn FnOnce(&TcpConnection) + Send>>,
    ) {
        let conn = self.clone();
        tokio::spawn(async move {
            read_loop(conn, reader, on_closed).await;
        });
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn role(&self) -> ConnectionRole {
        self.inner.role
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    // ── Per-packet arming ────────────────────────────────────────────

    /// The next packet's header is 64-bit. Resets once that header has been
    /// consumed.
    pub fn set_read_next_as_long(&self, value: bool) {
        self.inner.read_next_as_long.store(value, Ordering::SeqCst);
    }

    /// Suppress whole-packet accumulation for the next starting packet.
    pub fn set_read_next_not_buffered(&self, value: bool) {
        self.inner
            .read_next_not_buffered
            .store(value, Ordering::SeqCst);
    }

    /// Idle timeout in milliseconds; zero or negative disables.
    pub fn set_idle_timeout(&self, interval_ms: i64) {
        self.inner.idle.set_interval(interval_ms);
    }

    /// Access the caller-owned tag slot.
    pub fn with_tag<R>(&self, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> R {
        f(&mut self.inner.tag.lock().unwrap_or_else(|e| e.into_inner()))
    }

    // ── Send paths ───────────────────────────────────────────────────

    /// Send one 32-bit length-prefixed packet.
    pub async fn send(&self, payload: &[u8]) -> TcpResult<()> {
        self.ensure_connected()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| TcpError::framing("payload exceeds the 32-bit frame limit"))?;

        let _key = self.inner.write_lock.lock(&self.inner.write_key).await;
        let mut writer = self.inner.writer.lock().await;
        if self.inner.length_in_one_frame {
            let mut wire = Vec::with_capacity(4 + payload.len());
            wire.extend_from_slice(&len.to_be_bytes());
            wire.extend_from_slice(payload);
            writer.write_all(&wire).await?;
        } else {
            writer.write_all(&len.to_be_bytes()).await?;
            writer.write_all(payload).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Send bytes without a length prefix.
    pub async fn send_raw(&self, payload: &[u8]) -> TcpResult<()> {
        self.ensure_connected()?;
        let _key = self.inner.write_lock.lock(&self.inner.write_key).await;
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Stream a file, optionally 64-bit length-prefixed and wrapped in
    /// pre/post buffers. Returns the number of body bytes sent.
    pub async fn send_file(&self, path: &Path, options: &FileSendOptions) -> TcpResult<u64> {
        self.ensure_connected()?;
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TcpError::io(format!("open {}: {}", path.display(), e)))?;
        let file_len = file
            .metadata()
            .await
            .map_err(|e| TcpError::io(format!("stat {}: {}", path.display(), e)))?
            .len();

        let _key = self.inner.write_lock.lock(&self.inner.write_key).await;
        let mut writer = self.inner.writer.lock().await;

        if options.pre_buffer_before_length {
            if let Some(pre) = &options.pre_buffer {
                writer.write_all(pre).await?;
            }
        }
        if options.length_prefixed {
            writer.write_all(&file_len.to_be_bytes()).await?;
        }
        if !options.pre_buffer_before_length {
            if let Some(pre) = &options.pre_buffer {
                writer.write_all(pre).await?;
            }
        }

        let mut buf = vec![0u8; self.inner.buffer_size];
        let mut sent = 0u64;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| TcpError::io(format!("read {}: {}", path.display(), e)))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            sent += n as u64;
        }

        if let Some(post) = &options.post_buffer {
            writer.write_all(post).await?;
        }
        writer.flush().await?;
        Ok(sent)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Shut down the send side and let the receive loop observe
    /// end-of-stream naturally. Idempotent; the disconnection event fires
    /// exactly once across all paths.
    pub async fn disconnect(&self) {
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        self.inner.idle.pause();
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if was_connected {
            log::debug!("[tcp:{}] disconnected", self.inner.write_key);
        }
        self.report_disconnect();
    }

    fn ensure_connected(&self) -> TcpResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TcpError::not_connected())
        }
    }

    fn report_disconnect(&self) {
        if !self.inner.disconnect_reported.swap(true, Ordering::SeqCst) {
            if let Some(f) = &self.inner.events.disconnected {
                f(self);
            }
        }
    }
}

async fn read_loop(
    conn: TcpConnection,
    mut reader: StreamReader,
    on_closed: Option<Box<dyn FnOnce(&TcpConnection) + Send>>,
) {
    let mut framer = Framer::new(conn.inner.buffer_size);
    let mut failure: Option<TcpError> = None;

    while conn.inner.connected.load(Ordering::SeqCst) {
        // The timer runs while we wait for bytes and is retired as soon as
        // the read returns, so it measures idleness on the wire rather than
        // time spent in callbacks.
        conn.inner.idle.resume();
        let result = reader.read(framer.read_buffer()).await;
        conn.inner.idle.pause();

        match result {
            Ok(0) => break,
            Ok(n) => {
                let collect = conn.inner.events.packet.is_some();
                let fed = framer.feed(
                    n,
                    &conn.inner.read_next_as_long,
                    &conn.inner.read_next_not_buffered,
                    collect,
                    &mut |delivery| match delivery {
                        Delivery::Fragment(frag) => {
                            if let Some(f) = &conn.inner.events.fragment {
                                f(&conn, frag);
                            }
                        }
                        Delivery::Packet(payload) => {
                            if let Some(f) = &conn.inner.events.packet {
                                f(&conn, payload);
                            }
                        }
                    },
                );
                if let Err(e) = fed {
                    failure = Some(e);
                    break;
                }
            }
            Err(e) => {
                // Our own disconnect tears the stream down underneath the
                // pending read; that is not a receive error.
                if conn.inner.connected.load(Ordering::SeqCst) {
                    failure = Some(TcpError::receive(e.to_string()));
                }
                break;
            }
        }
    }

    conn.inner.idle.pause();
    if let Some(e) = &failure {
        log::error!("[tcp:{}] {}", conn.inner.write_key, e);
        if let Some(f) = &conn.inner.events.receive_error {
            f(&conn, e);
        }
    }
    conn.disconnect().await;
    if let Some(hook) = on_closed {
        hook(&conn);
    }
}
