//! Single-instance coordinator.
//!
//! On construction the coordinator probes loopback:port. If nothing
//! answers within the deadline this process is the single instance and
//! starts listening; otherwise it forwards its argument vector to the
//! running peer and reports `is_single = false`.
//!
//! Wire protocol (32-bit framed throughout): one packet carrying a 4-byte
//! little-endian argument count, then exactly that many packets each
//! holding one UTF-16LE string.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sonk_tcp::{
    ConnectionEvents, ServerEvents, TcpClient, TcpClientConfig, TcpServer, TcpServerConfig,
    TcpResult,
};
use tokio::time::timeout;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleInstanceConfig {
    pub port: u16,
    /// Overall deadline for the probe connect.
    #[serde(default = "default_try_timeout")]
    pub try_timeout_ms: u64,
    /// Read timeout applied to peers of the listening side.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: i64,
}

fn default_try_timeout() -> u64 {
    1500
}

fn default_read_timeout() -> i64 {
    5000
}

/// Per-peer protocol state, carried on the connection tag.
struct InstanceInfo {
    /// Argument count announced by the first packet; -1 until it arrives.
    expected: i32,
    received: Vec<String>,
}

pub type ArgumentsCallback = Arc<dyn Fn(Vec<String>) + Send + Sync>;

pub struct SingleInstance {
    is_single: bool,
    server: Option<TcpServer>,
}

impl SingleInstance {
    /// Probe, then either start listening (single) or forward `args` to the
    /// running peer and disconnect.
    pub async fn start(
        config: SingleInstanceConfig,
        args: &[String],
        on_arguments: impl Fn(Vec<String>) + Send + Sync + 'static,
    ) -> TcpResult<Self> {
        let client = TcpClient::new(TcpClientConfig {
            address: "127.0.0.1".into(),
            port: config.port,
            buffer_size: 4096,
            length_in_one_frame: false,
            ssl_target_host: None,
            idle_timeout_ms: 0,
            connect_timeout_sec: (config.try_timeout_ms / 1000).max(1),
        });

        let deadline = Duration::from_millis(config.try_timeout_ms);
        let is_single = match timeout(deadline, client.connect()).await {
            // Deadline elapsed: nothing accepted the probe.
            Err(_) => true,
            Ok(connected) => !connected,
        };

        if is_single {
            log::info!("[instance] no peer on port {}, listening", config.port);
            let server = listen(&config, Arc::new(on_arguments)).await?;
            Ok(Self {
                is_single: true,
                server: Some(server),
            })
        } else {
            log::info!(
                "[instance] peer already on port {}, forwarding {} argument(s)",
                config.port,
                args.len()
            );
            forward_arguments(&client, args).await;
            client.disconnect().await;
            Ok(Self {
                is_single: false,
                server: None,
            })
        }
    }

    /// Whether this process holds the exclusive role.
    pub fn is_single(&self) -> bool {
        self.is_single
    }

    /// Stop both sides.
    pub async fn shutdown(&self) {
        if let Some(server) = &self.server {
            server.disconnect_all().await;
            server.stop().await;
        }
    }
}

async fn listen(
    config: &SingleInstanceConfig,
    on_arguments: ArgumentsCallback,
) -> TcpResult<TcpServer> {
    let server = TcpServer::new(TcpServerConfig {
        bind_address: "127.0.0.1".into(),
        port: config.port,
        buffer_size: 4096,
        length_in_one_frame: false,
        max_clients: 64,
        idle_timeout_ms: config.read_timeout_ms,
    })
    .events(
        ServerEvents::new()
            .on_connected(|conn| {
                conn.with_tag(|tag| {
                    *tag = Some(Box::new(InstanceInfo {
                        expected: -1,
                        received: Vec::new(),
                    }));
                });
            })
            .with_connection(ConnectionEvents::new().on_packet(move |conn, payload| {
                let complete = conn.with_tag(|tag| {
                    let info = tag
                        .as_mut()
                        .and_then(|t| t.downcast_mut::<InstanceInfo>())?;
                    if info.expected < 0 {
                        if payload.len() < 4 {
                            log::warn!("[instance] malformed count packet from {}", conn.peer());
                            return None;
                        }
                        let mut raw = [0u8; 4];
                        raw.copy_from_slice(&payload[..4]);
                        info.expected = i32::from_le_bytes(raw);
                    } else {
                        info.received.push(decode_utf16le(&payload));
                    }
                    if info.expected >= 0 && info.received.len() == info.expected as usize {
                        Some(std::mem::take(&mut info.received))
                    } else {
                        None
                    }
                });

                if let Some(arguments) = complete {
                    on_arguments(arguments);
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        conn.disconnect().await;
                    });
                }
            })),
    );
    server.start().await?;
    Ok(server)
}

/// Count packet first, then one packet per argument.
async fn forward_arguments(client: &TcpClient, args: &[String]) {
    let count = (args.len() as i32).to_le_bytes();
    if let Err(e) = client.send(&count).await {
        log::warn!("[instance] failed to send argument count: {}", e);
        return;
    }
    for arg in args {
        if let Err(e) = client.send(&encode_utf16le(arg)).await {
            log::warn!("[instance] failed to forward argument: {}", e);
            return;
        }
    }
}

fn encode_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    #[test]
    fn utf16le_roundtrip() {
        for s in ["", "plain", "späße", "数据", "mixed 字 and ascii"] {
            assert_eq!(decode_utf16le(&encode_utf16le(s)), s);
        }
    }

    #[test]
    fn config_defaults() {
        let cfg: SingleInstanceConfig = serde_json::from_str(r#"{"port":46123}"#).unwrap();
        assert_eq!(cfg.try_timeout_ms, 1500);
        assert_eq!(cfg.read_timeout_ms, 5000);
    }

    /// Grab a port that is currently free on loopback.
    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn first_instance_is_single_and_receives_arguments() {
        let port = free_port().await;
        let config = SingleInstanceConfig {
            port,
            try_timeout_ms: 800,
            read_timeout_ms: 5000,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();
        let first = SingleInstance::start(config.clone(), &[], move |arguments| {
            let _ = tx.send(arguments);
        })
        .await
        .unwrap();
        assert!(first.is_single());

        let args = vec!["open".to_string(), "C:\\files\\läuft.txt".to_string()];
        let second = SingleInstance::start(config, &args, |_| {}).await.unwrap();
        assert!(!second.is_single());

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("arguments never arrived")
            .unwrap();
        assert_eq!(received, args);

        first.shutdown().await;
    }

    #[tokio::test]
    async fn zero_arguments_still_fire() {
        let port = free_port().await;
        let config = SingleInstanceConfig {
            port,
            try_timeout_ms: 800,
            read_timeout_ms: 5000,
        };

        let fired = Arc::new(StdMutex::new(None::<usize>));
        let sink = fired.clone();
        let first = SingleInstance::start(config.clone(), &[], move |arguments| {
            *sink.lock().unwrap() = Some(arguments.len());
        })
        .await
        .unwrap();
        assert!(first.is_single());

        let second = SingleInstance::start(config, &[], |_| {}).await.unwrap();
        assert!(!second.is_single());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*fired.lock().unwrap(), Some(0));
        first.shutdown().await;
    }
}
