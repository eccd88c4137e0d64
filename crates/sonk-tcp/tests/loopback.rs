//! Loopback end-to-end coverage for the framing engine.

use std::io::Write;
use std::time::Duration;

use sonk_tcp::{
    ConnectionEvents, FileSendOptions, ServerEvents, TcpClient, TcpClientConfig, TcpServer,
    TcpServerConfig,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn server_config(port: u16) -> TcpServerConfig {
    TcpServerConfig {
        bind_address: "127.0.0.1".into(),
        port,
        buffer_size: 256,
        length_in_one_frame: false,
        max_clients: 16,
        idle_timeout_ms: 0,
    }
}

fn client_config(port: u16) -> TcpClientConfig {
    TcpClientConfig {
        address: "127.0.0.1".into(),
        port,
        buffer_size: 256,
        length_in_one_frame: false,
        ssl_target_host: None,
        idle_timeout_ms: 0,
        connect_timeout_sec: 5,
    }
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn frame32(payload: &[u8]) -> Vec<u8> {
    let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
    wire.extend_from_slice(payload);
    wire
}

#[tokio::test]
async fn echo_roundtrip() {
    let (srv_tx, mut srv_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let server = TcpServer::new(server_config(0)).events(
        ServerEvents::new().with_connection(
            ConnectionEvents::new().on_packet(move |_, payload| {
                let _ = srv_tx.send(payload);
            }),
        ),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let (cli_tx, mut cli_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let client = TcpClient::new(client_config(port)).events(
        ConnectionEvents::new().on_packet(move |_, payload| {
            let _ = cli_tx.send(payload);
        }),
    );
    assert!(client.connect().await);

    client.send(b"HELLOWORLD").await.unwrap();
    assert_eq!(recv(&mut srv_rx).await, b"HELLOWORLD".to_vec());

    let failures = server.send_all(b"Hello World!").await;
    assert!(failures.is_empty());
    assert_eq!(recv(&mut cli_rx).await, b"Hello World!".to_vec());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn header_split_across_transport_reads() {
    let (srv_tx, mut srv_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let server = TcpServer::new(server_config(0)).events(
        ServerEvents::new().with_connection(
            ConnectionEvents::new().on_packet(move |_, payload| {
                let _ = srv_tx.send(payload);
            }),
        ),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TcpClient::new(client_config(port));
    assert!(client.connect().await);

    // 4-byte payload with the header split 2+2 across two writes.
    let wire = frame32(b"ABCD");
    client.send_raw(&wire[..2]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send_raw(&wire[2..]).await.unwrap();

    assert_eq!(recv(&mut srv_rx).await, b"ABCD".to_vec());
    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn two_packets_in_one_read() {
    let (srv_tx, mut srv_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let server = TcpServer::new(server_config(0)).events(
        ServerEvents::new().with_connection(
            ConnectionEvents::new().on_packet(move |_, payload| {
                let _ = srv_tx.send(payload);
            }),
        ),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TcpClient::new(client_config(port));
    assert!(client.connect().await);

    let mut wire = frame32(b"AAAA");
    wire.extend_from_slice(&frame32(b"BBBB"));
    client.send_raw(&wire).await.unwrap();

    assert_eq!(recv(&mut srv_rx).await, b"AAAA".to_vec());
    assert_eq!(recv(&mut srv_rx).await, b"BBBB".to_vec());
    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn file_transfer_with_long_header() {
    let (srv_tx, mut srv_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let server = TcpServer::new(server_config(0)).events(
        ServerEvents::new()
            .on_connected(|conn| {
                // The sender uses a 64-bit header for files.
                conn.set_read_next_as_long(true);
            })
            .with_connection(ConnectionEvents::new().on_packet(move |_, payload| {
                let _ = srv_tx.send(payload);
            })),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"ninebytes").unwrap();
    file.flush().unwrap();

    let client = TcpClient::new(client_config(port));
    assert!(client.connect().await);

    let sent = client
        .send_file(file.path(), &FileSendOptions::length_prefixed())
        .await
        .unwrap();
    assert_eq!(sent, 9);
    assert_eq!(recv(&mut srv_rx).await, b"ninebytes".to_vec());

    // The long-header arming was a one-shot; a plain packet follows fine.
    client.send(b"plain").await.unwrap();
    assert_eq!(recv(&mut srv_rx).await, b"plain".to_vec());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn single_frame_sends_decode_identically() {
    let (srv_tx, mut srv_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let server = TcpServer::new(server_config(0)).events(
        ServerEvents::new().with_connection(
            ConnectionEvents::new().on_packet(move |_, payload| {
                let _ = srv_tx.send(payload);
            }),
        ),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    // Header and payload coalesced into one write on the sender side must be
    // indistinguishable to the receiver.
    let mut config = client_config(port);
    config.length_in_one_frame = true;
    let client = TcpClient::new(config);
    assert!(client.connect().await);

    client.send(b"coalesced").await.unwrap();
    assert_eq!(recv(&mut srv_rx).await, b"coalesced".to_vec());

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn max_clients_cap_turns_away_excess() {
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<&'static str>();
    let connected_tx = evt_tx.clone();
    let mut config = server_config(0);
    config.max_clients = 1;
    let server = TcpServer::new(config).events(
        ServerEvents::new()
            .on_connected(move |_| {
                let _ = connected_tx.send("connected");
            })
            .on_max_clients_reached(move |_| {
                let _ = evt_tx.send("max");
            }),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let first = TcpClient::new(client_config(port));
    assert!(first.connect().await);
    assert_eq!(recv(&mut evt_rx).await, "connected");
    assert_eq!(server.client_count(), 1);

    let second = TcpClient::new(client_config(port));
    assert!(second.connect().await);
    assert_eq!(recv(&mut evt_rx).await, "max");
    assert_eq!(server.client_count(), 1);

    first.disconnect().await;
    second.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn concurrent_senders_never_interleave() {
    let (srv_tx, mut srv_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let server = TcpServer::new(server_config(0)).events(
        ServerEvents::new().with_connection(
            ConnectionEvents::new().on_packet(move |_, payload| {
                let _ = srv_tx.send(payload);
            }),
        ),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = std::sync::Arc::new(TcpClient::new(client_config(port)));
    assert!(client.connect().await);

    let a = vec![b'A'; 200];
    let b = vec![b'B'; 200];
    let ca = client.clone();
    let cb = client.clone();
    let pa = a.clone();
    let pb = b.clone();
    let ta = tokio::spawn(async move { ca.send(&pa).await });
    let tb = tokio::spawn(async move { cb.send(&pb).await });
    ta.await.unwrap().unwrap();
    tb.await.unwrap().unwrap();

    // Two complete packets, each uniform, in one of the two orders.
    let first = recv(&mut srv_rx).await;
    let second = recv(&mut srv_rx).await;
    assert!(
        (first == a && second == b) || (first == b && second == a),
        "packets interleaved"
    );

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn fragment_windows_reassemble_large_packet() {
    // Payload larger than the 256-byte receive buffer forces multiple
    // fragment deliveries per packet.
    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

    let (frag_tx, mut frag_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (full_tx, mut full_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let server = TcpServer::new(server_config(0)).events(
        ServerEvents::new().with_connection(
            ConnectionEvents::new()
                .on_fragment(move |_, frag| {
                    let _ = frag_tx.send(frag.current_slice().to_vec());
                })
                .on_packet(move |_, payload| {
                    let _ = full_tx.send(payload);
                }),
        ),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TcpClient::new(client_config(port));
    assert!(client.connect().await);
    client.send(&payload).await.unwrap();

    let full = recv(&mut full_rx).await;
    assert_eq!(full, payload);

    // The windows concatenate to exactly the payload.
    let mut reassembled = Vec::new();
    while reassembled.len() < payload.len() {
        reassembled.extend_from_slice(&recv(&mut frag_rx).await);
    }
    assert_eq!(reassembled, payload);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn disconnect_reports_exactly_once_and_unregisters() {
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<&'static str>();
    let server = TcpServer::new(server_config(0)).events(
        ServerEvents::new().with_connection(ConnectionEvents::new().on_disconnected(move |_| {
            let _ = evt_tx.send("disconnected");
        })),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TcpClient::new(client_config(port));
    assert!(client.connect().await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.client_count(), 1);

    client.disconnect().await;
    assert_eq!(recv(&mut evt_rx).await, "disconnected");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.client_count(), 0);
    assert!(
        evt_rx.try_recv().is_err(),
        "disconnect reported more than once"
    );

    server.stop().await;
}

#[tokio::test]
async fn idle_timeout_disconnects_quiet_client() {
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<&'static str>();
    let mut config = server_config(0);
    config.idle_timeout_ms = 100;
    let server = TcpServer::new(config).events(
        ServerEvents::new().with_connection(ConnectionEvents::new().on_disconnected(move |_| {
            let _ = evt_tx.send("disconnected");
        })),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TcpClient::new(client_config(port));
    assert!(client.connect().await);
    // Say something once so the server-side timer starts cycling, then go
    // quiet past the timeout.
    client.send(b"hello").await.unwrap();
    assert_eq!(recv(&mut evt_rx).await, "disconnected");

    server.stop().await;
}

#[tokio::test]
async fn client_reconnects_with_fresh_connection() {
    let server = TcpServer::new(server_config(0));
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TcpClient::new(client_config(port));
    assert!(client.connect().await);
    let first_peer = client.connection().unwrap().peer();
    client.disconnect().await;
    assert!(!client.is_connected());

    assert!(client.connect().await);
    let second = client.connection().unwrap();
    assert!(second.is_connected());
    // Same server, but a brand-new socket.
    assert_eq!(second.peer().ip(), first_peer.ip());
    client.send(b"again").await.unwrap();

    client.disconnect().await;
    server.stop().await;
}
