//! End-to-end tests over loopback sockets
//!
//! Verifies:
//! 1. Connections reach the backend chosen by SNI, byte for byte
//! 2. Rejections (no route, dead backend, silent client, connection limit)
//!    close the client and never dial a backend
//! 3. PROXY protocol headers precede the ClientHello
//! 4. Reloads and graceful stop

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use snimux_router::{Backend, ProxyProtocol, RouteTable};
use snimux_server::{
    RejectReason, ServerError, ServerHandle, ServerStats, SniServer, SniServerConfig,
};

/// Build a ClientHello record, with an SNI extension when `hostname` is set
fn client_hello(hostname: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(hostname) = hostname {
        let name = hostname.as_bytes();
        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        extensions.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        extensions.push(0x00);
        extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
        extensions.extend_from_slice(name);
    }
    // supported_versions
    extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x5a; 32]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Backend that writes `tag`, then echoes everything it receives
async fn tagged_echo_backend(tag: u8) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if socket.write_all(&[tag]).await.is_err() {
                    return;
                }
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    (address, accepted)
}

/// Backend that reports everything it received before the client's EOF
async fn recording_backend() -> (String, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        let _ = tx.send(received);
    });

    (address, rx)
}

/// Backend that accepts and holds the connection open without replying
async fn silent_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    address
}

async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

fn config() -> SniServerConfig {
    SniServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        inspect_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(30),
        ..Default::default()
    }
}

async fn start(config: SniServerConfig, table: RouteTable) -> ServerHandle {
    SniServer::new(config, table).bind().await.unwrap()
}

/// Send a ClientHello and return the backend tag, or `None` if the router closed us
async fn route_tag(router: SocketAddr, hostname: Option<&str>) -> Option<u8> {
    let hello = client_hello(hostname);
    let mut client = TcpStream::connect(router).await.unwrap();
    client.write_all(&hello).await.unwrap();

    let mut tag = [0u8; 1];
    match tokio::time::timeout(Duration::from_secs(5), client.read(&mut tag)).await {
        Ok(Ok(1)) => {}
        Ok(_) => return None,
        Err(_) => panic!("router neither forwarded nor closed the connection"),
    }

    let mut echoed = vec![0u8; hello.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, hello, "backend must receive the ClientHello unchanged");
    Some(tag[0])
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn rejected(stats: &ServerStats, reason: RejectReason) -> u64 {
    stats.rejected(reason)
}

#[tokio::test]
async fn test_routes_by_sni() {
    let (api, _) = tagged_echo_backend(b'A').await;
    let (cdn, _) = tagged_echo_backend(b'C').await;

    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&api).unwrap())
        .unwrap()
        .route("*.cdn.example.com", Backend::new(&cdn).unwrap())
        .unwrap()
        .build();
    let server = start(config(), table).await;
    let addr = server.local_addr();

    assert_eq!(route_tag(addr, Some("api.example.com")).await, Some(b'A'));
    assert_eq!(route_tag(addr, Some("Api.Example.COM")).await, Some(b'A'));
    assert_eq!(route_tag(addr, Some("x.cdn.example.com")).await, Some(b'C'));
    assert_eq!(route_tag(addr, Some("other.tld")).await, None);
    assert_eq!(route_tag(addr, None).await, None);

    let stats = server.stats();
    eventually(|| rejected(&stats, RejectReason::RouteNotFound) == 1).await;
    eventually(|| rejected(&stats, RejectReason::NoSni) == 1).await;
    assert_eq!(stats.routed(&api), 2);
    assert_eq!(stats.routed(&cdn), 1);
}

#[tokio::test]
async fn test_default_backend_catches_unmatched() {
    let (api, _) = tagged_echo_backend(b'A').await;
    let (fallback, _) = tagged_echo_backend(b'D').await;

    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&api).unwrap())
        .unwrap()
        .default_backend(Backend::new(&fallback).unwrap())
        .build();
    let server = start(config(), table).await;

    assert_eq!(route_tag(server.local_addr(), Some("other.tld")).await, Some(b'D'));
    assert_eq!(route_tag(server.local_addr(), None).await, Some(b'D'));
    assert_eq!(route_tag(server.local_addr(), Some("api.example.com")).await, Some(b'A'));
}

#[tokio::test]
async fn test_large_transfer_is_byte_exact() {
    let (api, _) = tagged_echo_backend(b'A').await;
    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&api).unwrap())
        .unwrap()
        .build();
    let server = start(config(), table).await;

    let hello = client_hello(Some("api.example.com"));
    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i * 31 % 251) as u8).collect();

    let client = TcpStream::connect(server.local_addr()).await.unwrap();
    let (mut read, mut write) = client.into_split();

    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        write.write_all(&hello).await.unwrap();
        write.write_all(&sent).await.unwrap();
        write.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    read.read_to_end(&mut received).await.unwrap();
    writer.await.unwrap();

    let hello_len = client_hello(Some("api.example.com")).len();
    assert_eq!(received[0], b'A');
    assert_eq!(&received[1 + hello_len..], &payload[..]);
}

#[tokio::test]
async fn test_bind_fails_when_port_is_taken() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = occupied.local_addr().unwrap();

    let result = SniServer::new(
        SniServerConfig {
            bind_addr: taken,
            ..config()
        },
        RouteTable::builder().build(),
    )
    .bind()
    .await;

    match result {
        Err(ServerError::BindError { address, port, .. }) => {
            assert_eq!(address, "127.0.0.1");
            assert_eq!(port, taken.port());
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(server) => panic!("bound {} while it was taken", server.local_addr()),
    }
}

#[tokio::test]
async fn test_dead_backend_does_not_stop_router() {
    let dead = closed_port().await;
    let (live, _) = tagged_echo_backend(b'L').await;

    let table = RouteTable::builder()
        .route("dead.example.com", Backend::new(&dead).unwrap())
        .unwrap()
        .route("live.example.com", Backend::new(&live).unwrap())
        .unwrap()
        .build();
    let server = start(config(), table).await;

    assert_eq!(route_tag(server.local_addr(), Some("dead.example.com")).await, None);
    assert_eq!(route_tag(server.local_addr(), Some("live.example.com")).await, Some(b'L'));

    let stats = server.stats();
    eventually(|| rejected(&stats, RejectReason::BackendUnavailable) == 1).await;
}

#[tokio::test]
async fn test_silent_client_times_out_without_dialing() {
    let (api, accepted) = tagged_echo_backend(b'A').await;
    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&api).unwrap())
        .unwrap()
        .build();
    let server = start(
        SniServerConfig {
            inspect_timeout: Duration::from_millis(300),
            ..config()
        },
        table,
    )
    .await;

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    // Half a record header, then nothing
    client.write_all(&[0x16, 0x03]).await.unwrap();

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("router should close the connection")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let stats = server.stats();
    eventually(|| rejected(&stats, RejectReason::InspectionTimeout) == 1).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_garbage_is_rejected() {
    let (api, accepted) = tagged_echo_backend(b'A').await;
    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&api).unwrap())
        .unwrap()
        .build();
    let server = start(config(), table).await;

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: api.example.com\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let _ = client.read_to_end(&mut buf).await;
    assert!(buf.is_empty());

    let stats = server.stats();
    eventually(|| rejected(&stats, RejectReason::MalformedClientHello) == 1).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connection_limit_rejects_excess() {
    let (api, _) = tagged_echo_backend(b'A').await;
    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&api).unwrap())
        .unwrap()
        .build();
    let server = start(
        SniServerConfig {
            max_connections: 3,
            inspect_timeout: Duration::from_secs(10),
            ..config()
        },
        table,
    )
    .await;
    let stats = server.stats();

    // Hold every slot in the inspection phase
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(TcpStream::connect(server.local_addr()).await.unwrap());
    }
    eventually(|| stats.active() == 3).await;

    let mut extra = TcpStream::connect(server.local_addr()).await.unwrap();
    let _ = extra.write_all(&client_hello(Some("api.example.com"))).await;
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), extra.read(&mut buf))
        .await
        .expect("excess connection should be closed immediately")
        .unwrap_or(0);
    assert_eq!(n, 0);
    eventually(|| rejected(&stats, RejectReason::ConnectionLimit) == 1).await;

    // A freed slot is usable again
    drop(held.pop());
    eventually(|| stats.active() == 2).await;
    assert_eq!(
        route_tag(server.local_addr(), Some("api.example.com")).await,
        Some(b'A')
    );
}

#[tokio::test]
async fn test_unhealthy_backend_is_skipped() {
    let (api, accepted) = tagged_echo_backend(b'A').await;
    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&api).unwrap())
        .unwrap()
        .build();
    let server = start(config(), table).await;

    server.router().health().record(&api, false);
    assert_eq!(route_tag(server.local_addr(), Some("api.example.com")).await, None);
    assert_eq!(accepted.load(Ordering::SeqCst), 0);

    server.router().health().record(&api, true);
    assert_eq!(
        route_tag(server.local_addr(), Some("api.example.com")).await,
        Some(b'A')
    );
}

#[tokio::test]
async fn test_health_checks_mark_dead_backend() {
    let dead = closed_port().await;
    let table = RouteTable::builder()
        .route(
            "api.example.com",
            Backend::new(&dead)
                .unwrap()
                .with_health_check(Duration::from_millis(50)),
        )
        .unwrap()
        .build();
    let server = start(config(), table).await;

    let router = server.router();
    eventually(|| !router.health().is_healthy(&dead)).await;
}

#[tokio::test]
async fn test_proxy_protocol_v1_precedes_client_hello() {
    let (backend, received) = recording_backend().await;
    let table = RouteTable::builder()
        .route(
            "api.example.com",
            Backend::new(&backend)
                .unwrap()
                .with_proxy_protocol(ProxyProtocol::V1),
        )
        .unwrap()
        .build();
    let server = start(config(), table).await;

    let hello = client_hello(Some("api.example.com"));
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let client_port = client.local_addr().unwrap().port();
    client.write_all(&hello).await.unwrap();
    client.write_all(b"after").await.unwrap();
    client.shutdown().await.unwrap();

    let received = received.await.unwrap();
    let expected_header = format!(
        "PROXY TCP4 127.0.0.1 127.0.0.1 {} {}\r\n",
        client_port,
        server.local_addr().port()
    );
    let header_len = expected_header.len();
    assert_eq!(&received[..header_len], expected_header.as_bytes());
    assert_eq!(&received[header_len..header_len + hello.len()], &hello[..]);
    assert_eq!(&received[header_len + hello.len()..], b"after");
}

#[tokio::test]
async fn test_proxy_protocol_v2_precedes_client_hello() {
    let (backend, received) = recording_backend().await;
    let table = RouteTable::builder()
        .route(
            "api.example.com",
            Backend::new(&backend)
                .unwrap()
                .with_proxy_protocol(ProxyProtocol::V2),
        )
        .unwrap()
        .build();
    let server = start(config(), table).await;

    let hello = client_hello(Some("api.example.com"));
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let client_port = client.local_addr().unwrap().port();
    client.write_all(&hello).await.unwrap();
    client.shutdown().await.unwrap();

    let received = received.await.unwrap();
    assert_eq!(&received[..12], b"\r\n\r\n\0\r\nQUIT\n");
    assert_eq!(received[13], 0x11);
    assert_eq!(&received[16..20], &[127, 0, 0, 1]);
    assert_eq!(&received[24..26], &client_port.to_be_bytes());
    assert_eq!(&received[28..], &hello[..]);
}

#[tokio::test]
async fn test_reload_applies_to_new_connections() {
    let (first, _) = tagged_echo_backend(b'1').await;
    let (second, _) = tagged_echo_backend(b'2').await;

    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&first).unwrap())
        .unwrap()
        .build();
    let server = start(config(), table).await;
    assert_eq!(route_tag(server.local_addr(), Some("api.example.com")).await, Some(b'1'));

    server.reload(
        RouteTable::builder()
            .route("api.example.com", Backend::new(&second).unwrap())
            .unwrap()
            .build(),
    );
    assert_eq!(route_tag(server.local_addr(), Some("api.example.com")).await, Some(b'2'));

    server.reload(RouteTable::default());
    assert_eq!(route_tag(server.local_addr(), Some("api.example.com")).await, None);
}

#[tokio::test]
async fn test_stop_with_no_sessions() {
    let server = start(config(), RouteTable::default()).await;
    let addr = server.local_addr();

    assert_eq!(server.stop(Duration::from_secs(1)).await, 0);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_stop_forces_sessions_past_drain_deadline() {
    let backend = silent_backend().await;
    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&backend).unwrap())
        .unwrap()
        .build();
    let server = start(config(), table).await;
    let stats = server.stats();

    let mut sessions = Vec::new();
    for _ in 0..2 {
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client
            .write_all(&client_hello(Some("api.example.com")))
            .await
            .unwrap();
        sessions.push(client);
    }
    eventually(|| stats.routed(&backend) == 2).await;

    let forced = server.stop(Duration::from_millis(200)).await;
    assert_eq!(forced, 2);
    assert_eq!(stats.snapshot().forcibly_closed, 2);
    assert_eq!(stats.active(), 0);

    for mut client in sessions {
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }
}

#[tokio::test]
async fn test_stop_lets_short_sessions_finish() {
    let (api, _) = tagged_echo_backend(b'A').await;
    let table = RouteTable::builder()
        .route("api.example.com", Backend::new(&api).unwrap())
        .unwrap()
        .build();
    let server = Arc::new(start(config(), table).await);

    let hello = client_hello(Some("api.example.com"));
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&hello).await.unwrap();
    let mut reply = vec![0u8; 1 + hello.len()];
    client.read_exact(&mut reply).await.unwrap();

    let stopping = {
        let server = server.clone();
        tokio::spawn(async move { server.stop(Duration::from_secs(5)).await })
    };

    // The open session keeps working during the drain
    client.write_all(b"still here").await.unwrap();
    let mut echoed = [0u8; 10];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"still here");
    drop(client);

    assert_eq!(stopping.await.unwrap(), 0);
}
