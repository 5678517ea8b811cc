//! Both transports run together under one cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use firn::{Catalog, Listeners, Server, ServerConfig, ServerSpec};
use firn_core::FirnError;
use firn_core::catalog::{IPXE_EFI, SNP_EFI, UNDIONLY_KPXE};
use firn_core::patch::MARKER;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);
const SCRIPT: &[u8] = b"#!ipxe\nchain http://boot.example/menu.ipxe";

fn image() -> Bytes {
    let mut content = b"efi header ".to_vec();
    content.extend_from_slice(MARKER);
    content.extend((0..900).map(|i| (i % 251) as u8));
    Bytes::from(content)
}

fn catalog() -> Arc<Catalog> {
    let catalog = Catalog::from_entries([
        (SNP_EFI, image()),
        (IPXE_EFI, image()),
        (UNDIONLY_KPXE, Bytes::from_static(b"legacy bios")),
    ])
    .unwrap();
    Arc::new(catalog)
}

fn patched_image() -> Vec<u8> {
    let mut expected = image().to_vec();
    let offset = b"efi header ".len();
    expected[offset..offset + SCRIPT.len()].copy_from_slice(SCRIPT);
    for b in &mut expected[offset + SCRIPT.len()..offset + MARKER.len()] {
        *b = b' ';
    }
    expected
}

fn disabled() -> ServerSpec {
    ServerSpec {
        disabled: true,
        ..Default::default()
    }
}

async fn tftp_get(server: SocketAddr, filename: &str) -> Vec<u8> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut request = vec![0, 1];
    for part in [filename, "octet"] {
        request.extend_from_slice(part.as_bytes());
        request.push(0);
    }
    client.send_to(&request, server).await.unwrap();

    let mut content = Vec::new();
    let mut buf = vec![0u8; 1024];
    loop {
        let (size, from) = timeout(WAIT, client.recv_from(&mut buf))
            .await
            .expect("no packet from server")
            .unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), 3, "expected DATA");
        content.extend_from_slice(&buf[4..size]);
        client
            .send_to(&[0, 4, buf[2], buf[3]], from)
            .await
            .unwrap();
        if size - 4 < 512 {
            return content;
        }
    }
}

async fn http_get(server: SocketAddr, path: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(server).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: boot\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    assert!(raw.starts_with(b"HTTP/1.1 200 OK\r\n"));
    let body_start = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator")
        + 4;
    raw.split_off(body_start)
}

#[tokio::test]
async fn test_serves_both_transports_until_cancelled() {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tftp_addr = udp.local_addr().unwrap();
    let http_addr = tcp.local_addr().unwrap();

    let patch = Bytes::from_static(SCRIPT);
    let config = ServerConfig {
        tftp: ServerSpec {
            patch: patch.clone(),
            ..Default::default()
        },
        http: ServerSpec {
            patch,
            ..Default::default()
        },
        ..Default::default()
    };
    let server = Server::new(config, catalog());
    let token = CancellationToken::new();
    let task = tokio::spawn({
        let token = token.clone();
        async move {
            server
                .serve(
                    token,
                    Listeners {
                        tcp: Some(tcp),
                        udp: Some(udp),
                    },
                )
                .await
        }
    });

    assert_eq!(tftp_get(tftp_addr, SNP_EFI).await, patched_image());
    assert_eq!(
        http_get(http_addr, "/30:23:03:73:a5:a7/ipxe.efi").await,
        patched_image()
    );
    assert_eq!(tftp_get(tftp_addr, UNDIONLY_KPXE).await, b"legacy bios");

    token.cancel();
    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_both_disabled_waits_for_cancel() {
    let config = ServerConfig {
        tftp: disabled(),
        http: disabled(),
        ..Default::default()
    };
    let server = Server::new(config, catalog());
    let token = CancellationToken::new();
    let task = tokio::spawn({
        let token = token.clone();
        async move { server.listen_and_serve(token).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    token.cancel();
    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_missing_listener_is_rejected() {
    let config = ServerConfig {
        http: disabled(),
        ..Default::default()
    };
    let server = Server::new(config, catalog());

    let result = server
        .serve(CancellationToken::new(), Listeners::default())
        .await;

    assert!(matches!(result, Err(FirnError::MissingListener("udp"))));
}

#[tokio::test]
async fn test_disabled_transport_needs_no_listener() {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = ServerConfig {
        tftp: disabled(),
        ..Default::default()
    };
    let server = Server::new(config, catalog());
    let token = CancellationToken::new();
    token.cancel();

    let result = timeout(
        WAIT,
        server.serve(
            token,
            Listeners {
                tcp: Some(tcp),
                udp: None,
            },
        ),
    )
    .await
    .unwrap();

    assert!(result.is_ok());
}

#[tokio::test]
async fn test_bind_failure_stops_sibling() {
    let occupied = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = ServerConfig {
        tftp: ServerSpec {
            addr: Some(occupied.local_addr().unwrap()),
            ..Default::default()
        },
        http: ServerSpec {
            addr: Some("127.0.0.1:0".parse().unwrap()),
            ..Default::default()
        },
        ..Default::default()
    };
    let server = Server::new(config, catalog());
    let token = CancellationToken::new();

    let result = timeout(WAIT, server.listen_and_serve(token.clone()))
        .await
        .expect("server kept running after a bind failure");

    let err = result.unwrap_err();
    assert!(err.to_string().starts_with("TFTP server: "), "{err}");
    let FirnError::Other(cause) = err else {
        panic!("unexpected error variant");
    };
    let io = cause
        .chain()
        .find_map(|e| e.downcast_ref::<std::io::Error>())
        .expect("bind error kept as the source");
    assert_eq!(io.kind(), std::io::ErrorKind::AddrInUse);
    // the caller's token is left alone
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn test_listen_opens_only_enabled_transport() {
    // binding this would fail, so serving proves the TFTP side never tried
    let occupied = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let http_addr = {
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        free.local_addr().unwrap()
    };
    let config = ServerConfig {
        tftp: ServerSpec {
            addr: Some(occupied.local_addr().unwrap()),
            disabled: true,
            ..Default::default()
        },
        http: ServerSpec {
            addr: Some(http_addr),
            ..Default::default()
        },
        ..Default::default()
    };
    let server = Server::new(config, catalog());
    let token = CancellationToken::new();
    let task = tokio::spawn({
        let token = token.clone();
        async move { server.listen_and_serve(token).await }
    });

    let mut connected = None;
    for _ in 0..50 {
        match TcpStream::connect(http_addr).await {
            Ok(stream) => {
                connected = Some(stream);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    drop(connected.expect("HTTP listener never came up"));

    assert_eq!(http_get(http_addr, "/snp.efi").await, image().to_vec());
    assert!(!task.is_finished());

    token.cancel();
    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
    drop(occupied);
}
