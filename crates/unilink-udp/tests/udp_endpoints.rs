//! End-to-end tests driving real UDP sockets on the loopback interface.

use std::net::SocketAddr;
use std::time::Duration;

use unilink_core::{Status, Timeout};
use unilink_endpoint::{CommonOpts, Endpoint, RawEndpoint, RecvCallback};
use unilink_filter::slip;
use unilink_udp::{UdpArgs, UdpTransport};

fn loopback_any() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn open_server_with(opts: CommonOpts) -> (Endpoint<UdpTransport>, SocketAddr) {
    let ep = Endpoint::new(UdpTransport::new());
    let status = ep.open_with(Some(UdpArgs::server(loopback_any())), opts, Timeout::Default);
    assert_eq!(status, Status::Success);
    let local = ep
        .get_open_args()
        .and_then(|args| args.local)
        .expect("server must report its bound address");
    (ep, local)
}

fn open_server() -> (Endpoint<UdpTransport>, SocketAddr) {
    open_server_with(CommonOpts::new())
}

#[test]
fn test_client_server_roundtrip() {
    let (server, server_addr) = open_server();
    let client = Endpoint::new(UdpTransport::new());
    assert_eq!(client.open_with_args(UdpArgs::client(server_addr)), Status::Success);

    assert_eq!(client.send(b"ping"), Status::Success);

    let mut buf = [0u8; 64];
    let got = server.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
    assert_eq!(got.status, Status::Success);
    assert_eq!(&buf[..got.len], b"ping");

    // the server replies to the peer it last heard from
    assert_eq!(server.send(b"pong"), Status::Success);
    let got = client.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
    assert_eq!(got.status, Status::Success);
    assert_eq!(&buf[..got.len], b"pong");
}

#[test]
fn test_server_send_before_any_peer() {
    let (server, _) = open_server();
    let status = server.send(b"into the void");
    assert_eq!(status, Status::Extension { code: 107, label: "NO_PEER" });
}

#[test]
fn test_open_requires_address() {
    let ep = Endpoint::new(UdpTransport::new());
    let status = ep.open_with_args(UdpArgs::default());
    assert_eq!(status, Status::Extension { code: 22, label: "INVALID_ADDR" });
    assert!(!ep.is_open());
}

#[test]
fn test_client_rejects_port_zero() {
    let ep = Endpoint::new(UdpTransport::new());
    let status = ep.open_with_args(UdpArgs::client(loopback_any()));
    assert_eq!(status, Status::Extension { code: 22, label: "INVALID_PORT" });
}

#[test]
fn test_receive_timeout_on_silent_socket() {
    let (server, _) = open_server();
    let got = server.receive_within(&mut [0u8; 16], Timeout::After(Duration::from_millis(80)));
    assert_eq!(got.status, Status::TimedOut);
}

#[test]
fn test_slip_framing_between_endpoints() {
    let (server, server_addr) =
        open_server_with(CommonOpts::new().recv_filter(slip::Decode::new()));

    let client = Endpoint::new(UdpTransport::new());
    let status = client.open_with(
        Some(UdpArgs::client(server_addr)),
        CommonOpts::new().send_filter(slip::Encode::new()),
        Timeout::Default,
    );
    assert_eq!(status, Status::Success);

    // frames with bytes that need escaping survive the trip
    let messages: [&[u8]; 3] =
        [b"hello1", &[0xC0, 0x11, 0xDB], b"hello3"];
    for msg in messages {
        assert_eq!(client.send(msg), Status::Success);
    }

    let mut buf = [0u8; 128];
    for expected in messages {
        let got = server.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
        assert_eq!(got.status, Status::Success);
        assert_eq!(&buf[..got.len], expected);
    }
}

#[test]
fn test_receive_callback_over_udp() {
    let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
    let (server, server_addr) =
        open_server_with(CommonOpts::new().recv_callback(RecvCallback::new(512, move |op| {
            let _ = tx.send(op.payload().to_vec());
        })));

    let client = Endpoint::new(UdpTransport::new());
    assert_eq!(client.open_with_args(UdpArgs::client(server_addr)), Status::Success);
    assert_eq!(client.send(b"callback-data"), Status::Success);

    let got = rx.recv_timeout(Duration::from_secs(2)).expect("callback never fired");
    assert_eq!(got, b"callback-data");

    // the callback owns the receive category now
    assert_eq!(server.receive(&mut [0u8; 8]).status, Status::Disabled);
}

#[test]
fn test_raw_client_talks_to_threadsafe_server() {
    let (server, server_addr) = open_server();
    let mut client = RawEndpoint::new(UdpTransport::new());
    assert_eq!(client.open_with_args(UdpArgs::client(server_addr)), Status::Success);

    assert_eq!(client.send(b"from-raw"), Status::Success);
    let mut buf = [0u8; 32];
    let got = server.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
    assert_eq!(got.status, Status::Success);
    assert_eq!(&buf[..got.len], b"from-raw");

    assert_eq!(server.send(b"to-raw"), Status::Success);
    let got = client.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
    assert_eq!(got.status, Status::Success);
    assert_eq!(&buf[..got.len], b"to-raw");

    assert_eq!(client.close(), Status::Success);
}

#[test]
fn test_empty_send_succeeds_without_traffic() {
    let (_server, server_addr) = open_server();
    let client = Endpoint::new(UdpTransport::new());
    assert_eq!(client.open_with_args(UdpArgs::client(server_addr)), Status::Success);
    assert_eq!(client.send(b""), Status::Success);
}
