//! End-to-end tests driving real TCP sockets on the loopback interface.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use unilink_core::{Status, Timeout};
use unilink_endpoint::{CommonOpts, Endpoint};
use unilink_filter::Delimit;
use unilink_tcp::{TcpArgs, TcpTransport};

fn loopback_any() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn open_server_with(opts: CommonOpts) -> (Endpoint<TcpTransport>, SocketAddr) {
    let ep = Endpoint::new(TcpTransport::new());
    let status = ep.open_with(Some(TcpArgs::server(loopback_any())), opts, Timeout::Default);
    assert_eq!(status, Status::Success);
    let local = ep
        .get_open_args()
        .and_then(|args| args.local)
        .expect("server must report its bound address");
    (ep, local)
}

fn open_server() -> (Endpoint<TcpTransport>, SocketAddr) {
    open_server_with(CommonOpts::new())
}

fn connect_client(addr: SocketAddr) -> Endpoint<TcpTransport> {
    let ep = Endpoint::new(TcpTransport::new());
    assert_eq!(ep.open_with_args(TcpArgs::client(addr)), Status::Success);
    ep
}

#[test]
fn test_client_server_roundtrip() {
    let (server, addr) = open_server();
    let client = connect_client(addr);

    assert_eq!(client.send(b"hello-server"), Status::Success);

    let mut buf = [0u8; 64];
    let got = server.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
    assert_eq!(got.status, Status::Success);
    assert_eq!(&buf[..got.len], b"hello-server");
    let channel = got.channel.expect("server receives carry the client channel");

    assert_eq!(server.send_on(channel, b"hello-client"), Status::Success);
    let got = client.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
    assert_eq!(got.status, Status::Success);
    assert_eq!(&buf[..got.len], b"hello-client");
}

#[test]
fn test_broadcast_reaches_every_client() {
    let (server, addr) = open_server();
    let client_a = connect_client(addr);
    let client_b = connect_client(addr);

    // wait until the idle loop has accepted both
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(server.send(b"to-everyone"), Status::Success);

    let mut buf = [0u8; 32];
    for client in [&client_a, &client_b] {
        let got = client.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
        assert_eq!(got.status, Status::Success);
        assert_eq!(&buf[..got.len], b"to-everyone");
    }
}

#[test]
fn test_send_without_clients_fails() {
    let (server, _) = open_server();
    let status = server.send(b"nobody");
    assert_eq!(status, Status::Extension { code: 5, label: "SEND_FAILED_NO_CLIENTS" });
}

#[test]
fn test_client_sees_server_close() {
    let (server, addr) = open_server();
    let client = connect_client(addr);
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(server.close(), Status::Success);

    let got = client.receive_within(&mut [0u8; 16], Timeout::After(Duration::from_secs(2)));
    assert_eq!(got.status, Status::Extension { code: 5, label: "RECV_FAILED_SOCK_CLOSED" });
    assert_eq!(
        client.open_status(),
        Status::Extension { code: 5, label: "SERVER_CLOSED_CONN" }
    );
    // subsequent operations observe the closure directly
    assert_eq!(client.send(b"x"), Status::NotOpen);
}

#[test]
fn test_server_reaps_disconnected_client() {
    let (server, addr) = open_server();
    let client = connect_client(addr);
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(client.close(), Status::Success);

    // the idle loop prunes the dead stream; a broadcast then has no targets
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let status = server.send(b"anyone?");
        if status == (Status::Extension { code: 5, label: "SEND_FAILED_NO_CLIENTS" }) {
            break;
        }
        assert!(Instant::now() < deadline, "client was never reaped");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_delimited_messages_over_stream() {
    // the receive filter restores message framing on top of the stream
    let (server, addr) = open_server_with(CommonOpts::new().recv_filter(Delimit::new(b"\n")));
    let client = connect_client(addr);

    assert_eq!(client.send(b"alpha\nbeta\n"), Status::Success);

    let mut buf = [0u8; 32];
    for expected in [&b"alpha"[..], b"beta"] {
        let got = server.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
        assert_eq!(got.status, Status::Success);
        assert_eq!(&buf[..got.len], expected);
    }
}

#[test]
fn test_connect_to_closed_port_fails() {
    // bind a port then free it so nothing is listening there
    let probe = std::net::TcpListener::bind(loopback_any()).unwrap();
    let dead = probe.local_addr().unwrap();
    drop(probe);

    let ep = Endpoint::new(TcpTransport::new());
    let status = ep.open_with_args(TcpArgs::client(dead));
    assert_eq!(status.label(), "CONNECT_FAILURE");
    assert!(!ep.is_open());
}
