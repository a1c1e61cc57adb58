#![warn(missing_docs)]

//! unilink-udp: a UDP transport for unilink endpoints.
//!
//! A [`UdpTransport`] works behind both endpoint variants. In the client
//! role the socket is bound to an ephemeral port and connected to the
//! target address; in the server role it is bound to the configured address
//! and replies to the most recently seen peer. The transport polls its
//! non-blocking socket in 1ms slices, bounded by the pending operations'
//! deadlines and interruptible through the sticky wake flag.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::SockRef;
use tracing::{debug, error};
use unilink_core::{deadline, CloseOp, OpenOp, Status};
use unilink_endpoint::{LinkCtx, SendRecv, Transport, TransportWaker};

const POLL_SLICE: Duration = Duration::from_millis(1);

// errno values used for argument validation failures
const EINVAL: u32 = 22;
const EIO: u32 = 5;
const ENOTCONN: u32 = 107;

/// Whether the socket binds and listens (server) or connects out (client).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UdpRole {
    /// Bind an ephemeral port and send to a fixed target.
    #[default]
    Client,
    /// Bind the configured address and reply to the last peer.
    Server,
}

/// Open arguments for [`UdpTransport`].
#[derive(Clone, Debug, Default)]
pub struct UdpArgs {
    /// Client: the target address. Server: the address to bind.
    pub addr: Option<SocketAddr>,
    /// The socket role.
    pub role: UdpRole,
    /// The actual local address, written back by the transport after a
    /// successful open (useful when binding port 0).
    pub local: Option<SocketAddr>,
    /// SO_RCVBUF, if set.
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF, if set.
    pub send_buffer_size: Option<usize>,
    /// IP_TTL, if set.
    pub ttl: Option<u32>,
    /// SO_BROADCAST.
    pub broadcast: bool,
}

impl UdpArgs {
    /// Arguments for a client socket targeting `addr`.
    pub fn client(addr: SocketAddr) -> Self {
        Self { addr: Some(addr), role: UdpRole::Client, ..Self::default() }
    }

    /// Arguments for a server socket bound to `addr`.
    pub fn server(addr: SocketAddr) -> Self {
        Self { addr: Some(addr), role: UdpRole::Server, ..Self::default() }
    }

    /// Sets the receive buffer size (SO_RCVBUF).
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Sets the send buffer size (SO_SNDBUF).
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Sets the time-to-live (IP_TTL).
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Enables broadcast mode (SO_BROADCAST).
    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }
}

/// Sticky wake flag for [`UdpTransport`].
#[derive(Clone, Debug)]
pub struct UdpWaker(Arc<AtomicBool>);

impl TransportWaker for UdpWaker {
    fn wake(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A UDP socket usable behind either endpoint variant.
#[derive(Debug, Default)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    role: UdpRole,
    peer: Option<SocketAddr>,
    wake: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Creates the transport. The socket is created by `open`.
    pub fn new() -> Self {
        Self::default()
    }

    fn consumed_wake(&self) -> bool {
        self.wake.swap(false, Ordering::SeqCst)
    }

    fn fault(&mut self, cx: &mut LinkCtx<'_, UdpArgs>, err: &io::Error, label: &'static str) {
        error!(%err, label, "udp socket fault");
        self.socket = None;
        self.peer = None;
        *cx.open_status = Status::Extension { code: os_code(err), label };
    }
}

fn os_code(err: &io::Error) -> u32 {
    err.raw_os_error().map(|code| code as u32).unwrap_or(0)
}

fn apply_socket_options(socket: &UdpSocket, args: &UdpArgs) -> io::Result<()> {
    let sock = SockRef::from(socket);
    if let Some(size) = args.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = args.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    if let Some(ttl) = args.ttl {
        socket.set_ttl(ttl)?;
    }
    if args.broadcast {
        socket.set_broadcast(true)?;
    }
    Ok(())
}

fn ephemeral_bind_addr(target: SocketAddr) -> SocketAddr {
    if target.is_ipv4() {
        "0.0.0.0:0".parse().expect("static addr")
    } else {
        "[::]:0".parse().expect("static addr")
    }
}

impl Transport for UdpTransport {
    type OpenArgs = UdpArgs;
    type Waker = UdpWaker;

    fn waker(&self) -> UdpWaker {
        UdpWaker(Arc::clone(&self.wake))
    }

    fn destruct(&mut self) {
        self.socket = None;
    }

    fn process_open(&mut self, op: &mut OpenOp, cx: &mut LinkCtx<'_, UdpArgs>) {
        // reopen closes the previous socket first
        self.socket = None;
        self.peer = None;

        let Some(addr) = cx.open_args.addr else {
            op.end_with_error(EINVAL, "INVALID_ADDR");
            return;
        };
        self.role = cx.open_args.role;
        if self.role == UdpRole::Client && addr.port() == 0 {
            op.end_with_error(EINVAL, "INVALID_PORT");
            return;
        }

        let bind_addr = match self.role {
            UdpRole::Server => addr,
            UdpRole::Client => ephemeral_bind_addr(addr),
        };
        let socket = match UdpSocket::bind(bind_addr) {
            Ok(socket) => socket,
            Err(err) => {
                op.end_with_error(os_code(&err), "BIND_FAILURE");
                return;
            }
        };
        if let Err(err) = apply_socket_options(&socket, cx.open_args) {
            op.end_with_error(os_code(&err), "SOCKOPT_FAILURE");
            return;
        }
        if self.role == UdpRole::Client {
            if let Err(err) = socket.connect(addr) {
                op.end_with_error(os_code(&err), "CONNECT_FAILURE");
                return;
            }
        }
        if let Err(err) = socket.set_nonblocking(true) {
            op.end_with_error(os_code(&err), "NONBLOCK_FAILURE");
            return;
        }

        // record the real local address so port-0 binds are discoverable
        cx.open_args.local = socket.local_addr().ok();
        debug!(local = ?cx.open_args.local, role = ?self.role, "udp socket open");
        self.socket = Some(socket);
        op.end(Status::Success);
    }

    fn process_close(&mut self, op: &mut CloseOp, _cx: &mut LinkCtx<'_, UdpArgs>) {
        self.socket = None;
        self.peer = None;
        op.end(Status::Success);
    }

    fn process_send_receive(&mut self, mut io: SendRecv<'_>, cx: &mut LinkCtx<'_, UdpArgs>) {
        loop {
            if self.socket.is_none() {
                if let Some(send) = io.send.as_deref_mut() {
                    if send.is_operating() {
                        send.end(Status::NotOpen);
                    }
                }
                if let Some(recv) = io.recv.as_deref_mut() {
                    if recv.is_operating() {
                        recv.end(Status::NotOpen);
                    }
                }
                return;
            }

            if let Some(send) = io.send.as_deref_mut() {
                if send.is_operating() {
                    if send.data.is_empty() {
                        // empty sends need no wire traffic
                        send.end(Status::Success);
                    } else {
                        let target = match self.role {
                            UdpRole::Client => None,
                            UdpRole::Server => match self.peer {
                                Some(peer) => Some(peer),
                                None => {
                                    send.end_with_error(ENOTCONN, "NO_PEER");
                                    continue;
                                }
                            },
                        };
                        let socket = self.socket.as_ref().expect("socket present");
                        let result = match target {
                            Some(peer) => socket.send_to(&send.data, peer),
                            None => socket.send(&send.data),
                        };
                        match result {
                            Ok(n) if n == send.data.len() => send.end(Status::Success),
                            Ok(_) => send.end_with_error(EIO, "PARTIAL_SEND"),
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                            Err(err) => {
                                send.end_with_error(os_code(&err), "SEND_FAILED");
                                self.fault(cx, &err, "SEND_FAILED");
                                continue;
                            }
                        }
                    }
                }
            }

            if let Some(recv) = io.recv.as_deref_mut() {
                if recv.is_operating() {
                    let socket = self.socket.as_ref().expect("socket present");
                    let buf = recv.buffer();
                    let result = match self.role {
                        UdpRole::Client => socket.recv(buf).map(|n| (n, None)),
                        UdpRole::Server => socket.recv_from(buf).map(|(n, from)| (n, Some(from))),
                    };
                    match result {
                        Ok((n, from)) => {
                            if let Some(from) = from {
                                self.peer = Some(from);
                            }
                            recv.set_received(n);
                            recv.end(Status::Success);
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) => {
                            recv.end_with_error(os_code(&err), "RECV_FAILED");
                            self.fault(cx, &err, "RECV_FAILED");
                            continue;
                        }
                    }
                }
            }

            let send_pending =
                io.send.as_deref().map(|op| op.is_operating()).unwrap_or(false);
            let recv_pending =
                io.recv.as_deref().map(|op| op.is_operating()).unwrap_or(false);
            if !send_pending && !recv_pending {
                return;
            }
            if self.consumed_wake() {
                return;
            }
            let now = Instant::now();
            let expired = (send_pending
                && deadline::has_expired(
                    io.send.as_deref().and_then(|op| op.deadline),
                    now,
                ))
                || (recv_pending
                    && deadline::has_expired(
                        io.recv.as_deref().and_then(|op| op.deadline),
                        now,
                    ));
            if expired {
                return;
            }
            std::thread::sleep(POLL_SLICE);
        }
    }

    fn name(&self) -> &'static str {
        "udp::socket"
    }

    fn id(&self) -> i32 {
        0x0B83
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_builders() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let client = UdpArgs::client(addr).ttl(12).recv_buffer_size(65536);
        assert_eq!(client.role, UdpRole::Client);
        assert_eq!(client.addr, Some(addr));
        assert_eq!(client.ttl, Some(12));
        assert_eq!(client.recv_buffer_size, Some(65536));
        assert!(!client.broadcast);

        let server = UdpArgs::server(addr).broadcast();
        assert_eq!(server.role, UdpRole::Server);
        assert!(server.broadcast);
    }

    #[test]
    fn test_ephemeral_bind_matches_family() {
        let v4: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert!(ephemeral_bind_addr(v4).is_ipv4());
        let v6: SocketAddr = "[::1]:5000".parse().unwrap();
        assert!(!ephemeral_bind_addr(v6).is_ipv4());
    }
}
