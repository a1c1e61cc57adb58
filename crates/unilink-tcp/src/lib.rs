#![warn(missing_docs)]

//! unilink-tcp: TCP transports for unilink endpoints.
//!
//! The client role wraps one connected stream. The server role owns a
//! listening socket plus a table of accepted clients, each addressed by a
//! small integer channel id: receives report the source channel, sends
//! target one channel or broadcast to every client, and while the endpoint
//! is open the transport idles in its send-receive hook to accept new
//! clients and reap disconnected ones even when no operation is pending.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::SockRef;
use tracing::{debug, error, trace};
use unilink_core::{deadline, CloseOp, OpenOp, RecvOp, SendOp, Status};
use unilink_endpoint::{LinkCtx, SendRecv, Transport, TransportWaker};

const POLL_SLICE: Duration = Duration::from_millis(1);

// errno values used for validation and peer-loss reporting
const EINVAL: u32 = 22;
const EIO: u32 = 5;

/// Whether the socket connects out (client) or accepts clients (server).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TcpRole {
    /// Connect to a server address.
    #[default]
    Client,
    /// Bind, listen, and serve multiple clients.
    Server,
}

/// Open arguments for [`TcpTransport`].
#[derive(Clone, Debug, Default)]
pub struct TcpArgs {
    /// Client: the address to connect to. Server: the address to bind.
    pub addr: Option<SocketAddr>,
    /// The socket role.
    pub role: TcpRole,
    /// The actual local address, written back by the transport after a
    /// successful open (useful when binding port 0).
    pub local: Option<SocketAddr>,
    /// Maximum number of simultaneously connected clients (server role).
    pub max_clients: usize,
    /// Disables Nagle's algorithm on connected streams.
    pub nodelay: bool,
    /// SO_RCVBUF, if set.
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF, if set.
    pub send_buffer_size: Option<usize>,
}

impl TcpArgs {
    /// Arguments for a client connecting to `addr`.
    pub fn client(addr: SocketAddr) -> Self {
        Self { addr: Some(addr), role: TcpRole::Client, ..Self::default() }
    }

    /// Arguments for a server bound to `addr`, with the default client
    /// table size of 100.
    pub fn server(addr: SocketAddr) -> Self {
        Self { addr: Some(addr), role: TcpRole::Server, max_clients: 100, ..Self::default() }
    }

    /// Caps the number of simultaneous clients (server role).
    pub fn max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    /// Disables Nagle's algorithm.
    pub fn nodelay(mut self) -> Self {
        self.nodelay = true;
        self
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
}

/// Sticky wake flag for [`TcpTransport`].
#[derive(Clone, Debug)]
pub struct TcpWaker(Arc<AtomicBool>);

impl TransportWaker for TcpWaker {
    fn wake(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct Client {
    id: i32,
    stream: TcpStream,
}

/// Tracks how far a send has progressed: which targets remain and the byte
/// offset into the current one. Rebuilt whenever a fresh send op arrives.
#[derive(Default)]
struct SendCursor {
    targets: Vec<i32>,
    index: usize,
    offset: usize,
}

/// A TCP socket (client or multi-client server) usable behind either
/// endpoint variant.
#[derive(Default)]
pub struct TcpTransport {
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    clients: Vec<Client>,
    next_client_id: i32,
    role: TcpRole,
    cursor: SendCursor,
    recv_rotation: usize,
    wake: Arc<AtomicBool>,
}

/// Channel id used for the client role's single peer.
pub const CLIENT_CHANNEL: i32 = 0;

impl TcpTransport {
    /// Creates the transport. Sockets are created by `open`.
    pub fn new() -> Self {
        Self::default()
    }

    fn consumed_wake(&self) -> bool {
        self.wake.swap(false, Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.listener.is_some() || self.stream.is_some()
    }

    fn close_everything(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for client in self.clients.drain(..) {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
        self.listener = None;
        self.cursor = SendCursor::default();
    }

    fn drop_client(&mut self, id: i32) {
        if let Some(pos) = self.clients.iter().position(|c| c.id == id) {
            let client = self.clients.remove(pos);
            let _ = client.stream.shutdown(Shutdown::Both);
            debug!(channel = id, "tcp client dropped");
        }
    }

    fn fault(&mut self, cx: &mut LinkCtx<'_, TcpArgs>, code: u32, label: &'static str) {
        error!(code, label, "tcp transport fault");
        self.close_everything();
        *cx.idle_in_send_recv = false;
        *cx.open_status = Status::Extension { code, label };
    }

    /// Accept pending clients (server role). Returns false on a fatal
    /// listener error.
    fn accept_clients(&mut self, max_clients: usize) -> io::Result<()> {
        let Some(listener) = self.listener.as_ref() else { return Ok(()) };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.clients.len() >= max_clients {
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                    stream.set_nonblocking(true)?;
                    let id = self.next_client_id;
                    self.next_client_id = self.next_client_id.wrapping_add(1);
                    debug!(channel = id, %peer, "tcp client accepted");
                    self.clients.push(Client { id, stream });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Reap clients whose peer has closed, without consuming payload bytes.
    fn reap_disconnected(&mut self) {
        let mut gone = Vec::new();
        for client in &self.clients {
            let mut probe = [0u8; 1];
            match client.stream.peek(&mut probe) {
                Ok(0) => gone.push(client.id),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => gone.push(client.id),
            }
        }
        for id in gone {
            self.drop_client(id);
        }
    }

    /// Starts a fresh send: resolve the target channel list.
    fn start_send(&mut self, send: &SendOp) -> Result<(), Status> {
        let targets = match self.role {
            TcpRole::Client => vec![CLIENT_CHANNEL],
            TcpRole::Server => match send.channel {
                Some(id) => {
                    if self.clients.iter().any(|c| c.id == id) {
                        vec![id]
                    } else {
                        return Err(Status::Extension { code: EIO, label: "SEND_UNKNOWN_CHANNEL" });
                    }
                }
                None => {
                    if self.clients.is_empty() {
                        return Err(Status::Extension {
                            code: EIO,
                            label: "SEND_FAILED_NO_CLIENTS",
                        });
                    }
                    self.clients.iter().map(|c| c.id).collect()
                }
            },
        };
        self.cursor = SendCursor { targets, index: 0, offset: 0 };
        Ok(())
    }

    /// Pushes bytes toward the current send target. Returns true when the
    /// whole send finished.
    fn advance_send(&mut self, send: &mut SendOp) -> bool {
        while self.cursor.index < self.cursor.targets.len() {
            let target = self.cursor.targets[self.cursor.index];
            let stream = match self.role {
                TcpRole::Client => self.stream.as_mut(),
                TcpRole::Server => self
                    .clients
                    .iter_mut()
                    .find(|c| c.id == target)
                    .map(|c| &mut c.stream),
            };
            let Some(stream) = stream else {
                // the target vanished mid-send; skip it
                self.cursor.index += 1;
                self.cursor.offset = 0;
                continue;
            };
            match stream.write(&send.data[self.cursor.offset..]) {
                Ok(0) => {
                    self.drop_client(target);
                    self.cursor.index += 1;
                    self.cursor.offset = 0;
                }
                Ok(n) => {
                    self.cursor.offset += n;
                    if self.cursor.offset >= send.data.len() {
                        trace!(channel = target, len = send.data.len(), "tcp send complete");
                        self.cursor.index += 1;
                        self.cursor.offset = 0;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    if self.role == TcpRole::Server {
                        self.drop_client(target);
                        self.cursor.index += 1;
                        self.cursor.offset = 0;
                    } else {
                        send.end_with_error(EIO, "SEND_FAILED");
                        return true;
                    }
                }
            }
        }
        send.end(Status::Success);
        true
    }

    /// Tries one receive across the connected streams. Returns true if the
    /// op reached a final status, false to keep polling. Client-side peer
    /// loss is reported through `lost_link`.
    fn try_receive(&mut self, recv: &mut RecvOp) -> RecvPoll {
        match self.role {
            TcpRole::Client => {
                let Some(stream) = self.stream.as_mut() else { return RecvPoll::LinkLost };
                let buf = recv.buffer();
                match stream.read(buf) {
                    Ok(0) => RecvPoll::LinkLost,
                    Ok(n) => {
                        recv.set_received(n);
                        recv.channel = Some(CLIENT_CHANNEL);
                        recv.end(Status::Success);
                        RecvPoll::Finished
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => RecvPoll::Pending,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => RecvPoll::Pending,
                    Err(_) => RecvPoll::LinkLost,
                }
            }
            TcpRole::Server => {
                let count = self.clients.len();
                let mut dropped = Vec::new();
                let mut outcome = RecvPoll::Pending;
                for step in 0..count {
                    let index = (self.recv_rotation + step) % count;
                    let client = &mut self.clients[index];
                    let id = client.id;
                    let buf = recv.buffer();
                    match client.stream.read(buf) {
                        Ok(0) => dropped.push(id),
                        Ok(n) => {
                            recv.set_received(n);
                            recv.channel = Some(id);
                            recv.end(Status::Success);
                            // rotate so one chatty client cannot starve the rest
                            self.recv_rotation = index + 1;
                            outcome = RecvPoll::Finished;
                            break;
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => dropped.push(id),
                    }
                }
                for id in dropped {
                    self.drop_client(id);
                }
                outcome
            }
        }
    }
}

enum RecvPoll {
    Pending,
    Finished,
    LinkLost,
}

fn os_code(err: &io::Error) -> u32 {
    err.raw_os_error().map(|code| code as u32).unwrap_or(0)
}

fn apply_stream_options(stream: &TcpStream, args: &TcpArgs) -> io::Result<()> {
    let sock = SockRef::from(stream);
    if let Some(size) = args.recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = args.send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    if args.nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(())
}

impl Transport for TcpTransport {
    type OpenArgs = TcpArgs;
    type Waker = TcpWaker;

    fn waker(&self) -> TcpWaker {
        TcpWaker(Arc::clone(&self.wake))
    }

    fn destruct(&mut self) {
        self.close_everything();
    }

    fn process_open(&mut self, op: &mut OpenOp, cx: &mut LinkCtx<'_, TcpArgs>) {
        // reopen closes the previous sockets first
        self.close_everything();

        let Some(addr) = cx.open_args.addr else {
            op.end_with_error(EINVAL, "INVALID_ADDR");
            return;
        };
        self.role = cx.open_args.role;

        match self.role {
            TcpRole::Server => {
                let listener = match TcpListener::bind(addr) {
                    Ok(listener) => listener,
                    Err(err) => {
                        op.end_with_error(os_code(&err), "BIND_FAILURE");
                        return;
                    }
                };
                if let Err(err) = listener.set_nonblocking(true) {
                    op.end_with_error(os_code(&err), "NONBLOCK_FAILURE");
                    return;
                }
                cx.open_args.local = listener.local_addr().ok();
                debug!(local = ?cx.open_args.local, "tcp server listening");
                self.listener = Some(listener);
            }
            TcpRole::Client => {
                if addr.port() == 0 {
                    op.end_with_error(EINVAL, "INVALID_PORT");
                    return;
                }
                let connect = match deadline::time_left(op.deadline, Instant::now()) {
                    Some(left) if left > Duration::ZERO => {
                        TcpStream::connect_timeout(&addr, left)
                    }
                    Some(_) => {
                        op.end(Status::TimedOut);
                        return;
                    }
                    None => TcpStream::connect(addr),
                };
                let stream = match connect {
                    Ok(stream) => stream,
                    Err(err) => {
                        op.end_with_error(os_code(&err), "CONNECT_FAILURE");
                        return;
                    }
                };
                if let Err(err) = apply_stream_options(&stream, cx.open_args) {
                    op.end_with_error(os_code(&err), "SOCKOPT_FAILURE");
                    return;
                }
                if let Err(err) = stream.set_nonblocking(true) {
                    op.end_with_error(os_code(&err), "NONBLOCK_FAILURE");
                    return;
                }
                cx.open_args.local = stream.local_addr().ok();
                debug!(local = ?cx.open_args.local, peer = %addr, "tcp client connected");
                self.stream = Some(stream);
            }
        }

        // keep the hook running while open so the server can accept and
        // reap clients with nothing pending
        *cx.idle_in_send_recv = self.role == TcpRole::Server;
        op.end(Status::Success);
    }

    fn process_close(&mut self, op: &mut CloseOp, cx: &mut LinkCtx<'_, TcpArgs>) {
        self.close_everything();
        *cx.idle_in_send_recv = false;
        op.end(Status::Success);
    }

    fn process_send_receive(&mut self, mut io: SendRecv<'_>, cx: &mut LinkCtx<'_, TcpArgs>) {
        let max_clients = cx.open_args.max_clients.max(1);
        loop {
            if !self.is_open() {
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

            if self.role == TcpRole::Server {
                if let Err(err) = self.accept_clients(max_clients) {
                    self.fault(cx, os_code(&err), "SERVER_ACCEPT_FAILED");
                    continue;
                }
                let receiving =
                    io.recv.as_deref().map(|op| op.is_operating()).unwrap_or(false);
                if !receiving {
                    // only probe for hangups while no receive could be
                    // consuming those same streams
                    self.reap_disconnected();
                }
            }

            if let Some(send) = io.send.as_deref_mut() {
                if send.is_operating() {
                    if send.status == Status::StartNewOp {
                        if let Err(status) = self.start_send(send) {
                            send.end(status);
                        } else {
                            send.status = Status::InProgress;
                        }
                    }
                    if send.is_operating() && send.data.is_empty() {
                        send.end(Status::Success);
                    }
                    if send.is_operating() {
                        self.advance_send(send);
                    }
                }
            }

            if let Some(recv) = io.recv.as_deref_mut() {
                if recv.is_operating() {
                    match self.try_receive(recv) {
                        RecvPoll::Finished | RecvPoll::Pending => {}
                        RecvPoll::LinkLost => {
                            recv.end_with_error(EIO, "RECV_FAILED_SOCK_CLOSED");
                            self.fault(
                                cx,
                                EIO,
                                if self.role == TcpRole::Client {
                                    "SERVER_CLOSED_CONN"
                                } else {
                                    "CLIENT_CLOSED_CONN"
                                },
                            );
                            continue;
                        }
                    }
                }
            }

            let send_pending =
                io.send.as_deref().map(|op| op.is_operating()).unwrap_or(false);
            let recv_pending =
                io.recv.as_deref().map(|op| op.is_operating()).unwrap_or(false);
            if !send_pending && !recv_pending && !*cx.idle_in_send_recv {
                return;
            }
            if self.consumed_wake() {
                return;
            }
            let now = Instant::now();
            if !send_pending && !recv_pending {
                // idling: give the dispatcher a turn after each slice so new
                // requests are picked up promptly
                std::thread::sleep(POLL_SLICE);
                return;
            }
            let expired = (send_pending
                && deadline::has_expired(io.send.as_deref().and_then(|op| op.deadline), now))
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
        match self.role {
            TcpRole::Client => "tcp::socket<client>",
            TcpRole::Server => "tcp::socket<server>",
        }
    }

    fn id(&self) -> i32 {
        match self.role {
            TcpRole::Client => 0x6B44,
            TcpRole::Server => 0x2654,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_builders() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let client = TcpArgs::client(addr).nodelay();
        assert_eq!(client.role, TcpRole::Client);
        assert!(client.nodelay);
        assert_eq!(client.max_clients, 0);

        let server = TcpArgs::server(addr).max_clients(4);
        assert_eq!(server.role, TcpRole::Server);
        assert_eq!(server.max_clients, 4);
    }

    #[test]
    fn test_send_cursor_defaults_empty() {
        let cursor = SendCursor::default();
        assert!(cursor.targets.is_empty());
        assert_eq!(cursor.index, 0);
    }
}
