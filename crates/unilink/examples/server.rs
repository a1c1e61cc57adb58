//! SLIP-framed UDP echo server built on a receive callback.
//!
//! Run the server first:
//! - cargo run -p unilink --example server -- 127.0.0.1:7777
//!
//! Then run the client:
//! - cargo run -p unilink --example client -- 127.0.0.1:7777

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use unilink::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let bind_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7777".to_string())
        .parse()?;

    // the callback runs on the endpoint's management thread, so it hands
    // each message to the main thread over a channel instead of replying
    // inline
    let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let server = Endpoint::new(UdpTransport::new());
    server
        .open_with(
            Some(UdpArgs::server(bind_addr)),
            CommonOpts::new()
                .recv_filter(slip::Decode::new())
                .send_filter(slip::Encode::new())
                .recv_callback(RecvCallback::new(1500, move |op| {
                    let _ = tx.send(op.payload().to_vec());
                })),
            Timeout::Default,
        )
        .ok()?;

    let local = server.get_open_args().and_then(|args| args.local);
    println!("unilink echo server listening on {local:?}");

    loop {
        match rx.recv_timeout(Duration::from_secs(60)) {
            Ok(message) => {
                let text = String::from_utf8_lossy(&message);
                println!("[recv] {} bytes: \"{text}\"", message.len());

                let mut reply = b"echo: ".to_vec();
                reply.extend_from_slice(&message);
                let status = server.send(&reply);
                if !status.is_success() {
                    eprintln!("[send] failed: {status}");
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                println!("no traffic for a minute, shutting down");
                break;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    server.close().ok()?;
    Ok(())
}
