//! SLIP-framed UDP client for the echo server example.
//!
//! - cargo run -p unilink --example client -- 127.0.0.1:7777
//! - cargo run -p unilink --example client -- 127.0.0.1:7777 10 200
//!   (sends 10 messages, 200ms apart)

use std::env;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use unilink::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Args: <server_addr> [count] [interval_ms]
    let mut args = env::args().skip(1);
    let server_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:7777".to_string())
        .parse()?;
    let count: usize = args.next().and_then(|v| v.parse().ok()).unwrap_or(5);
    let interval_ms: u64 = args.next().and_then(|v| v.parse().ok()).unwrap_or(300);

    let client = Endpoint::new(UdpTransport::new());
    client
        .open_with(
            Some(UdpArgs::client(server_addr)),
            CommonOpts::new()
                .send_filter(slip::Encode::new())
                .recv_filter(slip::Decode::new()),
            Timeout::Default,
        )
        .ok()?;

    println!("unilink client sending {count} messages to {server_addr}");

    let mut buf = [0u8; 1500];
    for i in 0..count {
        let message = format!("hello {i}");
        let status = client.send(message.as_bytes());
        if !status.is_success() {
            eprintln!("[send] failed: {status}");
            break;
        }

        let reply = client.receive_within(&mut buf, Timeout::After(Duration::from_secs(2)));
        match reply.status {
            Status::Success => {
                let text = String::from_utf8_lossy(&buf[..reply.len]);
                println!("[reply] \"{text}\"");
            }
            other => eprintln!("[reply] {other}"),
        }

        thread::sleep(Duration::from_millis(interval_ms));
    }

    client.close().ok()?;
    println!("done");
    Ok(())
}
