use std::net::SocketAddr;
use std::sync::Arc;

use millrace::{EventLoopThread, Result, TcpServer, TcpServerConfig};
use tracing::info;

// Discard protocol (RFC 863): read and drop everything. Handy for eyeballing
// input-buffer throughput under load.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8090".to_string())
        .parse()
        .expect("usage: discard_server [ip:port]");

    let main_thread = EventLoopThread::start("discard-main")?;
    let config = TcpServerConfig::builder()
        .address(addr)
        .name("discard")
        .io_threads(2)
        .build();
    let server = TcpServer::new(main_thread.event_loop(), config)?;

    server.set_message_callback(Arc::new(|conn, buffer, receive_time| {
        let n = buffer.readable_bytes();
        buffer.retrieve(n);
        info!("{} discarded {n} bytes at {receive_time:?}", conn.name());
    }));
    server.start()?;

    info!("discard server listening on {}", server.listen_addr());
    std::thread::park();
    Ok(())
}
