use std::net::SocketAddr;
use std::sync::Arc;

use millrace::{EventLoopThread, Result, TcpServer, TcpServerConfig};
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string())
        .parse()
        .expect("usage: echo_server [ip:port]");

    let main_thread = EventLoopThread::start("echo-main")?;
    let config = TcpServerConfig::builder()
        .address(addr)
        .name("echo")
        .io_threads(4)
        .build();
    let server = TcpServer::new(main_thread.event_loop(), config)?;

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            info!("{} is up ({} -> {})", conn.name(), conn.peer_addr(), conn.local_addr());
        } else {
            info!("{} is down", conn.name());
        }
    }));
    server.set_message_callback(Arc::new(|conn, buffer, _receive_time| {
        let data = buffer.retrieve_all_as_string();
        conn.send(data.as_bytes());
    }));
    server.start()?;

    info!("echo server listening on {}", server.listen_addr());
    std::thread::park();
    Ok(())
}
