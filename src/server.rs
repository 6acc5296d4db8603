use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::EventLoopThreadPool;
use crate::socket::Socket;

/// Configuration for a [`TcpServer`].
///
/// Use [`TcpServerConfig::builder`] for ergonomic construction; every field
/// falls back to the default shown in [`TcpServerConfig::default`].
#[derive(Clone)]
pub struct TcpServerConfig {
    /// Address to bind to.
    pub address: SocketAddr,
    /// Server name, used as the prefix of connection names.
    pub name: String,
    /// Enable `SO_REUSEPORT` on the listening socket.
    pub reuse_port: bool,
    /// Number of sub-loop threads; zero keeps everything on the main loop.
    pub io_threads: usize,
    /// Enable `TCP_NODELAY` on accepted connections.
    pub no_delay: bool,
    /// Enable `SO_KEEPALIVE` on accepted connections.
    pub keep_alive: bool,
}

impl TcpServerConfig {
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::new()
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".parse().unwrap(),
            name: "millrace".to_string(),
            reuse_port: false,
            io_threads: 0,
            no_delay: true,
            keep_alive: true,
        }
    }
}

/// Builder for [`TcpServerConfig`].
pub struct TcpServerConfigBuilder {
    address: Option<SocketAddr>,
    name: Option<String>,
    reuse_port: Option<bool>,
    io_threads: Option<usize>,
    no_delay: Option<bool>,
    keep_alive: Option<bool>,
}

impl TcpServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            address: None,
            name: None,
            reuse_port: None,
            io_threads: None,
            no_delay: None,
            keep_alive: None,
        }
    }

    /// Set the address to bind to.
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the server name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Enable or disable `SO_REUSEPORT`.
    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = Some(enabled);
        self
    }

    /// Set the number of sub-loop threads.
    pub fn io_threads(mut self, num: usize) -> Self {
        self.io_threads = Some(num);
        self
    }

    /// Enable or disable `TCP_NODELAY` on accepted connections.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Enable or disable `SO_KEEPALIVE` on accepted connections.
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = Some(enabled);
        self
    }

    pub fn build(self) -> TcpServerConfig {
        let default = TcpServerConfig::default();
        TcpServerConfig {
            address: self.address.unwrap_or(default.address),
            name: self.name.unwrap_or(default.name),
            reuse_port: self.reuse_port.unwrap_or(default.reuse_port),
            io_threads: self.io_threads.unwrap_or(default.io_threads),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
        }
    }
}

impl Default for TcpServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// User-facing facade wiring the acceptor on the main loop to connections
/// dispatched round-robin across the sub loops.
pub struct TcpServer {
    main_loop: Arc<EventLoop>,
    config: TcpServerConfig,
    listen_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    pool: EventLoopThreadPool,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
}

impl TcpServer {
    pub fn new(main_loop: Arc<EventLoop>, config: TcpServerConfig) -> Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(&main_loop, config.address, config.reuse_port)?;
        // Bound address, resolved in case the config asked for port 0.
        let listen_addr = acceptor.local_addr().unwrap_or(config.address);
        let pool = EventLoopThreadPool::new(main_loop.clone(), &config.name);
        pool.set_thread_num(config.io_threads);

        let server = Arc::new(TcpServer {
            main_loop,
            listen_addr,
            acceptor,
            pool,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            config,
        });

        let weak: Weak<TcpServer> = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(move |socket, peer_addr| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(socket, peer_addr);
            }
        });
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Address the server is listening on.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_cb.lock().unwrap() = Some(cb);
    }

    /// Start the sub-loop pool and begin listening. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.start()?;
        let acceptor = self.acceptor.clone();
        let addr = self.listen_addr;
        self.main_loop.run_in_loop(move || {
            if let Err(e) = acceptor.listen() {
                panic!("TcpServer failed to listen on {addr}: {e}");
            }
        });
        debug!("TcpServer [{}] listening on {}", self.config.name, addr);
        Ok(())
    }

    /// Runs on the main loop for every accepted descriptor: one-shot
    /// transfer of the socket onto the chosen sub loop.
    fn new_connection(self: &Arc<Self>, socket: Socket, peer_addr: SocketAddr) {
        let io_loop = self.pool.get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}-{}#{}", self.config.name, self.listen_addr, id);
        debug!("TcpServer::new_connection [{name}] from {peer_addr}");

        if self.config.no_delay {
            if let Err(e) = socket.set_tcp_no_delay(true) {
                error!("set_tcp_no_delay on [{name}] failed: {e}");
            }
        }
        if self.config.keep_alive {
            if let Err(e) = socket.set_keep_alive(true) {
                error!("set_keep_alive on [{name}] failed: {e}");
            }
        }
        let local_addr = socket.local_addr().unwrap_or(self.listen_addr);

        let conn = TcpConnection::new(io_loop.clone(), name.clone(), socket, local_addr, peer_addr);
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
            conn.set_high_water_mark_callback(cb);
        }
        let weak: Weak<TcpServer> = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections.lock().unwrap().insert(name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Invoked from a connection's close path, on its sub loop; deregisters
    /// on the main loop and schedules destruction back on the sub loop.
    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let server = self.clone();
        let conn = conn.clone();
        self.main_loop.run_in_loop(move || {
            debug!("TcpServer::remove_connection [{}]", conn.name());
            server.connections.lock().unwrap().remove(conn.name());
            let io_loop = conn.owner_loop().clone();
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        for (_, conn) in self.connections.lock().unwrap().drain() {
            let io_loop = conn.owner_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
