use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::{debug, error, trace};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::socket::Socket;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Output-buffer size at which the high-water callback fires, once, on the
/// upward crossing.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// One established connection: the socket, its channel, and the input and
/// output buffers, driven entirely on the owning sub-loop's thread.
///
/// Shared between the server's registry and every callback that receives it;
/// the channel observes it weakly and promotes that observation around each
/// dispatch, so handlers never run against a destroyed connection.
pub struct TcpConnection {
    owner_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    pub fn new(
        owner_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let channel = Channel::new(Arc::downgrade(&owner_loop), socket.fd());

            let w = weak.clone();
            channel.set_read_callback(move |receive_time| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(receive_time);
                }
            });
            let w = weak.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write();
                }
            });
            let w = weak.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
            });
            let w = weak.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_error();
                }
            });

            TcpConnection {
                owner_loop,
                name,
                state: AtomicU8::new(ConnState::Connecting as u8),
                reading: AtomicBool::new(false),
                channel,
                socket,
                local_addr,
                peer_addr,
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                connection_cb: Mutex::new(None),
                message_cb: Mutex::new(None),
                write_complete_cb: Mutex::new(None),
                high_water_cb: Mutex::new(None),
                close_cb: Mutex::new(None),
            }
        });
        debug!("TcpConnection::new [{}] fd={}", conn.name, conn.channel.fd());
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.owner_loop
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::SeqCst);
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

    /// Installed by the server facade to deregister the connection and
    /// schedule its destruction.
    pub fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    /// Send `data`, directly when called on the owning loop, otherwise
    /// marshalled onto it. Silently ignored unless currently connected.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.owner_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.owner_loop.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        let mut wrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        if self.state() == ConnState::Disconnected {
            error!("[{}] is disconnected, giving up writing", self.name);
            return;
        }

        // Nothing queued and not awaiting writability: try the direct path.
        if !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            match self.socket.send(data) {
                Ok(n) => {
                    wrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                            let conn = self.clone();
                            self.owner_loop.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send_in_loop [{}]: {e}", self.name);
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let mut output = self.output_buffer.lock().unwrap();
            let old_len = output.readable_bytes();
            let high_water = self.high_water_mark.load(Ordering::SeqCst);
            if old_len < high_water && high_water <= old_len + remaining {
                if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
                    let conn = self.clone();
                    let new_len = old_len + remaining;
                    self.owner_loop.queue_in_loop(move || cb(&conn, new_len));
                }
            }
            output.append(&data[wrote..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close the write side once pending output drains. Only meaningful
    /// from the connected state.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.owner_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        // Write interest still on means the output buffer has not drained;
        // handle_write performs the half-close after the last flush.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// Called on the owning loop once the server has registered the
    /// connection: ties the channel to this connection's lifetime, starts
    /// reading, and fires the user connection callback.
    pub fn connect_established(self: &Arc<Self>) {
        self.owner_loop.assert_in_loop_thread();
        self.set_state(ConnState::Connected);
        self.channel.tie(self.clone());
        self.channel.enable_reading();
        self.reading.store(true, Ordering::SeqCst);
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(self);
        }
    }

    /// Final teardown, scheduled onto the owning loop by the server facade.
    /// Idempotent; always unregisters the channel.
    pub fn connect_destroyed(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let cb = self.message_cb.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb(self, &mut input, receive_time);
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                // No progress this call; level-triggered readiness retries.
            }
            Err(e) => {
                drop(input);
                error!("TcpConnection::handle_read [{}]: {e}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            trace!("[{}] is down, no more writing", self.name);
            return;
        }
        let mut output = self.output_buffer.lock().unwrap();
        match output.write_fd(self.channel.fd()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    self.channel.disable_writing();
                    if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
                        let conn = self.clone();
                        self.owner_loop.queue_in_loop(move || cb(&conn));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("TcpConnection::handle_write [{}]: {e}", self.name);
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        debug!(
            "TcpConnection::handle_close [{}] state={:?}",
            self.name,
            self.state()
        );
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(self);
        }
        // The server's close callback deregisters this connection and
        // schedules connect_destroyed on the owning loop.
        if let Some(cb) = self.close_cb.lock().unwrap().clone() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!("TcpConnection::handle_error [{}]: SO_ERROR = {e}", self.name),
            Ok(None) => {}
            Err(e) => error!("TcpConnection::handle_error [{}]: {e}", self.name),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
    }
}
