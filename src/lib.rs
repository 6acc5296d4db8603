//! Multi-reactor, non-blocking TCP server core in the "one loop per thread"
//! style.
//!
//! A designated main loop hosts the acceptor; every accepted descriptor is
//! handed round-robin to a sub loop that owns the connection for its whole
//! life. All I/O is level-triggered and driven by [`mio::Poll`]; work that
//! originates on another thread reaches a loop through its pending queue and
//! an eventfd wakeup.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     User Application                     │
//! │        callbacks: connection / message / write-complete  │
//! └──────────────┬───────────────────────────────────────────┘
//!                │
//! ┌──────────────▼──────────────┐   round robin   ┌──────────┐
//! │  main EventLoop ── Acceptor │────────────────▶│ sub loop │
//! │  (listen fd channel)        │   accepted fd   │ channels │
//! └──────────────┬──────────────┘                 └────┬─────┘
//!                │ poll                                │ poll
//! ┌──────────────▼──────────────────────────────────────▼────┐
//! │            OS level-triggered readiness (epoll)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use millrace::{EventLoopThread, TcpServer, TcpServerConfig};
//! use std::sync::Arc;
//!
//! let main_thread = EventLoopThread::start("echo-main").unwrap();
//! let config = TcpServerConfig::builder()
//!     .address("127.0.0.1:8080".parse().unwrap())
//!     .name("echo")
//!     .io_threads(4)
//!     .build();
//! let server = TcpServer::new(main_thread.event_loop(), config).unwrap();
//! server.set_message_callback(Arc::new(|conn, buffer, _when| {
//!     let bytes = buffer.retrieve_all_as_string();
//!     conn.send(bytes.as_bytes());
//! }));
//! server.start().unwrap();
//! std::thread::park();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod event_loop_thread;
pub mod poller;
pub mod server;
pub mod socket;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::{Channel, Revents};
pub use connection::{
    CloseCallback, ConnState, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};
pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use poller::Poller;
pub use server::{TcpServer, TcpServerConfig};
pub use socket::Socket;
