use std::io;
use std::net::SocketAddr;

/// Errors surfaced by the reactor core.
///
/// I/O failures on established connections never travel through this type;
/// they are routed to the close or error callbacks of the connection that
/// observed them. `Error` covers setup paths: sockets, binding, listening,
/// and loop-thread bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("listener setup failed on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("event loop is gone")]
    LoopGone,
}

pub type Result<T> = std::result::Result<T, Error>;
