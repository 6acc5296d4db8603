use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::socket::Socket;

pub type NewConnectionCallback = Arc<dyn Fn(Socket, SocketAddr) + Send + Sync>;

/// Owns the listening socket and its channel on the main loop; hands each
/// accepted descriptor to the new-connection callback.
pub struct Acceptor {
    owner_loop: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        owner_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>> {
        let setup = |e: io::Error| Error::Listen {
            addr: listen_addr,
            source: e,
        };
        let accept_socket = Socket::new_nonblocking(&listen_addr).map_err(setup)?;
        accept_socket.set_reuse_addr(true).map_err(setup)?;
        if reuse_port {
            accept_socket.set_reuse_port(true).map_err(setup)?;
        }
        accept_socket.bind_address(&listen_addr).map_err(setup)?;

        let acceptor = Arc::new(Acceptor {
            owner_loop: owner_loop.clone(),
            accept_channel: Channel::new(Arc::downgrade(owner_loop), accept_socket.fd()),
            accept_socket,
            listening: AtomicBool::new(false),
            new_connection_cb: Mutex::new(None),
        });

        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        acceptor.accept_channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(Socket, SocketAddr) + Send + Sync + 'static,
    {
        *self.new_connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Address the listening socket actually bound to; useful with port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.accept_socket.local_addr()
    }

    /// Start listening and enable read interest. Must run on the owning
    /// loop's thread.
    pub fn listen(&self) -> Result<()> {
        self.owner_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::SeqCst);
        self.accept_socket.listen().map_err(|e| Error::Listen {
            addr: self.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap()),
            source: e,
        })?;
        self.accept_channel.enable_reading();
        Ok(())
    }

    /// One accept per readiness: the descriptor stays readable under
    /// level-triggered polling, so any backlog is drained across iterations
    /// and loops stay fair.
    fn handle_read(&self) {
        match self.accept_socket.accept() {
            Ok((socket, peer_addr)) => {
                debug!("accepted connection from {peer_addr}");
                let cb = self.new_connection_cb.lock().unwrap().clone();
                match cb {
                    Some(cb) => cb(socket, peer_addr),
                    // Nobody to hand it to; closing is the only safe choice.
                    None => drop(socket),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("accept failed: {e}");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    error!("file descriptor limit reached while accepting");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let channel = self.accept_channel.clone();
        self.owner_loop.run_in_loop(move || {
            channel.disable_all();
            channel.remove();
        });
    }
}
