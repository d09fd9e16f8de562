//! Listening-socket machinery: binds, listens, and turns readiness on the
//! listening fd into accepted connections handed up to whoever owns this
//! `Acceptor` (§4.6).

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::channel::Channel;
use crate::error::Result;
use crate::socket::SocketHandle;

/// Invoked once per accepted connection with the new fd and its peer address.
/// The `Acceptor` itself never constructs a `Connection` — that requires
/// picking a worker loop, which is the server façade's job, not this one's.
pub type NewConnectionCallback = Box<dyn FnMut(SocketHandle, SocketAddr) + Send>;

/// Owns a non-blocking listening socket and its `Channel`. Held behind `Arc`
/// (not `Rc`): `Server`, which owns an `Acceptor`, is itself shared across
/// worker threads via connection close callbacks, so everything it contains
/// transitively needs to be `Send + Sync`. The channel lives in its own
/// `Mutex`, independent of the other fields — mirroring `Connection`'s
/// channel/inner split — so dispatching a readiness event (which locks the
/// channel) never conflicts with the read callback re-entering to call
/// `accept()` and touch `new_connection_cb`.
pub struct Acceptor {
    socket: SocketHandle,
    pub(crate) channel: Mutex<Channel>,
    listening: AtomicBool,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Creates a listening socket bound to `addr`. `reuse_port` mirrors the
    /// original's constructor argument, letting multiple acceptors across
    /// processes/threads share one address (§4.6, SO_REUSEPORT).
    pub fn new(addr: SocketAddr, reuse_port: bool, registry: mio::Registry) -> Result<Self> {
        let socket = SocketHandle::new_nonblocking()?;
        socket.set_reuse_addr(true).ok();
        if reuse_port {
            socket.set_reuse_port(true).ok();
        }
        let SocketAddr::V4(v4) = addr else {
            unreachable!("reactor-core only speaks IPv4, per the data model");
        };
        socket.bind(v4)?;

        let fd = socket.fd();
        Ok(Acceptor {
            socket,
            channel: Mutex::new(Channel::new(fd, registry)),
            listening: AtomicBool::new(false),
            new_connection_cb: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    /// Starts listening and registers the listening fd for read interest.
    /// Idempotent the way `TcpServer::start` needs it to be.
    pub fn listen(self: &Arc<Self>, backlog: i32) -> Result<()> {
        if self.listening.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.socket.listen(backlog)?;

        let weak = Arc::downgrade(self);
        let mut channel = self.channel.lock().unwrap();
        channel.set_read_callback(Box::new(move |_time| {
            let Some(acceptor) = weak.upgrade() else { return };
            acceptor.handle_read();
        }));
        channel.enable_reading();
        Ok(())
    }

    /// Accepts exactly one pending connection per readiness event (§9: single
    /// accept, not a drain loop — matches the original and keeps one ready
    /// acceptor from starving other channels on the same loop).
    fn handle_read(&self) {
        match self.socket.accept() {
            Ok(Some((handle, peer))) => {
                let mut cb = self.new_connection_cb.lock().unwrap();
                if let Some(cb) = cb.as_mut() {
                    cb(handle, peer);
                }
                // else: handle drops here, closing the fd — nobody to hand it to.
            }
            Ok(None) => {}
            Err(err) => {
                error!(%err, "accept failed");
                if err.raw_os_error() == Some(libc::EMFILE) {
                    error!("per-process open file descriptor limit reached");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let mut channel = self.channel.lock().unwrap();
        channel.disable_all();
        channel.remove();
    }
}
