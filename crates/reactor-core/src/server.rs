//! The embedding-facing façade: wires an `Acceptor` to a `LoopThreadPool`,
//! owns the connection registry, and routes accepted fds into freshly
//! constructed `Connection`s on whichever worker loop is next in line (§4.9).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::acceptor::Acceptor;
use crate::connection::{
    Connection, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::error::Result;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::thread_pool::LoopThreadPool;

/// Whether the listening socket is shared across multiple acceptors bound to
/// the same address (`SO_REUSEPORT`), per §6's `ServerOption`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

/// The callbacks a user installs once on the `Server`; every `Connection` it
/// creates shares the same `Arc`-wrapped closures.
#[derive(Default)]
struct Callbacks {
    connection: Mutex<Option<ConnectionCallback>>,
    message: Mutex<Option<MessageCallback>>,
    write_complete: Mutex<Option<WriteCompleteCallback>>,
    high_water: Mutex<Option<HighWaterMarkCallback>>,
    high_water_mark: AtomicUsize,
}

/// The server façade. Construction happens on the base loop; `newConnection`
/// always runs there too, so the connection registry never needs its own
/// lock beyond the one already implied by single-threaded base-loop access —
/// matching §5's "connection registry: owned by the server, accessed only on
/// the base loop."
pub struct Server {
    name: String,
    base_loop: LoopHandle,
    acceptor: Arc<Acceptor>,
    pool: Mutex<Option<LoopThreadPool>>,
    num_threads: AtomicUsize,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    next_conn_id: AtomicUsize,
    started: AtomicBool,
    callbacks: Arc<Callbacks>,
}

impl Server {
    /// `base_loop` is the `EventLoop` this `Server` (and its `Acceptor`) runs
    /// on; callers typically run it themselves via `EventLoop::run` after
    /// `start()`. Must be called on `base_loop`'s own thread.
    pub fn new(
        base_loop: &EventLoop,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        option: ServerOption,
    ) -> Result<Arc<Self>> {
        let acceptor = Arc::new(Acceptor::new(
            listen_addr,
            option == ServerOption::ReusePort,
            base_loop.registry(),
        )?);

        let server = Arc::new(Server {
            name: name.into(),
            base_loop: base_loop.handle(),
            acceptor,
            pool: Mutex::new(None),
            num_threads: AtomicUsize::new(0),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
            started: AtomicBool::new(false),
            callbacks: Arc::new(Callbacks {
                high_water_mark: AtomicUsize::new(64 * 1024 * 1024),
                ..Default::default()
            }),
        });

        crate::event_loop::register_acceptor(server.acceptor.fd(), Arc::downgrade(&server.acceptor));

        let weak = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(Box::new(move |socket, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(socket, peer);
            }
        }));

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address the listening socket is actually bound to — useful when
    /// `listen_addr`'s port was `0` and the kernel picked one.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Must be called before `start()`. `0` keeps all I/O on the base loop.
    pub fn set_thread_num(&self, n: usize) {
        self.num_threads.store(n, Ordering::Relaxed);
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.callbacks.connection.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<Connection>, &mut crate::buffer::ByteBuffer, crate::time::Timestamp)
        + Send
        + Sync
        + 'static,
    ) {
        *self.callbacks.message.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) {
        *self.callbacks.write_complete.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&Arc<Connection>, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        *self.callbacks.high_water.lock().unwrap() = Some(Arc::new(cb));
        self.callbacks.high_water_mark.store(mark, Ordering::Relaxed);
    }

    /// Idempotent: a second call observes `started` already set and is a
    /// no-op, matching §4.9 / the `Server.start() called K times` property.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let n = self.num_threads.load(Ordering::Relaxed);
        let pool = LoopThreadPool::start(n)?;
        *self.pool.lock().unwrap() = Some(pool);

        info!(server = %self.name, threads = n, "starting");
        self.acceptor.listen(1024)?;
        Ok(())
    }

    /// Runs on the base loop (the `Acceptor`'s read callback only ever fires
    /// there). Picks a worker, then hands the accepted socket off to it.
    fn new_connection(self: &Arc<Self>, socket: crate::socket::SocketHandle, peer: SocketAddr) {
        let io_loop = {
            let pool = self.pool.lock().unwrap();
            pool.as_ref()
                .and_then(LoopThreadPool::next_loop)
                .unwrap_or_else(|| self.base_loop.clone())
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, peer, id);

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                tracing::warn!(%err, "getsockname failed for accepted connection");
                return;
            }
        };

        let callbacks = Arc::clone(&self.callbacks);
        let server = Arc::clone(self);

        // Everything past this point must run on `io_loop`'s thread: the
        // `Connection`'s `Channel` registers against that loop's own
        // registry, and `register_connection` writes into that thread's
        // registrant directory.
        let io_loop_for_task = io_loop.clone();
        io_loop.run_in_loop(move || {
            let registry = io_loop_for_task.registry();
            let conn = Connection::new(conn_name, io_loop_for_task, socket, local_addr, peer, registry);

            crate::event_loop::register_connection(conn.socket_fd(), Arc::downgrade(&conn));

            if let Some(cb) = callbacks.connection.lock().unwrap().clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = callbacks.message.lock().unwrap().clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = callbacks.write_complete.lock().unwrap().clone() {
                conn.set_write_complete_callback(cb);
            }
            if let Some(cb) = callbacks.high_water.lock().unwrap().clone() {
                let mark = callbacks.high_water_mark.load(Ordering::Relaxed);
                conn.set_high_water_mark_callback(cb, mark);
            }

            let weak_server = Arc::downgrade(&server);
            let weak_conn_for_close = Arc::downgrade(&conn);
            conn.set_close_callback(Arc::new(move |_conn: &Arc<Connection>| {
                if let Some(server) = weak_server.upgrade() {
                    if let Some(conn) = weak_conn_for_close.upgrade() {
                        server.remove_connection(&conn);
                    }
                }
            }));

            server
                .connections
                .lock()
                .unwrap()
                .insert(conn.name().to_string(), Arc::clone(&conn));
            conn.connect_established();
        });
    }

    /// Routed back to the base loop regardless of which loop calls it
    /// (§4.9): erases the registry entry there, then enqueues
    /// `connect_destroyed` on the connection's own io loop. The strong
    /// reference captured in the queued task keeps the connection alive
    /// until destruction runs on the correct thread.
    fn remove_connection(self: &Arc<Self>, conn: &Arc<Connection>) {
        let this = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.base_loop.run_in_loop(move || {
            this.connections.lock().unwrap().remove(conn.name());
            let loop_handle = conn.loop_handle().clone();
            loop_handle.queue_in_loop(move || {
                conn.connect_destroyed();
            });
        });
    }
}
