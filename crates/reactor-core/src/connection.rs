//! An established TCP connection: one per accepted (or, eventually,
//! outbound) socket, living entirely on one worker loop (§4.8).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use reactor_utils::safe_assert;
use tracing::{error, warn};

use crate::buffer::ByteBuffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::socket::SocketHandle;
use crate::time::Timestamp;

// `Arc`-based rather than `Box`-based: the server installs one callback per
// kind that every connection it creates shares, so the callback itself must
// be cheaply cloneable, not consumed by the first connection that receives it.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut ByteBuffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<Connection>, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

/// The mutable parts of a connection that aren't the `Channel` or the input
/// buffer. Kept in a *separate* mutex from `channel`: the dispatch path
/// releases `channel`'s lock before invoking a read/write callback
/// (`event_loop::dispatch_ready`), but that callback still re-enters through
/// `Connection`'s own API (`handle_write` re-locking `channel`, a synchronous
/// `send()`/`shutdown()` locking `inner`), so this needs to be a lock
/// genuinely distinct from the one dispatch last held, not just dropped
/// before the call.
struct Inner {
    state: ConnState,
    output_buffer: ByteBuffer,
    high_water_mark: usize,
}

/// An established connection. Always held behind `Arc`, since both its
/// owning loop and any cross-thread `send`/`shutdown` caller need a stable
/// reference; `Weak` copies are what `Channel`'s lifetime tie and the
/// server's connection registry actually hold day to day.
pub struct Connection {
    name: String,
    loop_handle: LoopHandle,
    socket: SocketHandle,
    pub(crate) channel: Mutex<Channel>,
    // Separate from `inner` so that `handle_read` holding this lock across a
    // synchronous message callback doesn't block that same callback calling
    // back into `send()`/`shutdown()`, which only ever need `inner` and
    // `channel` — never this buffer.
    input_buffer: Mutex<ByteBuffer>,
    inner: Mutex<Inner>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state_tag: AtomicU8,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

impl Connection {
    pub fn new(
        name: String,
        loop_handle: LoopHandle,
        socket: SocketHandle,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        registry: mio::Registry,
    ) -> Arc<Self> {
        let fd = socket.fd();
        socket.set_tcp_nodelay(true).ok();
        socket.set_keepalive(true).ok();

        let conn = Arc::new(Connection {
            name,
            loop_handle,
            socket,
            channel: Mutex::new(Channel::new(fd, registry)),
            input_buffer: Mutex::new(ByteBuffer::new()),
            inner: Mutex::new(Inner {
                state: ConnState::Connecting,
                output_buffer: ByteBuffer::new(),
                high_water_mark: 64 * 1024 * 1024,
            }),
            local_addr,
            peer_addr,
            state_tag: AtomicU8::new(ConnState::Connecting as u8),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        });

        Self::wire_channel(&conn);
        conn
    }

    /// Installs the four channel-level callbacks, each capturing only a weak
    /// back-reference so the channel never keeps the connection alive.
    fn wire_channel(conn: &Arc<Connection>) {
        let mut channel = conn.channel.lock().unwrap();
        channel.tie(Arc::downgrade(conn));

        let weak = Arc::downgrade(conn);
        channel.set_read_callback(Box::new(move |time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(time);
            }
        }));

        let weak = Arc::downgrade(conn);
        channel.set_write_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        }));

        let weak = Arc::downgrade(conn);
        channel.set_close_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        }));

        let weak = Arc::downgrade(conn);
        channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));
    }

    /// Per §5/§7: every mutating entry point asserts it's running on the
    /// connection's owning loop thread rather than silently racing a
    /// cross-thread caller — `send`/`shutdown` branch around this by
    /// queueing onto the loop instead of calling straight through.
    fn assert_on_loop_thread(&self, what: &str) {
        safe_assert!(
            self.loop_handle.is_in_loop_thread(),
            "Connection::{what} called off its owning loop thread (conn={})",
            self.name
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn socket_fd(&self) -> std::os::fd::RawFd {
        self.socket.fd()
    }

    pub fn connected(&self) -> bool {
        self.state_tag.load(Ordering::Acquire) == ConnState::Connected as u8
    }

    pub fn disconnected(&self) -> bool {
        self.state_tag.load(Ordering::Acquire) == ConnState::Disconnected as u8
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

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_cb.lock().unwrap() = Some(cb);
        self.inner.lock().unwrap().high_water_mark = mark;
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(err) = self.socket.set_tcp_nodelay(on) {
            warn!(conn = %self.name, %err, "failed to set TCP_NODELAY");
        }
    }

    /// Schedules (or runs, if already on the owning loop) enabling read
    /// interest — the user-facing half of `startRead`/`stopRead` (§6).
    pub fn start_read(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.loop_handle.run_in_loop(move || {
            this.channel.lock().unwrap().enable_reading();
        });
    }

    pub fn stop_read(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.loop_handle.run_in_loop(move || {
            this.channel.lock().unwrap().disable_reading();
        });
    }

    /// Called once, on the owning loop, right after construction.
    pub fn connect_established(self: &Arc<Self>) {
        self.assert_on_loop_thread("connect_established");
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state, ConnState::Connecting);
            inner.state = ConnState::Connected;
        }
        self.state_tag.store(ConnState::Connected as u8, Ordering::Release);

        self.channel.lock().unwrap().enable_reading();

        if let Some(cb) = self.connection_cb.lock().unwrap().as_ref() {
            cb(self);
        }
    }

    fn handle_read(self: &Arc<Self>, time: Timestamp) {
        self.assert_on_loop_thread("handle_read");
        let fd = self.socket.fd();
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_from_fd(fd) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_n) => {
                if let Some(cb) = self.message_cb.lock().unwrap().as_ref() {
                    cb(self, &mut input, time);
                }
            }
            Err(err) => {
                drop(input);
                error!(conn = %self.name, %err, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.assert_on_loop_thread("handle_write");
        let is_writing = self.channel.lock().unwrap().is_writing();
        if !is_writing {
            warn!(conn = %self.name, "handleWrite called with no write interest");
            return;
        }

        let fd = self.socket.fd();
        let mut inner = self.inner.lock().unwrap();
        let n = match inner.output_buffer.write_to_fd(fd) {
            Ok(n) => n,
            Err(err) => {
                error!(conn = %self.name, %err, "write failed");
                return;
            }
        };
        inner.output_buffer.retrieve(n);
        if inner.output_buffer.readable_bytes() != 0 {
            return;
        }

        self.channel.lock().unwrap().disable_writing();
        let was_disconnecting = inner.state == ConnState::Disconnecting;
        drop(inner);

        if self.write_complete_cb.lock().unwrap().is_some() {
            let this = Arc::clone(self);
            self.loop_handle.queue_in_loop(move || cb_call(&this));
        }

        if was_disconnecting {
            self.shutdown_in_loop();
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.assert_on_loop_thread("handle_close");
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = ConnState::Disconnected;
        }
        self.state_tag.store(ConnState::Disconnected as u8, Ordering::Release);
        self.channel.lock().unwrap().disable_all();

        // Hold a strong reference across both callbacks: the close callback
        // typically erases the server's own Arc, and we must not be dropped
        // mid-dispatch.
        let this = Arc::clone(self);
        if let Some(cb) = this.connection_cb.lock().unwrap().as_ref() {
            cb(&this);
        }
        if let Some(cb) = this.close_cb.lock().unwrap().as_ref() {
            cb(&this);
        }
    }

    fn handle_error(&self) {
        self.assert_on_loop_thread("handle_error");
        match self.socket.take_error() {
            Ok(0) => {}
            Ok(code) => {
                let err = std::io::Error::from_raw_os_error(code);
                error!(conn = %self.name, %err, "socket error");
            }
            Err(err) => error!(conn = %self.name, %err, "SO_ERROR read failed"),
        }
    }

    /// Queues (or copies and sends) `data`. Per §4.8, data crossing a thread
    /// boundary must be copied into the queued closure — it cannot borrow
    /// the caller's buffer.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if !self.connected() {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let this = Arc::clone(self);
            self.loop_handle.queue_in_loop(move || {
                this.send_in_loop(&owned);
            });
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.assert_on_loop_thread("send_in_loop");
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnState::Disconnecting {
            warn!(conn = %self.name, "send on a connection that is disconnecting");
            return;
        }

        let mut n_written: usize = 0;
        let mut fault_error = false;
        let is_writing = self.channel.lock().unwrap().is_writing();

        if !is_writing && inner.output_buffer.readable_bytes() == 0 {
            let fd = self.socket.fd();
            match write_once(fd, data) {
                Ok(n) => {
                    n_written = n;
                    if n == data.len() {
                        if let Some(cb) = self.write_complete_cb.lock().unwrap().as_ref() {
                            let this = Arc::clone(self);
                            drop(inner);
                            self.loop_handle.queue_in_loop(move || cb_call(&this));
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    n_written = 0;
                }
                Err(err)
                    if err.raw_os_error() == Some(libc::EPIPE)
                        || err.raw_os_error() == Some(libc::ECONNRESET) =>
                {
                    fault_error = true;
                }
                Err(err) => {
                    error!(conn = %self.name, %err, "write failed");
                }
            }
        }

        if fault_error {
            return;
        }

        let remaining = data.len() - n_written;
        if remaining > 0 {
            // Strictly greater, not >=: writing exactly up to the mark must not
            // fire (only the edge that actually crosses it should).
            let old_len = inner.output_buffer.readable_bytes();
            if old_len < inner.high_water_mark && old_len + remaining > inner.high_water_mark {
                let this = Arc::clone(self);
                let total = old_len + remaining;
                self.loop_handle.queue_in_loop(move || {
                    if let Some(cb) = this.high_water_cb.lock().unwrap().as_ref() {
                        cb(&this, total);
                    }
                });
            }
            inner.output_buffer.append(&data[n_written..]);
            drop(inner);
            self.channel.lock().unwrap().enable_writing();
        }
    }

    /// `shutdown()`: half-closes for writing once the output buffer drains.
    /// Unlike `send`, this has no cross-thread branch — per §6's surface,
    /// every existing call site reaches it from within a callback already
    /// running on the owning loop, so it asserts that rather than queueing.
    pub fn shutdown(self: &Arc<Self>) {
        self.assert_on_loop_thread("shutdown");
        let mut inner = self.inner.lock().unwrap();
        if inner.state != ConnState::Connected {
            return;
        }
        inner.state = ConnState::Disconnecting;
        self.state_tag.store(ConnState::Disconnecting as u8, Ordering::Release);
        let is_writing = self.channel.lock().unwrap().is_writing();
        drop(inner);
        if !is_writing {
            self.shutdown_in_loop();
        }
        // else: handle_write's drain path will call shutdown_in_loop.
    }

    fn shutdown_in_loop(&self) {
        self.assert_on_loop_thread("shutdown_in_loop");
        if let Err(err) = self.socket.shutdown_write() {
            warn!(conn = %self.name, %err, "shutdownWrite failed");
        }
    }

    /// Idempotent teardown, regardless of which state we arrive in — the
    /// resolved answer to whether this needs defensive handling for every
    /// state or just `Connected`: matching exhaustively means a connection
    /// torn down twice (or torn down before `handleClose` ever ran) cannot
    /// double-fire the connection callback or double-remove the channel.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.assert_on_loop_thread("connect_destroyed");
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ConnState::Connected {
            inner.state = ConnState::Disconnected;
            self.state_tag.store(ConnState::Disconnected as u8, Ordering::Release);
            self.channel.lock().unwrap().disable_all();
            drop(inner);
            if let Some(cb) = self.connection_cb.lock().unwrap().as_ref() {
                cb(self);
            }
        } else {
            drop(inner);
        }
        self.channel.lock().unwrap().remove();
        crate::event_loop::unregister(self.socket.fd());
    }
}

fn cb_call(conn: &Arc<Connection>) {
    if let Some(cb) = conn.write_complete_cb.lock().unwrap().as_ref() {
        cb(conn);
    }
}

fn write_once(fd: std::os::fd::RawFd, data: &[u8]) -> std::io::Result<usize> {
    let rc = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(rc as usize)
}
