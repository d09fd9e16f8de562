//! A per-thread reactor loop: one `EventLoop` owns exactly one OS thread's
//! worth of readiness polling, a cross-thread functor queue, and the routing
//! table that turns a ready fd back into the `Connection`/`Acceptor` that
//! owns it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::acceptor::Acceptor;
use crate::channel::Channel;
use crate::connection::Connection;
use crate::current_thread;
use crate::error::{Error, Result};
use crate::poller::ReadinessDemux;
use crate::time::Timestamp;

type Functor = Box<dyn FnOnce() + Send>;

/// What a ready fd routes back to. The `Weak` upgrade at lookup time is this
/// translation's version of `Channel`'s own `LifetimeTie`: if the owner has
/// already been torn down, the lookup simply finds nothing to dispatch to.
enum Registrant {
    Connection(Weak<Connection>),
    Acceptor(Weak<Acceptor>),
}

thread_local! {
    // Keyed by fd, scoped per OS thread rather than living inside `EventLoop`
    // itself: code that needs to register a freshly built `Connection`
    // (e.g. `Server::new_connection`'s queued task) runs as a plain functor
    // with no `&mut EventLoop` in hand, only the guarantee that it executes
    // on the owning loop's thread. A thread-local directory lets it reach
    // the routing table anyway; the one-loop-per-thread invariant
    // (`current_thread::with_loop_guard`) is what makes this sound.
    static REGISTRANTS: RefCell<HashMap<RawFd, Registrant>> = RefCell::new(HashMap::new());
}

/// Registers `fd` as belonging to `conn`, so a later readiness event on that
/// fd routes back to it. Must be called on the owning loop's thread.
pub fn register_connection(fd: RawFd, conn: Weak<Connection>) {
    REGISTRANTS.with(|r| r.borrow_mut().insert(fd, Registrant::Connection(conn)));
}

pub fn register_acceptor(fd: RawFd, acceptor: Weak<Acceptor>) {
    REGISTRANTS.with(|r| r.borrow_mut().insert(fd, Registrant::Acceptor(acceptor)));
}

pub fn unregister(fd: RawFd) {
    REGISTRANTS.with(|r| {
        r.borrow_mut().remove(&fd);
    });
}

/// A cheap, `Send + Sync` proxy onto an `EventLoop` confined to another
/// thread. Everything an `EventLoop` needs to expose across thread
/// boundaries — scheduling a functor, waking the loop, asking whether the
/// calling thread *is* the loop's thread, the registry handle needed to
/// register a fresh fd — lives here, mirroring how async runtimes split a
/// thread-confined driver from a freely cloneable handle.
#[derive(Clone)]
pub struct LoopHandle {
    tid: i64,
    wakeup_fd: RawFd,
    registry: mio::Registry,
    pending: Arc<Mutex<Vec<Functor>>>,
    quit: Arc<Mutex<bool>>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        current_thread::tid() == self.tid
    }

    pub fn registry(&self) -> mio::Registry {
        self.registry.clone()
    }

    /// Runs `f` now if called from the loop's own thread, otherwise queues it.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queues `f` for execution on the loop's thread and wakes it if the
    /// calling thread isn't already the loop thread (avoiding redundant
    /// self-wakeups while inside `calling_pending_functors`).
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push(Box::new(f));
        }
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn wakeup(&self) {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.wakeup_fd,
                std::ptr::addr_of!(one).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            warn!(err = %std::io::Error::last_os_error(), "failed to write to wakeup fd");
        }
    }

    pub fn quit(&self) {
        *self.quit.lock().unwrap() = true;
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }
}

/// The reactor itself. Not `Send`: must be constructed on, and driven from,
/// a single OS thread for its whole lifetime (§4.5's single-writer rule).
pub struct EventLoop {
    demux: ReadinessDemux,
    registry: mio::Registry,
    tid: i64,
    wakeup_fd: RawFd,
    wakeup_channel: Channel,
    pending: Arc<Mutex<Vec<Functor>>>,
    quit: Arc<Mutex<bool>>,
}

impl EventLoop {
    /// Constructs a new loop on the calling thread. Fails if another
    /// `EventLoop` already exists on this thread (one-loop-per-thread, §4.5).
    pub fn new() -> Result<Self> {
        current_thread::with_loop_guard(|| {
            let demux = ReadinessDemux::new()?;
            let registry = demux.registry().map_err(Error::PollCreate)?;

            let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if wakeup_fd < 0 {
                return Err(Error::EventFdCreate(std::io::Error::last_os_error()));
            }

            let mut wakeup_channel = Channel::new(wakeup_fd, registry.clone());
            wakeup_channel.set_read_callback(Box::new(move |_time| {
                let mut buf = [0u8; 8];
                let rc = unsafe { libc::read(wakeup_fd, buf.as_mut_ptr().cast(), buf.len()) };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() != std::io::ErrorKind::WouldBlock {
                        warn!(%err, "wakeup fd read failed");
                    }
                }
            }));
            wakeup_channel.enable_reading();

            Ok(EventLoop {
                demux,
                registry,
                tid: current_thread::tid(),
                wakeup_fd,
                wakeup_channel,
                pending: Arc::new(Mutex::new(Vec::new())),
                quit: Arc::new(Mutex::new(false)),
            })
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tid: self.tid,
            wakeup_fd: self.wakeup_fd,
            registry: self.registry.clone(),
            pending: Arc::clone(&self.pending),
            quit: Arc::clone(&self.quit),
        }
    }

    pub fn registry(&self) -> mio::Registry {
        self.registry.clone()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        current_thread::tid() == self.tid
    }

    /// Runs the reactor until `quit()` is called. §4.5's main iteration:
    /// poll, dispatch each ready channel in readiness order, then drain the
    /// cross-thread functor queue.
    pub fn run(&mut self) {
        debug!(tid = self.tid, "event loop starting");
        loop {
            if *self.quit.lock().unwrap() {
                break;
            }

            let (time, events) = self.demux.poll(Some(Duration::from_millis(10_000)));
            let ready: Vec<(RawFd, crate::channel::Revents)> = events
                .iter()
                .map(|ev| (ev.token().0 as RawFd, crate::channel::Revents::from(ev)))
                .collect();

            for (fd, revents) in ready {
                if fd == self.wakeup_fd {
                    self.wakeup_channel.set_revents(revents);
                    self.wakeup_channel.handle_event(time);
                    continue;
                }
                dispatch_ready(fd, revents, time);
            }

            self.run_pending_functors();
        }
        debug!(tid = self.tid, "event loop stopping");
    }

    fn run_pending_functors(&mut self) {
        let functors = std::mem::take(&mut *self.pending.lock().unwrap());
        for f in functors {
            f();
        }
    }
}

/// Looks up the owner of `fd` and locks only *its* channel mutex to dispatch
/// — never the owner's broader state mutex, which is what keeps this call
/// from nesting locks with whatever the dispatched callback itself needs to
/// acquire. The channel's own lock is released before any callback runs
/// (`begin_dispatch`/`end_dispatch`, not `handle_event`): a read or write
/// callback commonly re-enters the owner's API to touch this exact channel
/// again (`handle_write` disabling write interest, a synchronous `send()`
/// from inside a message callback enabling it), and `std::sync::Mutex` isn't
/// reentrant.
fn dispatch_ready(fd: RawFd, revents: crate::channel::Revents, time: Timestamp) {
    let registrant = REGISTRANTS.with(|r| match r.borrow().get(&fd) {
        Some(Registrant::Connection(weak)) => Some(Registrant::Connection(weak.clone())),
        Some(Registrant::Acceptor(weak)) => Some(Registrant::Acceptor(weak.clone())),
        None => None,
    });

    match registrant {
        Some(Registrant::Connection(weak)) => {
            let Some(conn) = weak.upgrade() else {
                trace!(fd, "dropped connection still had a pending readiness event");
                return;
            };
            let pending = {
                let mut channel = conn.channel.lock().unwrap();
                channel.set_revents(revents);
                channel.begin_dispatch()
            };
            if let Some(pending) = pending {
                let pending = pending.run(time);
                conn.channel.lock().unwrap().end_dispatch(pending);
            }
        }
        Some(Registrant::Acceptor(weak)) => {
            let Some(acceptor) = weak.upgrade() else {
                return;
            };
            let pending = {
                let mut channel = acceptor.channel.lock().unwrap();
                channel.set_revents(revents);
                channel.begin_dispatch()
            };
            if let Some(pending) = pending {
                let pending = pending.run(time);
                acceptor.channel.lock().unwrap().end_dispatch(pending);
            }
        }
        None => trace!(fd, "readiness event for unregistered fd"),
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
        }
    }
}
