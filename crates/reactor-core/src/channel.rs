//! Per-fd event subscription and dispatch.

use std::os::fd::RawFd;
use std::sync::Weak;

use mio::{Interest, Token, event::Event, unix::SourceFd};
use reactor_utils::safe_assert;
use tracing::warn;

use crate::connection::Connection;
use crate::current_thread;
use crate::time::Timestamp;

/// Membership state of a `Channel` in the readiness demultiplexer, mirroring
/// muduo's `Channel::index_`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollIndex {
    New,
    Added,
    Deleted,
}

/// A snapshot of the readiness bits the demux last delivered for this fd.
#[derive(Debug, Clone, Copy, Default)]
pub struct Revents {
    pub readable: bool,
    pub writable: bool,
    pub priority: bool,
    pub error: bool,
    pub read_closed: bool,
}

impl From<&Event> for Revents {
    fn from(ev: &Event) -> Self {
        Revents {
            readable: ev.is_readable(),
            writable: ev.is_writable(),
            priority: ev.is_priority(),
            error: ev.is_error(),
            read_closed: ev.is_read_closed(),
        }
    }
}

// Callbacks don't take the dispatching `Channel` itself: every realized
// callback in this crate closes over a `Weak` back-reference to its owner and
// re-enters through that owner's own API instead, which takes its own lock on
// this same `Channel`. Dispatch releases `Channel`'s lock before calling out
// (see `begin_dispatch`/`end_dispatch` below) precisely so that re-entry can
// succeed, which also means there is no live `&mut Channel` to hand these
// during the call.
type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
type VoidCallback = Box<dyn FnMut() + Send>;

/// The weak back-reference from a `Channel` to the `Connection` that owns it
/// (§9 "shared ownership with cycle avoidance"). Acceptor-owned channels carry
/// no tie: an Acceptor's own lifetime isn't subject to the same concurrent
/// teardown race a Connection is.
pub struct LifetimeTie(Weak<Connection>);

/// Per-fd event subscription and dispatch object. Not `Send`/`Sync`: every
/// mutation must happen on the owning loop's thread (enforced by its owner,
/// not by this type).
pub struct Channel {
    fd: RawFd,
    owner_tid: i64,
    registry: mio::Registry,
    interest: Interest,
    has_interest: bool,
    revents: Revents,
    index: PollIndex,
    tie: Option<LifetimeTie>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<VoidCallback>,
    close_cb: Option<VoidCallback>,
    error_cb: Option<VoidCallback>,
}

const READABLE: Interest = Interest::READABLE;
const WRITABLE: Interest = Interest::WRITABLE;

impl Channel {
    pub fn new(fd: RawFd, registry: mio::Registry) -> Self {
        Channel {
            fd,
            owner_tid: current_thread::tid(),
            registry,
            interest: READABLE,
            has_interest: false,
            revents: Revents::default(),
            index: PollIndex::New,
            tie: None,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn index(&self) -> PollIndex {
        self.index
    }

    pub fn revents(&self) -> Revents {
        self.revents
    }

    pub fn is_writing(&self) -> bool {
        self.has_interest && self.interest.is_writable()
    }

    pub fn is_reading(&self) -> bool {
        self.has_interest && self.interest.is_readable()
    }

    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_cb = Some(cb);
    }

    pub fn set_write_callback(&mut self, cb: VoidCallback) {
        self.write_cb = Some(cb);
    }

    pub fn set_close_callback(&mut self, cb: VoidCallback) {
        self.close_cb = Some(cb);
    }

    pub fn set_error_callback(&mut self, cb: VoidCallback) {
        self.error_cb = Some(cb);
    }

    /// Records a weak back-reference to the owning `Connection`, upgraded for
    /// the duration of dispatch.
    pub fn tie(&mut self, owner: Weak<Connection>) {
        self.tie = Some(LifetimeTie(owner));
    }

    pub fn set_revents(&mut self, revents: Revents) {
        self.revents = revents;
    }

    /// Per §5/§7: every mutating entry point asserts it's running on the
    /// loop thread that owns this fd's registration rather than silently
    /// racing the demux.
    fn assert_owning_thread(&self, what: &str) {
        safe_assert!(
            current_thread::tid() == self.owner_tid,
            "Channel::{what} called off its owning loop thread (fd={})",
            self.fd
        );
    }

    pub fn enable_reading(&mut self) {
        self.assert_owning_thread("enable_reading");
        self.interest = if self.has_interest {
            self.interest | READABLE
        } else {
            READABLE
        };
        self.has_interest = true;
        self.update();
    }

    pub fn disable_reading(&mut self) {
        self.assert_owning_thread("disable_reading");
        if self.has_interest && self.interest.is_writable() {
            self.interest = WRITABLE;
        } else {
            self.has_interest = false;
        }
        self.update();
    }

    pub fn enable_writing(&mut self) {
        self.assert_owning_thread("enable_writing");
        self.interest = if self.has_interest {
            self.interest | WRITABLE
        } else {
            WRITABLE
        };
        self.has_interest = true;
        self.update();
    }

    pub fn disable_writing(&mut self) {
        self.assert_owning_thread("disable_writing");
        if self.has_interest && self.interest.is_readable() {
            self.interest = READABLE;
        } else {
            self.has_interest = false;
        }
        self.update();
    }

    pub fn disable_all(&mut self) {
        self.assert_owning_thread("disable_all");
        self.has_interest = false;
        self.update();
    }

    /// Pushes the current interest set to the kernel, performing the
    /// ADD/MOD/DEL transition implied by `index` (§4.4). Each `Channel` holds
    /// its own cloned `mio::Registry` handle and drives this directly rather
    /// than reaching back through the owning `EventLoop` — `Registry` is a
    /// cheap, independently `Send + Sync` clone designed for exactly this.
    fn update(&mut self) {
        self.assert_owning_thread("update");
        let token = Token(self.fd as usize);
        let mut source = SourceFd(&self.fd);
        let result = match self.index {
            PollIndex::New | PollIndex::Deleted => {
                if self.has_interest {
                    let r = self.registry.register(&mut source, token, self.interest);
                    self.index = PollIndex::Added;
                    r
                } else {
                    // Nothing to add; stays New/Deleted until real interest appears.
                    Ok(())
                }
            }
            PollIndex::Added => {
                if self.has_interest {
                    self.registry.reregister(&mut source, token, self.interest)
                } else {
                    let r = self.registry.deregister(&mut source);
                    self.index = PollIndex::Deleted;
                    r
                }
            }
        };
        if let Err(err) = result {
            warn!(fd = self.fd, %err, "failed to update channel registration");
        }
    }

    /// Deregisters the fd entirely (called by the owner's teardown, before
    /// the `Channel` itself is dropped). No-op if never added.
    pub fn remove(&mut self) {
        self.assert_owning_thread("remove");
        debug_assert!(!self.has_interest, "remove a channel with no pending interest");
        if self.index == PollIndex::Added {
            let mut source = SourceFd(&self.fd);
            if let Err(err) = self.registry.deregister(&mut source) {
                warn!(fd = self.fd, %err, "failed to deregister channel");
            }
        }
        self.index = PollIndex::New;
    }

    /// Takes the callbacks this dispatch needs out of their slots (snapshotting
    /// the lifetime tie check along the way), so the caller can run them after
    /// releasing whatever lock guards this `Channel`. A callback re-entering
    /// to mutate this same `Channel` — e.g. `handle_write` disabling write
    /// interest once the output buffer drains — needs to lock it again, and
    /// `std::sync::Mutex` isn't reentrant, so nothing here must still be
    /// holding that lock by the time callbacks run. Returns `None` if a tie is
    /// set but its owner is already gone: the event is simply dropped.
    pub fn begin_dispatch(&mut self) -> Option<PendingDispatch> {
        if let Some(tie) = &self.tie {
            tie.0.upgrade()?;
        }
        let revents = self.revents;
        Some(PendingDispatch {
            close_cb: if revents.read_closed && !revents.readable {
                self.close_cb.take()
            } else {
                None
            },
            error_cb: if revents.error { self.error_cb.take() } else { None },
            read_cb: if revents.readable || revents.priority {
                self.read_cb.take()
            } else {
                None
            },
            write_cb: if revents.writable { self.write_cb.take() } else { None },
        })
    }

    /// Puts back whatever callbacks `pending` still holds after
    /// `PendingDispatch::run` — must be called with this same `Channel`
    /// re-locked.
    pub fn end_dispatch(&mut self, pending: PendingDispatch) {
        if let Some(cb) = pending.close_cb {
            self.close_cb = Some(cb);
        }
        if let Some(cb) = pending.error_cb {
            self.error_cb = Some(cb);
        }
        if let Some(cb) = pending.read_cb {
            self.read_cb = Some(cb);
        }
        if let Some(cb) = pending.write_cb {
            self.write_cb = Some(cb);
        }
    }

    /// Runs the ordered dispatch described by §4.3 without releasing any lock
    /// in between. Safe only for a `Channel` that isn't reached through a
    /// `Mutex` a re-entrant callback might need to lock again — the event
    /// loop's own wakeup channel, which it owns outright with no `Mutex`
    /// wrapper. Anything dispatched through a shared `Mutex<Channel>` owner
    /// (`Connection`, `Acceptor`) must instead use `begin_dispatch` /
    /// `end_dispatch` around the point where that lock is released.
    pub fn handle_event(&mut self, time: Timestamp) {
        if let Some(pending) = self.begin_dispatch() {
            let pending = pending.run(time);
            self.end_dispatch(pending);
        }
    }
}

/// Callbacks taken out of a `Channel` for the duration of one dispatch, so
/// they can run without that `Channel`'s lock held. See `Channel::begin_dispatch`.
pub struct PendingDispatch {
    read_cb: Option<ReadCallback>,
    write_cb: Option<VoidCallback>,
    close_cb: Option<VoidCallback>,
    error_cb: Option<VoidCallback>,
}

impl PendingDispatch {
    /// Invokes whichever callbacks were taken, in §4.3's order (close, error,
    /// read, write), then hands itself back so the caller can restore them via
    /// `Channel::end_dispatch`.
    pub fn run(mut self, time: Timestamp) -> Self {
        if let Some(mut cb) = self.close_cb.take() {
            cb();
            self.close_cb = Some(cb);
        }
        if let Some(mut cb) = self.error_cb.take() {
            cb();
            self.error_cb = Some(cb);
        }
        if let Some(mut cb) = self.read_cb.take() {
            cb(time);
            self.read_cb = Some(cb);
        }
        if let Some(mut cb) = self.write_cb.take() {
            cb();
            self.write_cb = Some(cb);
        }
        self
    }
}
