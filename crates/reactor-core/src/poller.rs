//! Readiness demultiplexer: a thin, growable wrapper over `mio::Poll`.

use std::io;
use std::time::Duration;

use mio::{Events, Poll};
use tracing::{trace, warn};

use crate::error::Error;
use crate::time::Timestamp;

const INITIAL_EVENTS_CAPACITY: usize = 16;

/// Owns the kernel polling instance and the buffer `poll` delivers readiness
/// into. Doubling the buffer when it comes back full (§4.4) means a busy loop
/// converges on a capacity that fits its actual fan-in after a few iterations,
/// instead of paying a fixed, possibly-too-small allocation forever.
pub struct ReadinessDemux {
    poll: Poll,
    events: Events,
    was_full: bool,
}

impl ReadinessDemux {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new().map_err(Error::PollCreate)?;
        Ok(ReadinessDemux {
            poll,
            events: Events::with_capacity(INITIAL_EVENTS_CAPACITY),
            was_full: false,
        })
    }

    /// A cloneable handle usable to register/deregister fds from any
    /// `Channel`, independent of this demux's own thread confinement.
    pub fn registry(&self) -> io::Result<mio::Registry> {
        self.poll.registry().try_clone()
    }

    /// Blocks for readiness, up to `timeout`, retrying silently on `EINTR`
    /// (§4.4's "interrupted syscalls are not errors"). Returns the poll
    /// timestamp plus a borrow of whatever events came back; the caller walks
    /// `mio::Events` directly rather than this type re-exposing a Vec, since
    /// `Events` has no stable random-access API to copy out of cheaply.
    pub fn poll(&mut self, timeout: Option<Duration>) -> (Timestamp, &Events) {
        if self.was_full {
            let new_cap = self.events.capacity() * 2;
            trace!(new_cap, "growing readiness event buffer");
            self.events = Events::with_capacity(new_cap);
            self.was_full = false;
        }

        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%err, "poll failed");
                    break;
                }
            }
        }
        let now = Timestamp::now();
        self.was_full = self.events.iter().count() == self.events.capacity();
        (now, &self.events)
    }
}
