//! Cheap, cached, per-OS-thread identity, used to enforce the thread-affinity
//! invariant on `EventLoop`, `Channel`, and `Connection` mutation.

use std::cell::Cell;

use crate::error::Error;

thread_local! {
    static CACHED_TID: Cell<i64> = const { Cell::new(0) };
    static LOOP_EXISTS: Cell<bool> = const { Cell::new(false) };
}

/// The kernel thread id of the calling OS thread (`gettid(2)` on Linux),
/// cached thread-locally after the first call.
pub fn tid() -> i64 {
    CACHED_TID.with(|cell| {
        let cached = cell.get();
        if cached != 0 {
            return cached;
        }
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        cell.set(tid);
        tid
    })
}

/// Runs `build` only if no `EventLoop` already claims this thread, marking
/// the thread claimed for the duration (muduo enforces the same one-loop-
/// per-thread rule via an `__thread EventLoop*` pointer in its constructor).
pub fn with_loop_guard<T>(build: impl FnOnce() -> Result<T, Error>) -> Result<T, Error> {
    let already = LOOP_EXISTS.with(|cell| cell.replace(true));
    if already {
        return Err(Error::LoopAlreadyExistsOnThread);
    }
    let result = build();
    if result.is_err() {
        LOOP_EXISTS.with(|cell| cell.set(false));
    }
    result
}
