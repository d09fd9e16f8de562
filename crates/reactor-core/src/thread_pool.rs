//! A worker thread that owns one `EventLoop`, and a round-robin pool of them
//! (§4.7). One loop per thread; one thread per worker; the server façade
//! hands off every accepted connection to whichever worker's turn it is.

use std::sync::mpsc;
use std::thread::JoinHandle;

use reactor_utils::{ThreadPriority, thread_boot};
use tracing::debug;

use crate::error::Result;
use crate::event_loop::{EventLoop, LoopHandle};

/// A callback run on the worker's own thread immediately after its
/// `EventLoop` is constructed but before `run()` starts — the hook a caller
/// uses to register per-worker state (mirrors `EventLoopThread`'s
/// `ThreadInitCallback`).
pub type LoopInitCallback = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Spawns one OS thread, constructs an `EventLoop` on it, and publishes a
/// `LoopHandle` back to whoever called `start()` once the loop exists.
pub struct LoopThread {
    handle: LoopHandle,
    join: Option<JoinHandle<()>>,
}

impl LoopThread {
    pub fn start(init: Option<LoopInitCallback>, core: Option<usize>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Result<LoopHandle>>();

        let join = std::thread::Builder::new()
            .name("reactor-worker".into())
            .spawn(move || {
                thread_boot(core, ThreadPriority::OsDefault);
                let mut loop_ = match EventLoop::new() {
                    Ok(l) => l,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                if let Some(init) = init {
                    init(&mut loop_);
                }
                let _ = tx.send(Ok(loop_.handle()));
                loop_.run();
            })
            .expect("failed to spawn reactor worker thread");

        let handle = rx
            .recv()
            .expect("worker thread exited before publishing its loop handle")?;

        Ok(LoopThread {
            handle,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A fixed-size, round-robin pool of worker loops. The base/accept loop is
/// not a member of this pool — it keeps running the `Acceptor` (§4.9).
pub struct LoopThreadPool {
    workers: Vec<LoopThread>,
    next: std::sync::atomic::AtomicUsize,
}

impl LoopThreadPool {
    /// Spawns `num_threads` workers, each on its own thread. `num_threads ==
    /// 0` is valid: `next_loop()` then has nowhere to hand work and the
    /// caller is expected to run everything on the base loop instead (§4.7's
    /// degenerate single-thread mode).
    pub fn start(num_threads: usize) -> Result<Self> {
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            debug!(worker = i, "starting reactor worker");
            workers.push(LoopThread::start(None, None)?);
        }
        Ok(LoopThreadPool {
            workers,
            next: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Picks the next worker's handle in round-robin order. `None` if the
    /// pool has no workers (all-in-the-base-loop mode).
    pub fn next_loop(&self) -> Option<LoopHandle> {
        if self.workers.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.workers.len();
        Some(self.workers[i].handle())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
