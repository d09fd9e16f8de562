//! A single-writer-per-thread, non-blocking TCP reactor: one cooperative
//! event loop per OS thread, readiness-driven dispatch, and a server façade
//! that hands accepted connections off to a round-robin pool of worker
//! loops.

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod current_thread;
mod error;
mod event_loop;
mod poller;
mod server;
mod socket;
mod thread_pool;
mod time;

pub use buffer::ByteBuffer;
pub use connection::{
    CloseCallback, Connection, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use server::{Server, ServerOption};
pub use socket::SocketHandle;
pub use thread_pool::{LoopThread, LoopThreadPool};
pub use time::Timestamp;
