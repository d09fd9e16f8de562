use std::net::SocketAddr;

/// Fatal setup failures (§7's "Fatal setup" row). Everything else the spec's
/// error table describes is disposed of inline — logged and survived — and
/// never surfaces as a typed error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to listen: {0}")]
    Listen(#[source] std::io::Error),

    #[error("failed to create epoll instance: {0}")]
    PollCreate(#[source] std::io::Error),

    #[error("failed to create wakeup eventfd: {0}")]
    EventFdCreate(#[source] std::io::Error),

    #[error("another EventLoop already exists on this thread")]
    LoopAlreadyExistsOnThread,
}

pub type Result<T> = std::result::Result<T, Error>;
