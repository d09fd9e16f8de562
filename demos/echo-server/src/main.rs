//! A minimal echo server: every message a client sends is written back,
//! after which the connection is half-closed for writing.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use reactor_core::{Connection, EventLoop, Server, ServerOption};
use tracing::info;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(18080);
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));

    let mut base_loop = EventLoop::new().expect("failed to create base event loop");
    let server = Server::new(&base_loop, addr, "echo-server", ServerOption::NoReusePort)
        .expect("failed to bind echo server");

    server.set_connection_callback(on_connection);
    server.set_message_callback(on_message);
    server.set_thread_num(3);

    server.start().expect("failed to start echo server");
    info!(%addr, "echo server listening");

    base_loop.run();
}

fn on_connection(conn: &Arc<Connection>) {
    if conn.connected() {
        info!(peer = %conn.peer_addr(), "conn UP");
    } else {
        info!(peer = %conn.peer_addr(), "conn DOWN");
    }
}

fn on_message(conn: &Arc<Connection>, buf: &mut reactor_core::ByteBuffer, _time: reactor_core::Timestamp) {
    let msg = buf.retrieve_all_as_vec();
    conn.send(&msg);
    conn.shutdown();
}
