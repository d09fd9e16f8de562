//! Scenario E6: calling `Connection::send` from a thread other than the
//! connection's owning loop still delivers the bytes, by queuing the write
//! onto that loop rather than touching the socket directly.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use reactor_core::{Connection, EventLoop, LoopHandle, Server, ServerOption};

#[test]
fn send_from_foreign_thread_is_delivered() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel::<LoopHandle>();
    let latest_conn: Arc<Mutex<Option<Arc<Connection>>>> = Arc::new(Mutex::new(None));
    let latest_for_server = Arc::clone(&latest_conn);

    let server_thread = thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let server =
            Server::new(&base_loop, addr, "cross-thread-test", ServerOption::NoReusePort).unwrap();

        server.set_connection_callback(move |conn: &Arc<Connection>| {
            if conn.connected() {
                *latest_for_server.lock().unwrap() = Some(Arc::clone(conn));
            }
        });
        server.set_thread_num(0);
        server.start().unwrap();

        addr_tx.send(server.local_addr().unwrap()).unwrap();
        handle_tx.send(base_loop.handle()).unwrap();

        base_loop.run();
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let loop_handle = handle_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    // Nudge the server so the accept/connect_established path actually runs
    // and `latest_conn` gets populated before we race to read it.
    stream.write_all(b"hi").unwrap();

    let conn = loop {
        if let Some(conn) = latest_conn.lock().unwrap().clone() {
            break conn;
        }
        thread::sleep(Duration::from_millis(10));
    };

    // Both calls happen on the test thread, never on the connection's own
    // worker loop — exercising the cross-thread `queue_in_loop` path in
    // `Connection::send`, and its per-producer FIFO ordering (E6).
    assert!(!loop_handle.is_in_loop_thread());
    conn.send(b"A");
    conn.send(b"B");

    let mut buf = [0u8; 2];
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"AB");

    loop_handle.quit();
    server_thread.join().unwrap();
}
