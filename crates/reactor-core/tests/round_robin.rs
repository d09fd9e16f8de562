//! Scenario E2: with N worker threads, concurrently accepted connections are
//! spread across more than one of them.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use reactor_core::{Connection, EventLoop, LoopHandle, Server, ServerOption};

#[test]
fn spreads_connections_across_workers() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel::<LoopHandle>();
    let seen_threads: Arc<Mutex<HashSet<ThreadId>>> = Arc::new(Mutex::new(HashSet::new()));
    let seen_for_server = Arc::clone(&seen_threads);

    let server_thread = thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let server =
            Server::new(&base_loop, addr, "round-robin-test", ServerOption::NoReusePort).unwrap();

        server.set_connection_callback(move |_conn: &Arc<Connection>| {
            seen_for_server.lock().unwrap().insert(thread::current().id());
        });
        server.set_thread_num(4);
        server.start().unwrap();

        addr_tx.send(server.local_addr().unwrap()).unwrap();
        handle_tx.send(base_loop.handle()).unwrap();

        base_loop.run();
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let loop_handle = handle_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Connections are accepted one at a time on the base loop, so open them
    // sequentially with a short settle delay rather than racing them.
    for _ in 0..8 {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"x").unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(stream);
    }

    thread::sleep(Duration::from_millis(100));
    loop_handle.quit();
    server_thread.join().unwrap();

    let threads = seen_threads.lock().unwrap();
    assert!(
        threads.len() > 1,
        "expected connections spread across multiple worker threads, saw {}",
        threads.len()
    );
}
