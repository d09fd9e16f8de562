//! Scenario E3: a connection that keeps writing without its peer ever
//! reading backs up past the high-water mark exactly once, however many
//! individual `send` calls it takes to get there.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_core::{Connection, EventLoop, LoopHandle, Server, ServerOption};

const MARK: usize = 256 * 1024;

#[test]
fn fires_exactly_once_past_the_mark() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel::<LoopHandle>();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_for_server = Arc::clone(&fired);

    let server_thread = thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let server = Server::new(&base_loop, addr, "hwm-test", ServerOption::NoReusePort).unwrap();

        // The client below never reads, so repeatedly sending backs the
        // server's own output buffer up well past `MARK` — matching the
        // scenario's intent without depending on any single write's exact
        // byte count.
        server.set_connection_callback(move |conn: &Arc<Connection>| {
            if conn.connected() {
                for _ in 0..8 {
                    conn.send(&vec![0u8; 1024 * 1024]);
                }
            }
        });
        server.set_high_water_mark_callback(
            move |_conn: &Arc<Connection>, _len: usize| {
                fired_for_server.fetch_add(1, Ordering::SeqCst);
            },
            MARK,
        );
        server.set_thread_num(0);
        server.start().unwrap();

        addr_tx.send(server.local_addr().unwrap()).unwrap();
        handle_tx.send(base_loop.handle()).unwrap();

        base_loop.run();
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let loop_handle = handle_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let stream = TcpStream::connect(addr).unwrap();
    thread::sleep(Duration::from_millis(300));
    drop(stream);

    loop_handle.quit();
    server_thread.join().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1, "callback must fire exactly once");
}
