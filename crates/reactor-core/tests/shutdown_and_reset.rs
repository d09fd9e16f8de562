//! Scenarios E4/E5: shutdown only half-closes once the output buffer has
//! actually drained, and a peer reset mid-write tears the connection down
//! exactly once rather than wedging it or double-firing callbacks.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_core::{Connection, EventLoop, LoopHandle, Server, ServerOption};

fn spawn_server(
    name: &'static str,
    wire: impl FnOnce(&Arc<Server>) + Send + 'static,
) -> (SocketAddr, LoopHandle, thread::JoinHandle<()>) {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel::<LoopHandle>();

    let join = thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let server = Server::new(&base_loop, addr, name, ServerOption::NoReusePort).unwrap();

        wire(&server);
        server.set_thread_num(0);
        server.start().unwrap();

        addr_tx.send(server.local_addr().unwrap()).unwrap();
        handle_tx.send(base_loop.handle()).unwrap();

        base_loop.run();
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let loop_handle = handle_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    (addr, loop_handle, join)
}

/// E4: the server writes a payload well past what a single non-blocking
/// `write` will accept, then immediately calls `shutdown()`. The client
/// reads slowly, so the only way it can observe every byte before EOF is if
/// `shutdownWrite` really was deferred until `outputBuffer` fully drained.
#[test]
fn shutdown_waits_for_output_buffer_to_drain() {
    const PAYLOAD_LEN: usize = 4 * 1024 * 1024;

    let (addr, loop_handle, join) = spawn_server("shutdown-test", |server| {
        server.set_connection_callback(|conn: &Arc<Connection>| {
            if conn.connected() {
                conn.send(&vec![0x5Au8; PAYLOAD_LEN]);
                conn.shutdown();
            }
        });
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let mut total = 0usize;
    let mut chunk = [0u8; 4096];
    loop {
        // Read slowly with short pauses so the server's writes genuinely
        // have to wait on EPOLLOUT rather than draining in one shot.
        thread::sleep(Duration::from_millis(1));
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                assert!(chunk[..n].iter().all(|&b| b == 0x5A));
                total += n;
            }
            Err(err) => panic!("read failed before EOF: {err}"),
        }
    }
    assert_eq!(total, PAYLOAD_LEN, "peer must observe every byte before FIN");

    loop_handle.quit();
    join.join().unwrap();
}

/// E5: the peer resets the connection while the server is still mid-write.
/// The connection must transition to disconnected and fire its close
/// callback exactly once, never leaving it wedged or double-tearing-down.
#[test]
fn peer_reset_during_write_closes_exactly_once() {
    const PAYLOAD_LEN: usize = 4 * 1024 * 1024;

    let closes = Arc::new(AtomicUsize::new(0));
    let closes_for_server = Arc::clone(&closes);

    let (addr, loop_handle, join) = spawn_server("reset-test", move |server| {
        server.set_connection_callback(move |conn: &Arc<Connection>| {
            if conn.connected() {
                conn.send(&vec![0x7Bu8; PAYLOAD_LEN]);
            } else {
                closes_for_server.fetch_add(1, Ordering::SeqCst);
            }
        });
    });

    let stream = TcpStream::connect(addr).unwrap();
    // SO_LINGER(on, 0): closing now sends RST instead of a clean FIN,
    // forcing the server's next write/read to observe ECONNRESET.
    let raw = std::os::fd::AsRawFd::as_raw_fd(&stream);
    let linger = libc::linger { l_onoff: 1, l_linger: 0 };
    unsafe {
        libc::setsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            std::ptr::addr_of!(linger).cast(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }

    // Let a bit of the payload actually land in the kernel's receive buffer
    // before the peer slams the connection shut.
    thread::sleep(Duration::from_millis(50));
    drop(stream);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while closes.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(closes.load(Ordering::SeqCst), 1, "close callback must fire exactly once");

    loop_handle.quit();
    join.join().unwrap();
}
