//! Scenario E1: a client writes bytes, the server echoes them back and
//! half-closes; the client observes both the echo and EOF.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_core::{Connection, EventLoop, LoopHandle, Server, ServerOption};

#[test]
fn echoes_and_shuts_down() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel::<LoopHandle>();

    let server_thread = thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let server = Server::new(&base_loop, addr, "echo-test", ServerOption::NoReusePort).unwrap();

        server.set_message_callback(|conn: &Arc<Connection>, buf, _time| {
            let msg = buf.retrieve_all_as_vec();
            conn.send(&msg);
            conn.shutdown();
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
    stream.write_all(b"hello reactor").unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert_eq!(response, b"hello reactor");

    loop_handle.quit();
    server_thread.join().unwrap();
}
