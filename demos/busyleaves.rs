//! A tiny echo server: one accepted TCP connection becomes one coroutine on
//! a shared `CoroutineThread`, via `coroutine::net::Server`. This replaces
//! the original demo's work-stealing queue, which this scheduler
//! deliberately doesn't have (see the scheduler's non-goals) — the
//! interesting cross-thread hand-off in this design isn't coroutines
//! migrating between workers, it's a connection's reader-shim thread
//! turning socket readiness into a `signal` call.

use std::io::{Read, Write};
use std::net::TcpStream;

use coroutine::net::Server;
use coroutine::ThreadBuilder;

fn main() {
    env_logger::init();
    let thread = ThreadBuilder::new().name("echo-server".into()).start().unwrap();

    let server = Server::start("127.0.0.1:0", thread.clone(), |_me, con| {
        loop {
            let data = con.read().expect("connection read failed");
            if data.is_empty() && con.is_eof() {
                break;
            }
            con.write_all(&data).expect("connection write failed");
        }
        Box::new(())
    })
    .unwrap();

    let addr = server.local_addr().unwrap();
    println!("echoing on {addr}");

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"hello, coroutine\n").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    print!("server echoed: {response}");

    server.stop();
    thread.stop();
}
