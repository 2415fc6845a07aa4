//! End-to-end tests: client bytes in, server bytes out.
//!
//! Each test boots the server on an ephemeral port in a background thread
//! and speaks raw RESP over a plain TCP socket. When io_uring is not
//! available in the environment, tests print a notice and pass vacuously.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use uringkv::{Config, ServerError};

fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct TestServer {
    handle: thread::JoinHandle<Result<(), ServerError>>,
    running: Arc<AtomicBool>,
    addr: SocketAddr,
}

/// Boot a server and wait until it listens. `None` means the environment
/// cannot run io_uring and the test should be skipped.
fn start_server() -> Option<TestServer> {
    let port = get_available_port();
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    let handle = thread::spawn(move || {
        let config = Config {
            port,
            ..Config::default()
        };
        uringkv::run(&config, flag)
    });

    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if handle.is_finished() {
            match handle.join() {
                Ok(Err(e)) => {
                    eprintln!("skipping: server unavailable here: {e}");
                    return None;
                }
                Ok(Ok(())) => panic!("server exited before the test ran"),
                Err(_) => panic!("server thread panicked"),
            }
        }
        if TcpStream::connect_timeout(&addr, Duration::from_millis(50)).is_ok() {
            return Some(TestServer {
                handle,
                running,
                addr,
            });
        }
        if Instant::now() > deadline {
            panic!("server did not start listening");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

impl TestServer {
    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Clear the running flag, nudge the event loop awake, and join.
    fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = TcpStream::connect(self.addr);
        self.handle.join().unwrap().unwrap();
    }
}

/// Send request bytes and read back exactly `expect.len()` reply bytes.
fn roundtrip(stream: &mut TcpStream, request: &[u8], expect: &[u8]) {
    stream.write_all(request).unwrap();
    let mut reply = vec![0u8; expect.len()];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(
        reply,
        expect,
        "request {:?} replied {:?}",
        String::from_utf8_lossy(request),
        String::from_utf8_lossy(&reply)
    );
}

#[test]
fn ping_as_array() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();
    roundtrip(&mut stream, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n");
    drop(stream);
    server.stop();
}

#[test]
fn ping_inline() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();
    roundtrip(&mut stream, b"+PING\r\n", b"+PONG\r\n");
    drop(stream);
    server.stop();
}

#[test]
fn set_then_get() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();
    roundtrip(
        &mut stream,
        b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
        b"+OK\r\n",
    );
    roundtrip(
        &mut stream,
        b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n",
        b"$3\r\nbar\r\n",
    );
    drop(stream);
    server.stop();
}

#[test]
fn get_before_any_set_is_nil() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();
    roundtrip(&mut stream, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n", b"$-1\r\n");
    drop(stream);
    server.stop();
}

#[test]
fn client_setname_is_acknowledged() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();
    roundtrip(
        &mut stream,
        b"*2\r\n$6\r\nCLIENT\r\n$7\r\nSETNAME\r\n",
        b"+OK\r\n",
    );
    drop(stream);
    server.stop();
}

#[test]
fn set_twice_returns_second_value() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();
    roundtrip(
        &mut stream,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nfirst\r\n",
        b"+OK\r\n",
    );
    roundtrip(
        &mut stream,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$6\r\nsecond\r\n",
        b"+OK\r\n",
    );
    roundtrip(
        &mut stream,
        b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n",
        b"$6\r\nsecond\r\n",
    );
    drop(stream);
    server.stop();
}

#[test]
fn del_and_exists_report_counts() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();
    roundtrip(
        &mut stream,
        b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n",
        b"+OK\r\n",
    );
    roundtrip(
        &mut stream,
        b"*3\r\n$6\r\nEXISTS\r\n$1\r\na\r\n$1\r\nb\r\n",
        b":1\r\n",
    );
    roundtrip(
        &mut stream,
        b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n",
        b":1\r\n",
    );
    roundtrip(&mut stream, b"*2\r\n$6\r\nEXISTS\r\n$1\r\na\r\n", b":0\r\n");
    drop(stream);
    server.stop();
}

#[test]
fn unknown_commands_are_acknowledged() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();
    roundtrip(&mut stream, b"*1\r\n$8\r\nFLUSHALL\r\n", b"+OK\r\n");
    drop(stream);
    server.stop();
}

#[test]
fn commands_are_case_insensitive() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();
    roundtrip(&mut stream, b"*1\r\n$4\r\nping\r\n", b"+PONG\r\n");
    drop(stream);
    server.stop();
}

#[test]
fn malformed_input_gets_an_error_and_a_hangup() {
    let server = match start_server() {
        Some(s) => s,
        None => return,
    };
    let mut stream = server.connect();

    stream.write_all(b"?junk\r\n").unwrap();
    let mut reply = Vec::new();
    // The server replies with an error and closes this connection only.
    stream.read_to_end(&mut reply).unwrap();
    assert!(
        reply.starts_with(b"-ERR Protocol error:"),
        "unexpected reply {:?}",
        String::from_utf8_lossy(&reply)
    );
    assert!(reply.ends_with(b"\r\n"));

    // The server itself is still alive for other clients.
    let mut second = server.connect();
    roundtrip(&mut second, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n");
    drop(second);
    server.stop();
}
