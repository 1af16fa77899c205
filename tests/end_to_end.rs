//! Live-socket scenarios driving a real listener over loopback.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use triplex::client::Client;
use triplex::{ClientConfig, ErrorKind, Listener, ServerConfig, ShutdownHandle};

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(config: ServerConfig, configure: impl FnOnce(&mut Listener)) -> TestServer {
        let mut ln = Listener::bind(false, "127.0.0.1:0", config).expect("bind");
        ln.on_error(|err| eprintln!("server error: {err}"));
        configure(&mut ln);
        let addr = ln.local_addr();
        let shutdown = ln.shutdown_handle();
        let thread = std::thread::spawn(move || {
            let _ = ln.serve();
        });
        TestServer {
            addr,
            shutdown,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("read_exact");
    buf
}

fn echo_http_server() -> TestServer {
    TestServer::start(ServerConfig::default(), |ln| {
        ln.on_http(|req| {
            req.bytes(200, "", req.body()).flush();
            req.release();
            true
        });
    })
}

const E1_REQUEST: &[u8] = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
const E1_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nConnection: Keep-Alive\r\nContent-Length: 5\r\n\r\nhello";

#[test]
fn e1_http_echo() {
    let server = echo_http_server();
    let mut stream = server.connect();

    stream.write_all(E1_REQUEST).unwrap();
    let response = read_exact(&mut stream, E1_RESPONSE.len());
    assert_eq!(response, E1_RESPONSE);
}

#[test]
fn e2_http_pipelined() {
    let server = echo_http_server();
    let mut stream = server.connect();

    // Two identical requests in one TCP write: two responses, in order, and
    // the connection stays open.
    let mut burst = Vec::new();
    burst.extend_from_slice(E1_REQUEST);
    burst.extend_from_slice(E1_REQUEST);
    stream.write_all(&burst).unwrap();

    let response = read_exact(&mut stream, E1_RESPONSE.len() * 2);
    assert_eq!(&response[..E1_RESPONSE.len()], E1_RESPONSE);
    assert_eq!(&response[E1_RESPONSE.len()..], E1_RESPONSE);

    stream.write_all(E1_REQUEST).unwrap();
    let response = read_exact(&mut stream, E1_RESPONSE.len());
    assert_eq!(response, E1_RESPONSE);
}

#[test]
fn e3_resp_echo() {
    let server = TestServer::start(ServerConfig::default(), |ln| {
        ln.on_redis(|req| {
            assert_eq!(req.len(), 3);
            assert_eq!(req.arg(0), Some(&b"TEST"[..]));
            assert_eq!(req.str_arg(1), Some("0"));
            assert_eq!(req.arg(2), Some(&b"foo"[..]));
            req.write_bulk(req.arg(2).unwrap_or_default()).flush();
            req.release();
            true
        });
    });
    let mut stream = server.connect();

    stream
        .write_all(b"*3\r\n$4\r\nTEST\r\n$1\r\n0\r\n$3\r\nfoo\r\n")
        .unwrap();
    let response = read_exact(&mut stream, 9);
    assert_eq!(&response[..], b"$3\r\nfoo\r\n");
}

#[test]
fn resp_pipelined_in_order() {
    let server = TestServer::start(ServerConfig::default(), |ln| {
        ln.on_redis(|req| {
            req.write_bulk(req.arg(1).unwrap_or_default()).flush();
            req.release();
            true
        });
    });
    let mut stream = server.connect();

    stream
        .write_all(b"*2\r\n$4\r\nECHO\r\n$1\r\na\r\n*2\r\n$4\r\nECHO\r\n$1\r\nb\r\n")
        .unwrap();
    let response = read_exact(&mut stream, 14);
    assert_eq!(&response[..], b"$1\r\na\r\n$1\r\nb\r\n");
}

#[test]
fn e4_websocket_round_trip() {
    let server = TestServer::start(ServerConfig::default(), |ln| {
        ln.on_http(|req| {
            req.upgrade_websocket(&[]);
            req.release();
            true
        });
        ln.on_ws_data(|ws, data| {
            ws.write_binary(data);
        });
    });
    let mut stream = server.connect();

    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap();

    // Read the 101 response up to the blank line.
    let mut handshake = Vec::new();
    let mut byte = [0u8; 1];
    while !handshake.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        handshake.push(byte[0]);
    }
    let text = String::from_utf8(handshake).unwrap();
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    // Masked binary "hello" in, unmasked echo out.
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut frame = vec![0x82, 0x85];
    frame.extend_from_slice(&mask);
    frame.extend(b"hello".iter().enumerate().map(|(i, &b)| b ^ mask[i % 4]));
    stream.write_all(&frame).unwrap();

    let echoed = read_exact(&mut stream, 7);
    assert_eq!(&echoed[..], &[0x82, 0x05, b'h', b'e', b'l', b'l', b'o']);
}

#[test]
fn websocket_ping_pong() {
    let server = TestServer::start(ServerConfig::default(), |ln| {
        ln.on_http(|req| {
            req.upgrade_websocket(&[]);
            req.release();
            true
        });
    });
    let mut stream = server.connect();

    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap();
    let mut handshake = Vec::new();
    let mut byte = [0u8; 1];
    while !handshake.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        handshake.push(byte[0]);
    }

    // Ping with payload comes back as a pong with the same payload.
    let mask = [9u8, 9, 9, 9];
    let mut frame = vec![0x89, 0x84];
    frame.extend_from_slice(&mask);
    frame.extend(b"data".iter().enumerate().map(|(i, &b)| b ^ mask[i % 4]));
    stream.write_all(&frame).unwrap();

    let pong = read_exact(&mut stream, 6);
    assert_eq!(&pong[..], &[0x8a, 0x04, b'd', b'a', b't', b'a']);
}

#[test]
fn e5_oversize_closes_without_handler() {
    let handler_ran = Arc::new(AtomicBool::new(false));
    let saw_oversize = Arc::new(AtomicBool::new(false));

    let ran = Arc::clone(&handler_ran);
    let oversize = Arc::clone(&saw_oversize);
    let mut ln = Listener::bind(false, "127.0.0.1:0", ServerConfig::default()).expect("bind");
    ln.on_error(move |err| {
        if err.kind == ErrorKind::Oversize {
            oversize.store(true, Ordering::Release);
        }
    });
    ln.on_http(move |req| {
        ran.store(true, Ordering::Release);
        req.release();
        true
    });
    let addr = ln.local_addr();
    let shutdown = ln.shutdown_handle();
    let thread = std::thread::spawn(move || {
        let _ = ln.serve();
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 99999999\r\n\r\n")
        .unwrap();

    // The server must close the connection without ever parsing a request.
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).expect("read");
    assert_eq!(n, 0, "expected EOF, got {n} bytes");
    assert!(saw_oversize.load(Ordering::Acquire));
    assert!(!handler_ran.load(Ordering::Acquire));

    shutdown.shutdown();
    let _ = thread.join();
}

/// A RESP upstream that records each command and answers `+OK`.
fn recording_resp_server(log: Arc<Mutex<Vec<Vec<String>>>>) -> TestServer {
    TestServer::start(ServerConfig::default(), move |ln| {
        ln.on_redis(move |req| {
            let args: Vec<String> = (0..req.len())
                .map(|i| req.str_arg(i).unwrap_or("").to_string())
                .collect();
            log.lock().push(args);
            req.write_simple_string("OK").flush();
            req.release();
            true
        });
    })
}

#[test]
fn e6_client_auth_prelude() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = recording_resp_server(Arc::clone(&log));

    let config = ClientConfig {
        auth: Some("pwd".to_string()),
        ..ClientConfig::default()
    };
    let client = Client::new(&server.addr.to_string(), config, |err| {
        eprintln!("client error: {err}")
    })
    .expect("client");

    let (tx, rx) = std::sync::mpsc::channel();
    client.exec(["PING"], move |res| {
        let value = res.map(|mut reply| reply.string());
        tx.send(value).unwrap();
    });

    let value = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    // The AUTH reply is consumed internally; the user sees only the second.
    assert_eq!(value.expect("ok").as_deref(), Some("OK"));

    let log = log.lock();
    assert_eq!(log[0], vec!["AUTH".to_string(), "pwd".to_string()]);
    assert_eq!(log[1], vec!["PING".to_string()]);
}

#[test]
fn client_round_trip_and_reuse() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = recording_resp_server(Arc::clone(&log));

    let client = Client::new(
        &server.addr.to_string(),
        ClientConfig::default(),
        |err| eprintln!("client error: {err}"),
    )
    .expect("client");

    for i in 0..5 {
        let (tx, rx) = std::sync::mpsc::channel();
        let key = format!("k{i}");
        client.exec(["SET", key.as_str(), "v"], move |res| {
            tx.send(res.is_ok()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    // Every command got its reply and at least one socket is pooled.
    assert!(client.count() >= 1);
    assert_eq!(log.lock().len(), 5);
}

#[test]
fn client_pool_stays_bounded() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = recording_resp_server(Arc::clone(&log));

    let config = ClientConfig {
        pool_size: 2,
        ..ClientConfig::default()
    };
    let client = Arc::new(
        Client::new(&server.addr.to_string(), config, |err| {
            eprintln!("client error: {err}")
        })
        .expect("client"),
    );

    let max_fds = Arc::new(AtomicUsize::new(0));
    let peak = Arc::clone(&max_fds);
    client.on_fd_count(move |n| {
        peak.fetch_max(n, Ordering::AcqRel);
    });

    let mut threads = Vec::new();
    for t in 0..4 {
        let client = Arc::clone(&client);
        threads.push(std::thread::spawn(move || {
            for i in 0..10 {
                let (tx, rx) = std::sync::mpsc::channel();
                let key = format!("k{t}-{i}");
                client.exec(["GET", key.as_str()], move |res| {
                    tx.send(res.is_ok()).unwrap();
                });
                assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    assert!(max_fds.load(Ordering::Acquire) <= 2);
    assert_eq!(log.lock().len(), 40);
}

#[test]
fn idle_timeout_closes_connection() {
    let saw_timeout = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&saw_timeout);

    let config = ServerConfig {
        idle_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let mut ln = Listener::bind(false, "127.0.0.1:0", config).expect("bind");
    ln.on_error(move |err| {
        if err.kind == ErrorKind::Timeout {
            seen.store(true, Ordering::Release);
        }
    });
    let addr = ln.local_addr();
    let shutdown = ln.shutdown_handle();
    let thread = std::thread::spawn(move || {
        let _ = ln.serve();
    });

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    // Poke the server once so the connection is registered and touched.
    stream.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();

    // The idle sweep fires once last-activity is older than the timeout.
    let mut buf = [0u8; 64];
    let mut eof = false;
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert!(eof, "expected the idle sweep to close the connection");
    assert!(saw_timeout.load(Ordering::Acquire));

    shutdown.shutdown();
    let _ = thread.join();
}
