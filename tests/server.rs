//! End-to-end tests against a real dispatcher on a loopback port.
//!
//! Each test binds port 0, drives the server with raw sockets or the
//! blocking client, and shuts it down through its handle.

use drop_box::client::Client;
use drop_box::config::{Config, ShutdownPolicy};
use drop_box::runtime::{Server, ServerHandle};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        poll_timeout: Duration::from_millis(20),
        ..Config::default()
    }
}

fn start(config: Config) -> ServerHandle {
    Server::bind(config)
        .expect("bind server")
        .spawn()
        .expect("spawn dispatcher")
}

/// A raw protocol connection with line-level helpers.
struct Conn {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Conn {
    fn open(handle: &ServerHandle) -> Self {
        let stream = TcpStream::connect(handle.local_addr()).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let writer = stream.try_clone().unwrap();
        Self {
            reader: BufReader::new(stream),
            writer,
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
        self.writer.flush().unwrap();
    }

    fn line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read reply");
        line
    }

    /// Open a connection and log in as `name`.
    fn login(handle: &ServerHandle, name: &str) -> Self {
        let mut conn = Self::open(handle);
        assert!(conn.line().starts_with("HELO "));
        conn.send(format!("LOGIN {}\r\n", name).as_bytes());
        assert_eq!(conn.line(), format!("SUCCESS LOGIN {}\r\n", name));
        conn
    }

    /// Block until the server closes the connection.
    fn expect_closed(&mut self) {
        let mut rest = Vec::new();
        match self.reader.read_to_end(&mut rest) {
            Ok(_) => assert!(rest.is_empty(), "unexpected data: {:?}", rest),
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        }
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("condition not reached in time");
}

/// Run `handle.shutdown()` on a helper thread, reporting completion.
fn shutdown_in_background(handle: ServerHandle) -> mpsc::Receiver<std::io::Result<()>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(handle.shutdown());
    });
    rx
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[test]
fn greeting_and_login() {
    let handle = start(test_config());
    let mut conn = Conn::open(&handle);

    let helo = conn.line();
    assert!(helo.starts_with("HELO local="), "{helo}");
    assert!(helo.ends_with("\r\n"));
    assert_eq!(helo.trim_end().split(' ').count(), 2);

    conn.send(b"LOGIN alice\r\n");
    assert_eq!(conn.line(), "SUCCESS LOGIN alice\r\n");

    wait_until(|| {
        handle
            .registry()
            .snapshot()
            .iter()
            .any(|(_, info)| info.name.as_deref() == Some("alice"))
    });

    conn.send(b"LOGOUT \r\n");
    conn.expect_closed();
    handle.shutdown().unwrap();
}

#[test]
fn upload_in_four_chunks() {
    let handle = start(test_config());
    let mut conn = Conn::login(&handle, "alice");

    conn.send(b"UPLOAD file1.txt 100\r\n");
    assert_eq!(conn.line(), "ACKN file1.txt\r\n");

    for size in [32usize, 32, 32] {
        conn.send(&vec![b'a'; size]);
        thread::sleep(Duration::from_millis(10));
    }
    conn.send(&[b'a'; 4]);
    assert_eq!(conn.line(), "SUCCESS UPLOAD file1.txt\r\n");

    // Back in WAIT: a second upload is accepted.
    conn.send(b"UPLOAD file2.txt 3\r\nxyz");
    assert_eq!(conn.line(), "ACKN file2.txt\r\n");
    assert_eq!(conn.line(), "SUCCESS UPLOAD file2.txt\r\n");

    conn.send(b"LOGOUT \r\n");
    conn.expect_closed();
    handle.shutdown().unwrap();
}

#[test]
fn unknown_message_before_login_fails() {
    let handle = start(test_config());
    let mut conn = Conn::open(&handle);
    conn.line();

    conn.send(b"FOO bar\r\n");
    assert_eq!(conn.line(), "FAILED LOGIN\r\n");

    // Still CONNECTED: login works afterwards.
    conn.send(b"LOGIN alice\r\n");
    assert_eq!(conn.line(), "SUCCESS LOGIN alice\r\n");

    conn.send(b"LOGIN again\r\n");
    assert_eq!(conn.line(), "FAILED LOGIN\r\n");

    conn.send(b"UPLOAD missing-size\r\n");
    assert_eq!(conn.line(), "FAILED UPLOAD\r\n");

    drop(conn);
    handle.shutdown().unwrap();
}

#[test]
fn message_split_across_writes() {
    let handle = start(test_config());
    let mut conn = Conn::open(&handle);
    conn.line();

    conn.send(b"LOG");
    thread::sleep(Duration::from_millis(50));
    conn.send(b"IN ali");
    thread::sleep(Duration::from_millis(50));
    conn.send(b"ce\r\n");
    assert_eq!(conn.line(), "SUCCESS LOGIN alice\r\n");

    drop(conn);
    handle.shutdown().unwrap();
}

#[test]
fn overlong_line_closes_connection() {
    let config = Config {
        max_line_length: 64,
        ..test_config()
    };
    let handle = start(config);
    let mut conn = Conn::open(&handle);
    conn.line();

    conn.send(&[b'A'; 256]);
    conn.expect_closed();
    wait_until(|| handle.active_sessions() == 0);
    handle.shutdown().unwrap();
}

#[test]
fn sessions_are_isolated() {
    let handle = start(test_config());
    let mut alice = Conn::login(&handle, "alice");
    let mut bob = Conn::login(&handle, "bob");

    alice.send(b"UPLOAD a.txt 10\r\n");
    bob.send(b"UPLOAD b.txt 6\r\n");
    assert_eq!(alice.line(), "ACKN a.txt\r\n");
    assert_eq!(bob.line(), "ACKN b.txt\r\n");

    alice.send(b"01234");
    bob.send(b"abc");
    thread::sleep(Duration::from_millis(30));
    bob.send(b"def");
    assert_eq!(bob.line(), "SUCCESS UPLOAD b.txt\r\n");
    alice.send(b"56789");
    assert_eq!(alice.line(), "SUCCESS UPLOAD a.txt\r\n");

    let names: Vec<_> = handle
        .registry()
        .snapshot()
        .into_iter()
        .filter_map(|(_, info)| info.name)
        .collect();
    assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);

    alice.send(b"LOGOUT \r\n");
    bob.send(b"LOGOUT \r\n");
    alice.expect_closed();
    bob.expect_closed();
    handle.shutdown().unwrap();
}

#[test]
fn dropped_session_leaves_others_running() {
    let handle = start(test_config());
    let mut alice = Conn::login(&handle, "alice");
    let mut bob = Conn::login(&handle, "bob");

    alice.send(b"UPLOAD x 8\r\n");
    bob.send(b"UPLOAD y 8\r\n");
    assert_eq!(alice.line(), "ACKN x\r\n");
    assert_eq!(bob.line(), "ACKN y\r\n");
    alice.send(b"1234");
    bob.send(b"1234");

    drop(bob);
    wait_until(|| handle.active_sessions() == 1);

    alice.send(b"5678");
    assert_eq!(alice.line(), "SUCCESS UPLOAD x\r\n");
    alice.send(b"LOGOUT \r\n");
    alice.expect_closed();
    handle.shutdown().unwrap();
}

#[test]
fn replies_queue_while_client_is_not_reading() {
    const LINES: usize = 300_000;

    let handle = start(test_config());
    let mut conn = Conn::open(&handle);
    conn.line();

    // Far more reply bytes than the socket buffers hold, so the server has
    // to park output and finish it on writable events.
    conn.send(&b"X\r\n".repeat(LINES));

    for _ in 0..LINES {
        assert_eq!(conn.line(), "FAILED LOGIN\r\n");
    }

    // Exactly one reply per line: the next one answers the login.
    conn.send(b"LOGIN alice\r\n");
    assert_eq!(conn.line(), "SUCCESS LOGIN alice\r\n");
    conn.send(b"LOGOUT \r\n");
    conn.expect_closed();
    handle.shutdown().unwrap();
}

#[test]
fn uploads_are_stored_in_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        upload_dir: Some(dir.path().to_path_buf()),
        ..test_config()
    };
    let handle = start(config);

    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let mut client = Client::connect(handle.local_addr()).unwrap();
    client.login("carol").unwrap();
    let sent = client
        .upload("data.bin", payload.as_slice(), payload.len() as u64)
        .unwrap();
    assert_eq!(sent, 1000);
    client.logout().unwrap();

    let stored = std::fs::read(dir.path().join("data.bin")).unwrap();
    assert_eq!(stored, payload);

    handle.shutdown().unwrap();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[test]
fn run_on_calling_thread() {
    let server = Server::bind(test_config()).unwrap();
    let addr = server.local_addr();
    let registry = server.registry();
    let dispatcher = thread::spawn(move || server.run());

    let mut client = Client::connect(addr).unwrap();
    client.login("dave").unwrap();
    wait_until(|| registry.len() == 1);

    // Draining: the logged-in session keeps the registry non-empty.
    assert!(!registry.await_drain_timeout(Duration::from_millis(50)));
    assert!(registry.is_terminating());

    client.logout().unwrap();
    assert!(registry.await_drain_timeout(Duration::from_secs(5)));
    dispatcher.join().unwrap().unwrap();
}

#[test]
fn shutdown_with_no_sessions_returns() {
    let handle = start(test_config());
    handle.shutdown().unwrap();
}

#[test]
fn shutdown_waits_for_sessions_mid_upload() {
    let handle = start(test_config());
    let addr = handle.local_addr();
    let registry = handle.registry().clone();

    let mut alice = Conn::login(&handle, "alice");
    let mut bob = Conn::login(&handle, "bob");
    alice.send(b"UPLOAD a.bin 8\r\n");
    bob.send(b"UPLOAD b.bin 8\r\n");
    assert_eq!(alice.line(), "ACKN a.bin\r\n");
    assert_eq!(bob.line(), "ACKN b.bin\r\n");
    alice.send(b"1234");
    bob.send(b"1234");

    let done = shutdown_in_background(handle);
    wait_until(|| registry.is_terminating());
    thread::sleep(Duration::from_millis(100));
    assert!(done.try_recv().is_err(), "shutdown returned with open sessions");

    // No new sessions once shutdown was requested.
    assert!(TcpStream::connect(addr)
        .and_then(|mut s| {
            s.set_read_timeout(Some(Duration::from_millis(500)))?;
            let mut buf = [0u8; 16];
            match s.read(&mut buf)? {
                0 => Err(std::io::ErrorKind::UnexpectedEof.into()),
                _ => Ok(()),
            }
        })
        .is_err());

    // Existing sessions keep being served until they finish.
    alice.send(b"5678");
    assert_eq!(alice.line(), "SUCCESS UPLOAD a.bin\r\n");
    alice.send(b"LOGOUT \r\n");
    alice.expect_closed();

    thread::sleep(Duration::from_millis(100));
    assert!(done.try_recv().is_err(), "shutdown returned with one session open");

    bob.send(b"5678");
    assert_eq!(bob.line(), "SUCCESS UPLOAD b.bin\r\n");
    bob.send(b"LOGOUT \r\n");
    bob.expect_closed();

    let result = done
        .recv_timeout(Duration::from_secs(5))
        .expect("shutdown did not return");
    assert!(result.is_ok());
    assert!(registry.is_empty());
}

#[test]
fn force_shutdown_closes_sessions() {
    let config = Config {
        shutdown_policy: ShutdownPolicy::Force,
        ..test_config()
    };
    let handle = start(config);
    let registry = handle.registry().clone();

    let mut alice = Conn::login(&handle, "alice");
    let mut bob = Conn::login(&handle, "bob");
    bob.send(b"UPLOAD b.bin 1000\r\n");
    assert_eq!(bob.line(), "ACKN b.bin\r\n");

    let done = shutdown_in_background(handle);
    let result = done
        .recv_timeout(Duration::from_secs(5))
        .expect("forced shutdown did not return");
    assert!(result.is_ok());
    assert!(registry.is_empty());

    alice.expect_closed();
    bob.expect_closed();
}

#[test]
fn drain_timeout_closes_idle_sessions() {
    let config = Config {
        drain_timeout: Some(Duration::from_millis(200)),
        ..test_config()
    };
    let handle = start(config);
    let mut idle = Conn::login(&handle, "idle");

    let done = shutdown_in_background(handle);
    let result = done
        .recv_timeout(Duration::from_secs(5))
        .expect("shutdown did not return after drain timeout");
    assert!(result.is_ok());
    idle.expect_closed();
}
