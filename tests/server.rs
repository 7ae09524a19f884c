//! End-to-end tests driving a real server over loopback sockets.

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rivet::{Config, Handle, TriggerMode, WebServer};
use tempfile::TempDir;

const INDEX: &str = "<html><body>index page</body></html>";
const PAGE_404: &str = "<html><body>not found</body></html>";
const PAGE_400: &str = "<html><body>bad request</body></html>";
const PAGE_403: &str = "<html><body>forbidden</body></html>";
const WELCOME: &str = "<html><body>welcome</body></html>";
const ERROR_PAGE: &str = "<html><body>login failed</body></html>";

fn write_page(dir: &Path, name: &str, contents: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
}

fn write_pages(dir: &Path) {
    write_page(dir, "index.html", INDEX);
    write_page(dir, "404.html", PAGE_404);
    write_page(dir, "400.html", PAGE_400);
    write_page(dir, "403.html", PAGE_403);
    write_page(dir, "welcome.html", WELCOME);
    write_page(dir, "error.html", ERROR_PAGE);
}

struct TestServer {
    handle: Handle,
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
    _resources: TempDir,
}

impl TestServer {
    fn start(trigger: TriggerMode, timeout: Option<Duration>) -> TestServer {
        let resources = tempfile::tempdir().unwrap();
        write_pages(resources.path());
        let mut server = WebServer::new(Config {
            port: 0,
            trigger,
            timeout,
            linger: false,
            worker_threads: 3,
            user_pool_size: 2,
            src_dir: Some(resources.path().to_path_buf()),
            log: None,
        })
        .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run());
        TestServer {
            handle,
            addr,
            thread: Some(thread),
            _resources: resources,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn wait_for_idle(&self) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while self.handle.active_users() > 0 {
            assert!(Instant::now() < deadline, "connections never drained");
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Sends one request and reads until the server closes the socket.
fn roundtrip_to_eof(server: &TestServer, request: &[u8]) -> String {
    let mut stream = server.connect();
    stream.write_all(request).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

/// Reads one response off a keep-alive stream: headers to the blank
/// line, then exactly Content-length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(
            n > 0,
            "eof before end of headers: {:?}",
            String::from_utf8_lossy(&head)
        );
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let len = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-length: "))
        .map(|v| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = vec![0; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

#[test]
fn get_root_serves_index_and_closes() {
    let server = TestServer::start(TriggerMode::EdgeBoth, Some(Duration::from_secs(10)));
    let response = roundtrip_to_eof(&server, b"GET / HTTP/1.1\r\nHost: t\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.contains("Content-type: text/html\r\n"));
    assert!(response.contains(&format!("Content-length: {}\r\n\r\n", INDEX.len())));
    assert!(response.ends_with(INDEX));
    server.wait_for_idle();
}

#[test]
fn keep_alive_reuses_the_connection() {
    for trigger in [TriggerMode::Level, TriggerMode::EdgeBoth] {
        let server = TestServer::start(trigger, Some(Duration::from_secs(10)));
        let mut stream = server.connect();
        for _ in 0..2 {
            stream
                .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                .unwrap();
            let (head, body) = read_response(&mut stream);
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
            assert!(head.contains("Connection: keep-alive\r\n"));
            assert_eq!(INDEX.as_bytes(), body.as_slice());
        }
    }
}

#[test]
fn unknown_path_gets_the_canned_404() {
    let server = TestServer::start(TriggerMode::EdgeBoth, Some(Duration::from_secs(10)));
    let response = roundtrip_to_eof(&server, b"GET /nope HTTP/1.1\r\nHost: t\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    assert!(response.ends_with(PAGE_404));
}

#[test]
fn garbage_request_gets_400_and_close() {
    let server = TestServer::start(TriggerMode::EdgeBoth, Some(Duration::from_secs(10)));
    let response = roundtrip_to_eof(&server, b"GARBAGE\r\n\r\n");
    assert!(
        response.starts_with("HTTP/1.1 400 Bad Request\r\n"),
        "{response}"
    );
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with(PAGE_400));
}

#[test]
fn unreadable_file_gets_403() {
    use std::os::unix::fs::PermissionsExt;
    let server = TestServer::start(TriggerMode::EdgeBoth, Some(Duration::from_secs(10)));
    let secret = server._resources.path().join("secret.html");
    fs::write(&secret, "hidden").unwrap();
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();
    let response = roundtrip_to_eof(&server, b"GET /secret.html HTTP/1.1\r\nHost: t\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{response}");
    assert!(response.ends_with(PAGE_403));
}

#[test]
fn register_then_login_lands_on_welcome() {
    let server = TestServer::start(TriggerMode::EdgeBoth, Some(Duration::from_secs(10)));

    let register = b"POST /register.html HTTP/1.1\r\nHost: t\r\n\
        Content-Type: application/x-www-form-urlencoded\r\n\
        Content-Length: 26\r\n\r\n\
        username=alice&password=pw";
    let response = roundtrip_to_eof(&server, register);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with(WELCOME), "{response}");

    let login = b"POST /login.html HTTP/1.1\r\nHost: t\r\n\
        Content-Type: application/x-www-form-urlencoded\r\n\
        Content-Length: 26\r\n\r\n\
        username=alice&password=pw";
    let response = roundtrip_to_eof(&server, login);
    assert!(response.ends_with(WELCOME), "{response}");

    let bad_login = b"POST /login.html HTTP/1.1\r\nHost: t\r\n\
        Content-Type: application/x-www-form-urlencoded\r\n\
        Content-Length: 28\r\n\r\n\
        username=alice&password=nope";
    let response = roundtrip_to_eof(&server, bad_login);
    assert!(response.ends_with(ERROR_PAGE), "{response}");
}

#[test]
fn idle_connection_is_closed_by_the_timer() {
    let server = TestServer::start(TriggerMode::EdgeBoth, Some(Duration::from_millis(250)));
    let mut stream = server.connect();
    // say nothing; the idle deadline should close the socket
    let mut buf = [0u8; 16];
    let start = Instant::now();
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(0, n, "expected eof from the server");
    assert!(start.elapsed() >= Duration::from_millis(200));
    server.wait_for_idle();
    assert_eq!(0, server.handle.active_users());
}

#[test]
fn concurrent_clients_all_complete() {
    let server = TestServer::start(TriggerMode::EdgeBoth, Some(Duration::from_secs(10)));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let addr = server.addr;
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                stream
                    .write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n")
                    .unwrap();
                let mut response = String::new();
                stream.read_to_string(&mut response).unwrap();
                response.starts_with("HTTP/1.1 200 OK\r\n") && response.ends_with(INDEX)
            })
        })
        .collect();
    for worker in workers {
        assert!(worker.join().unwrap());
    }
    server.wait_for_idle();
}
