use sonata_core::{Config, IdentityError, IdentityStore, Server, SonataResult, Verdict};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct TestStore;

impl IdentityStore for TestStore {
    fn login(&self, username: &str, password: &str) -> Result<Verdict, IdentityError> {
        if username == "alice" && password == "pw" {
            Ok(Verdict::success("Login successful"))
        } else {
            Ok(Verdict::failure("Invalid username or password"))
        }
    }

    fn register(
        &self,
        _username: &str,
        _password: &str,
        _email: Option<&str>,
    ) -> Result<Verdict, IdentityError> {
        Err(IdentityError::Unavailable("database offline".into()))
    }
}

struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<SonataResult<()>>>,
    _root: tempfile::TempDir,
}

impl TestServer {
    fn start(tweak: impl FnOnce(&mut Config)) -> Self {
        let root = tempfile::tempdir().unwrap();
        write_public(&root.path().join("index.html"), b"<h1>Welcome</h1>");
        write_public(&root.path().join("empty.txt"), b"");
        let big: Vec<u8> = (0..512 * 1024).map(|i| (i % 253) as u8).collect();
        write_public(&root.path().join("big.bin"), &big);

        let mut config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            doc_root: root.path().to_path_buf(),
            workers: 2,
            poll_timeout_ms: 50,
            ..Config::default()
        };
        tweak(&mut config);

        let server = Server::bind(config, Arc::new(TestStore)).unwrap();
        let addr = server.local_addr();
        let stop = server.shutdown_handle();
        let handle = thread::spawn(move || server.serve());

        Self {
            addr,
            stop,
            handle: Some(handle),
            _root: root,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn stop(mut self) -> SonataResult<()> {
        self.stop.store(true, Ordering::Release);
        self.handle.take().unwrap().join().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_public(path: &Path, contents: &[u8]) {
    fs::write(path, contents).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o644)).unwrap();
}

/// Read one response: header block, then exactly Content-Length body bytes.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "connection closed inside the header block");
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn post(path: &str, body: &str) -> String {
    format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        path,
        body.len(),
        body
    )
}

#[test]
fn serves_static_files_and_errors() {
    let server = TestServer::start(|_| {});

    let mut stream = server.connect();
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.contains("Content-Type: text/html\r\n"));
    assert!(res.contains("Connection: close\r\n"));
    assert!(res.ends_with("<h1>Welcome</h1>"));

    let mut stream = server.connect();
    stream
        .write_all(b"GET /missing-file HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    let page = "The requested file was not found on this server.\n";
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(res.contains(&format!("Content-Length: {}\r\n", page.len())));
    assert!(res.ends_with(page));

    let mut stream = server.connect();
    stream.write_all(b"GET index.html HTTP/1.1\r\n\r\n").unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    let mut stream = server.connect();
    stream.write_all(b"GET /empty.txt HTTP/1.0\r\n\r\n").unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(res.contains("Content-Length: 0\r\n"));
    assert!(res.ends_with("\r\n\r\n"));
}

#[test]
fn login_and_register_reply_with_json() {
    let server = TestServer::start(|_| {});

    let mut stream = server.connect();
    stream
        .write_all(post("/login", r#"{"username":"alice","password":"pw"}"#).as_bytes())
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: application/json\r\n"));
    let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["success"], true);
    assert_eq!(reply["username"], "alice");
    assert_eq!(reply["redirect"], "/welcome.html");

    let mut stream = server.connect();
    stream
        .write_all(post("/login", r#"{"username":"alice","password":"wrong"}"#).as_bytes())
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["success"], false);
    assert_eq!(reply["message"], "Invalid username or password");

    // Store failures become a plain `success:false`.
    let mut stream = server.connect();
    stream
        .write_all(post("/register", r#"{"username":"bob","password":"pw"}"#).as_bytes())
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["success"], false);
    assert!(reply["message"].is_string());
}

#[test]
fn request_split_across_writes() {
    let server = TestServer::start(|_| {});
    let request = post("/login", r#"{"username":"alice","password":"pw"}"#);

    let mut stream = server.connect();
    stream.set_nodelay(true).unwrap();
    for piece in request.as_bytes().chunks(9) {
        stream.write_all(piece).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    let (_, body) = read_response(&mut stream);
    let reply: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(reply["success"], true);
}

#[test]
fn keep_alive_serves_several_requests() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();

    for _ in 0..3 {
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(body, b"<h1>Welcome</h1>");
    }

    stream.write_all(b"GET /index.html HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.contains("Connection: close\r\n"));
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn large_file_arrives_intact() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream.write_all(b"GET /big.bin HTTP/1.1\r\n\r\n").unwrap();

    // Let the server fill the socket buffer before reading.
    thread::sleep(Duration::from_millis(50));
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Content-Length: 524288\r\n"));
    let expected: Vec<u8> = (0..512 * 1024).map(|i| (i % 253) as u8).collect();
    assert!(body == expected);
}

#[test]
fn full_connection_table_answers_503() {
    let server = TestServer::start(|c| c.max_connections = 1);

    let _held = server.connect();
    thread::sleep(Duration::from_millis(100));

    let mut refused = server.connect();
    let mut res = String::new();
    refused.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
}

#[test]
fn many_clients_with_a_tiny_queue() {
    let server = TestServer::start(|c| {
        c.workers = 1;
        c.max_queue = 1;
    });
    let addr = server.addr;

    let clients: Vec<_> = (0..16)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .unwrap();
                stream.write_all(b"GET /index.html HTTP/1.1\r\n\r\n").unwrap();
                let mut res = String::new();
                stream.read_to_string(&mut res).unwrap();
                res
            })
        })
        .collect();

    for client in clients {
        let res = client.join().unwrap();
        assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    }
}

#[test]
fn shutdown_flag_stops_the_server() {
    let server = TestServer::start(|_| {});
    let _idle = server.connect();
    thread::sleep(Duration::from_millis(20));
    assert!(server.stop().is_ok());
}
