use std::{
    fs,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tempfile::TempDir;

struct UpstreamServer {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    port: u16,
}

impl UpstreamServer {
    fn spawn(port: u16, content_type: &'static str, body: &'static str) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = thread::spawn(move || {
            let listener =
                TcpListener::bind(("127.0.0.1", port)).expect("failed to bind upstream server");
            listener
                .set_nonblocking(true)
                .expect("failed to set nonblocking upstream listener");

            while !stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = handle_upstream_conn(&mut stream, content_type, body);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
            port,
        }
    }

    /// An upstream that never answers, used to exercise the read-timeout path.
    fn spawn_stalling(port: u16) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = thread::spawn(move || {
            let listener =
                TcpListener::bind(("127.0.0.1", port)).expect("failed to bind stalling upstream");
            listener.set_nonblocking(true).expect("nonblocking listener");
            let mut held = Vec::new();
            while !stop.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => held.push(stream),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
            drop(held);
        });
        Self {
            shutdown,
            handle: Some(handle),
            port,
        }
    }
}

impl Drop for UpstreamServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_upstream_conn(stream: &mut TcpStream, content_type: &'static str, body: &'static str) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 4096];
    let _ = stream.read(&mut buf)?;

    let resp = format!(
        "HTTP/1.1 200 OK\r\ncontent-length: {}\r\ncontent-type: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        content_type,
        body
    );
    stream.write_all(resp.as_bytes())?;
    stream.flush()?;
    Ok(())
}

struct GatewayProcess {
    child: Child,
}

impl GatewayProcess {
    fn spawn(config_path: &Path) -> Self {
        let child = Command::new(resolve_gateway_binary())
            .env("SPG_CONFIG_PATH", config_path)
            .env("RUST_LOG", "error")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn gateway");
        Self { child }
    }

    fn wait_until_listening(&self, port: u16) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("gateway did not start listening on port {port}");
    }
}

fn resolve_gateway_binary() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_spg") {
        return PathBuf::from(path);
    }

    let mut candidate = std::env::current_exe()
        .expect("failed to resolve current test binary path")
        .parent()
        .expect("missing test binary parent")
        .parent()
        .expect("missing target debug parent")
        .join("spg");
    if cfg!(windows) {
        candidate.set_extension("exe");
    }

    if candidate.exists() {
        return candidate;
    }

    panic!(
        "unable to locate spg binary: tried CARGO_BIN_EXE_spg and {}",
        candidate.display()
    );
}

impl Drop for GatewayProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn reserve_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("failed to bind random port")
        .local_addr()
        .expect("failed to get local addr")
        .port()
}

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("config.yaml");
    fs::write(&path, content).expect("failed to write config");
    path
}

fn header_value<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let lower_name = name.to_ascii_lowercase();
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim().to_ascii_lowercase() == lower_name).then(|| value.trim())
    })
}

fn send_request_with_headers(port: u16, method: &str, path: &str, headers: &[(&str, &str)]) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("failed to connect to gateway");
    stream
        .set_read_timeout(Some(Duration::from_secs(8)))
        .expect("failed to set read timeout");
    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\n");
    for (name, value) in headers {
        req.push_str(&format!("{name}: {value}\r\n"));
    }
    req.push_str("Connection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).expect("failed to write request");
    stream.flush().expect("failed to flush request");
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("failed to read response");
    response
}

fn send_json_post(port: u16, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to admin");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let req = format!(
        "POST {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(req.as_bytes()).unwrap();
    let mut resp = String::new();
    stream.read_to_string(&mut resp).unwrap();
    resp
}

fn send_request(port: u16, method: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("failed to connect to gateway");
    stream
        .set_read_timeout(Some(Duration::from_secs(8)))
        .expect("failed to set read timeout");
    let req = format!("{method} {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).expect("failed to write request");
    stream.flush().expect("failed to flush request");
    let mut response = String::new();
    stream.read_to_string(&mut response).expect("failed to read response");
    response
}

#[test]
fn routes_longest_prefix_to_matching_upstream() {
    let generic_port = reserve_port();
    let specific_port = reserve_port();
    let _generic = UpstreamServer::spawn(generic_port, "text/plain", "generic upstream");
    let _specific = UpstreamServer::spawn(specific_port, "text/plain", "specific upstream");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\n  admin_host: \"127.0.0.1\"\nroutes:\n  - name: generic\n    path: /api\n    target: \"http://127.0.0.1:{generic_port}\"\n  - name: specific\n    path: /api/users\n    target: \"http://127.0.0.1:{specific_port}\"\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let response = send_request(proxy_port, "GET", "/api/users/42");
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.contains("specific upstream"), "response: {response}");
}

#[test]
fn returns_404_for_unmatched_path_and_405_for_wrong_method() {
    let upstream_port = reserve_port();
    let _upstream = UpstreamServer::spawn(upstream_port, "text/plain", "unused");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: only\n    path: /api\n    target: \"http://127.0.0.1:{upstream_port}\"\n    method: GET\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let not_found = send_request(proxy_port, "GET", "/other");
    assert!(not_found.starts_with("HTTP/1.1 404"), "response: {not_found}");

    let not_allowed = send_request(proxy_port, "POST", "/api");
    assert!(not_allowed.starts_with("HTTP/1.1 405"), "response: {not_allowed}");
}

#[test]
fn masks_matching_response_body_content() {
    let upstream_port = reserve_port();
    let _upstream = UpstreamServer::spawn(upstream_port, "text/plain", "ssn: 123-45-6789 done");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: app\n    path: /\n    target: \"http://127.0.0.1:{upstream_port}\"\n    response_rules:\n      mask_regex:\n        - pattern: \"\\\\d{{3}}-\\\\d{{2}}-\\\\d{{4}}\"\n          replacement: \"***-**-****\"\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let response = send_request(proxy_port, "GET", "/");
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.contains("***-**-****"), "response: {response}");
    assert!(!response.contains("123-45-6789"), "response: {response}");
}

#[test]
fn upstream_that_never_responds_yields_gateway_timeout() {
    let stalling_port = reserve_port();
    let _stalling = UpstreamServer::spawn_stalling(stalling_port);
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nproxy:\n  timeout:\n    connect: 1.0\n    read: 1.0\n    write: 1.0\nroutes:\n  - name: app\n    path: /\n    target: \"http://127.0.0.1:{stalling_port}\"\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let response = send_request(proxy_port, "GET", "/");
    assert!(response.starts_with("HTTP/1.1 504"), "response: {response}");
}

#[test]
fn admin_update_backs_up_prior_config_and_takes_effect() {
    let upstream_a_port = reserve_port();
    let upstream_b_port = reserve_port();
    let _upstream_a = UpstreamServer::spawn(upstream_a_port, "text/plain", "from a");
    let _upstream_b = UpstreamServer::spawn(upstream_b_port, "text/plain", "from b");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: app\n    path: /\n    target: \"http://127.0.0.1:{upstream_a_port}\"\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let before = send_request(proxy_port, "GET", "/");
    assert!(before.contains("from a"), "response: {before}");

    let new_cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: app\n    path: /\n    target: \"http://127.0.0.1:{upstream_b_port}\"\n"
    );
    let escaped = new_cfg.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n");
    let body = format!("{{\"content\": \"{escaped}\", \"format\": \"yaml\"}}");

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).expect("connect to admin");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let req = format!(
        "POST /api/config HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(req.as_bytes()).unwrap();
    let mut resp = String::new();
    stream.read_to_string(&mut resp).unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"), "admin response: {resp}");

    let backup_path = PathBuf::from(format!("{}.bak", cfg_path.display()));
    assert!(backup_path.exists(), "expected backup at {}", backup_path.display());

    let mut retries = 0;
    loop {
        let after = send_request(proxy_port, "GET", "/");
        if after.contains("from b") {
            break;
        }
        retries += 1;
        assert!(retries < 20, "gateway never picked up updated config: {after}");
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn proxy_response_echoes_request_id_as_header() {
    let upstream_port = reserve_port();
    let _upstream = UpstreamServer::spawn(upstream_port, "text/plain", "hello");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: app\n    path: /\n    target: \"http://127.0.0.1:{upstream_port}\"\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let response = send_request_with_headers(proxy_port, "GET", "/", &[("X-Request-Id", "abc-123")]);
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert_eq!(header_value(&response, "x-request-id"), Some("abc-123"));
}

#[test]
fn proxy_generates_request_id_header_when_absent() {
    let upstream_port = reserve_port();
    let _upstream = UpstreamServer::spawn(upstream_port, "text/plain", "hello");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: app\n    path: /\n    target: \"http://127.0.0.1:{upstream_port}\"\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let response = send_request(proxy_port, "GET", "/");
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(header_value(&response, "x-request-id").is_some_and(|id| !id.is_empty()));
}

#[test]
fn not_found_response_still_carries_request_id_header() {
    let upstream_port = reserve_port();
    let _upstream = UpstreamServer::spawn(upstream_port, "text/plain", "unused");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: only\n    path: /api\n    target: \"http://127.0.0.1:{upstream_port}\"\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let response = send_request_with_headers(proxy_port, "GET", "/other", &[("X-Request-Id", "req-404")]);
    assert!(response.starts_with("HTTP/1.1 404"), "response: {response}");
    assert_eq!(header_value(&response, "x-request-id"), Some("req-404"));
}

#[test]
fn admin_accepts_structured_config_body_without_content_wrapper() {
    let upstream_a_port = reserve_port();
    let upstream_b_port = reserve_port();
    let _upstream_a = UpstreamServer::spawn(upstream_a_port, "text/plain", "from a");
    let _upstream_b = UpstreamServer::spawn(upstream_b_port, "text/plain", "from b");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: app\n    path: /\n    target: \"http://127.0.0.1:{upstream_a_port}\"\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let structured_body = format!(
        "{{\"server\": {{\"host\": \"127.0.0.1\", \"port\": {proxy_port}, \"admin_host\": \"127.0.0.1\"}}, \"routes\": [{{\"name\": \"app\", \"path\": \"/\", \"target\": \"http://127.0.0.1:{upstream_b_port}\"}}]}}"
    );
    let resp = send_json_post(proxy_port, "/api/config", &structured_body);
    assert!(resp.starts_with("HTTP/1.1 200"), "admin response: {resp}");

    let mut retries = 0;
    loop {
        let after = send_request(proxy_port, "GET", "/");
        if after.contains("from b") {
            break;
        }
        retries += 1;
        assert!(retries < 20, "gateway never picked up structured config update: {after}");
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn admin_get_config_reports_path_and_picks_up_external_edits() {
    let upstream_a_port = reserve_port();
    let upstream_b_port = reserve_port();
    let _upstream_a = UpstreamServer::spawn(upstream_a_port, "text/plain", "from a");
    let _upstream_b = UpstreamServer::spawn(upstream_b_port, "text/plain", "from b");
    let proxy_port = reserve_port();
    let tmp = TempDir::new().expect("failed to create temp dir");
    let cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: app\n    path: /\n    target: \"http://127.0.0.1:{upstream_a_port}\"\n"
    );
    let cfg_path = write_config(&tmp, &cfg);

    let gateway = GatewayProcess::spawn(&cfg_path);
    gateway.wait_until_listening(proxy_port);

    let initial = send_request(proxy_port, "GET", "/api/config");
    assert!(initial.starts_with("HTTP/1.1 200"), "admin response: {initial}");
    assert!(initial.contains(&cfg_path.display().to_string()), "response: {initial}");
    assert!(initial.contains("from a") || initial.contains(&upstream_a_port.to_string()));

    thread::sleep(Duration::from_millis(10));
    let new_cfg = format!(
        "server:\n  host: \"127.0.0.1\"\n  port: {proxy_port}\nroutes:\n  - name: app\n    path: /\n    target: \"http://127.0.0.1:{upstream_b_port}\"\n"
    );
    fs::write(&cfg_path, &new_cfg).expect("failed to edit config externally");

    let mut retries = 0;
    loop {
        let after = send_request(proxy_port, "GET", "/api/config");
        if after.contains(&upstream_b_port.to_string()) {
            break;
        }
        retries += 1;
        assert!(retries < 20, "GET /api/config never reloaded external edit: {after}");
        thread::sleep(Duration::from_millis(100));
    }
}
