use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log_receiver::receiver::{self, ACK_MESSAGE, PARSE_FAILURE_PREFIX, SERVICE_NAME};
use log_receiver::{ErrorKind, Server};
use serde_json::{json, Value};

struct Running {
    addr: SocketAddr,
    stop: &'static AtomicBool,
    handle: JoinHandle<log_receiver::Result<()>>,
}

impl Running {
    fn start() -> Self {
        let stop: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
        let mut server = Server::new("127.0.0.1:0").unwrap();
        server.stop_on(stop);
        let listening = server.bind().unwrap();
        let addr = listening.local_addr();
        let handle = thread::spawn(move || listening.serve(receiver::handle));
        Running { addr, stop, handle }
    }

    fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap().unwrap();
    }
}

struct Reply {
    status: u16,
    head: String,
    body: Vec<u8>,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

fn read_reply(mut stream: TcpStream) -> Reply {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    let head = String::from_utf8(raw[..split].to_vec()).unwrap();
    let status = head.split(' ').nth(1).unwrap().parse().unwrap();
    Reply {
        status,
        head,
        body: raw[split + 4..].to_vec(),
    }
}

fn exchange(addr: SocketAddr, raw: &[u8]) -> Reply {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(raw).unwrap();
    read_reply(stream)
}

fn post_log(addr: SocketAddr, body: &[u8]) -> Reply {
    let mut raw = format!(
        "POST /api/logs/receive HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nX-Log-Source: test-client\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(body);
    exchange(addr, &raw)
}

#[test]
fn receives_log_payload() {
    let server = Running::start();

    let reply = post_log(server.addr, br#"{"level":"info","msg":"hello"}"#);
    assert_eq!(reply.status, 200);
    assert!(reply.head.contains("content-type: application/json"));
    assert!(reply.head.contains("connection: close"));
    let body = reply.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], ACK_MESSAGE);
    assert!(body["timestamp"].as_i64().unwrap() > 0);
    assert_eq!(body["receivedData"], json!({"level": "info", "msg": "hello"}));

    server.shutdown();
}

#[test]
fn body_arriving_in_pieces() {
    let server = Running::start();

    let body = "{\"msg\":\"分段发送\",\"n\":[1,2,3]}".as_bytes();
    let mut stream = TcpStream::connect(server.addr).unwrap();
    write!(
        stream,
        "POST /api/logs/receive HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(&body[..7]).unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(&body[7..]).unwrap();

    let reply = read_reply(stream);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["receivedData"], json!({"msg": "分段发送", "n": [1, 2, 3]}));

    server.shutdown();
}

#[test]
fn rejects_non_json_payload() {
    let server = Running::start();

    let reply = post_log(server.addr, b"not-json");
    assert_eq!(reply.status, 400);
    let body = reply.json();
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().starts_with(PARSE_FAILURE_PREFIX));
    assert!(body["timestamp"].is_i64());

    let reply = post_log(server.addr, b"\xff\xfe\xfd");
    assert_eq!(reply.status, 400);
    assert_eq!(reply.json()["success"], false);

    server.shutdown();
}

#[test]
fn health_probe() {
    let server = Running::start();

    let reply = exchange(server.addr, b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(reply.status, 200);
    let body = reply.json();
    assert_eq!(body["status"], "UP");
    assert_eq!(body["service"], SERVICE_NAME);
    assert!(body["timestamp"].as_i64().unwrap() > 0);

    server.shutdown();
}

#[test]
fn unknown_route_is_plain_not_found() {
    let server = Running::start();

    let reply = exchange(server.addr, b"GET /unknown HTTP/1.1\r\n\r\n");
    assert_eq!(reply.status, 404);
    assert_eq!(reply.body, b"Not Found");
    assert!(reply.head.contains("connection: close"));
    assert!(!reply.head.contains("content-type"));

    server.shutdown();
}

#[test]
fn malformed_head_is_bad_request() {
    let server = Running::start();

    let reply = exchange(
        server.addr,
        b"POST /api/logs/receive HTTP/1.1\r\nContent-Length: many\r\n\r\n",
    );
    assert_eq!(reply.status, 400);
    assert_eq!(reply.body, b"bad request");

    server.shutdown();
}

#[test]
fn stalled_client_does_not_block_others() {
    let server = Running::start();

    let mut stalled = TcpStream::connect(server.addr).unwrap();
    stalled
        .write_all(b"POST /api/logs/receive HTTP/1.1\r\nContent-Length: 100\r\n\r\n{")
        .unwrap();

    let reply = exchange(server.addr, b"GET /health HTTP/1.1\r\n\r\n");
    assert_eq!(reply.status, 200);

    drop(stalled);
    server.shutdown();
}

#[test]
fn second_bind_reports_address_in_use() {
    let first = Server::new("127.0.0.1:0").unwrap().bind().unwrap();
    let addr = first.local_addr().to_string();

    match Server::new(&addr).unwrap().bind() {
        Err(e) => match e.kind() {
            ErrorKind::AddressInUse(in_use) => assert_eq!(in_use, &addr),
            other => panic!("unexpected error kind: {}", other),
        },
        Ok(_) => panic!("second bind on {} succeeded", addr),
    }
}

#[test]
fn stop_flag_closes_listener() {
    let server = Running::start();
    let addr = server.addr;
    server.shutdown();

    assert!(TcpStream::connect(addr).is_err());
}
