/*!
## log_receiver

A small HTTP server that stands in for a log collector while testing a log
sender. `POST /api/logs/receive` accepts a JSON payload and echoes it back in
an acknowledgment, `GET /health` answers a liveness probe.

## Basic Example

```rust,no_run
# fn run() -> log_receiver::Result<()> {
use log_receiver::config::ReceiverConfig;

log_receiver::start_server(&ReceiverConfig::default().with_port(8081))?;
# Ok(())
# }
```

The request loop is single threaded: handlers run one at a time, in the
order their requests complete.
*/

#![recursion_limit = "1024"]
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

mod errors;
mod http_stream;

pub mod config;
pub mod receiver;
pub mod signal;

pub use http::header;
pub use http::method;
pub use http::status;
use mio::net::{TcpListener, TcpStream};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use crate::errors::*;
use crate::http_stream::HttpStreamReader;

/// Re-exported `http::Response` for constructing return responses in handlers
pub use http::Response;
use mio::{Interest, Token};

use crate::config::ReceiverConfig;

/// How long a poll may block before the stop flag is checked again
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Internal `http::Response` wrapper with helpers for constructing the bytes
/// that needs to be written back a Stream
struct ResponseWrapper {
    inner: http::Response<Vec<u8>>,
    header_data: Vec<u8>,
}
impl ResponseWrapper {
    fn new(inner: http::Response<Vec<u8>>) -> Self {
        let mut wrapper = Self {
            inner,
            header_data: Vec::with_capacity(1024),
        };
        wrapper.serialize_headers();
        wrapper
    }

    fn bad_request() -> Self {
        let mut resp = Response::new(b"bad request".to_vec());
        *resp.status_mut() = status::StatusCode::BAD_REQUEST;
        Self::new(resp)
    }

    fn serialize_headers(&mut self) {
        {
            let body_len = self.inner.body().len();
            let hdrs = self.inner.headers_mut();
            hdrs.insert(
                header::SERVER,
                header::HeaderValue::from_static("log-receiver (rust)"),
            );
            hdrs.insert(header::CONTENT_LENGTH, header::HeaderValue::from(body_len));
            // every connection carries exactly one request
            hdrs.insert(header::CONNECTION, header::HeaderValue::from_static("close"));
        }
        let status = self.inner.status();
        let s = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_str(),
            status.canonical_reason().unwrap_or("Unsupported Status")
        );
        self.header_data.extend_from_slice(s.as_bytes());

        for (key, value) in self.inner.headers().iter() {
            self.header_data.extend_from_slice(key.as_str().as_bytes());
            self.header_data.extend_from_slice(b": ");
            self.header_data.extend_from_slice(value.as_bytes());
            self.header_data.extend_from_slice(b"\r\n");
        }
        self.header_data.extend_from_slice(b"\r\n");
    }

    /// Header bytes followed by body bytes, starting at `offset`
    fn remaining(&self, offset: usize) -> Option<&[u8]> {
        let header_len = self.header_data.len();
        if offset < header_len {
            Some(&self.header_data[offset..])
        } else if offset < header_len + self.inner.body().len() {
            Some(&self.inner.body()[offset - header_len..])
        } else {
            None
        }
    }
}

/// Represent everything about a request except its (possible) body
type RequestHead = http::Request<()>;

/// `Request` received and used by handlers. Wraps & `deref`s to an `http::Request`
/// and patches `Request::body` to return the correct slice of bytes from the
/// `HttpStreamReader.read_buf`
pub struct Request {
    inner: http::Request<Vec<u8>>,
    body_start: usize,
}
impl Request {
    pub fn body(&self) -> &[u8] {
        &self.inner.body()[self.body_start..]
    }
}
impl From<http::Request<Vec<u8>>> for Request {
    fn from(inner: http::Request<Vec<u8>>) -> Self {
        Self {
            inner,
            body_start: 0,
        }
    }
}
impl std::ops::Deref for Request {
    type Target = http::Request<Vec<u8>>;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl std::ops::DerefMut for Request {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Represent the tcp socket & streams being polled by `mio`
enum Socket {
    Listener {
        listener: TcpListener,
    },
    Stream {
        stream: TcpStream,
        reader: HttpStreamReader,
        response: Option<ResponseWrapper>,
        bytes_written: usize,
    },
}
impl Socket {
    fn new_listener(l: TcpListener) -> Self {
        Socket::Listener { listener: l }
    }

    /// Construct a new `Stream` variant accepted from a tcp listener
    fn new_stream(s: TcpStream) -> Self {
        Socket::Stream {
            stream: s,
            reader: HttpStreamReader::new(),
            response: None,
            bytes_written: 0,
        }
    }
}

enum ReadOutcome {
    /// Peer is still connected, maybe more to come
    Open,
    /// Peer closed its write half or the socket failed
    Closed,
}

/// Drain everything currently readable into `reader`
fn read_available(token: Token, stream: &mut TcpStream, reader: &mut HttpStreamReader) -> ReadOutcome {
    let mut buf = [0; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => {
                let total = reader.receive_chunk(&buf[..n]);
                debug!("{:?} - Read {} bytes ({} buffered)", token, n, total);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Open,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                return ReadOutcome::Closed
            }
            Err(e) => {
                error!("{:?} - Encountered error while reading from socket: {:?}", token, e);
                return ReadOutcome::Closed;
            }
        }
    }
}

/// Write as much of `resp` as the socket accepts. Returns `true` once the
/// connection is finished with, either fully written or broken.
fn write_available(
    token: Token,
    stream: &mut TcpStream,
    resp: &ResponseWrapper,
    bytes_written: &mut usize,
) -> bool {
    loop {
        let data = match resp.remaining(*bytes_written) {
            Some(data) => data,
            None => {
                debug!("{:?} - flushing", token);
                // a failed flush on a live connection is left to the os
                stream.flush().ok();
                return true;
            }
        };
        match stream.write(data) {
            Ok(0) => return true,
            Ok(n) => {
                *bytes_written += n;
                debug!("{:?} - Wrote {} bytes", token, n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("{:?} - Encountered error while writing to socket: {:?}", token, e);
                return true;
            }
        }
    }
}

/// Register a freshly accepted stream for reads. On error the stream is
/// dropped and nothing is added to `sockets`.
fn track_stream(
    registry: &mio::Registry,
    sockets: &mut slab::Slab<Socket>,
    mut sock: TcpStream,
    no_delay: bool,
) -> io::Result<()> {
    if no_delay {
        sock.set_nodelay(true)?;
    }
    let entry = sockets.vacant_entry();
    registry.register(&mut sock, Token(entry.key()), Interest::READABLE)?;
    entry.insert(Socket::new_stream(sock));
    Ok(())
}

pub struct Server {
    addr: String,
    no_delay: bool,
    stop: Option<&'static AtomicBool>,
}
impl Server {
    /// Initialize a new default `Server` to run on `addr`
    pub fn new(addr: &str) -> Result<Self> {
        Ok(Self {
            addr: addr.to_string(),
            no_delay: false,
            stop: None,
        })
    }

    /// Configure `tcp_nodelay` setting for each accepted socket.
    /// Default: `false`
    pub fn tcp_nodelay(&mut self, no_delay: bool) -> &mut Self {
        self.no_delay = no_delay;
        self
    }

    /// Stop serving once `flag` becomes `true`. Without a flag the server
    /// runs until the process exits.
    pub fn stop_on(&mut self, flag: &'static AtomicBool) -> &mut Self {
        self.stop = Some(flag);
        self
    }

    /// Bind the listening socket without serving yet
    pub fn bind(&self) -> Result<Listening> {
        let addr: SocketAddr = self.addr.parse()?;
        let listener = match TcpListener::bind(addr) {
            Ok(l) => l,
            Err(ref e) if e.kind() == io::ErrorKind::AddrInUse => {
                bail!(ErrorKind::AddressInUse(self.addr.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let local_addr = listener.local_addr()?;
        Ok(Listening {
            listener,
            local_addr,
            no_delay: self.no_delay,
            stop: self.stop,
        })
    }

    /// Start the server using the given handler function
    pub fn start<F>(&self, func: F) -> Result<()>
    where
        F: Fn(Request) -> Response<Vec<u8>>,
    {
        self.bind()?.serve(func)
    }
}

/// A bound listener, ready to serve
pub struct Listening {
    listener: TcpListener,
    local_addr: SocketAddr,
    no_delay: bool,
    stop: Option<&'static AtomicBool>,
}
impl Listening {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the event loop, calling `func` for every complete request.
    /// Returns once the stop flag is raised; the listener closes on return.
    pub fn serve<F>(self, func: F) -> Result<()>
    where
        F: Fn(Request) -> Response<Vec<u8>>,
    {
        let mut sockets = slab::Slab::with_capacity(1024);
        let mut poll = mio::Poll::new()?;
        let Listening {
            listener: mut server,
            local_addr,
            no_delay,
            stop,
        } = self;
        {
            // register our tcp listener
            let entry = sockets.vacant_entry();
            let server_token = Token(entry.key());
            poll.registry()
                .register(&mut server, server_token, Interest::READABLE)?;
            entry.insert(Socket::new_listener(server));
        }

        info!("** Listening on {} **", local_addr);

        let mut events = mio::Events::with_capacity(1024);
        loop {
            if stop.map_or(false, |f| f.load(Ordering::Relaxed)) {
                debug!("Stop flag raised, leaving event loop");
                return Ok(());
            }
            match poll.poll(&mut events, Some(POLL_INTERVAL)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            for e in &events {
                let token = e.token();
                if !sockets.contains(token.0) {
                    continue;
                }
                match sockets.remove(token.0) {
                    Socket::Listener { mut listener } => {
                        loop {
                            match listener.accept() {
                                Ok((sock, addr)) => {
                                    debug!("opened socket to: {:?}", addr);
                                    if let Err(e) =
                                        track_stream(poll.registry(), &mut sockets, sock, no_delay)
                                    {
                                        error!("Dropping connection from {:?}: {:?}", addr, e);
                                    }
                                }
                                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                Err(e) => {
                                    error!("{:?} - Encountered error while accepting the connection: {:?}", token, e);
                                    break;
                                }
                            }
                        }
                        // reregister listener
                        let entry = sockets.vacant_entry();
                        let token = Token(entry.key());
                        poll.registry()
                            .reregister(&mut listener, token, Interest::READABLE)?;
                        entry.insert(Socket::new_listener(listener));
                    }
                    Socket::Stream {
                        mut stream,
                        mut reader,
                        mut response,
                        mut bytes_written,
                    } => {
                        if e.is_write_closed() {
                            debug!("{:?} - Peer gone. Killing socket.", token);
                            poll.registry().deregister(&mut stream)?;
                            continue;
                        }

                        // Keep reading until the request head and body are complete.
                        // Once the response exists, this socket is only polled for writes.
                        if response.is_none() {
                            let outcome = if e.is_readable() {
                                read_available(token, &mut stream, &mut reader)
                            } else {
                                ReadOutcome::Open
                            };
                            match reader.try_build_request() {
                                Ok(Some(head)) => {
                                    debug!("Begin processing the response for token {:?}", token);
                                    let (parts, _) = head.into_parts();
                                    let body = std::mem::take(&mut reader.read_buf);
                                    let request = Request {
                                        inner: http::Request::from_parts(parts, body),
                                        body_start: reader.headers_length,
                                    };
                                    response = Some(ResponseWrapper::new(func(request)));
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    error!("{:?} - Encountered error while parsing: {}", token, e);
                                    response = Some(ResponseWrapper::bad_request());
                                }
                            }
                            if response.is_none() {
                                if let ReadOutcome::Closed = outcome {
                                    debug!("{:?} - Stream closed mid-request. Killing socket.", token);
                                    poll.registry().deregister(&mut stream)?;
                                    continue;
                                }
                            }
                        }

                        let done_write = match response {
                            Some(ref resp) => {
                                write_available(token, &mut stream, resp, &mut bytes_written)
                            }
                            None => false,
                        };

                        if done_write {
                            debug!("{:?} - Done writing, killing socket", token);
                            poll.registry().deregister(&mut stream)?;
                        } else {
                            let interest = if response.is_some() {
                                Interest::WRITABLE
                            } else {
                                Interest::READABLE
                            };
                            let entry = sockets.vacant_entry();
                            let token = Token(entry.key());
                            poll.registry().reregister(&mut stream, token, interest)?;
                            entry.insert(Socket::Stream {
                                stream,
                                reader,
                                response,
                                bytes_written,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Bind the log receiver on `config.addr()`, announce its endpoints and
/// serve until `signal::SHUTDOWN` is raised.
pub fn start_server(config: &ReceiverConfig) -> Result<()> {
    let mut server = Server::new(&config.addr())?;
    server
        .tcp_nodelay(config.tcp_nodelay)
        .stop_on(&signal::SHUTDOWN);
    let listening = server.bind()?;

    info!("HTTP log server started");
    info!("port: {}", config.port);
    info!("url: http://localhost:{}", config.port);
    info!("receive endpoint: http://localhost:{}{}", config.port, receiver::RECEIVE_PATH);
    info!("health check: http://localhost:{}{}", config.port, receiver::HEALTH_PATH);
    info!("press Ctrl+C to stop");
    info!("{}", receiver::RULE);

    listening.serve(receiver::handle)
}
