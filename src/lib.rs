#![recursion_limit="1024"]
#[macro_use] extern crate error_chain;
#[macro_use] extern crate log;
extern crate http;
extern crate httparse;
extern crate mio;
extern crate num_cpus;
extern crate slab;
extern crate threadpool;

pub mod errors;
mod http_stream;

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;

use errors::*;
use http_stream::RequestReader;


/// A fully received request, body collected into memory
pub type Request = http::Request<Vec<u8>>;

/// A response whose body is written back as-is
pub type Response = http::Response<Vec<u8>>;

pub(crate) type RequestHead = http::Request<()>;

const SERVER_NAME: &'static str = concat!("greeter_http/", env!("CARGO_PKG_VERSION"));


enum Socket {
    Listener {
        listener: mio::net::TcpListener,
    },
    Stream {
        stream: mio::net::TcpStream,
        reader: RequestReader,
        write_buf: Vec<u8>,
        bytes_written: usize,
        keep_alive: bool,
    },
    /// Connection parked while its request runs on the pool. The
    /// registration must stay alive until the response wakeup fires.
    Dispatched {
        stream: mio::net::TcpStream,
        _registration: mio::Registration,
        response: mpsc::Receiver<(Vec<u8>, bool)>,
    },
}
impl Socket {
    fn new_stream(stream: mio::net::TcpStream) -> Self {
        Socket::Stream {
            stream,
            reader: RequestReader::new(),
            write_buf: Vec::new(),
            bytes_written: 0,
            keep_alive: false,
        }
    }
    fn writing_stream(stream: mio::net::TcpStream, write_buf: Vec<u8>, keep_alive: bool) -> Self {
        Socket::Stream {
            stream,
            reader: RequestReader::new(),
            write_buf,
            bytes_written: 0,
            keep_alive,
        }
    }
}


/// HTTP server bound to a local address
pub struct Server {
    listener: mio::net::TcpListener,
    addr: SocketAddr,
    pool_size: usize,
}

impl Server {
    /// Bind to `addr`, e.g. `"0.0.0.0:3000"`. The listener is live
    /// immediately; connections queue until `start` is called.
    pub fn bind(addr: &str) -> Result<Server> {
        let addr = addr.parse::<SocketAddr>()?;
        let listener = mio::net::TcpListener::bind(&addr)?;
        let addr = listener.local_addr()?;
        Ok(Server { listener, addr, pool_size: num_cpus::get() })
    }

    /// Address the listener is bound to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of threads handlers run on, default `num_cpus::get()`
    pub fn pool_size(mut self, size: usize) -> Server {
        self.pool_size = size;
        self
    }

    /// Run the event loop, invoking `handler` once per received request.
    /// Blocks the calling thread, returning only on listener or poll failure.
    pub fn start<F>(self, handler: F) -> Result<()>
        where F: Fn(Request) -> Response + Send + Sync + 'static
    {
        let Server { listener, addr, pool_size } = self;
        let handler = Arc::new(handler);
        let pool = threadpool::ThreadPool::new(pool_size);
        let poll = mio::Poll::new()?;
        let mut sockets = slab::Slab::with_capacity(1024);
        {
            let entry = sockets.vacant_entry();
            let token = entry.key().into();
            poll.register(&listener, token,
                          mio::Ready::readable(),
                          mio::PollOpt::edge() | mio::PollOpt::oneshot())?;
            entry.insert(Socket::Listener { listener });
        }

        info!("** Listening on {} **", addr);

        let mut events = mio::Events::with_capacity(1024);
        loop {
            poll.poll(&mut events, None)?;
            for event in &events {
                let token = event.token();
                if !sockets.contains(token.into()) {
                    // stale wakeup for a connection already dropped
                    continue;
                }
                match sockets.remove(token.into()) {
                    Socket::Listener { listener } => {
                        loop {
                            match listener.accept() {
                                Ok((stream, peer)) => {
                                    debug!("opened socket to {}", peer);
                                    let entry = sockets.vacant_entry();
                                    let token = entry.key().into();
                                    poll.register(&stream, token,
                                                  mio::Ready::readable(),
                                                  mio::PollOpt::edge() | mio::PollOpt::oneshot())?;
                                    entry.insert(Socket::new_stream(stream));
                                }
                                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                Err(e) => return Err(e.into()),
                            }
                        }
                        let entry = sockets.vacant_entry();
                        let token = entry.key().into();
                        poll.reregister(&listener, token,
                                        mio::Ready::readable(),
                                        mio::PollOpt::edge() | mio::PollOpt::oneshot())?;
                        entry.insert(Socket::Listener { listener });
                    }
                    Socket::Stream { mut stream, mut reader, write_buf, mut bytes_written, keep_alive } => {
                        if write_buf.is_empty() {
                            // reading phase
                            if !event.readiness().is_readable() {
                                debug!("connection gone {:?}", token);
                                continue;
                            }
                            let mut chunk = [0; 1024];
                            let mut closed = false;
                            loop {
                                match stream.read(&mut chunk) {
                                    Ok(0) => {
                                        closed = true;
                                        break;
                                    }
                                    Ok(n) => {
                                        reader.push(&chunk[..n]);
                                    }
                                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                    Err(e) => {
                                        debug!("read failed on {:?}: {}", token, e);
                                        closed = true;
                                        break;
                                    }
                                }
                            }
                            if closed {
                                debug!("peer closed {:?}", token);
                                continue;
                            }
                            match reader.try_request() {
                                Ok(Some(request)) => {
                                    let keep_alive = !wants_close(&request);
                                    let (registration, set_readiness) = mio::Registration::new2();
                                    let (tx, rx) = mpsc::channel();
                                    let entry = sockets.vacant_entry();
                                    let token = entry.key().into();
                                    poll.register(&registration, token,
                                                  mio::Ready::readable(),
                                                  mio::PollOpt::edge() | mio::PollOpt::oneshot())?;
                                    entry.insert(Socket::Dispatched {
                                        stream,
                                        _registration: registration,
                                        response: rx,
                                    });
                                    let handler = handler.clone();
                                    pool.execute(move || {
                                        let response = handler(request);
                                        let bytes = serialize_response(&response);
                                        if tx.send((bytes, keep_alive)).is_err() {
                                            // connection went away while the handler ran
                                            return;
                                        }
                                        if let Err(e) = set_readiness.set_readiness(mio::Ready::readable()) {
                                            error!("response wakeup failed: {}", e);
                                        }
                                    });
                                }
                                Ok(None) => {
                                    // wait for the rest of the request
                                    let entry = sockets.vacant_entry();
                                    let token = entry.key().into();
                                    poll.reregister(&stream, token,
                                                    mio::Ready::readable(),
                                                    mio::PollOpt::edge() | mio::PollOpt::oneshot())?;
                                    entry.insert(Socket::Stream {
                                        stream, reader, write_buf, bytes_written, keep_alive,
                                    });
                                }
                                Err(e) => {
                                    info!("dropping connection, bad request: {}", e);
                                }
                            }
                        } else {
                            // writing phase
                            if !event.readiness().is_writable() {
                                debug!("connection gone {:?}", token);
                                continue;
                            }
                            let mut closed = false;
                            loop {
                                match stream.write(&write_buf[bytes_written..]) {
                                    Ok(0) => break,
                                    Ok(n) => {
                                        bytes_written += n;
                                        if bytes_written == write_buf.len() {
                                            break;
                                        }
                                    }
                                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                                    Err(e) => {
                                        debug!("write failed on {:?}: {}", token, e);
                                        closed = true;
                                        break;
                                    }
                                }
                            }
                            if closed {
                                continue;
                            }
                            if bytes_written == write_buf.len() {
                                if keep_alive {
                                    // reset for the next request on this connection
                                    let entry = sockets.vacant_entry();
                                    let token = entry.key().into();
                                    poll.reregister(&stream, token,
                                                    mio::Ready::readable(),
                                                    mio::PollOpt::edge() | mio::PollOpt::oneshot())?;
                                    entry.insert(Socket::new_stream(stream));
                                }
                                // otherwise drop the stream, closing the connection
                            } else {
                                let entry = sockets.vacant_entry();
                                let token = entry.key().into();
                                poll.reregister(&stream, token,
                                                mio::Ready::writable(),
                                                mio::PollOpt::edge() | mio::PollOpt::oneshot())?;
                                entry.insert(Socket::Stream {
                                    stream, reader, write_buf, bytes_written, keep_alive,
                                });
                            }
                        }
                    }
                    Socket::Dispatched { stream, response, .. } => {
                        let (write_buf, keep_alive) = match response.try_recv() {
                            Ok(r) => r,
                            Err(e) => {
                                error!("woke up without a response: {}", e);
                                continue;
                            }
                        };
                        let entry = sockets.vacant_entry();
                        let token = entry.key().into();
                        poll.reregister(&stream, token,
                                        mio::Ready::writable(),
                                        mio::PollOpt::edge() | mio::PollOpt::oneshot())?;
                        entry.insert(Socket::writing_stream(stream, write_buf, keep_alive));
                    }
                }
            }
        }
    }
}


fn wants_close(request: &Request) -> bool {
    match request.headers().get(http::header::CONNECTION) {
        Some(value) => value.as_bytes().eq_ignore_ascii_case(b"close"),
        None => false,
    }
}

/// Render a response to wire bytes, filling in `server` and
/// `content-length` when the handler didn't set them
fn serialize_response(response: &Response) -> Vec<u8> {
    let status = response.status();
    let mut buf = Vec::with_capacity(256 + response.body().len());
    buf.extend_from_slice(format!("HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")).as_bytes());
    for (name, value) in response.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !response.headers().contains_key(http::header::SERVER) {
        buf.extend_from_slice(format!("server: {}\r\n", SERVER_NAME).as_bytes());
    }
    if !response.headers().contains_key(http::header::CONTENT_LENGTH) {
        buf.extend_from_slice(format!("content-length: {}\r\n", response.body().len()).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(response.body());
    buf
}


#[cfg(test)]
mod tests {
    use http;
    use super::*;

    fn greeting_response() -> Response {
        http::Response::builder()
            .status(200)
            .header("Content-Type", "text/plain")
            .body(b"hi".to_vec())
            .unwrap()
    }

    #[test]
    fn serializes_status_line_and_headers() {
        let text = String::from_utf8(serialize_response(&greeting_response())).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.contains("server: greeter_http/"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn respects_explicit_content_length() {
        let response = http::Response::builder()
            .status(200)
            .header("Content-Length", "2")
            .body(b"hi".to_vec())
            .unwrap();
        let text = String::from_utf8(serialize_response(&response)).unwrap();
        assert_eq!(text.matches("content-length").count(), 1);
    }

    #[test]
    fn connection_close_is_case_insensitive() {
        let request = http::Request::builder()
            .header("Connection", "Close")
            .body(Vec::new())
            .unwrap();
        assert!(wants_close(&request));

        let request = http::Request::builder()
            .header("Connection", "keep-alive")
            .body(Vec::new())
            .unwrap();
        assert!(!wants_close(&request));

        let request = http::Request::builder().body(Vec::new()).unwrap();
        assert!(!wants_close(&request));
    }
}
