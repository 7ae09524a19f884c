//! Per-connection state: the socket, its buffers, and the request/response
//! pair driven through read -> process -> write.

use std::io::{self, ErrorKind, IoSlice, Write as _};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::buffer::Buffer;
use crate::pool::UserPool;

use super::request::{HttpRequest, ParseOutcome};
use super::response::HttpResponse;

/// Keep draining the socket while more than this many bytes are still
/// queued, even in level-triggered mode.
const WRITE_DRAIN_THRESHOLD: usize = 10240;

/// One accepted client connection.
#[derive(Debug)]
pub struct HttpConn {
    stream: Option<TcpStream>,
    fd: RawFd,
    peer: SocketAddr,
    edge_triggered: bool,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    /// Bytes of the mapped body already written; the write-buffer cursor
    /// tracks the header slot.
    body_written: usize,
    closed: bool,
    src_dir: Arc<PathBuf>,
    users: Arc<UserPool>,
    user_count: Arc<AtomicUsize>,
}

impl HttpConn {
    /// Adopts an accepted socket, counting it against the shared user
    /// total.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        edge_triggered: bool,
        src_dir: Arc<PathBuf>,
        users: Arc<UserPool>,
        user_count: Arc<AtomicUsize>,
    ) -> HttpConn {
        let fd = stream.as_raw_fd();
        let active = user_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!("client[{fd}]({peer}) in, users: {active}");
        HttpConn {
            stream: Some(stream),
            fd,
            peer,
            edge_triggered,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            body_written: 0,
            closed: false,
            src_dir,
            users,
            user_count,
        }
    }

    /// The socket fd this connection is registered under.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The client's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection survives the response currently queued.
    /// This is the response's decision, so a parse error (400) closes
    /// even when the half-parsed request asked for keep-alive.
    pub fn is_keep_alive(&self) -> bool {
        self.response.is_keep_alive()
    }

    /// Bytes still queued for the peer: unsent headers plus the unsent
    /// part of the mapped body.
    pub fn to_write(&self) -> usize {
        self.write_buf.remaining() + self.response.file_len().saturating_sub(self.body_written)
    }

    /// True once [`close`](Self::close) ran.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Scatter-reads from the socket into the read buffer, draining until
    /// `WouldBlock` under edge-triggering. `Ok(0)` means the peer closed.
    pub fn read(&mut self) -> io::Result<usize> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(0),
        };
        let mut total = 0;
        loop {
            match self.read_buf.read_from(stream) {
                Ok(0) => {
                    if total == 0 {
                        return Ok(0);
                    }
                    break;
                }
                Ok(n) => {
                    total += n;
                    if !self.edge_triggered {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Parses buffered bytes and, when a request is ready (or broken),
    /// assembles the response. Returns whether there is a response to
    /// write.
    pub fn process(&mut self) -> bool {
        if self.request.is_finished() {
            // keep-alive reuse: previous request fully answered
            self.request.reset();
        }
        if self.read_buf.remaining() == 0 {
            return false;
        }
        match self.request.parse(&mut self.read_buf, &self.users) {
            ParseOutcome::Complete => {
                debug!("client[{}] requests {}", self.fd, self.request.path());
                self.response.init(
                    &self.src_dir,
                    self.request.path(),
                    self.request.is_keep_alive(),
                    Some(200),
                );
            }
            ParseOutcome::Incomplete => return false,
            ParseOutcome::Error => {
                self.response
                    .init(&self.src_dir, self.request.path(), false, Some(400));
            }
        }
        self.write_buf.clear();
        self.body_written = 0;
        self.response.build(&mut self.write_buf);
        debug!(
            "client[{}] response ready, {} bytes to send",
            self.fd,
            self.to_write()
        );
        true
    }

    /// Vectored write of the header slot and the mapped body slot,
    /// advancing past short writes. Drains until `WouldBlock` when
    /// edge-triggered or while more than 10 KiB remain queued.
    pub fn write(&mut self) -> io::Result<usize> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(0),
        };
        let mut total = 0;
        loop {
            let header_len = self.write_buf.remaining();
            if header_len + self.response.file_len().saturating_sub(self.body_written) == 0 {
                break;
            }
            let written = {
                let header = self.write_buf.peek();
                let body = match self.response.file() {
                    Some(file) if self.body_written < file.len() => &file[self.body_written..],
                    _ => &[],
                };
                if body.is_empty() {
                    stream.write(header)
                } else if header.is_empty() {
                    stream.write(body)
                } else {
                    stream.write_vectored(&[IoSlice::new(header), IoSlice::new(body)])
                }
            };
            match written {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "peer stopped reading")),
                Ok(n) => {
                    total += n;
                    if n > header_len {
                        self.body_written += n - header_len;
                        self.write_buf.clear();
                    } else {
                        self.write_buf.mark_read(n);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            let left =
                self.write_buf.remaining() + self.response.file_len().saturating_sub(self.body_written);
            if left == 0 {
                break;
            }
            if !self.edge_triggered && left <= WRITE_DRAIN_THRESHOLD {
                break;
            }
        }
        Ok(total)
    }

    /// Releases the response mapping, closes the socket, and gives the
    /// user-count slot back. Idempotent.
    pub fn close(&mut self) {
        self.response.unmap();
        if self.closed {
            return;
        }
        self.closed = true;
        self.stream = None;
        let active = self.user_count.fetch_sub(1, Ordering::Relaxed) - 1;
        info!("client[{}]({}) quit, users: {active}", self.fd, self.peer);
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}
