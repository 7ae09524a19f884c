//! Incremental HTTP/1.1 request parser.
//!
//! A line-based state machine over the connection's read buffer:
//! RequestLine -> Headers -> Body -> Finish. Lines end at CRLF; when no
//! CRLF has arrived yet the parser reports [`ParseOutcome::Incomplete`]
//! and consumes nothing, so the caller can retry once more bytes are in.
//! The parser lives for the whole connection and is reset to RequestLine
//! when a keep-alive connection starts its next request.

use std::collections::HashMap;

use log::{debug, error};
use memchr::memmem;

use crate::buffer::Buffer;
use crate::pool::{verify_user, UserPool};

/// Paths served as `{name}.html` when requested bare.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Current position in the request state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for `METHOD SP URI SP HTTP/VERSION`.
    RequestLine,
    /// Consuming `Name: value` lines until the blank line.
    Headers,
    /// Capturing the remaining bytes as the body.
    Body,
    /// A full request has been parsed.
    Finish,
}

/// What a `parse` call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A full request is ready.
    Complete,
    /// More bytes are needed; nothing was discarded.
    Incomplete,
    /// The request line is malformed; the caller should answer 400.
    Error,
}

/// One parsed (or in-flight) HTTP request.
#[derive(Debug, Default)]
pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    body: String,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl Default for ParseState {
    fn default() -> Self {
        ParseState::RequestLine
    }
}

impl HttpRequest {
    /// A fresh parser at the RequestLine state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears everything for the next request on a reused connection.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Request method as sent (`GET`, `POST`, ...).
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request path after rewriting (`/` becomes `/index.html`, known
    /// pages gain `.html`, auth POSTs land on `/welcome.html` or
    /// `/error.html`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP version, the part after `HTTP/`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Header lookup; the first occurrence of a duplicate name wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Decoded form field from an urlencoded POST body.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// True once a full request has been parsed.
    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    /// Connection reuse rule: `Connection: keep-alive` and version 1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.headers.get("Connection").map(String::as_str) == Some("keep-alive")
            && self.version == "1.1"
    }

    /// Advances the state machine over the readable bytes of `buf`.
    /// Consumed lines are retrieved from the buffer; on `Complete` the
    /// buffer is drained.
    pub fn parse(&mut self, buf: &mut Buffer, users: &UserPool) -> ParseOutcome {
        while buf.remaining() > 0 && self.state != ParseState::Finish {
            match self.state {
                ParseState::RequestLine => {
                    let Some(end) = memmem::find(buf.peek(), b"\r\n") else {
                        return ParseOutcome::Incomplete;
                    };
                    let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                    if !self.parse_request_line(&line) {
                        error!("malformed request line: {line:?}");
                        return ParseOutcome::Error;
                    }
                    self.rewrite_path();
                    buf.mark_read(end + 2);
                }
                ParseState::Headers => {
                    let Some(end) = memmem::find(buf.peek(), b"\r\n") else {
                        return ParseOutcome::Incomplete;
                    };
                    let line = String::from_utf8_lossy(&buf.peek()[..end]).into_owned();
                    self.parse_header(&line);
                    // a lone CRLF left over means there is no body to wait for
                    if buf.remaining() <= 2 {
                        self.state = ParseState::Finish;
                        break;
                    }
                    buf.mark_read(end + 2);
                }
                ParseState::Body => {
                    self.body = String::from_utf8_lossy(buf.peek()).into_owned();
                    let len = buf.remaining();
                    buf.mark_read(len);
                    self.parse_post(users);
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => unreachable!("loop exits at Finish"),
            }
        }
        if self.state == ParseState::Finish {
            buf.clear();
            debug!("[{}] [{}] [{}]", self.method, self.path, self.version);
            ParseOutcome::Complete
        } else {
            ParseOutcome::Incomplete
        }
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split(' ');
        let (Some(method), Some(path), Some(proto), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let Some(version) = proto.strip_prefix("HTTP/") else {
            return false;
        };
        if method.is_empty() || path.is_empty() {
            return false;
        }
        self.method = method.to_owned();
        self.path = path.to_owned();
        self.version = version.to_owned();
        self.state = ParseState::Headers;
        true
    }

    fn rewrite_path(&mut self) {
        if self.path == "/" {
            self.path = String::from("/index.html");
        } else if DEFAULT_PAGES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// A `Name: value` line goes into the header map (first value wins);
    /// anything without a colon, notably the blank line, ends the
    /// header section.
    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.headers
                    .entry(name.to_owned())
                    .or_insert_with(|| value.to_owned());
            }
            None => self.state = ParseState::Body,
        }
    }

    fn parse_post(&mut self, users: &UserPool) {
        if self.method != "POST"
            || self.headers.get("Content-Type").map(String::as_str) != Some(FORM_CONTENT_TYPE)
        {
            return;
        }
        self.parse_urlencoded();
        let is_login = match self.path.as_str() {
            "/register.html" => false,
            "/login.html" => true,
            _ => return,
        };
        let name = self.form.get("username").cloned().unwrap_or_default();
        let password = self.form.get("password").cloned().unwrap_or_default();
        self.path = if verify_user(users, &name, &password, is_login) {
            String::from("/welcome.html")
        } else {
            String::from("/error.html")
        };
    }

    /// Decodes the whole body first, then splits key/value pairs on `&`
    /// and `=`.
    fn parse_urlencoded(&mut self) {
        if self.body.is_empty() {
            return;
        }
        let decoded = url_decode(self.body.as_bytes());
        for pair in decoded.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                debug!("form field {key}");
                self.form.insert(key.to_owned(), value.to_owned());
            }
        }
    }
}

/// Urlencoded decoding: `+` becomes space, `%HH` becomes the byte, and
/// everything else passes through verbatim. A truncated escape at the end
/// of input is kept as-is.
pub fn url_decode(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < raw.len() => {
                out.push((from_hex(raw[i + 1]) << 4) | from_hex(raw[i + 2]));
                i += 2;
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn from_hex(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'A'..=b'F' => b - b'A' + 10,
        b'a'..=b'f' => b - b'a' + 10,
        _ => 0,
    }
}
