//! Incremental HTTP/1.x request decoder.
//!
//! [`Parser`] is a byte-oriented state machine that can be fed arbitrary
//! slices of a connection's inbound stream. It never blocks and never needs
//! the whole request at once: feeding a request in one piece or split at any
//! byte boundary yields the same [`Request`].
//!
//! ```text
//! Method ─' '─▶ Url ─' '─▶ Version ─LF─▶ HeaderName ─':'─▶ HeaderValue
//!                                          │   ▲                 │
//!                                          │   └──────LF─────────┘
//!                                          │ empty line
//!                                          ▼
//!                           Body (Content-Length bytes) ──▶ Complete
//! ```
//!
//! Any violation moves the machine into a sticky `Error` state.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::http::request::{Method, Request, Version};
use crate::http::response::StatusCode;

/// Longest accepted method token.
pub const MAX_METHOD_LEN: usize = 16;
/// Upper bound for the request line plus all header lines.
pub const MAX_HEAD_LEN: usize = 64 * 1024;
/// Upper bound for the number of header lines.
pub const MAX_HEADERS: usize = 100;
/// Upper bound for a Content-Length framed body.
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;
/// Most body capacity set aside before the body bytes arrive.
const BODY_RESERVE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    UnsupportedVersion,
    InvalidHeader,
    InvalidContentLength,
    UnsupportedTransferEncoding,
    HeadTooLarge,
    BodyTooLarge,
    Incomplete,
}

impl ParseError {
    /// The status a server should answer this fault with.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::UnsupportedVersion => StatusCode::HttpVersionNotSupported,
            ParseError::UnsupportedTransferEncoding => StatusCode::NotImplemented,
            ParseError::HeadTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            ParseError::BodyTooLarge => StatusCode::PayloadTooLarge,
            ParseError::InvalidRequest
            | ParseError::InvalidMethod
            | ParseError::InvalidHeader
            | ParseError::InvalidContentLength
            | ParseError::Incomplete => StatusCode::BadRequest,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ParseError::InvalidRequest => "malformed request line",
            ParseError::InvalidMethod => "unknown or malformed method",
            ParseError::UnsupportedVersion => "unsupported protocol version",
            ParseError::InvalidHeader => "malformed header line",
            ParseError::InvalidContentLength => "invalid Content-Length",
            ParseError::UnsupportedTransferEncoding => "Transfer-Encoding is not supported",
            ParseError::HeadTooLarge => "request head too large",
            ParseError::BodyTooLarge => "request body too large",
            ParseError::Incomplete => "incomplete request",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ParseError {}

/// Observable position of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Method,
    Url,
    Version,
    HeaderName,
    HeaderValue,
    Body,
    Complete,
    Error,
}

#[derive(Debug)]
enum State {
    Method,
    Url,
    Version,
    HeaderName,
    HeaderValue,
    Body,
    Complete,
    Error(ParseError),
}

/// Per-connection incremental request decoder.
#[derive(Debug)]
pub struct Parser {
    state: State,
    token: Vec<u8>,
    head_len: usize,
    method: Option<Method>,
    path: String,
    query: Option<String>,
    version: Option<Version>,
    header_name: String,
    headers: HashMap<String, String>,
    content_length: usize,
    body: Vec<u8>,
    completed: VecDeque<Request>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Method,
            token: Vec::with_capacity(64),
            head_len: 0,
            method: None,
            path: String::new(),
            query: None,
            version: None,
            header_name: String::new(),
            headers: HashMap::new(),
            content_length: 0,
            body: Vec::new(),
            completed: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ParseState {
        match self.state {
            State::Method => ParseState::Method,
            State::Url => ParseState::Url,
            State::Version => ParseState::Version,
            State::HeaderName => ParseState::HeaderName,
            State::HeaderValue => ParseState::HeaderValue,
            State::Body => ParseState::Body,
            State::Complete => ParseState::Complete,
            State::Error(_) => ParseState::Error,
        }
    }

    /// Feeds inbound bytes, queueing every request they complete.
    ///
    /// Returns the number of requests completed by this call. Requests that
    /// completed before a fault stay queued and can still be taken with
    /// [`Parser::next_request`].
    pub fn feed(&mut self, mut data: &[u8]) -> Result<usize, ParseError> {
        let mut completed = 0;
        loop {
            let (consumed, request) = self.advance(data)?;
            data = &data[consumed..];
            match request {
                Some(request) => {
                    self.completed.push_back(request);
                    completed += 1;
                }
                None => break,
            }
            if data.is_empty() {
                break;
            }
        }
        Ok(completed)
    }

    /// The fault that stopped the parser, if any.
    pub fn error(&self) -> Option<&ParseError> {
        match &self.state {
            State::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn has_request(&self) -> bool {
        !self.completed.is_empty()
    }

    /// Pops the oldest completed request.
    pub fn next_request(&mut self) -> Option<Request> {
        self.completed.pop_front()
    }

    /// Consumes bytes up to and including the end of at most one request.
    ///
    /// Returns how many bytes were consumed and the request they completed,
    /// if any. A parser left in `Complete` is reset on the next call.
    pub fn advance(&mut self, data: &[u8]) -> Result<(usize, Option<Request>), ParseError> {
        if let State::Error(e) = &self.state {
            return Err(e.clone());
        }
        if let State::Complete = self.state {
            self.reset();
        }

        let mut i = 0;
        while i < data.len() {
            if let State::Body = self.state {
                let wanted = self.content_length - self.body.len();
                let take = wanted.min(data.len() - i);
                self.body.extend_from_slice(&data[i..i + take]);
                i += take;
                if self.body.len() == self.content_length {
                    return Ok((i, Some(self.complete())));
                }
                continue;
            }

            let byte = data[i];
            i += 1;
            if let Err(e) = self.step(byte) {
                self.state = State::Error(e.clone());
                return Err(e);
            }
            if let State::Complete = self.state {
                return Ok((i, Some(self.complete())));
            }
        }

        Ok((i, None))
    }

    fn step(&mut self, byte: u8) -> Result<(), ParseError> {
        // Blank lines ahead of a request line are skipped, not counted.
        if matches!(self.state, State::Method) && self.token.is_empty() && is_newline(byte) {
            return Ok(());
        }

        self.head_len += 1;
        if self.head_len > MAX_HEAD_LEN {
            return Err(ParseError::HeadTooLarge);
        }

        match self.state {
            State::Method => match byte {
                b' ' => {
                    let method = std::str::from_utf8(&self.token)
                        .ok()
                        .and_then(Method::from_str)
                        .ok_or(ParseError::InvalidMethod)?;
                    self.method = Some(method);
                    self.token.clear();
                    self.state = State::Url;
                }
                _ if byte.is_ascii_graphic() && self.token.len() < MAX_METHOD_LEN => {
                    self.token.push(byte)
                }
                _ => return Err(ParseError::InvalidMethod),
            },
            State::Url => match byte {
                b' ' => {
                    if self.token.is_empty() {
                        return Err(ParseError::InvalidRequest);
                    }
                    let target = String::from_utf8(std::mem::take(&mut self.token))
                        .map_err(|_| ParseError::InvalidRequest)?;
                    match target.split_once('?') {
                        Some((path, query)) => {
                            self.path = path.to_string();
                            self.query = Some(query.to_string());
                        }
                        None => self.path = target,
                    }
                    self.state = State::Version;
                }
                _ if byte.is_ascii_control() => return Err(ParseError::InvalidRequest),
                _ => self.token.push(byte),
            },
            State::Version => match byte {
                b'\n' => {
                    let line = take_line(&mut self.token);
                    if !is_version_token(&line) {
                        return Err(ParseError::InvalidRequest);
                    }
                    let version = std::str::from_utf8(&line)
                        .ok()
                        .and_then(Version::from_str)
                        .ok_or(ParseError::UnsupportedVersion)?;
                    self.version = Some(version);
                    self.state = State::HeaderName;
                }
                _ => self.token.push(byte),
            },
            State::HeaderName => match byte {
                b'\n' => {
                    let line = take_line(&mut self.token);
                    if !line.is_empty() {
                        return Err(ParseError::InvalidHeader);
                    }
                    self.end_of_head()?;
                }
                b':' => {
                    let name = String::from_utf8(std::mem::take(&mut self.token))
                        .map_err(|_| ParseError::InvalidHeader)?;
                    if name.is_empty() || name.bytes().any(|b| !b.is_ascii_graphic()) {
                        return Err(ParseError::InvalidHeader);
                    }
                    self.header_name = name;
                    self.state = State::HeaderValue;
                }
                _ => self.token.push(byte),
            },
            State::HeaderValue => match byte {
                b'\n' => {
                    let line = take_line(&mut self.token);
                    let value = String::from_utf8_lossy(&line).trim().to_string();
                    let name = std::mem::take(&mut self.header_name);
                    self.insert_header(name, value)?;
                    self.state = State::HeaderName;
                }
                _ => self.token.push(byte),
            },
            State::Body | State::Complete | State::Error(_) => {
                unreachable!("handled by advance")
            }
        }

        Ok(())
    }

    fn insert_header(&mut self, name: String, value: String) -> Result<(), ParseError> {
        let existing = self
            .headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case(&name))
            .cloned();

        match existing {
            Some(key) if name.eq_ignore_ascii_case("Content-Length") => {
                if self.headers[&key] != value {
                    return Err(ParseError::InvalidContentLength);
                }
            }
            Some(key) => {
                if let Some(current) = self.headers.get_mut(&key) {
                    current.push_str(", ");
                    current.push_str(&value);
                }
            }
            None => {
                if self.headers.len() >= MAX_HEADERS {
                    return Err(ParseError::HeadTooLarge);
                }
                self.headers.insert(name, value);
            }
        }
        Ok(())
    }

    fn end_of_head(&mut self) -> Result<(), ParseError> {
        let header = |name: &str| {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };

        if header("Transfer-Encoding").is_some() {
            return Err(ParseError::UnsupportedTransferEncoding);
        }

        // A missing Content-Length means an empty body.
        let length = match header("Content-Length") {
            Some(value) => {
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseError::InvalidContentLength);
                }
                value
                    .parse::<usize>()
                    .map_err(|_| ParseError::InvalidContentLength)?
            }
            None => 0,
        };

        if length > MAX_BODY_LEN {
            return Err(ParseError::BodyTooLarge);
        }

        self.content_length = length;
        self.state = if length == 0 {
            State::Complete
        } else {
            self.body.reserve(length.min(BODY_RESERVE));
            State::Body
        };
        Ok(())
    }

    fn complete(&mut self) -> Request {
        self.state = State::Complete;
        Request {
            method: self.method.take().unwrap_or(Method::GET),
            path: std::mem::take(&mut self.path),
            query: self.query.take(),
            version: self.version.take().unwrap_or(Version::Http11),
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
        }
    }

    fn reset(&mut self) {
        self.state = State::Method;
        self.token.clear();
        self.head_len = 0;
        self.method = None;
        self.path.clear();
        self.query = None;
        self.version = None;
        self.header_name.clear();
        self.headers.clear();
        self.content_length = 0;
        self.body.clear();
    }
}

fn is_newline(byte: u8) -> bool {
    byte == b'\r' || byte == b'\n'
}

/// `HTTP/<digit>.<digit>` and nothing else.
fn is_version_token(line: &[u8]) -> bool {
    match line {
        [b'H', b'T', b'T', b'P', b'/', major, b'.', minor] => {
            major.is_ascii_digit() && minor.is_ascii_digit()
        }
        _ => false,
    }
}

/// Takes the accumulated line, dropping one trailing CR.
fn take_line(token: &mut Vec<u8>) -> Vec<u8> {
    let mut line = std::mem::take(token);
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

/// Parses exactly one request from the start of `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// `ParseError::Incomplete` when `buf` ends before the request does.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let mut parser = Parser::new();
    match parser.advance(buf)? {
        (consumed, Some(request)) => Ok((request, consumed)),
        (_, None) => Err(ParseError::Incomplete),
    }
}
