//! Per-connection state shared between the reactor and worker tasks.
//!
//! A [`Connection`] lives in the reactor's connection table behind an `Arc`.
//! Worker tasks look it up by id, so a task may hold a reference after the
//! connection has been torn down; every socket operation therefore checks
//! the liveness flag and the socket slot first.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use bytes::Bytes;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::http::parser::Parser;

/// Queued response bytes above which a connection stops taking requests.
pub const MAX_QUEUED_BYTES: usize = 1024 * 1024;

/// Identifies a connection for its whole life. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl ConnectionId {
    pub fn token(self) -> Token {
        Token(self.0)
    }
}

impl From<Token> for ConnectionId {
    fn from(token: Token) -> Self {
        ConnectionId(token.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const RESCHEDULED: u8 = 2;

/// Admits at most one in-flight task of a kind per connection.
///
/// A readiness edge that arrives while the task is running is remembered
/// and handed to that same task through [`TaskGate::finish`], so the edge is
/// neither lost nor turned into a second concurrent task.
#[derive(Debug, Default)]
pub struct TaskGate {
    state: AtomicU8,
}

impl TaskGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a readiness edge. Returns `true` when the caller must submit
    /// a new task.
    pub fn schedule(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => RUNNING,
                RUNNING => RESCHEDULED,
                _ => return false,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current == IDLE,
                Err(actual) => current = actual,
            }
        }
    }

    /// Called by the running task when its pass is over. Returns `true` when
    /// another edge arrived meanwhile and the task must run one more pass.
    pub fn finish(&self) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(_) => {
                // Only the running task moves the gate out of RESCHEDULED.
                self.state.store(RUNNING, Ordering::Release);
                true
            }
        }
    }

    /// Releases a gate whose task could not be submitted.
    pub fn abandon(&self) {
        self.state.store(IDLE, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) != IDLE
    }
}

struct Outbound {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    /// Set while request intake waits for the queue to drain.
    read_paused: bool,
    write_ready: bool,
    closing: bool,
    interest: Interest,
}

pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    fd: RawFd,
    /// `None` once the socket has been closed.
    stream: RwLock<Option<TcpStream>>,
    outbound: Mutex<Outbound>,
    parser: Mutex<Parser>,
    active: AtomicBool,
    read_closed: AtomicBool,
    read_gate: TaskGate,
    write_gate: TaskGate,
}

impl Connection {
    pub fn new(id: ConnectionId, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            fd: stream.as_raw_fd(),
            stream: RwLock::new(Some(stream)),
            outbound: Mutex::new(Outbound {
                queue: VecDeque::new(),
                queued_bytes: 0,
                read_paused: false,
                write_ready: false,
                closing: false,
                interest: Interest::READABLE,
            }),
            parser: Mutex::new(Parser::new()),
            active: AtomicBool::new(true),
            read_closed: AtomicBool::new(false),
            read_gate: TaskGate::new(),
            write_gate: TaskGate::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn read_gate(&self) -> &TaskGate {
        &self.read_gate
    }

    pub fn write_gate(&self) -> &TaskGate {
        &self.write_gate
    }

    fn outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn socket(&self) -> RwLockReadGuard<'_, Option<TcpStream>> {
        self.stream.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The connection's request decoder.
    pub fn parser(&self) -> MutexGuard<'_, Parser> {
        self.parser.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Outbound queue

    pub fn push_message(&self, message: Bytes) {
        let mut outbound = self.outbound();
        outbound.queued_bytes += message.len();
        outbound.queue.push_back(message);
    }

    /// Puts the unsent remainder of a message back at the head of the queue.
    pub fn requeue_front(&self, remainder: Bytes) {
        let mut outbound = self.outbound();
        outbound.queued_bytes += remainder.len();
        outbound.queue.push_front(remainder);
    }

    pub fn has_messages(&self) -> bool {
        !self.outbound().queue.is_empty()
    }

    /// Pops the oldest pending message; `None` when the queue is empty.
    pub fn pop_message(&self) -> Option<Bytes> {
        let mut outbound = self.outbound();
        let message = outbound.queue.pop_front()?;
        outbound.queued_bytes -= message.len();
        Some(message)
    }

    /// Total bytes waiting in the outbound queue.
    pub fn queued_bytes(&self) -> usize {
        self.outbound().queued_bytes
    }

    /// Pauses request intake when the queue holds [`MAX_QUEUED_BYTES`] or
    /// more. Returns whether intake is paused.
    pub fn pause_reads_if_full(&self) -> bool {
        let mut outbound = self.outbound();
        if outbound.queued_bytes < MAX_QUEUED_BYTES {
            return false;
        }
        outbound.read_paused = true;
        true
    }

    /// Lifts a pause once the queue is back under the limit. Returns `true`
    /// only for the call that lifted it; that caller has to restart intake.
    pub fn resume_reads_if_drained(&self) -> bool {
        let mut outbound = self.outbound();
        if outbound.read_paused && outbound.queued_bytes < MAX_QUEUED_BYTES {
            outbound.read_paused = false;
            return true;
        }
        false
    }

    pub fn is_read_paused(&self) -> bool {
        self.outbound().read_paused
    }

    pub fn set_write_ready(&self, ready: bool) {
        self.outbound().write_ready = ready;
    }

    pub fn is_write_ready(&self) -> bool {
        self.outbound().write_ready
    }

    /// Stops request processing; the connection closes once the queue drains.
    pub fn set_closing(&self) {
        self.outbound().closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.outbound().closing
    }

    // Liveness

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Records that the peer shut down its sending side. Returns `true` only
    /// for the first call.
    pub fn mark_read_closed(&self) -> bool {
        !self.read_closed.swap(true, Ordering::AcqRel)
    }

    // Socket

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.is_active() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match self.socket().as_ref() {
            Some(mut stream) => stream.read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if !self.is_active() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match self.socket().as_ref() {
            Some(mut stream) => stream.write(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Adds the connection to the readiness set, read interest only.
    pub fn register(&self, registry: &Registry) -> io::Result<()> {
        let socket = self.socket();
        if socket.is_none() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        registry.register(&mut SourceFd(&self.fd), self.id.token(), Interest::READABLE)
    }

    /// Re-registers the interest set.
    ///
    /// The registration is always re-issued, even for an unchanged set, so an
    /// edge-triggered source that is already ready reports again.
    pub fn set_interest(&self, registry: &Registry, interest: Interest) -> io::Result<()> {
        let mut outbound = self.outbound();
        self.reregister(registry, &mut outbound, interest)
    }

    /// Drops write interest if, and only if, nothing is queued.
    ///
    /// Returns `false` when messages arrived in the meantime and the caller
    /// has to keep writing.
    pub fn disarm_write_if_drained(&self, registry: &Registry) -> io::Result<bool> {
        let mut outbound = self.outbound();
        if !outbound.queue.is_empty() {
            return Ok(false);
        }
        if outbound.interest.is_writable() {
            self.reregister(registry, &mut outbound, Interest::READABLE)?;
        }
        Ok(true)
    }

    pub fn interest(&self) -> Interest {
        self.outbound().interest
    }

    fn reregister(
        &self,
        registry: &Registry,
        outbound: &mut Outbound,
        interest: Interest,
    ) -> io::Result<()> {
        // Holding the socket guard keeps the descriptor from being closed
        // (and its number reused) under us.
        let socket = self.socket();
        if socket.is_none() || !self.is_active() {
            return Ok(());
        }
        registry.reregister(&mut SourceFd(&self.fd), self.id.token(), interest)?;
        outbound.interest = interest;
        Ok(())
    }

    /// Deactivates the connection, removes it from the readiness set and
    /// closes the socket. Returns `false` when it was already closed.
    pub fn close(&self, registry: &Registry) -> bool {
        self.deactivate();
        let mut slot = self.stream.write().unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            Some(stream) => {
                if let Err(e) = registry.deregister(&mut SourceFd(&self.fd)) {
                    tracing::debug!(conn = %self.id, error = %e, "Deregister failed");
                }
                drop(stream);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("active", &self.is_active())
            .finish()
    }
}
