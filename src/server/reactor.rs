//! Edge-triggered readiness loop.
//!
//! One thread owns the [`Poll`] and does nothing but accept connections and
//! turn readiness events into tasks on the [`WorkerPool`]. All socket I/O,
//! parsing and handler calls happen in those tasks:
//!
//! ```text
//!   readable ──▶ read task ──▶ parser ──▶ handler ──▶ outbound queue ──┐
//!                                                                      │ arm WRITABLE
//!   writable ──▶ write task ◀──────────────────────────────────────────┘
//! ```
//!
//! Edges are only reported once, so every task drains its socket until the
//! kernel says `WouldBlock`.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, Bytes};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::handler::Handler;
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::http::writer::encode_response;
use crate::server::SERVER_NAME;
use crate::server::connection::{Connection, ConnectionId};
use crate::server::pool::WorkerPool;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(usize::MAX);
const FIRST_CONNECTION_ID: usize = 1;
const READ_BUFFER_SIZE: usize = 8 * 1024;

struct Shared {
    registry: Registry,
    waker: Waker,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    handler: Arc<dyn Handler>,
    next_id: AtomicUsize,
    shutdown: AtomicBool,
    /// Connections whose request intake was paused and may continue.
    resumed: Mutex<Vec<ConnectionId>>,
}

/// Cloneable access to the reactor's connection table, used by worker tasks.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    pool: WorkerPool,
    max_events: usize,
    handle: ReactorHandle,
}

impl Reactor {
    /// Binds the listener, registers it for read readiness and starts
    /// `workers` worker threads.
    pub fn bind(
        addr: SocketAddr,
        handler: Arc<dyn Handler>,
        workers: usize,
        max_events: usize,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let waker = Waker::new(poll.registry(), WAKER)?;
        let registry = poll.registry().try_clone()?;
        let pool = WorkerPool::new(workers)?;

        Ok(Self {
            poll,
            listener,
            local_addr,
            pool,
            max_events: max_events.max(1),
            handle: ReactorHandle {
                shared: Arc::new(Shared {
                    registry,
                    waker,
                    connections: Mutex::new(HashMap::new()),
                    handler,
                    next_id: AtomicUsize::new(FIRST_CONNECTION_ID),
                    shutdown: AtomicBool::new(false),
                    resumed: Mutex::new(Vec::new()),
                }),
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Runs until [`ReactorHandle::shutdown`] is called or waiting for
    /// readiness fails. Every connection is closed and the pool is joined
    /// before this returns.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr,
            workers = self.pool.size(),
            "Server starting"
        );

        let mut events = Events::with_capacity(self.max_events);
        let result = loop {
            if self.handle.is_shutting_down() {
                break Ok(());
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Waiting for readiness failed");
                break Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_loop(),
                    WAKER => self.resume_intake(),
                    _ => self.dispatch(event),
                }
            }
        };

        self.teardown();
        result
    }

    /// Accepts until the listener reports `WouldBlock`.
    fn accept_loop(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let id = self.handle.next_id();
                    let conn = Arc::new(Connection::new(id, stream, peer));
                    if let Err(e) = conn.register(&self.handle.shared.registry) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }
                    self.handle.connections().insert(id, conn);
                    info!(conn = %id, peer = %peer, "Accepted connection");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn dispatch(&self, event: &Event) {
        let id = ConnectionId::from(event.token());
        let Some(conn) = self.handle.connection(id) else {
            trace!(conn = %id, "Event for a removed connection");
            return;
        };
        if !conn.is_active() {
            return;
        }

        if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
            debug!(conn = %id, "Peer hung up");
            self.handle.remove_connection(id);
            return;
        }

        if event.is_readable() || event.is_read_closed() {
            self.schedule_read(&conn);
        }
        if event.is_writable() {
            conn.set_write_ready(true);
            self.schedule_write(&conn);
        }
    }

    /// Starts read tasks for connections whose outbound queue drained.
    fn resume_intake(&self) {
        let ids = std::mem::take(&mut *self.handle.resumed());
        for id in ids {
            if let Some(conn) = self.handle.connection(id) {
                if conn.is_active() {
                    self.schedule_read(&conn);
                }
            }
        }
    }

    fn schedule_read(&self, conn: &Arc<Connection>) {
        if !conn.read_gate().schedule() {
            return;
        }
        let handle = self.handle.clone();
        let id = conn.id();
        if self.pool.submit(move || handle.read_task(id)).is_err() {
            conn.read_gate().abandon();
        }
    }

    fn schedule_write(&self, conn: &Arc<Connection>) {
        if !conn.write_gate().schedule() {
            return;
        }
        let handle = self.handle.clone();
        let id = conn.id();
        if self.pool.submit(move || handle.write_task(id)).is_err() {
            conn.write_gate().abandon();
        }
    }

    fn teardown(&mut self) {
        let ids: Vec<ConnectionId> = self.handle.connections().keys().copied().collect();
        for id in ids {
            self.handle.remove_connection(id);
        }
        self.pool.shutdown();
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "Failed to deregister listener");
        }
        info!("Server stopped");
    }
}

impl ReactorHandle {
    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn resumed(&self) -> MutexGuard<'_, Vec<ConnectionId>> {
        self.shared
            .resumed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Asks the reactor loop to stop.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            error!(error = %e, "Failed to wake the reactor");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Re-registers a connection's interest set. Unknown ids are ignored.
    pub fn modify_interest(&self, id: ConnectionId, interest: Interest) -> io::Result<()> {
        match self.connection(id) {
            Some(conn) => conn.set_interest(&self.shared.registry, interest),
            None => Ok(()),
        }
    }

    /// Removes a connection from the table, deregisters and closes it.
    ///
    /// Only the first call for an id does anything; returns whether this call
    /// was the one.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        let mut table = self.connections();
        let Some(conn) = table.remove(&id) else {
            return false;
        };
        conn.close(&self.shared.registry);
        drop(table);
        info!(conn = %id, peer = %conn.peer(), "Connection closed");
        true
    }

    fn arm_write(&self, conn: &Connection) {
        if let Err(e) = self.modify_interest(conn.id(), Interest::READABLE | Interest::WRITABLE) {
            warn!(conn = %conn.id(), error = %e, "Failed to arm write interest");
            self.remove_connection(conn.id());
        }
    }

    // Read path

    fn read_task(&self, id: ConnectionId) {
        let Some(conn) = self.connection(id) else {
            return;
        };
        loop {
            if conn.is_active() {
                self.read_pass(&conn);
            }
            if !conn.read_gate().finish() {
                break;
            }
        }
    }

    fn read_pass(&self, conn: &Connection) {
        self.serve_pending(conn);

        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut peer_closed = false;
        loop {
            if conn.pause_reads_if_full() {
                trace!(
                    conn = %conn.id(),
                    queued = conn.queued_bytes(),
                    "Outbound queue full, pausing reads"
                );
                break;
            }
            match conn.read(&mut buf) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => {
                    trace!(conn = %conn.id(), bytes = n, "Read");
                    if !conn.is_closing() {
                        self.process(conn, &buf[..n]);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if conn.is_active() {
                        debug!(conn = %conn.id(), error = %e, "Read failed");
                    }
                    self.remove_connection(conn.id());
                    return;
                }
            }
        }

        // After a half-close the write path flushes what is queued and then
        // removes the connection; arming write interest makes sure it runs.
        let first_close = peer_closed && conn.mark_read_closed();
        if first_close {
            debug!(conn = %conn.id(), "Peer closed its sending side");
            conn.set_closing();
        }
        if first_close || conn.has_messages() {
            self.arm_write(conn);
        }
    }

    fn process(&self, conn: &Connection, data: &[u8]) {
        if let Err(e) = conn.parser().feed(data) {
            trace!(conn = %conn.id(), error = %e, "Parser stopped");
        }
        self.serve_pending(conn);
    }

    /// Serves parsed requests in order until none are left, the connection
    /// is closing or the outbound queue is full. A parse fault is answered
    /// once every request before it has been served.
    fn serve_pending(&self, conn: &Connection) {
        loop {
            if conn.is_closing() || conn.pause_reads_if_full() {
                return;
            }
            let next = conn.parser().next_request();
            match next {
                Some(request) => self.serve(conn, &request),
                None => break,
            }
        }

        let fault = conn.parser().error().cloned();
        if let Some(e) = fault {
            warn!(conn = %conn.id(), error = %e, "Malformed request");
            let mut response = Response::error(e.status());
            response.set_header("Server", SERVER_NAME);
            response.set_header("Connection", "close");
            conn.push_message(encode_response(&response));
            conn.set_closing();
        }
    }

    fn serve(&self, conn: &Connection, request: &Request) {
        let keep_alive = request.keep_alive();
        let mut response = self.respond(request);

        if request.method == Method::HEAD {
            if !response.status.forbids_body() && response.header("Content-Length").is_none() {
                response.set_header("Content-Length", response.body.len().to_string());
            }
            response.body.clear();
        }
        response.set_header("Server", SERVER_NAME);
        response.set_header("Connection", if keep_alive { "keep-alive" } else { "close" });

        debug!(
            conn = %conn.id(),
            method = %request.method,
            path = %request.path,
            status = response.status.as_u16(),
            "Request served"
        );

        conn.push_message(encode_response(&response));
        if !keep_alive {
            conn.set_closing();
        }
    }

    fn respond(&self, request: &Request) -> Response {
        let handler = &self.shared.handler;
        panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))).unwrap_or_else(|_| {
            error!(method = %request.method, path = %request.path, "Handler panicked");
            Response::internal_error()
        })
    }

    // Write path

    fn write_task(&self, id: ConnectionId) {
        let Some(conn) = self.connection(id) else {
            return;
        };
        loop {
            if conn.is_active() {
                self.write_pass(&conn);
            }
            if !conn.write_gate().finish() {
                break;
            }
            // A writable edge arrived while this pass ran.
            conn.set_write_ready(true);
        }
    }

    fn write_pass(&self, conn: &Connection) {
        if !conn.is_write_ready() {
            return;
        }
        loop {
            while let Some(message) = conn.pop_message() {
                if !self.send(conn, message) {
                    return;
                }
                self.resume_reads(conn);
            }

            if conn.is_closing() {
                if conn.has_messages() {
                    continue;
                }
                self.remove_connection(conn.id());
                return;
            }

            match conn.disarm_write_if_drained(&self.shared.registry) {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    warn!(conn = %conn.id(), error = %e, "Failed to disarm write interest");
                    self.remove_connection(conn.id());
                    return;
                }
            }
        }
    }

    fn resume_reads(&self, conn: &Connection) {
        if !conn.resume_reads_if_drained() {
            return;
        }
        trace!(conn = %conn.id(), "Outbound queue drained, resuming reads");
        self.resumed().push(conn.id());
        if let Err(e) = self.shared.waker.wake() {
            error!(error = %e, "Failed to wake the reactor");
        }
    }

    /// Writes one message. Returns `false` when the pass has to stop, either
    /// because the socket is full (the unsent rest goes back to the queue) or
    /// because the connection is gone.
    fn send(&self, conn: &Connection, mut message: Bytes) -> bool {
        while message.has_remaining() {
            match conn.write(&message) {
                Ok(0) => {
                    debug!(conn = %conn.id(), "Peer stopped accepting data");
                    self.remove_connection(conn.id());
                    return false;
                }
                Ok(n) => message.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    trace!(conn = %conn.id(), pending = message.len(), "Socket full");
                    conn.requeue_front(message);
                    conn.set_write_ready(false);
                    return false;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if conn.is_active() {
                        debug!(conn = %conn.id(), error = %e, "Write failed");
                    }
                    self.remove_connection(conn.id());
                    return false;
                }
            }
        }
        true
    }
}
