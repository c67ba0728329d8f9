//! The acceptor/reactor event loop.
//!
//! One thread owns the listening socket, the poll instance, every connection,
//! and the shared write-staging buffer. Readiness-based model: poll tells us
//! when sockets are ready, then we perform non-blocking read/write syscalls.
//!
//! Other threads never touch the selector directly. They record what they
//! want (queued buffers, a changed read-interest flag, a session close,
//! shutdown) in shared state, then wake the poll; the reactor applies the
//! changes on its next pass.

use crate::config::{Config, SELECT_TIMEOUT, WRITE_STAGING_SIZE};
use crate::proto::frame::{Probe, ReadEvent};
use crate::proto::records::{
    error_code, op_code, AuthPacket, ConnectRequest, ReplyHeader, RequestHeader,
};
use crate::runtime::connection::{
    consume_sent, stage_outgoing, CnxnError, CnxnHandle, CnxnShared, Connection,
};
use crate::runtime::probe;
use crate::server::{AuthRegistry, Request, ServerCore, ServerStats};
use crate::trace;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use slab::Slab;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, trace as trace_event, warn};

const LISTENER: Token = Token(usize::MAX);
pub(crate) const WAKER: Token = Token(usize::MAX - 1);

/// Work recorded by other threads for the reactor to apply.
#[derive(Default)]
struct PendingOps {
    /// Connections whose queue or interest flags changed.
    dirty: Vec<usize>,
    close_sessions: Vec<i64>,
    shutdown: bool,
}

/// Reactor state reachable from other threads: the waker, the control queue,
/// the attached server core, and the server-wide statistics.
pub(crate) struct ReactorShared {
    waker: Waker,
    pending: Mutex<PendingOps>,
    server: RwLock<Option<Arc<dyn ServerCore>>>,
    outstanding_limit: AtomicI32,
    pub(crate) stats: Arc<ServerStats>,
}

impl ReactorShared {
    fn new(waker: Waker) -> Self {
        Self {
            waker,
            pending: Mutex::new(PendingOps::default()),
            server: RwLock::new(None),
            // effectively no pipelining until a core installs its real limit
            outstanding_limit: AtomicI32::new(1),
            stats: Arc::new(ServerStats::new()),
        }
    }

    pub(crate) fn server(&self) -> Option<Arc<dyn ServerCore>> {
        self.server.read().unwrap().clone()
    }

    fn set_server(&self, server: Option<Arc<dyn ServerCore>>) {
        let limit = server
            .as_ref()
            .map(|s| s.global_outstanding_limit())
            .unwrap_or(1);
        *self.server.write().unwrap() = server;
        self.outstanding_limit.store(limit, Ordering::Release);
    }

    pub(crate) fn outstanding_limit(&self) -> i32 {
        self.outstanding_limit.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake the reactor");
        }
    }

    /// Mark a connection's shared state as changed and wake the reactor.
    pub(crate) fn notify_dirty(&self, token: usize) {
        self.pending.lock().unwrap().dirty.push(token);
        self.wake();
    }

    /// Re-enable reads on a connection once the pipeline is back under its
    /// limit, or once this connection has nothing left in flight.
    pub(crate) fn check_unthrottle(&self, shared: &CnxnShared) {
        let under_limit = match self.server() {
            Some(server) => server.in_process() < self.outstanding_limit(),
            None => true,
        };
        if under_limit || shared.outstanding.load(Ordering::Acquire) < 1 {
            shared.set_recv_enabled(true);
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Arc<Self> {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), WAKER).unwrap();
        // keep the poll fd alive for the waker's lifetime
        std::mem::forget(poll);
        Arc::new(Self::new(waker))
    }
}

/// Cloneable control surface of a running [`Reactor`].
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    /// Attach (or detach, with `None`) the request-execution core. Detached,
    /// the front-end answers probes and refuses handshakes.
    pub fn set_server(&self, server: Option<Arc<dyn ServerCore>>) {
        self.shared.set_server(server);
    }

    /// Close every connection bound to the given session id.
    pub fn close_session(&self, session_id: i64) {
        self.shared
            .pending
            .lock()
            .unwrap()
            .close_sessions
            .push(session_id);
        self.shared.wake();
    }

    /// Stop the reactor: the run loop closes every connection and returns.
    pub fn shutdown(&self) {
        self.shared.pending.lock().unwrap().shutdown = true;
        self.shared.wake();
    }

    pub fn server_stats(&self) -> Arc<ServerStats> {
        self.shared.stats.clone()
    }
}

/// The single-threaded acceptor/reactor.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    conns: Slab<Connection>,
    ip_map: HashMap<IpAddr, HashSet<usize>>,
    /// Write-staging buffer shared by every connection's coalesced writes.
    /// Only this thread touches it between a stage and the completing write.
    staging: Vec<u8>,
    shared: Arc<ReactorShared>,
    auth: AuthRegistry,
    max_frame: usize,
    max_client_cnxns: u32,
    rng: StdRng,
    shutdown: bool,
}

impl Reactor {
    /// Bind the client port and set up the poll instance.
    pub fn bind(config: &Config, auth: AuthRegistry) -> io::Result<Reactor> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        info!(addr = %addr, "binding to client port");
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let mut listener = TcpListener::from_std(socket.into());
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        Ok(Reactor {
            poll,
            listener,
            conns: Slab::new(),
            ip_map: HashMap::new(),
            staging: Vec::with_capacity(WRITE_STAGING_SIZE),
            shared: Arc::new(ReactorShared::new(waker)),
            auth,
            max_frame: config.max_frame,
            max_client_cnxns: config.max_client_cnxns,
            rng: StdRng::from_entropy(),
            shutdown: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run until shutdown is requested. Per-connection failures close that
    /// connection; nothing propagates out of the loop.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        while !self.shutdown {
            match self.poll.poll(&mut events, Some(SELECT_TIMEOUT)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            // Snapshot and shuffle so low-numbered tokens get no service bias.
            let mut ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| {
                    (
                        e.token(),
                        e.is_readable() || e.is_read_closed(),
                        e.is_writable() || e.is_write_closed(),
                    )
                })
                .collect();
            ready.shuffle(&mut self.rng);

            for (token, readable, writable) in ready {
                match token {
                    LISTENER => self.accept_ready(),
                    WAKER => {}
                    Token(idx) => self.conn_ready(idx, readable, writable),
                }
            }

            self.drain_pending();
        }

        info!("reactor exited run loop");
        let tokens: Vec<usize> = self.conns.iter().map(|(idx, _)| idx).collect();
        for idx in tokens {
            self.close_conn(idx);
        }
        Ok(())
    }

    /// Accept until the listener would block, enforcing the per-IP cap.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let count = self
                        .ip_map
                        .get(&peer.ip())
                        .map(|set| set.len())
                        .unwrap_or(0);
                    if self.max_client_cnxns > 0 && count >= self.max_client_cnxns as usize {
                        warn!(
                            peer = %peer,
                            max = self.max_client_cnxns,
                            "Too many connections from remote address"
                        );
                        continue;
                    }
                    if let Err(e) = self.register_conn(stream, peer) {
                        warn!(peer = %peer, error = %e, "Failed to register accepted connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn register_conn(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nodelay(true)?;
        socket2::SockRef::from(&stream).set_linger(None)?;

        let entry = self.conns.vacant_entry();
        let idx = entry.key();
        let mut conn = Connection::new(stream, peer, idx, self.max_frame);
        self.poll
            .registry()
            .register(&mut conn.stream, Token(idx), Interest::READABLE)?;
        conn.registered = Some((true, false));
        entry.insert(conn);

        // one connection per host is the common case: capacity 2 avoids a
        // rehash when the first entry lands
        self.ip_map
            .entry(peer.ip())
            .or_insert_with(|| HashSet::with_capacity(2))
            .insert(idx);

        info!(peer = %peer, "Accepted socket connection");
        Ok(())
    }

    /// Per-connection I/O dispatch: reads first, then the write drain, then
    /// reconcile selector interest with the connection's state.
    fn conn_ready(&mut self, idx: usize, readable: bool, writable: bool) {
        if !self.conns.contains(idx) {
            return;
        }

        if readable {
            match self.handle_readable(idx) {
                Ok(Some(probe)) => {
                    self.serve_probe(idx, probe);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    self.close_on_error(idx, e);
                    return;
                }
            }
        }

        if !self.conns.contains(idx) {
            return;
        }

        if writable {
            if let Err(e) = self.drain_outgoing(idx) {
                self.close_on_error(idx, e);
                return;
            }
        }

        self.sync_interest(idx);
    }

    /// Drive the framing state machine while read interest holds, handing
    /// each complete frame to the dispatcher.
    fn handle_readable(&mut self, idx: usize) -> Result<Option<Probe>, CnxnError> {
        loop {
            let (event, initialized) = {
                let conn = match self.conns.get_mut(idx) {
                    Some(conn) => conn,
                    None => return Ok(None),
                };
                if !conn.shared.recv_enabled() {
                    return Ok(None);
                }
                (conn.read_event()?, conn.initialized)
            };

            match event {
                ReadEvent::NeedMore => return Ok(None),
                ReadEvent::Probe(probe) => return Ok(Some(probe)),
                ReadEvent::Frame(payload) => {
                    self.packet_received(idx);
                    if initialized {
                        self.handle_request(idx, payload)?;
                    } else {
                        self.handle_connect(idx, payload)?;
                    }
                }
            }
        }
    }

    /// First frame of a connection: the session handshake.
    fn handle_connect(&mut self, idx: usize, payload: bytes::Bytes) -> Result<(), CnxnError> {
        let mut buf = payload;
        let req = ConnectRequest::deserialize(&mut buf)?;
        let remote = self.conns[idx].remote;
        debug!(
            peer = %remote,
            last_zxid = %format!("0x{:x}", req.last_zxid_seen),
            "Session establishment request"
        );

        let server = self
            .shared
            .server()
            .ok_or(CnxnError::CloseRequest("server core not running"))?;

        if req.last_zxid_seen > server.last_zxid() {
            info!(
                peer = %remote,
                client_zxid = %format!("0x{:x}", req.last_zxid_seen),
                our_zxid = %format!("0x{:x}", server.last_zxid()),
                "Refusing session request, client must try another server"
            );
            return Err(CnxnError::CloseRequest("client has seen a newer zxid"));
        }

        let mut timeout = req.timeout;
        let min = server.min_session_timeout();
        if timeout < min {
            timeout = min;
        }
        let max = server.max_session_timeout();
        if timeout > max {
            timeout = max;
        }

        {
            let conn = &self.conns[idx];
            conn.shared.set_session_timeout(timeout);
            // no packets until the session is set up
            conn.shared.set_recv_enabled(false);
        }

        let handle = self.handle_for(idx);
        if req.session_id != 0 {
            info!(
                session = %format!("0x{:x}", req.session_id),
                peer = %remote,
                "Client attempting to renew session"
            );
            // a renewed session steals its id from any connection still
            // holding it; we are on the reactor thread, no wakeup needed
            self.close_session_conns(req.session_id, Some(idx));
            self.conns[idx].shared.set_session_id(req.session_id);
            server.reopen_session(handle, req.session_id, req.passwd, timeout);
        } else {
            info!(peer = %remote, "Client attempting to establish new session");
            server.create_session(handle, req.passwd, timeout);
        }
        self.conns[idx].initialized = true;
        Ok(())
    }

    /// Post-handshake frame: auth packet or upward request.
    fn handle_request(&mut self, idx: usize, payload: bytes::Bytes) -> Result<(), CnxnError> {
        let mut buf = payload;
        let header = RequestHeader::deserialize(&mut buf)?;

        if header.rtype == op_code::AUTH {
            let packet = AuthPacket::deserialize(&mut buf)?;
            let remote = self.conns[idx].remote;
            let handle = self.handle_for(idx);
            let outcome = match self.auth.get(&packet.scheme) {
                None => {
                    warn!(scheme = %packet.scheme, "No authentication provider for scheme");
                    None
                }
                Some(provider) => match provider.authenticate(remote, &packet.auth) {
                    Ok(ids) => Some(ids),
                    Err(e) => {
                        warn!(scheme = %packet.scheme, error = %e, "Authentication failed");
                        None
                    }
                },
            };
            match outcome {
                Some(ids) => {
                    debug!(scheme = %packet.scheme, "Authentication succeeded");
                    for id in ids {
                        handle.add_auth_info(id);
                    }
                    handle.send_response(ReplyHeader::new(header.xid, 0, error_code::OK), None);
                }
                None => {
                    handle.send_response(
                        ReplyHeader::new(header.xid, 0, error_code::AUTH_FAILED),
                        None,
                    );
                    handle.send_close_session();
                    self.conns[idx].shared.set_recv_enabled(false);
                }
            }
            return Ok(());
        }

        let server = self
            .shared
            .server()
            .ok_or(CnxnError::CloseRequest("server core not running"))?;

        let shared = self.conns[idx].shared.clone();
        let req = Request {
            cnxn: self.handle_for(idx),
            session_id: shared.session_id(),
            cxid: header.xid,
            rtype: header.rtype,
            payload: buf,
            auth_info: shared.auth_info_snapshot(),
        };
        if trace::enabled(trace::CLIENT_REQUEST_TRACE_MASK) {
            trace_event!(request = ?req, "Submitting request");
        }
        server.submit_request(req);

        if header.xid >= 0 {
            shared.outstanding.fetch_add(1, Ordering::AcqRel);
            let in_process = server.in_process();
            if in_process > self.shared.outstanding_limit() {
                debug!(in_process, "Throttling recv");
                shared.set_recv_enabled(false);
            }
        }
        Ok(())
    }

    /// Coalesced write: stage queued buffers into the shared staging area,
    /// one socket write, then settle the queue. Loops until the queue drains
    /// or the socket pushes back; edge-triggered writability will not re-fire
    /// for data that was already writable.
    fn drain_outgoing(&mut self, idx: usize) -> Result<(), CnxnError> {
        loop {
            let conn = match self.conns.get_mut(idx) {
                Some(conn) => conn,
                None => return Ok(()),
            };

            let mut queue = conn.shared.outgoing().lock().unwrap();
            if queue.is_empty() {
                drop(queue);
                if !conn.initialized && !conn.shared.recv_enabled() {
                    return Err(CnxnError::CloseRequest("responded to info probe"));
                }
                return Ok(());
            }

            stage_outgoing(&queue, &mut self.staging, WRITE_STAGING_SIZE);

            let mut would_block = false;
            let mut sent = 0;
            if !self.staging.is_empty() {
                match conn.stream.write(&self.staging) {
                    Ok(0) => {
                        return Err(CnxnError::Io(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned 0",
                        )))
                    }
                    Ok(n) => sent = n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => would_block = true,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => would_block = true,
                    Err(e) => return Err(CnxnError::Io(e)),
                }
            }

            match consume_sent(&mut queue, sent) {
                Ok(flushed) => {
                    for _ in 0..flushed {
                        conn.shared.stats.incr_packets_sent();
                        self.shared.stats.incr_packets_sent();
                    }
                }
                Err(_) => return Err(CnxnError::CloseRequest("close requested")),
            }

            let empty = queue.is_empty();
            drop(queue);

            if empty && !conn.initialized && !conn.shared.recv_enabled() {
                return Err(CnxnError::CloseRequest("responded to info probe"));
            }
            if empty || would_block {
                return Ok(());
            }
        }
    }

    /// A pre-handshake length word matched the probe table: detach the
    /// connection from the selector (peers often half-close right after the
    /// probe, which would otherwise surface as read-readiness and abort the
    /// write), answer synchronously, close.
    fn serve_probe(&mut self, idx: usize, probe: Probe) {
        self.packet_received(idx);
        info!(
            cmd = probe.name(),
            peer = %self.conns[idx].remote,
            "Processing diagnostic command"
        );
        let mut conn = self.remove_conn(idx);
        let server = self.shared.server();
        probe::respond(
            probe,
            &mut conn,
            server.as_ref(),
            &self.shared.stats,
            &self.conns,
        );
        self.finish_close(conn);
    }

    fn packet_received(&self, idx: usize) {
        if let Some(conn) = self.conns.get(idx) {
            conn.shared.stats.incr_packets_received();
        }
        self.shared.stats.incr_packets_received();
    }

    fn handle_for(&self, idx: usize) -> CnxnHandle {
        CnxnHandle::new(idx, self.conns[idx].shared.clone(), self.shared.clone())
    }

    /// Apply the work other threads queued: shutdown, session closes, and
    /// per-connection queue/interest changes.
    fn drain_pending(&mut self) {
        let ops = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };

        if ops.shutdown {
            self.shutdown = true;
        }
        for session_id in ops.close_sessions {
            self.close_session_conns(session_id, None);
        }

        let mut dirty = ops.dirty;
        dirty.sort_unstable();
        dirty.dedup();
        for idx in dirty {
            if !self.conns.contains(idx) {
                continue;
            }
            if let Err(e) = self.drain_outgoing(idx) {
                self.close_on_error(idx, e);
                continue;
            }
            self.sync_interest(idx);
        }
    }

    /// Close every connection bound to `session_id`, except `keep`.
    fn close_session_conns(&mut self, session_id: i64, keep: Option<usize>) {
        if session_id == 0 {
            return;
        }
        let matches: Vec<usize> = self
            .conns
            .iter()
            .filter(|(idx, conn)| {
                Some(*idx) != keep && conn.shared.session_id() == session_id
            })
            .map(|(idx, _)| idx)
            .collect();
        for idx in matches {
            debug!(
                session = %format!("0x{session_id:x}"),
                "Closing connection for session takeover or expiry"
            );
            self.close_conn(idx);
        }
    }

    /// Reconcile the selector with the connection's desired interest.
    fn sync_interest(&mut self, idx: usize) {
        let conn = match self.conns.get_mut(idx) {
            Some(conn) => conn,
            None => return,
        };
        let want = conn.desired_interest();
        if conn.registered == want {
            return;
        }
        let result = match want {
            None => self.poll.registry().deregister(&mut conn.stream),
            Some((read, write)) => {
                let interest = match (read, write) {
                    (true, true) => Interest::READABLE | Interest::WRITABLE,
                    (true, false) => Interest::READABLE,
                    _ => Interest::WRITABLE,
                };
                if conn.registered.is_none() {
                    self.poll
                        .registry()
                        .register(&mut conn.stream, Token(idx), interest)
                } else {
                    self.poll
                        .registry()
                        .reregister(&mut conn.stream, Token(idx), interest)
                }
            }
        };
        match result {
            Ok(()) => conn.registered = want,
            Err(e) => {
                warn!(error = %e, "Failed to update selector interest");
                self.close_conn(idx);
            }
        }
    }

    fn close_on_error(&mut self, idx: usize, err: CnxnError) {
        let session_id = self
            .conns
            .get(idx)
            .map(|conn| conn.shared.session_id())
            .unwrap_or(0);
        match &err {
            CnxnError::CloseRequest(reason) => {
                debug!(
                    session = %format!("0x{session_id:x}"),
                    reason = %reason,
                    "Closing connection"
                );
            }
            CnxnError::EndOfStream => {
                warn!(
                    session = %format!("0x{session_id:x}"),
                    "Unable to read additional data from client, likely client has closed socket"
                );
            }
            other => {
                warn!(
                    session = %format!("0x{session_id:x}"),
                    error = %other,
                    "Exception causing close of connection"
                );
            }
        }
        self.close_conn(idx);
    }

    /// Idempotent close: a connection no longer in the slab is already gone.
    fn close_conn(&mut self, idx: usize) {
        if !self.conns.contains(idx) {
            return;
        }
        let conn = self.remove_conn(idx);
        self.finish_close(conn);
    }

    /// Detach from the slab, the IP map, and the selector.
    fn remove_conn(&mut self, idx: usize) -> Connection {
        let mut conn = self.conns.remove(idx);
        let ip = conn.remote.ip();
        if let Some(set) = self.ip_map.get_mut(&ip) {
            set.remove(&idx);
            if set.is_empty() {
                self.ip_map.remove(&ip);
            }
        }
        let _ = self.poll.registry().deregister(&mut conn.stream);
        conn
    }

    /// Second half of close: mark the shared state dead, inform the core,
    /// and shut the socket down output-first.
    fn finish_close(&mut self, conn: Connection) {
        conn.shared.set_closed();
        if let Some(server) = self.shared.server() {
            let handle = CnxnHandle::new(conn.token, conn.shared.clone(), self.shared.clone());
            server.remove_connection(&handle);
        }
        let _ = conn.stream.shutdown(Shutdown::Write);
        let _ = conn.stream.shutdown(Shutdown::Read);
        let session_id = conn.shared.session_id();
        if session_id != 0 {
            info!(
                peer = %conn.remote,
                session = %format!("0x{session_id:x}"),
                "Closed socket connection"
            );
        } else {
            info!(
                peer = %conn.remote,
                "Closed socket connection (no session established)"
            );
        }
    }
}
