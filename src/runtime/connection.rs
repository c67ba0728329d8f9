//! Per-connection state and the upward connection handle.
//!
//! A connection is split in two. The reactor thread exclusively owns the
//! socket, the frame reader, and the handshake flag. Everything the request
//! pipeline may touch from other threads lives in [`CnxnShared`] behind an
//! `Arc`: the outbound queue, the desired read-interest flag, the session
//! identity, and the statistics. The pipeline only ever sees a
//! [`CnxnHandle`], never the reactor-owned half.

use crate::proto::archive::ArchiveError;
use crate::proto::frame::{encode_frame, FrameError, FrameReader, ReadEvent};
use crate::proto::records::{
    ConnectResponse, Id, ReplyHeader, ResponseBody, WatcherEvent, NOTIFICATION_XID,
    SESSION_PASSWD_LEN,
};
use crate::runtime::event_loop::ReactorShared;
use crate::trace;
use bytes::Bytes;
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, trace as trace_event};

static NEXT_CNXN_ID: AtomicU64 = AtomicU64::new(1);

/// A buffer queued for transmission. `pos` advances as partial writes land.
#[derive(Debug)]
pub(crate) struct SendBuf {
    data: Bytes,
    pos: usize,
}

impl SendBuf {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.pos += n;
    }
}

/// Outbound queue entry. The close marker is terminal: once it reaches the
/// queue head the connection closes, and nothing staged behind it is sent.
#[derive(Debug)]
pub(crate) enum Queued {
    Data(SendBuf),
    CloseMarker,
}

/// Raised when the close marker reaches the queue head during a drain.
pub(crate) struct CloseRequested;

/// Copy queued buffers into the staging area in order, stopping at the close
/// marker or at `capacity`. Source buffer positions are left untouched; the
/// copy is non-destructive so partially sent buffers survive.
pub(crate) fn stage_outgoing(queue: &VecDeque<Queued>, staging: &mut Vec<u8>, capacity: usize) {
    staging.clear();
    for item in queue {
        match item {
            Queued::CloseMarker => break,
            Queued::Data(buf) => {
                let rem = buf.bytes();
                let space = capacity - staging.len();
                if space == 0 {
                    break;
                }
                let n = rem.len().min(space);
                staging.extend_from_slice(&rem[..n]);
                if n < rem.len() {
                    break;
                }
            }
        }
    }
}

/// Walk the queue head consuming `sent` bytes: fully covered buffers are
/// dropped, a partially covered head is advanced. Returns how many buffers
/// were fully flushed, or the close signal when the head is the marker.
pub(crate) fn consume_sent(
    queue: &mut VecDeque<Queued>,
    mut sent: usize,
) -> Result<usize, CloseRequested> {
    let mut flushed = 0;
    while let Some(head) = queue.front_mut() {
        match head {
            Queued::CloseMarker => return Err(CloseRequested),
            Queued::Data(buf) => {
                let rem = buf.remaining();
                if sent < rem {
                    buf.advance(sent);
                    break;
                }
                sent -= rem;
                flushed += 1;
                queue.pop_front();
            }
        }
    }
    Ok(flushed)
}

/// Why a connection is being torn down. The reactor maps each variant onto
/// the single idempotent close path.
#[derive(Debug)]
pub(crate) enum CnxnError {
    /// Internal control signal, not a failure.
    CloseRequest(&'static str),
    /// Peer closed its sending side.
    EndOfStream,
    Frame(FrameError),
    Archive(ArchiveError),
    Io(io::Error),
}

impl fmt::Display for CnxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CnxnError::CloseRequest(msg) => write!(f, "close requested: {msg}"),
            CnxnError::EndOfStream => write!(f, "end of stream"),
            CnxnError::Frame(e) => write!(f, "framing error: {e}"),
            CnxnError::Archive(e) => write!(f, "malformed record: {e}"),
            CnxnError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl From<FrameError> for CnxnError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::EndOfStream => CnxnError::EndOfStream,
            other => CnxnError::Frame(other),
        }
    }
}

impl From<ArchiveError> for CnxnError {
    fn from(e: ArchiveError) -> Self {
        CnxnError::Archive(e)
    }
}

impl From<io::Error> for CnxnError {
    fn from(e: io::Error) -> Self {
        CnxnError::Io(e)
    }
}

#[derive(Debug)]
struct StatsInner {
    min_latency: u64,
    max_latency: u64,
    total_latency: u64,
    count: u64,
    last_op: String,
    last_cxid: i64,
    last_zxid: i64,
    last_response_time: u64,
    last_latency: u64,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            min_latency: u64::MAX,
            max_latency: 0,
            total_latency: 0,
            count: 0,
            last_op: "NA".to_string(),
            last_cxid: -1,
            last_zxid: -1,
            last_response_time: 0,
            last_latency: 0,
        }
    }
}

/// Per-connection statistics, safe to update from the pipeline threads.
#[derive(Debug)]
pub struct CnxnStats {
    established_ms: u64,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    inner: Mutex<StatsInner>,
}

impl CnxnStats {
    fn new() -> Self {
        let established_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            established_ms,
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            inner: Mutex::new(StatsInner::new()),
        }
    }

    pub fn incr_packets_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_packets_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn established_ms(&self) -> u64 {
        self.established_ms
    }

    /// Record one completed request. Negative cxids are internal traffic and
    /// do not overwrite the client's last real operation id.
    pub fn update_for_response(&self, cxid: i64, zxid: i64, op: &str, start_ms: u64, end_ms: u64) {
        let mut s = self.inner.lock().unwrap();
        if cxid >= 0 {
            s.last_cxid = cxid;
        }
        s.last_zxid = zxid;
        s.last_op = op.to_string();
        s.last_response_time = end_ms;
        let elapsed = end_ms.saturating_sub(start_ms);
        s.last_latency = elapsed;
        s.min_latency = s.min_latency.min(elapsed);
        s.max_latency = s.max_latency.max(elapsed);
        s.count += 1;
        s.total_latency += elapsed;
    }

    pub fn reset(&self) {
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        *self.inner.lock().unwrap() = StatsInner::new();
    }
}

/// State shared between the reactor and the pipeline threads.
pub(crate) struct CnxnShared {
    id: u64,
    remote: SocketAddr,
    outgoing: Mutex<VecDeque<Queued>>,
    /// Desired read interest; the reactor applies it to the selector.
    recv_enabled: AtomicBool,
    closed: AtomicBool,
    session_id: AtomicI64,
    session_timeout: AtomicI32,
    /// Requests submitted upward and not yet responded to.
    pub(crate) outstanding: AtomicI32,
    auth_info: Mutex<Vec<Id>>,
    pub(crate) stats: CnxnStats,
}

impl CnxnShared {
    pub(crate) fn new(remote: SocketAddr) -> Self {
        // Every connection starts with the identity its address proves.
        let ip_id = Id::new("ip", remote.ip().to_string());
        Self {
            id: NEXT_CNXN_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            outgoing: Mutex::new(VecDeque::new()),
            recv_enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            session_id: AtomicI64::new(0),
            session_timeout: AtomicI32::new(0),
            outstanding: AtomicI32::new(0),
            auth_info: Mutex::new(vec![ip_id]),
            stats: CnxnStats::new(),
        }
    }

    pub(crate) fn outgoing(&self) -> &Mutex<VecDeque<Queued>> {
        &self.outgoing
    }

    pub(crate) fn queue_empty(&self) -> bool {
        self.outgoing.lock().unwrap().is_empty()
    }

    pub(crate) fn recv_enabled(&self) -> bool {
        self.recv_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_recv_enabled(&self, enabled: bool) {
        self.recv_enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn session_id(&self) -> i64 {
        self.session_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_session_id(&self, session_id: i64) {
        self.session_id.store(session_id, Ordering::Release);
    }

    pub(crate) fn session_timeout(&self) -> i32 {
        self.session_timeout.load(Ordering::Acquire)
    }

    pub(crate) fn set_session_timeout(&self, timeout_ms: i32) {
        self.session_timeout.store(timeout_ms, Ordering::Release);
    }

    pub(crate) fn auth_info_snapshot(&self) -> Vec<Id> {
        self.auth_info.lock().unwrap().clone()
    }

    pub(crate) fn add_auth_info(&self, id: Id) {
        self.auth_info.lock().unwrap().push(id);
    }

    /// One line of the `stat`/`cons` listing. `brief` omits the session
    /// detail fields. `detached` renders the interest value as 0: a probing
    /// connection has already been pulled from the selector, so it reports
    /// no interest regardless of its flags.
    pub(crate) fn dump_connection_info(
        &self,
        w: &mut dyn fmt::Write,
        brief: bool,
        detached: bool,
    ) -> fmt::Result {
        let interest = if detached {
            0
        } else {
            u32::from(self.recv_enabled()) | if self.queue_empty() { 0 } else { 4 }
        };
        write!(
            w,
            " {}[{:x}](queued={},recved={},sent={}",
            self.remote,
            interest,
            self.outstanding.load(Ordering::Acquire),
            self.stats.packets_received(),
            self.stats.packets_sent(),
        )?;
        if !brief {
            let session_id = self.session_id();
            if session_id != 0 {
                let s = self.stats.inner.lock().unwrap();
                write!(w, ",sid=0x{session_id:x}")?;
                write!(w, ",lop={}", s.last_op)?;
                write!(w, ",est={}", self.stats.established_ms)?;
                write!(w, ",to={}", self.session_timeout())?;
                if s.last_cxid >= 0 {
                    write!(w, ",lcxid=0x{:x}", s.last_cxid)?;
                }
                write!(w, ",lzxid=0x{:x}", s.last_zxid)?;
                write!(w, ",lresp={}", s.last_response_time)?;
                write!(w, ",llat={}", s.last_latency)?;
                let min = if s.count == 0 { 0 } else { s.min_latency };
                write!(w, ",minlat={min}")?;
                let avg = if s.count == 0 {
                    0
                } else {
                    s.total_latency / s.count
                };
                write!(w, ",avglat={avg}")?;
                write!(w, ",maxlat={}", s.max_latency)?;
            }
        }
        writeln!(w, ")")
    }
}

/// The reactor-owned half of a connection.
pub(crate) struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) token: usize,
    pub(crate) remote: SocketAddr,
    pub(crate) reader: FrameReader,
    /// True once the handshake frame has been consumed.
    pub(crate) initialized: bool,
    /// Interest currently installed in the selector; `None` when the
    /// connection is not registered.
    pub(crate) registered: Option<(bool, bool)>,
    pub(crate) shared: Arc<CnxnShared>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        remote: SocketAddr,
        token: usize,
        max_frame: usize,
    ) -> Self {
        Self {
            stream,
            token,
            remote,
            reader: FrameReader::new(max_frame),
            initialized: false,
            registered: None,
            shared: Arc::new(CnxnShared::new(remote)),
        }
    }

    /// One step of the framing state machine.
    pub(crate) fn read_event(&mut self) -> Result<ReadEvent, CnxnError> {
        let recognize_probes = !self.initialized;
        Ok(self.reader.read_from(&mut self.stream, recognize_probes)?)
    }

    /// Interest the selector should carry for this connection right now.
    /// `None` means deregistered.
    pub(crate) fn desired_interest(&self) -> Option<(bool, bool)> {
        let read = self.shared.recv_enabled() && !self.shared.is_closed();
        let write = !self.shared.queue_empty();
        if read || write {
            Some((read, write))
        } else {
            None
        }
    }
}

/// Upward-facing handle to one connection. Cloneable, thread-safe, and inert
/// once the connection has closed. This is all the request pipeline ever
/// holds.
#[derive(Clone)]
pub struct CnxnHandle {
    pub(crate) token: usize,
    pub(crate) shared: Arc<CnxnShared>,
    pub(crate) reactor: Arc<ReactorShared>,
}

impl CnxnHandle {
    pub(crate) fn new(token: usize, shared: Arc<CnxnShared>, reactor: Arc<ReactorShared>) -> Self {
        Self {
            token,
            shared,
            reactor,
        }
    }

    /// Stable identity of this connection, never reused within the process.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn session_id(&self) -> i64 {
        self.shared.session_id()
    }

    /// Assign the session id. Called by the core while establishing or
    /// reopening a session.
    pub fn set_session_id(&self, session_id: i64) {
        self.shared.set_session_id(session_id);
    }

    pub fn session_timeout(&self) -> i32 {
        self.shared.session_timeout()
    }

    pub fn auth_info(&self) -> Vec<Id> {
        self.shared.auth_info_snapshot()
    }

    pub fn add_auth_info(&self, id: Id) {
        self.shared.add_auth_info(id);
    }

    /// Per-connection statistics feed for the pipeline's response path.
    pub fn update_stats_for_response(
        &self,
        cxid: i64,
        zxid: i64,
        op: &str,
        start_ms: u64,
        end_ms: u64,
    ) {
        self.shared
            .stats
            .update_for_response(cxid, zxid, op, start_ms, end_ms);
    }

    fn push(&self, entry: Queued) {
        if self.shared.is_closed() {
            return;
        }
        self.shared.outgoing.lock().unwrap().push_back(entry);
    }

    fn notify(&self) {
        self.reactor.notify_dirty(self.token);
    }

    /// Serialise `<len><header><body?>` and queue it. Responses to
    /// non-internal xids also settle the outstanding-request accounting and
    /// may re-enable read interest if the pipeline has drained.
    pub fn send_response(&self, header: ReplyHeader, body: Option<ResponseBody>) {
        let frame = encode_frame(|buf| {
            header.serialize(buf);
            if let Some(body) = &body {
                body.serialize(buf);
            }
        });
        self.push(Queued::Data(SendBuf::new(frame)));
        if header.xid >= 0 {
            self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.reactor.check_unthrottle(&self.shared);
        }
        self.notify();
    }

    /// Queue the close marker: everything already queued flushes, then the
    /// connection closes.
    pub fn send_close_session(&self) {
        self.push(Queued::CloseMarker);
        self.notify();
    }

    /// Deliver a watch notification. Safe from any thread; interleaves with
    /// normal responses in enqueue order.
    pub fn process(&self, event: WatcherEvent) {
        if trace::enabled(trace::EVENT_DELIVERY_TRACE_MASK) {
            trace_event!(
                session = %format!("0x{:x}", self.session_id()),
                path = %event.path,
                event_type = event.event_type,
                "Deliver event"
            );
        }
        let header = ReplyHeader::new(NOTIFICATION_XID, -1, 0);
        self.send_response(header, Some(ResponseBody::Watcher(event)));
    }

    /// Complete the handshake the connection started. Sends the
    /// `ConnectResponse` (zeroed when the session is invalid), queues the
    /// close marker on an invalid session, and re-enables read interest.
    pub fn finish_session_init(&self, valid: bool) {
        let session_id = self.shared.session_id();
        let timeout = self.shared.session_timeout();
        let passwd = if valid {
            self.reactor
                .server()
                .map(|s| s.session_passwd(session_id))
                .unwrap_or_else(|| vec![0u8; SESSION_PASSWD_LEN])
        } else {
            vec![0u8; SESSION_PASSWD_LEN]
        };
        let rsp = ConnectResponse {
            protocol_version: 0,
            timeout: if valid { timeout } else { 0 },
            session_id: if valid { session_id } else { 0 },
            passwd,
        };
        let frame = encode_frame(|buf| rsp.serialize(buf));
        self.push(Queued::Data(SendBuf::new(frame)));
        if valid {
            info!(
                session = %format!("0x{session_id:x}"),
                timeout_ms = timeout,
                peer = %self.shared.remote,
                "Established session"
            );
        } else {
            info!(
                session = %format!("0x{session_id:x}"),
                peer = %self.shared.remote,
                "Invalid session, probably expired"
            );
            self.push(Queued::CloseMarker);
        }
        // The session is set up; packets may flow again.
        self.shared.set_recv_enabled(true);
        self.notify();
    }
}
