//! Contracts between the network front-end and the request-execution core.
//!
//! The reactor never owns request semantics: it decodes frames and hands
//! [`Request`]s to a [`ServerCore`], which answers back through the
//! [`CnxnHandle`](crate::runtime::CnxnHandle) it was given. A reactor with no
//! core attached is "not serving": probes still answer, handshakes are
//! refused.

use crate::proto::records::Id;
use crate::runtime::CnxnHandle;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A decoded client request on its way to the execution pipeline. The payload
/// is the undecoded record bytes following the request header.
pub struct Request {
    pub cnxn: CnxnHandle,
    pub session_id: i64,
    pub cxid: i32,
    pub rtype: i32,
    pub payload: Bytes,
    pub auth_info: Vec<Id>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("session_id", &format_args!("0x{:x}", self.session_id))
            .field("cxid", &self.cxid)
            .field("rtype", &self.rtype)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// The request-execution side of the server, as seen from the front-end.
///
/// `create_session`/`reopen_session` must eventually call
/// `finish_session_init` on the handle; `submit_request` owns the request
/// from the moment it returns.
pub trait ServerCore: Send + Sync {
    fn submit_request(&self, req: Request);
    fn create_session(&self, cnxn: CnxnHandle, passwd: Vec<u8>, timeout_ms: i32);
    fn reopen_session(&self, cnxn: CnxnHandle, session_id: i64, passwd: Vec<u8>, timeout_ms: i32);
    /// Password to hand back for an established session.
    fn session_passwd(&self, session_id: i64) -> Vec<u8>;

    /// Number of requests currently inside the pipeline.
    fn in_process(&self) -> i32;
    fn global_outstanding_limit(&self) -> i32;
    fn min_session_timeout(&self) -> i32;
    fn max_session_timeout(&self) -> i32;
    /// Largest transaction id the server has processed.
    fn last_zxid(&self) -> i64;
    fn node_count(&self) -> usize;

    /// A connection closed; drop whatever state references it.
    fn remove_connection(&self, cnxn: &CnxnHandle);

    fn dump_conf(&self, w: &mut dyn fmt::Write) -> fmt::Result;
    fn dump_sessions(&self, w: &mut dyn fmt::Write) -> fmt::Result;
    fn dump_ephemerals(&self, w: &mut dyn fmt::Write) -> fmt::Result;
    fn dump_watch_summary(&self, w: &mut dyn fmt::Write) -> fmt::Result;
    fn dump_watches_by_path(&self, w: &mut dyn fmt::Write) -> fmt::Result;
    fn dump_watches_by_session(&self, w: &mut dyn fmt::Write) -> fmt::Result;
}

/// Authentication failure reported by a provider.
#[derive(Debug)]
pub struct AuthError(pub String);

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authentication failed: {}", self.0)
    }
}

impl std::error::Error for AuthError {}

/// A pluggable authentication scheme.
pub trait AuthProvider: Send + Sync {
    fn scheme(&self) -> &str;
    /// Validate the credential bytes, returning the identities they prove.
    fn authenticate(&self, addr: SocketAddr, auth: &[u8]) -> Result<Vec<Id>, AuthError>;
}

/// Scheme-keyed set of [`AuthProvider`]s consulted for `auth` packets.
#[derive(Default)]
pub struct AuthRegistry {
    providers: HashMap<String, Arc<dyn AuthProvider>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn AuthProvider>) {
        self.providers
            .insert(provider.scheme().to_string(), provider);
    }

    pub fn get(&self, scheme: &str) -> Option<&Arc<dyn AuthProvider>> {
        self.providers.get(scheme)
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(|s| s.as_str())
    }
}

#[derive(Debug)]
struct Latency {
    min: u64,
    max: u64,
    total: u64,
    count: u64,
}

impl Latency {
    fn new() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            total: 0,
            count: 0,
        }
    }
}

/// Front-end-owned server-wide counters, rendered by `srvr`/`stat` and reset
/// by `srst`.
#[derive(Debug)]
pub struct ServerStats {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    latency: Mutex<Latency>,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            latency: Mutex::new(Latency::new()),
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

    /// Record one request round-trip, in milliseconds.
    pub fn update_latency(&self, elapsed_ms: u64) {
        let mut l = self.latency.lock().unwrap();
        l.min = l.min.min(elapsed_ms);
        l.max = l.max.max(elapsed_ms);
        l.total += elapsed_ms;
        l.count += 1;
    }

    pub fn min_latency(&self) -> u64 {
        let l = self.latency.lock().unwrap();
        if l.count == 0 {
            0
        } else {
            l.min
        }
    }

    pub fn avg_latency(&self) -> u64 {
        let l = self.latency.lock().unwrap();
        if l.count == 0 {
            0
        } else {
            l.total / l.count
        }
    }

    pub fn max_latency(&self) -> u64 {
        self.latency.lock().unwrap().max
    }

    pub fn reset(&self) {
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        *self.latency.lock().unwrap() = Latency::new();
    }

    /// Text form used by the `srvr` and `stat` probes.
    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            w,
            "Latency min/avg/max: {}/{}/{}",
            self.min_latency(),
            self.avg_latency(),
            self.max_latency()
        )?;
        writeln!(w, "Received: {}", self.packets_received())?;
        writeln!(w, "Sent: {}", self.packets_sent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_aggregation() {
        let stats = ServerStats::new();
        assert_eq!(stats.min_latency(), 0);

        stats.update_latency(4);
        stats.update_latency(10);
        stats.update_latency(1);

        assert_eq!(stats.min_latency(), 1);
        assert_eq!(stats.avg_latency(), 5);
        assert_eq!(stats.max_latency(), 10);

        stats.reset();
        assert_eq!(stats.min_latency(), 0);
        assert_eq!(stats.max_latency(), 0);
    }

    #[test]
    fn test_stats_dump_format() {
        let stats = ServerStats::new();
        stats.incr_packets_received();
        stats.incr_packets_received();
        stats.incr_packets_sent();

        let mut out = String::new();
        stats.dump(&mut out).unwrap();
        assert_eq!(out, "Latency min/avg/max: 0/0/0\nReceived: 2\nSent: 1\n");
    }

    struct NullProvider;

    impl AuthProvider for NullProvider {
        fn scheme(&self) -> &str {
            "null"
        }

        fn authenticate(&self, _addr: SocketAddr, _auth: &[u8]) -> Result<Vec<Id>, AuthError> {
            Ok(vec![Id::new("null", "anyone")])
        }
    }

    #[test]
    fn test_auth_registry_lookup() {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(NullProvider));

        assert!(registry.get("null").is_some());
        assert!(registry.get("digest").is_none());

        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let ids = registry
            .get("null")
            .unwrap()
            .authenticate(addr, b"")
            .unwrap();
        assert_eq!(ids, vec![Id::new("null", "anyone")]);
    }
}
