//! Diagnostic responders for the four-letter probes.
//!
//! By the time a responder runs, the reactor has removed the connection from
//! the selector and the probing socket is switched to blocking, so each
//! responder is straight-line code: render text through the chunked sink,
//! flush, and let the caller close the socket.

use crate::proto::frame::Probe;
use crate::runtime::connection::{CnxnShared, Connection};
use crate::server::{ServerCore, ServerStats};
use crate::trace;
use mio::net::TcpStream;
use slab::Slab;
use socket2::SockRef;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NOT_SERVING: &str = "This ZooKeeper instance is not currently serving requests";

/// Text accumulates here and is written out in chunks of at least this size,
/// rather than one syscall per line.
const CHUNK_SIZE: usize = 2048;

/// Bound on waiting for the 8-byte trace mask that follows `stmk`.
const STMK_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Chunked text sink over the probing socket.
struct ChunkedWriter<'a> {
    sink: &'a mut TcpStream,
    buf: String,
    error: Option<io::Error>,
}

impl<'a> ChunkedWriter<'a> {
    fn new(sink: &'a mut TcpStream) -> Self {
        Self {
            sink,
            buf: String::new(),
            error: None,
        }
    }

    fn flush_chunk(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if self.error.is_none() {
            if let Err(e) = self.sink.write_all(self.buf.as_bytes()) {
                self.error = Some(e);
            }
        }
        self.buf.clear();
    }

    fn finish(mut self) {
        self.flush_chunk();
        if let Some(e) = self.error {
            info!(error = %e, "Error writing diagnostic response");
        }
    }
}

impl fmt::Write for ChunkedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.push_str(s);
        if self.buf.len() > CHUNK_SIZE {
            self.flush_chunk();
        }
        Ok(())
    }
}

/// Answer one probe on a connection already detached from the selector.
pub(crate) fn respond(
    probe: Probe,
    conn: &mut Connection,
    server: Option<&Arc<dyn ServerCore>>,
    stats: &ServerStats,
    conns: &Slab<Connection>,
) {
    let sref = SockRef::from(&conn.stream);
    if let Err(e) = sref.set_nonblocking(false) {
        warn!(error = %e, "Failed to switch probe socket to blocking");
        return;
    }

    // stmk carries its argument after the token: 8 bytes, big-endian
    let stmk_mask = if probe == Probe::Stmk {
        let _ = sref.set_read_timeout(Some(STMK_READ_TIMEOUT));
        let mut raw = [0u8; 8];
        match conn.stream.read_exact(&mut raw) {
            Ok(()) => Some(i64::from_be_bytes(raw)),
            Err(e) => {
                warn!(error = %e, "Failed to read trace mask argument");
                return;
            }
        }
    } else {
        None
    };

    let self_shared = conn.shared.clone();
    let mut out = ChunkedWriter::new(&mut conn.stream);
    let _ = render(probe, &mut out, stmk_mask, server, stats, conns, &self_shared);
    out.finish();
}

fn render(
    probe: Probe,
    w: &mut dyn fmt::Write,
    stmk_mask: Option<i64>,
    server: Option<&Arc<dyn ServerCore>>,
    stats: &ServerStats,
    conns: &Slab<Connection>,
    self_shared: &CnxnShared,
) -> fmt::Result {
    match probe {
        Probe::Ruok => w.write_str("imok"),

        Probe::Gtmk => write!(w, "{}", trace::mask()),

        Probe::Stmk => match stmk_mask {
            Some(mask) => {
                trace::set_mask(mask);
                write!(w, "{mask}")
            }
            None => Ok(()),
        },

        Probe::Envi => {
            writeln!(w, "Environment:")?;
            for (key, value) in environment() {
                writeln!(w, "{key}={value}")?;
            }
            Ok(())
        }

        Probe::Conf => match server {
            None => writeln!(w, "{NOT_SERVING}"),
            Some(server) => server.dump_conf(w),
        },

        Probe::Srst => match server {
            None => writeln!(w, "{NOT_SERVING}"),
            Some(_) => {
                stats.reset();
                writeln!(w, "Server stats reset.")
            }
        },

        Probe::Crst => match server {
            None => writeln!(w, "{NOT_SERVING}"),
            Some(_) => {
                self_shared.stats.reset();
                for (_, conn) in conns.iter() {
                    conn.shared.stats.reset();
                }
                writeln!(w, "Connection stats reset.")
            }
        },

        Probe::Dump => match server {
            None => writeln!(w, "{NOT_SERVING}"),
            Some(server) => {
                writeln!(w, "SessionTracker dump:")?;
                server.dump_sessions(w)?;
                writeln!(w, "ephemeral nodes dump:")?;
                server.dump_ephemerals(w)
            }
        },

        Probe::Srvr | Probe::Stat => match server {
            None => writeln!(w, "{NOT_SERVING}"),
            Some(server) => {
                writeln!(
                    w,
                    "{} version: {}",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION")
                )?;
                if probe == Probe::Stat {
                    writeln!(w, "Clients:")?;
                    for (_, conn) in conns.iter() {
                        conn.shared.dump_connection_info(w, true, false)?;
                    }
                    self_shared.dump_connection_info(w, true, true)?;
                    writeln!(w)?;
                }
                stats.dump(w)?;
                writeln!(w, "Outstanding: {}", server.in_process())?;
                writeln!(w, "Zxid: 0x{:x}", server.last_zxid())?;
                writeln!(w, "Node count: {}", server.node_count())
            }
        },

        Probe::Cons => match server {
            None => writeln!(w, "{NOT_SERVING}"),
            Some(_) => {
                for (_, conn) in conns.iter() {
                    conn.shared.dump_connection_info(w, false, false)?;
                }
                self_shared.dump_connection_info(w, false, true)?;
                writeln!(w)
            }
        },

        Probe::Wchs => match server {
            None => writeln!(w, "{NOT_SERVING}"),
            Some(server) => {
                server.dump_watch_summary(w)?;
                writeln!(w)
            }
        },

        Probe::Wchp => match server {
            None => writeln!(w, "{NOT_SERVING}"),
            Some(server) => {
                server.dump_watches_by_path(w)?;
                writeln!(w)
            }
        },

        Probe::Wchc => match server {
            None => writeln!(w, "{NOT_SERVING}"),
            Some(server) => {
                server.dump_watches_by_session(w)?;
                writeln!(w)
            }
        },
    }
}

fn environment() -> Vec<(String, String)> {
    let mut env = vec![
        (
            "server.version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        ("os.name".to_string(), std::env::consts::OS.to_string()),
        ("os.arch".to_string(), std::env::consts::ARCH.to_string()),
        (
            "user.name".to_string(),
            std::env::var("USER").unwrap_or_default(),
        ),
    ];
    if let Ok(dir) = std::env::current_dir() {
        env.push(("user.dir".to_string(), dir.display().to_string()));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::CnxnShared;
    use crate::server::Request;
    use crate::CnxnHandle;

    struct StubCore;

    impl ServerCore for StubCore {
        fn submit_request(&self, _req: Request) {}
        fn create_session(&self, _cnxn: CnxnHandle, _passwd: Vec<u8>, _timeout_ms: i32) {}
        fn reopen_session(
            &self,
            _cnxn: CnxnHandle,
            _session_id: i64,
            _passwd: Vec<u8>,
            _timeout_ms: i32,
        ) {
        }
        fn session_passwd(&self, _session_id: i64) -> Vec<u8> {
            vec![0u8; 16]
        }
        fn in_process(&self) -> i32 {
            2
        }
        fn global_outstanding_limit(&self) -> i32 {
            1000
        }
        fn min_session_timeout(&self) -> i32 {
            4000
        }
        fn max_session_timeout(&self) -> i32 {
            40_000
        }
        fn last_zxid(&self) -> i64 {
            0x2a
        }
        fn node_count(&self) -> usize {
            7
        }
        fn remove_connection(&self, _cnxn: &CnxnHandle) {}
        fn dump_conf(&self, w: &mut dyn fmt::Write) -> fmt::Result {
            writeln!(w, "clientPort=2181")
        }
        fn dump_sessions(&self, w: &mut dyn fmt::Write) -> fmt::Result {
            writeln!(w, "Session 0x1f:")
        }
        fn dump_ephemerals(&self, w: &mut dyn fmt::Write) -> fmt::Result {
            writeln!(w, "0x1f:\n\t/locks/a")
        }
        fn dump_watch_summary(&self, w: &mut dyn fmt::Write) -> fmt::Result {
            writeln!(w, "0 connections watching 0 paths")
        }
        fn dump_watches_by_path(&self, w: &mut dyn fmt::Write) -> fmt::Result {
            writeln!(w, "/a\n\t0x1f")
        }
        fn dump_watches_by_session(&self, w: &mut dyn fmt::Write) -> fmt::Result {
            writeln!(w, "0x1f\n\t/a")
        }
    }

    fn render_to_string(probe: Probe, server: Option<&Arc<dyn ServerCore>>) -> String {
        let stats = ServerStats::new();
        let conns = Slab::new();
        let shared = CnxnShared::new("127.0.0.1:5000".parse().unwrap());
        let mut out = String::new();
        render(probe, &mut out, None, server, &stats, &conns, &shared).unwrap();
        out
    }

    #[test]
    fn test_ruok_needs_no_server() {
        assert_eq!(render_to_string(Probe::Ruok, None), "imok");
    }

    #[test]
    fn test_gtmk_prints_decimal_mask() {
        let _guard = trace::TEST_MASK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let out = render_to_string(Probe::Gtmk, None);
        assert_eq!(out, trace::mask().to_string());
    }

    #[test]
    fn test_envi_lists_key_value_pairs() {
        let out = render_to_string(Probe::Envi, None);
        assert!(out.starts_with("Environment:\n"));
        assert!(out.contains("server.version="));
        assert!(out.contains("os.name="));
    }

    #[test]
    fn test_not_serving_responses() {
        for probe in [
            Probe::Conf,
            Probe::Srst,
            Probe::Crst,
            Probe::Dump,
            Probe::Srvr,
            Probe::Stat,
            Probe::Cons,
            Probe::Wchs,
            Probe::Wchp,
            Probe::Wchc,
        ] {
            let out = render_to_string(probe, None);
            assert_eq!(out, format!("{NOT_SERVING}\n"), "probe {}", probe.name());
        }
    }

    #[test]
    fn test_srvr_reports_stats_and_counts() {
        let core: Arc<dyn ServerCore> = Arc::new(StubCore);
        let out = render_to_string(Probe::Srvr, Some(&core));
        assert!(out.contains("version:"));
        assert!(out.contains("Latency min/avg/max: 0/0/0"));
        assert!(out.contains("Outstanding: 2"));
        assert!(out.contains("Zxid: 0x2a"));
        assert!(out.contains("Node count: 7"));
        assert!(!out.contains("Clients:"));
    }

    #[test]
    fn test_stat_additionally_lists_connections() {
        let core: Arc<dyn ServerCore> = Arc::new(StubCore);
        let out = render_to_string(Probe::Stat, Some(&core));
        assert!(out.contains("Clients:"));
        // the probing connection lists itself with no selector interest
        assert!(out.contains(" 127.0.0.1:5000[0]("));
    }

    #[test]
    fn test_dump_sections() {
        let core: Arc<dyn ServerCore> = Arc::new(StubCore);
        let out = render_to_string(Probe::Dump, Some(&core));
        assert!(out.starts_with("SessionTracker dump:\n"));
        assert!(out.contains("ephemeral nodes dump:\n"));
    }

    #[test]
    fn test_stmk_installs_and_echoes_mask() {
        let _guard = trace::TEST_MASK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved = trace::mask();
        let stats = ServerStats::new();
        let conns = Slab::new();
        let shared = CnxnShared::new("127.0.0.1:5000".parse().unwrap());
        let mut out = String::new();
        render(Probe::Stmk, &mut out, Some(4), None, &stats, &conns, &shared).unwrap();
        assert_eq!(out, "4");
        assert_eq!(trace::mask(), 4);
        trace::set_mask(saved);
    }

    #[test]
    fn test_srst_resets_server_stats() {
        let core: Arc<dyn ServerCore> = Arc::new(StubCore);
        let stats = ServerStats::new();
        stats.incr_packets_received();
        let conns = Slab::new();
        let shared = CnxnShared::new("127.0.0.1:5000".parse().unwrap());
        let mut out = String::new();
        render(
            Probe::Srst,
            &mut out,
            None,
            Some(&core),
            &stats,
            &conns,
            &shared,
        )
        .unwrap();
        assert_eq!(out, "Server stats reset.\n");
        assert_eq!(stats.packets_received(), 0);
    }

    #[test]
    fn test_crst_resets_connection_stats() {
        let core: Arc<dyn ServerCore> = Arc::new(StubCore);
        let stats = ServerStats::new();
        let conns = Slab::new();
        let shared = CnxnShared::new("127.0.0.1:5000".parse().unwrap());
        shared.stats.incr_packets_received();
        let mut out = String::new();
        render(
            Probe::Crst,
            &mut out,
            None,
            Some(&core),
            &stats,
            &conns,
            &shared,
        )
        .unwrap();
        assert_eq!(out, "Connection stats reset.\n");
        assert_eq!(shared.stats.packets_received(), 0);
    }
}
