//! Process-wide trace mask.
//!
//! The mask selects which verbose trace events are emitted; it is read and
//! written remotely through the `gtmk`/`stmk` diagnostic probes.

use std::sync::atomic::{AtomicI64, Ordering};

pub const CLIENT_REQUEST_TRACE_MASK: i64 = 1 << 1;
pub const CLIENT_DATA_PACKET_TRACE_MASK: i64 = 1 << 2;
pub const CLIENT_PING_TRACE_MASK: i64 = 1 << 3;
pub const SERVER_PACKET_TRACE_MASK: i64 = 1 << 4;
pub const SESSION_TRACE_MASK: i64 = 1 << 5;
pub const EVENT_DELIVERY_TRACE_MASK: i64 = 1 << 6;
pub const WARNING_TRACE_MASK: i64 = 1 << 8;

const DEFAULT_MASK: i64 = CLIENT_REQUEST_TRACE_MASK
    | SERVER_PACKET_TRACE_MASK
    | SESSION_TRACE_MASK
    | WARNING_TRACE_MASK;

static TRACE_MASK: AtomicI64 = AtomicI64::new(DEFAULT_MASK);

/// Serialises tests that touch the process-wide mask.
#[cfg(test)]
pub(crate) static TEST_MASK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

pub fn mask() -> i64 {
    TRACE_MASK.load(Ordering::Relaxed)
}

pub fn set_mask(mask: i64) {
    TRACE_MASK.store(mask, Ordering::Relaxed);
}

/// True when any bit of `bits` is enabled in the current mask.
pub fn enabled(bits: i64) -> bool {
    mask() & bits != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_query() {
        let _guard = TEST_MASK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved = mask();

        set_mask(EVENT_DELIVERY_TRACE_MASK);
        assert_eq!(mask(), EVENT_DELIVERY_TRACE_MASK);
        assert!(enabled(EVENT_DELIVERY_TRACE_MASK));
        assert!(!enabled(CLIENT_PING_TRACE_MASK));

        set_mask(saved);
    }
}
