//! sniproxy/src/metrics.rs
//! Process-wide counters, grounded on the teacher's global `AtomicU64`
//! counters in `state.rs` (`TOTAL_CONN`, `ACTIVE_CONN`, `TOTAL_BYTES_SENT`,
//! `TOTAL_BYTES_RECV`).

use std::sync::atomic::{AtomicU64, Ordering};

pub static TOTAL_CONN: AtomicU64 = AtomicU64::new(0);
pub static ACTIVE_CONN: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_BYTES_SENT: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_BYTES_RECV: AtomicU64 = AtomicU64::new(0);

pub fn connection_accepted() {
    TOTAL_CONN.fetch_add(1, Ordering::Relaxed);
    ACTIVE_CONN.fetch_add(1, Ordering::Relaxed);
}

pub fn connection_closed() {
    ACTIVE_CONN.fetch_sub(1, Ordering::Relaxed);
}

pub fn add_bytes_sent(n: u64) {
    TOTAL_BYTES_SENT.fetch_add(n, Ordering::Relaxed);
}

pub fn add_bytes_recv(n: u64) {
    TOTAL_BYTES_RECV.fetch_add(n, Ordering::Relaxed);
}
