//! Engine-wide counters behind `Engine::session_stats`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Snapshot returned to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Sessions currently in the table.
    pub active: usize,
    /// Sessions created since the engine started.
    pub total: u64,
    /// Highest `active` ever observed.
    pub peak: usize,
    /// Bytes given up by ack-fault recovery and record resynchronization.
    pub missed_data: u64,
    /// Bytes currently held in out-of-order queues across all sessions.
    pub reassembly_bytes: usize,
    pub ack_faults: u64,
    pub fatal_sessions: u64,
    pub stale_evictions: u64,
    pub closed_sessions: u64,
    pub decrypted_bytes: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    total: AtomicU64,
    peak: AtomicUsize,
    missed_data: AtomicU64,
    ack_faults: AtomicU64,
    fatal_sessions: AtomicU64,
    stale_evictions: AtomicU64,
    closed_sessions: AtomicU64,
    decrypted_bytes: AtomicU64,
}

impl Stats {
    pub fn session_created(&self, active: usize) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(active, Ordering::Relaxed);
    }

    pub fn ack_fault(&self) {
        self.ack_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn missed(&self, bytes: u64) {
        self.missed_data.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn fatal(&self) {
        self.fatal_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale(&self, count: usize) {
        self.stale_evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn closed(&self) {
        self.closed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrypted(&self, bytes: usize) {
        self.decrypted_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active: usize, reassembly_bytes: usize) -> SessionStats {
        SessionStats {
            active,
            total: self.total.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
            missed_data: self.missed_data.load(Ordering::Relaxed),
            reassembly_bytes,
            ack_faults: self.ack_faults.load(Ordering::Relaxed),
            fatal_sessions: self.fatal_sessions.load(Ordering::Relaxed),
            stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
            closed_sessions: self.closed_sessions.load(Ordering::Relaxed),
            decrypted_bytes: self.decrypted_bytes.load(Ordering::Relaxed),
        }
    }
}
