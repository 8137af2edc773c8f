//! Statistics for the relay

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Relay-wide counters, shared by the coordinator and every router
#[derive(Debug)]
pub struct RelayStats {
    started_at: Instant,
    frames_relayed: AtomicU64,
    frame_bytes_relayed: AtomicU64,
    control_forwarded: AtomicU64,
    delivery_failures: AtomicU64,
    control_grants: AtomicU64,
    control_releases: AtomicU64,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            frames_relayed: AtomicU64::new(0),
            frame_bytes_relayed: AtomicU64::new(0),
            control_forwarded: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            control_grants: AtomicU64::new(0),
            control_releases: AtomicU64::new(0),
        }
    }

    /// One car frame fanned out to `delivered` clients
    pub fn record_frame(&self, len: usize, delivered: usize) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
        self.frame_bytes_relayed
            .fetch_add((len * delivered) as u64, Ordering::Relaxed);
    }

    pub fn record_control(&self) {
        self.control_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failures(&self, count: usize) {
        if count > 0 {
            self.delivery_failures
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn record_grant(&self) {
        self.control_grants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.control_releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            frame_bytes_relayed: self.frame_bytes_relayed.load(Ordering::Relaxed),
            control_forwarded: self.control_forwarded.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            control_grants: self.control_grants.load(Ordering::Relaxed),
            control_releases: self.control_releases.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    /// Car frames received and fanned out
    pub frames_relayed: u64,
    /// Bytes written to clients' frame channels
    pub frame_bytes_relayed: u64,
    /// Control messages forwarded to the car
    pub control_forwarded: u64,
    /// Per-recipient sends that failed or timed out
    pub delivery_failures: u64,
    pub control_grants: u64,
    pub control_releases: u64,
}
