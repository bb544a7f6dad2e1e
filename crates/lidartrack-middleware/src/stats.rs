//! Lock-free ingest counters, written by the ingest tasks and read by the
//! monitoring boundary.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use lidartrack_types::{IngestCounters, UnixNanos};

use crate::queue::DropCounter;

/// Wall-clock "now" in Unix nanoseconds.
pub fn now_ns() -> UnixNanos {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct IngestStats {
    packets_received: AtomicU64,
    packets_malformed: AtomicU64,
    frames_assembled: AtomicU64,
    last_packet_ns: AtomicI64,
    packets_dropped: DropCounter,
    frames_dropped: DropCounter,
}

impl IngestStats {
    /// Bind the stats to the drop counters of the packet and frame queues.
    pub fn new(packets_dropped: DropCounter, frames_dropped: DropCounter) -> Self {
        Self {
            packets_dropped,
            frames_dropped,
            ..Self::default()
        }
    }

    pub fn record_packet(&self, at: UnixNanos) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.last_packet_ns.store(at, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) -> u64 {
        self.packets_malformed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_frame(&self) {
        self.frames_assembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_packet_ns(&self) -> UnixNanos {
        self.last_packet_ns.load(Ordering::Relaxed)
    }

    /// `true` when a packet arrived within `window_ns` of `now`.
    pub fn udp_active(&self, now: UnixNanos, window_ns: i64) -> bool {
        let last = self.last_packet_ns();
        last > 0 && now.saturating_sub(last) <= window_ns
    }

    pub fn snapshot(&self) -> IngestCounters {
        IngestCounters {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.get(),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
            frames_assembled: self.frames_assembled.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.get(),
            last_packet_ns: self.last_packet_ns(),
        }
    }
}
