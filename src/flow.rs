// Per-flow counters and the shared flow table.
//
// The table is written by the capture thread and read by the reporter; a
// plain mutex guards it, held only for the duration of a single operation
// and never across I/O.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;

use crate::parse::FlowKey;

/// Wall clock in microseconds since the epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Cumulative statistics for one flow direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// TCP segment bodies only.
    pub payload_bytes: u64,
    pub packet_count: u64,
    /// On-wire frame sizes, all headers included.
    pub total_frame_bytes: u64,
    pub first_seen_us: u64,
    pub last_seen_us: u64,
}

impl FlowStats {
    pub fn update(&mut self, frame_bytes: u32, payload_bytes: u32, ts_us: u64) {
        self.payload_bytes += payload_bytes as u64;
        self.total_frame_bytes += frame_bytes as u64;
        self.packet_count += 1;
        if self.first_seen_us == 0 {
            self.first_seen_us = ts_us;
        }
        self.last_seen_us = ts_us;
    }

    /// Mean on-wire frame size; 0.0 for an empty flow.
    pub fn average_frame_size(&self) -> f64 {
        if self.packet_count == 0 {
            return 0.0;
        }
        self.total_frame_bytes as f64 / self.packet_count as f64
    }

    /// Payload throughput in bytes per second over the whole observed
    /// lifetime of the flow.
    ///
    /// Returns 0.0 for empty flows, a zero-length observation window, or a
    /// `now_us` behind `first_seen_us` (clock stepped backwards).
    pub fn average_speed(&self, now_us: u64) -> f64 {
        if self.packet_count == 0 || self.first_seen_us == 0 {
            return 0.0;
        }
        let duration_us = match now_us.checked_sub(self.first_seen_us) {
            Some(0) | None => return 0.0,
            Some(d) => d,
        };
        self.payload_bytes as f64 / (duration_us as f64 / 1_000_000.0)
    }

    pub fn reset(&mut self) {
        *self = FlowStats::default();
    }
}

/// Concurrent map of flow key to counters.
#[derive(Default)]
pub struct FlowTable {
    flows: Mutex<FxHashMap<FlowKey, FlowStats>>,
}

impl FlowTable {
    pub fn new() -> FlowTable {
        FlowTable::default()
    }

    /// Record one observed segment; inserts the flow on first sight.
    pub fn update(&self, key: FlowKey, frame_bytes: u32, payload_bytes: u32, ts_us: u64) {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        flows
            .entry(key)
            .or_default()
            .update(frame_bytes, payload_bytes, ts_us);
    }

    /// Point-in-time copy of the whole table, usable without the lock.
    pub fn snapshot(&self) -> FxHashMap<FlowKey, FlowStats> {
        let flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        flows.clone()
    }

    /// Drop every flow idle for longer than `idle_us` as of `now_us`.
    pub fn evict_older_than(&self, now_us: u64, idle_us: u64) {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        flows.retain(|_, stats| now_us.saturating_sub(stats.last_seen_us) <= idle_us);
    }

    /// Number of active flows.
    pub fn len(&self) -> usize {
        let flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
