// Periodic top-flows view: rank by average speed, render as a table.

use std::io::Write;
use std::sync::Arc;

use crossterm::cursor::MoveTo;
use crossterm::terminal::{Clear, ClearType};
use rustc_hash::FxHashMap;

use crate::flow::{now_micros, FlowStats, FlowTable};
use crate::parse::{ipv4_to_string, FlowKey};
use crate::trace::Tracer;

/// Rows shown per render.
pub const TOP_FLOWS: usize = 10;

/// Idle flows older than this are evicted.
const IDLE_TIMEOUT_SECS: u64 = 60;

/// Minimum spacing between eviction sweeps, independent of the render tick.
const CLEANUP_INTERVAL_SECS: u64 = 30;

/// One row of the rendered ranking, fully resolved for presentation.
#[derive(Debug, Clone)]
pub struct TopFlow {
    pub key: FlowKey,
    pub src_ip: String,
    pub dst_ip: String,
    pub average_speed: f64,
    pub average_frame_size: f64,
    pub payload_bytes: u64,
    pub packet_count: u64,
}

/// Rank a snapshot by decreasing average speed, truncated to `count`.
///
/// `Vec::sort_by` is stable, so equal-speed flows keep their snapshot
/// iteration order between identical inputs.
pub fn top_flows(
    snapshot: &FxHashMap<FlowKey, FlowStats>,
    now_us: u64,
    count: usize,
) -> Vec<TopFlow> {
    let mut flows: Vec<TopFlow> = snapshot
        .iter()
        .map(|(key, stats)| TopFlow {
            key: *key,
            src_ip: ipv4_to_string(key.src_ip),
            dst_ip: ipv4_to_string(key.dst_ip),
            average_speed: stats.average_speed(now_us),
            average_frame_size: stats.average_frame_size(),
            payload_bytes: stats.payload_bytes,
            packet_count: stats.packet_count,
        })
        .collect();

    flows.sort_by(|a, b| {
        b.average_speed
            .partial_cmp(&a.average_speed)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    flows.truncate(count);
    flows
}

/// Human-readable speed with an automatically chosen binary unit.
pub fn format_speed(speed: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    if speed >= GB {
        format!("{:.1} GB/s", speed / GB)
    } else if speed >= MB {
        format!("{:.1} MB/s", speed / MB)
    } else if speed >= KB {
        format!("{:.1} KB/s", speed / KB)
    } else {
        format!("{:.0} B/s", speed)
    }
}

/// Render the ranking: clear screen, header, ruled column row, data rows,
/// footer with the active flow count.
pub fn render(w: &mut impl Write, flows: &[TopFlow], active_flows: usize) -> std::io::Result<()> {
    if flows.is_empty() {
        writeln!(w, "[info] no active TCP flows observed")?;
        return Ok(());
    }

    crossterm::execute!(w, Clear(ClearType::All), MoveTo(0, 0))?;

    writeln!(w, "=== Top {} TCP flows by transfer speed ===", flows.len())?;
    writeln!(w, "{}", "=".repeat(88))?;
    writeln!(
        w,
        "{:<16}{:<8}{:<16}{:<8}{:<12}{:<10}{:<10}{:<8}",
        "Source", "Port", "Destination", "Port", "Speed", "AvgSize", "Bytes", "Packets"
    )?;
    writeln!(w, "{}", "-".repeat(88))?;

    for flow in flows {
        writeln!(
            w,
            "{:<16}{:<8}{:<16}{:<8}{:<12}{:<10.1}{:<10}{:<8}",
            flow.src_ip,
            flow.key.src_port,
            flow.dst_ip,
            flow.key.dst_port,
            format_speed(flow.average_speed),
            flow.average_frame_size,
            flow.payload_bytes,
            flow.packet_count,
        )?;
    }

    writeln!(w, "{}", "=".repeat(88))?;
    writeln!(w, "Active flows: {active_flows}")?;
    writeln!(w, "Press Ctrl-C to stop")?;
    Ok(())
}

/// Drives the 1 Hz render cycle and the slower eviction sweeps.
pub struct Reporter {
    table: Arc<FlowTable>,
    tracer: Tracer,
    last_cleanup_us: u64,
}

impl Reporter {
    pub fn new(table: Arc<FlowTable>, tracer: Tracer) -> Reporter {
        Reporter {
            table,
            tracer,
            last_cleanup_us: 0,
        }
    }

    /// One reporting cycle: sweep if due, snapshot, rank, render.
    pub fn tick(&mut self, w: &mut impl Write) -> std::io::Result<()> {
        let _scope = self.tracer.scope("reporter_tick");
        let now_us = now_micros();
        self.maybe_cleanup(now_us);

        let snapshot = self.table.snapshot();
        let flows = top_flows(&snapshot, now_us, TOP_FLOWS);
        render(w, &flows, snapshot.len())?;
        w.flush()
    }

    fn maybe_cleanup(&mut self, now_us: u64) {
        if now_us.saturating_sub(self.last_cleanup_us) <= CLEANUP_INTERVAL_SECS * 1_000_000 {
            return;
        }
        self.tracer.message("evicting idle flows");
        self.table
            .evict_older_than(now_us, IDLE_TIMEOUT_SECS * 1_000_000);
        self.last_cleanup_us = now_us;
    }
}
