// Packet acquisition behind a narrow trait, so the validation and flow
// accounting pipeline is testable without a live device.
//
// The real backend is libpcap. The capture loop never blocks for long: the
// handle is opened with a 10 ms read timeout and a timeout poll surfaces as
// "no frame", letting the loop observe the shutdown flag between polls.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Receiver;

use crate::error::{Result, TrafgenError};
use crate::flow::FlowTable;
use crate::parse;
use crate::trace::Tracer;

/// One raw frame with its capture timestamp in microseconds.
pub struct FrameRef<'a> {
    pub data: &'a [u8],
    pub ts_us: u64,
}

/// Kernel-level counters from a capture device, when the backend has them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub received: u32,
    pub dropped: u32,
}

/// A blocking "next packet" source assumed to deliver Ethernet-II frames.
pub trait PacketSource {
    /// Interface name this source is bound to.
    fn interface(&self) -> &str;

    /// Next captured frame, or `None` when the poll timed out with nothing
    /// to deliver.
    fn next_frame(&mut self) -> Result<Option<FrameRef<'_>>>;

    /// Capture statistics, if the backend exposes them.
    fn capture_stats(&mut self) -> Option<CaptureStats> {
        None
    }
}

/// Live capture over libpcap with the `tcp and ip` filter installed.
pub struct PcapSource {
    cap: pcap::Capture<pcap::Active>,
    interface: String,
}

impl PcapSource {
    pub fn open(interface: &str) -> Result<PcapSource> {
        let inactive = pcap::Capture::from_device(interface)
            .map_err(|e| TrafgenError::Capture(format!("open {interface}: {e}")))?;
        let mut cap = inactive
            .promisc(true)
            .snaplen(65535)
            .timeout(10)
            .open()
            .map_err(|e| TrafgenError::Capture(format!("activate {interface}: {e}")))?;
        cap.filter("tcp and ip", true)
            .map_err(|e| TrafgenError::Capture(format!("filter on {interface}: {e}")))?;

        log::info!("capturing on {interface}");
        Ok(PcapSource {
            cap,
            interface: interface.to_string(),
        })
    }
}

impl PacketSource for PcapSource {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn next_frame(&mut self) -> Result<Option<FrameRef<'_>>> {
        match self.cap.next_packet() {
            Ok(packet) => {
                let ts_us = packet.header.ts.tv_sec as u64 * 1_000_000
                    + packet.header.ts.tv_usec as u64;
                Ok(Some(FrameRef {
                    data: packet.data,
                    ts_us,
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(TrafgenError::Capture(format!(
                "capture on {}: {e}",
                self.interface
            ))),
        }
    }

    fn capture_stats(&mut self) -> Option<CaptureStats> {
        match self.cap.stats() {
            Ok(stats) => Some(CaptureStats {
                received: stats.received,
                dropped: stats.dropped,
            }),
            Err(e) => {
                log::debug!("capture stats unavailable on {}: {e}", self.interface);
                None
            }
        }
    }
}

/// True once shutdown has been requested via the flag or channel disconnect.
pub fn should_shutdown(flag: &AtomicBool, shutdown: &Receiver<()>) -> bool {
    if flag.load(Ordering::Relaxed) {
        return true;
    }
    match shutdown.try_recv() {
        Ok(()) | Err(crossbeam_channel::TryRecvError::Disconnected) => true,
        Err(crossbeam_channel::TryRecvError::Empty) => false,
    }
}

/// Capture thread body: poll frames, validate, account into the flow table.
///
/// Frames that are not TCP-over-IPv4 are dropped without comment. A capture
/// error ends the loop; the error is logged, not propagated, because the
/// reporter side owns process exit.
pub fn run_capture_loop<S: PacketSource>(
    source: &mut S,
    table: &FlowTable,
    flag: &AtomicBool,
    shutdown: &Receiver<()>,
    tracer: &Tracer,
) {
    let _scope = tracer.scope("capture_loop");
    let mut seen: u64 = 0;
    let mut accounted: u64 = 0;

    loop {
        if should_shutdown(flag, shutdown) {
            break;
        }

        match source.next_frame() {
            Ok(Some(frame)) => {
                seen += 1;
                if let Some(seg) = parse::parse_tcp_ipv4(frame.data) {
                    table.update(seg.key, seg.frame_bytes, seg.payload_bytes, frame.ts_us);
                    accounted += 1;
                }
            }
            Ok(None) => continue,
            Err(e) => {
                log::error!("capture stopped: {e}");
                break;
            }
        }
    }

    if let Some(stats) = source.capture_stats() {
        log::info!(
            "kernel capture stats for {}: {} received, {} dropped",
            source.interface(),
            stats.received,
            stats.dropped
        );
    }
    tracer.message(&format!("captured {seen} frames, accounted {accounted}"));
    log::info!("capture finished: {seen} frames seen, {accounted} accounted");
}
