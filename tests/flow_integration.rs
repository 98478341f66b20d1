//! End-to-end tests for the sniffer pipeline: raw frames in, ranked
//! top-flows out. Frames are built by hand; the capture backend is replayed
//! through the same `PacketSource` trait the live pcap source implements.

use std::sync::atomic::AtomicBool;

use trafgen::capture::{run_capture_loop, FrameRef, PacketSource};
use trafgen::error::{Result, TrafgenError};
use trafgen::flow::FlowTable;
use trafgen::parse::{parse_tcp_ipv4, FlowKey};
use trafgen::report::{format_speed, top_flows, TOP_FLOWS};
use trafgen::trace::Tracer;

/// Build an Ethernet-II + IPv4 + TCP frame with minimal headers.
fn tcp_frame(
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: u16,
    dst_port: u16,
    payload: usize,
) -> Vec<u8> {
    let mut frame = vec![0u8; 12]; // MACs, irrelevant to parsing
    frame.extend_from_slice(&0x0800u16.to_be_bytes());

    // IPv4: version 4, IHL 5, protocol TCP.
    frame.push(0x45);
    frame.push(0);
    let total_len = (20 + 20 + payload) as u16;
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0u8; 4]); // id, flags/frag
    frame.push(64); // TTL
    frame.push(6); // TCP
    frame.extend_from_slice(&[0u8; 2]); // checksum
    frame.extend_from_slice(&src_ip);
    frame.extend_from_slice(&dst_ip);

    // TCP: data offset 5.
    frame.extend_from_slice(&src_port.to_be_bytes());
    frame.extend_from_slice(&dst_port.to_be_bytes());
    frame.extend_from_slice(&[0u8; 8]); // seq, ack
    frame.push(5 << 4);
    frame.push(0x10); // ACK
    frame.extend_from_slice(&[0u8; 6]); // window, checksum, urgent

    frame.extend_from_slice(&vec![0xCC; payload]);
    frame
}

// The reference 60-byte frame classifies as TCP/IPv4 with payload 6 and the
// advertised 4-tuple.
#[test]
fn reference_frame_extraction() {
    let frame = tcp_frame([1, 2, 3, 4], [5, 6, 7, 8], 4660, 22136, 6);
    assert_eq!(frame.len(), 60);

    let seg = parse_tcp_ipv4(&frame).expect("frame should classify as TCP/IPv4");
    assert_eq!(seg.key.src_ip, u32::from_be_bytes([1, 2, 3, 4]));
    assert_eq!(seg.key.dst_ip, u32::from_be_bytes([5, 6, 7, 8]));
    assert_eq!(seg.key.src_port, 4660);
    assert_eq!(seg.key.dst_port, 22136);
    assert_eq!(seg.payload_bytes, 60 - 14 - 20 - 20);
}

// Two updates on one key: counters accumulate, averages match the numbers
// worked out by hand.
#[test]
fn flow_aggregation_reference_numbers() {
    let table = FlowTable::new();
    let key = FlowKey {
        src_ip: u32::from_be_bytes([10, 0, 0, 1]),
        dst_ip: u32::from_be_bytes([10, 0, 0, 2]),
        src_port: 1000,
        dst_port: 80,
    };

    table.update(key, 100, 80, 1_000_000);
    table.update(key, 150, 120, 2_000_000);

    let snap = table.snapshot();
    let stats = snap[&key];
    assert_eq!(stats.packet_count, 2);
    assert_eq!(stats.payload_bytes, 200);
    assert_eq!(stats.average_frame_size(), 125.0);

    let speed = stats.average_speed(2_000_000);
    assert!((speed - 200.0).abs() < 1e-9, "speed was {speed}");
}

// A flow idle past the timeout disappears; eviction law holds for the rest.
#[test]
fn idle_flow_evicted() {
    let table = FlowTable::new();
    let key = FlowKey {
        src_ip: 1,
        dst_ip: 2,
        src_port: 3,
        dst_port: 4,
    };
    table.update(key, 100, 80, 1_000_000);

    table.evict_older_than(2_500_000, 1_000_000);
    assert_eq!(table.len(), 0);
}

/// Replays canned frames through the capture loop, then reports drained.
struct ReplaySource {
    frames: Vec<(Vec<u8>, u64)>,
    next: usize,
    current: Option<(Vec<u8>, u64)>,
}

impl ReplaySource {
    fn new(frames: Vec<(Vec<u8>, u64)>) -> Self {
        Self {
            frames,
            next: 0,
            current: None,
        }
    }
}

impl PacketSource for ReplaySource {
    fn interface(&self) -> &str {
        "replay0"
    }

    fn next_frame(&mut self) -> Result<Option<FrameRef<'_>>> {
        if self.next >= self.frames.len() {
            return Err(TrafgenError::Capture("replay drained".to_string()));
        }
        self.current = Some(self.frames[self.next].clone());
        self.next += 1;
        let (data, ts_us) = self.current.as_ref().expect("just set");
        Ok(Some(FrameRef {
            data,
            ts_us: *ts_us,
        }))
    }
}

// Whole pipeline: frames of three flows plus junk go in, the ranking comes
// out sorted by decreasing average speed with junk ignored.
#[test]
fn pipeline_ranks_flows_by_speed() {
    let base = 1_000_000u64;
    let mut frames = Vec::new();

    // Flow A: 4 frames x 1000 payload bytes over 1s -> fastest.
    for i in 0..4u64 {
        frames.push((
            tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5001, 80, 1000),
            base + i * 250_000,
        ));
    }
    // Flow B: 2 frames x 300 payload bytes over 1s.
    for i in 0..2u64 {
        frames.push((
            tcp_frame([10, 0, 0, 3], [10, 0, 0, 4], 5002, 443, 300),
            base + i * 1_000_000,
        ));
    }
    // Flow C: a single tiny frame.
    frames.push((
        tcp_frame([10, 0, 0, 5], [10, 0, 0, 6], 5003, 22, 10),
        base,
    ));
    // Junk: ARP frame and a runt, both ignored.
    let mut arp = vec![0u8; 60];
    arp[12] = 0x08;
    arp[13] = 0x06;
    frames.push((arp, base));
    frames.push((vec![0u8; 20], base));

    let mut source = ReplaySource::new(frames);
    let table = FlowTable::new();
    let flag = AtomicBool::new(false);
    let (_tx, rx) = crossbeam_channel::bounded::<()>(1);
    run_capture_loop(&mut source, &table, &flag, &rx, &Tracer::disabled());

    assert_eq!(table.len(), 3, "junk frames must not create flows");

    let snapshot = table.snapshot();
    let now = base + 2_000_000;
    let ranked = top_flows(&snapshot, now, TOP_FLOWS);

    assert_eq!(ranked.len(), 3);
    assert_eq!(ranked[0].key.src_port, 5001);
    assert_eq!(ranked[1].key.src_port, 5002);
    assert_eq!(ranked[2].key.src_port, 5003);
    for pair in ranked.windows(2) {
        assert!(pair[0].average_speed >= pair[1].average_speed);
    }

    assert_eq!(ranked[0].src_ip, "10.0.0.1");
    assert_eq!(ranked[0].dst_ip, "10.0.0.2");
    assert_eq!(ranked[0].payload_bytes, 4000);
    assert_eq!(ranked[0].packet_count, 4);

    // Speed formatting picks a sensible unit for each row.
    for flow in &ranked {
        let text = format_speed(flow.average_speed);
        assert!(text.ends_with("B/s"), "unexpected unit in {text}");
    }
}
