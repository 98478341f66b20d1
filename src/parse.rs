// TCP-over-IPv4 frame validation and 4-tuple extraction.
//
// Input is a raw Ethernet-II frame as delivered by the capture backend.
// Anything that is not well-formed TCP/IPv4 is simply not ours: every
// rejection is a silent `None`.

// Ethernet
const ETH_HLEN: usize = 14;
const ETHERTYPE_OFFSET: usize = 12;
const ETHERTYPE_IPV4: u16 = 0x0800;

// IPv4
const IPV4_MIN_HLEN: usize = 20;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;
const PROTO_TCP: u8 = 6;

// TCP
const TCP_MIN_HLEN: usize = 20;
const TCP_DOFF_OFFSET: usize = 12;

/// Directional flow identity: `A -> B` and `B -> A` are distinct flows.
///
/// Addresses are stored as the 32-bit value of the on-wire (big-endian)
/// bytes; conversion to dotted-quad happens only at presentation. Ordering
/// is lexicographic over (src_ip, dst_ip, src_port, dst_port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

/// What the flow table needs to know about one validated segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub key: FlowKey,
    /// Whole on-wire frame size, link-layer header included.
    pub frame_bytes: u32,
    /// TCP segment body only.
    pub payload_bytes: u32,
}

/// Validate a raw frame as TCP-over-IPv4 and extract its flow identity.
///
/// Rejects, in order: frames shorter than the minimal header stack,
/// non-IPv4 EtherTypes, version nibbles other than 4, non-TCP protocols,
/// and header-length fields that are undersized or extend past the frame.
pub fn parse_tcp_ipv4(frame: &[u8]) -> Option<TcpSegment> {
    if frame.len() < ETH_HLEN + IPV4_MIN_HLEN + TCP_MIN_HLEN {
        return None;
    }

    let ethertype = u16::from_be_bytes([frame[ETHERTYPE_OFFSET], frame[ETHERTYPE_OFFSET + 1]]);
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }

    let ip = &frame[ETH_HLEN..];
    let version = ip[0] >> 4;
    if version != 4 {
        return None;
    }
    if ip[IPV4_PROTO_OFFSET] != PROTO_TCP {
        return None;
    }

    let ip_header_bytes = ((ip[0] & 0x0F) as usize) * 4;
    if ip_header_bytes < IPV4_MIN_HLEN {
        return None;
    }
    let tcp_start = ETH_HLEN + ip_header_bytes;
    if tcp_start + TCP_MIN_HLEN > frame.len() {
        return None;
    }

    let tcp = &frame[tcp_start..];
    let tcp_header_bytes = ((tcp[TCP_DOFF_OFFSET] >> 4) as usize) * 4;
    if tcp_header_bytes < TCP_MIN_HLEN {
        return None;
    }

    let headers = tcp_start + tcp_header_bytes;
    let payload_bytes = frame.len().checked_sub(headers)?;

    let key = FlowKey {
        src_ip: u32::from_be_bytes([
            ip[IPV4_SRC_OFFSET],
            ip[IPV4_SRC_OFFSET + 1],
            ip[IPV4_SRC_OFFSET + 2],
            ip[IPV4_SRC_OFFSET + 3],
        ]),
        dst_ip: u32::from_be_bytes([
            ip[IPV4_DST_OFFSET],
            ip[IPV4_DST_OFFSET + 1],
            ip[IPV4_DST_OFFSET + 2],
            ip[IPV4_DST_OFFSET + 3],
        ]),
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
    };

    Some(TcpSegment {
        key,
        frame_bytes: frame.len() as u32,
        payload_bytes: payload_bytes as u32,
    })
}

/// Dotted-quad rendering of a stored address. Presentation only.
pub fn ipv4_to_string(ip: u32) -> String {
    let b = ip.to_be_bytes();
    format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
}
