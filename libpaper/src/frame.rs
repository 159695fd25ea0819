//! Minimal link-layer decoding: just enough to pull a TCP payload out of a
//! captured Ethernet frame.
use binrw::{io::Cursor, BinRead};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_TCP: u8 = 6;

/// Ethernet II header, with an optional 802.1Q tag.
#[derive(BinRead, Debug)]
#[br(big)]
struct EthernetHeader {
    _dst: [u8; 6],
    _src: [u8; 6],
    ether_type: u16,
    #[br(if(ether_type == ETHERTYPE_VLAN))]
    vlan: Option<VlanTag>,
}

#[derive(BinRead, Debug)]
#[br(big)]
struct VlanTag {
    _tci: u16,
    ether_type: u16,
}

impl EthernetHeader {
    fn payload_type(&self) -> u16 {
        self.vlan.as_ref().map_or(self.ether_type, |v| v.ether_type)
    }
}

/// IPv4 header
///
/// * `u8`: version (high nibble), header length in words (low nibble)
/// * `u8`: DSCP/ECN
/// * `u16`: total length, including this header
/// * `u16`: identification
/// * `u16`: flags (3 bits), fragment offset (13 bits)
/// * `u8`: TTL
/// * `u8`: protocol
/// * `u16`: header checksum
/// * `[u8; 4]`: source, destination
/// * `ihl * 4 - 20` bytes: options
#[derive(BinRead, Debug)]
#[br(big)]
struct Ipv4Header {
    #[br(assert(
        (_version_ihl >> 4) == 4 && (_version_ihl & 0x0f) >= 5,
        "bad IPv4 version/IHL: {:#x}",
        _version_ihl
    ))]
    _version_ihl: u8,
    _dscp_ecn: u8,
    total_length: u16,
    _identification: u16,
    flags_fragment: u16,
    _ttl: u8,
    protocol: u8,
    _checksum: u16,
    _src: [u8; 4],
    _dst: [u8; 4],
    #[br(count = usize::from(_version_ihl & 0x0f) * 4 - 20)]
    _options: Vec<u8>,
}

/// Fixed IPv6 header. Extension headers are not followed.
#[derive(BinRead, Debug)]
#[br(big)]
struct Ipv6Header {
    #[br(assert((_version_class_flow >> 28) == 6, "bad IPv6 version"))]
    _version_class_flow: u32,
    payload_length: u16,
    next_header: u8,
    _hop_limit: u8,
    _src: [u8; 16],
    _dst: [u8; 16],
}

#[derive(BinRead, Debug)]
#[br(big)]
struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    _seq: u32,
    _ack: u32,
    #[br(assert((_offset_flags >> 12) >= 5, "bad TCP data offset"))]
    _offset_flags: u16,
    _window: u16,
    _checksum: u16,
    _urgent: u16,
    #[br(count = usize::from(_offset_flags >> 12) * 4 - 20)]
    _options: Vec<u8>,
}

/// Returns the TCP payload of `frame` if it is a TCP segment to or from
/// `port`.
///
/// The payload is bounded by the IP length field so that Ethernet padding
/// is not included. Non-initial IPv4 fragments are skipped.
pub fn tcp_payload(frame: &[u8], port: u16) -> Option<&[u8]> {
    let mut r = Cursor::new(frame);
    let eth = EthernetHeader::read(&mut r).ok()?;
    let ip_start = r.position() as usize;

    let (protocol, ip_end) = match eth.payload_type() {
        ETHERTYPE_IPV4 => {
            let ip = Ipv4Header::read(&mut r).ok()?;
            if ip.flags_fragment & 0x1fff != 0 {
                return None;
            }
            // Segmentation offload can leave the length zeroed on outbound frames
            let end = match ip.total_length {
                0 => frame.len(),
                n => ip_start + usize::from(n),
            };
            (ip.protocol, end)
        }
        ETHERTYPE_IPV6 => {
            let ip = Ipv6Header::read(&mut r).ok()?;
            (ip.next_header, r.position() as usize + usize::from(ip.payload_length))
        }
        _ => return None,
    };
    if protocol != IPPROTO_TCP {
        return None;
    }

    let tcp = TcpHeader::read(&mut r).ok()?;
    if tcp.src_port != port && tcp.dst_port != port {
        return None;
    }
    let start = r.position() as usize;
    frame.get(start..ip_end.min(frame.len()))
}
