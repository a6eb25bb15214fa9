use flowsnoop_common::{FlowKey4, FlowKey6};

const ETH_HDR_LEN: usize = 14;
const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86dd;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Bounds-checked byte access over whatever backs a packet: the classifier's
/// linear `data()`/`data_end()` window for the TC backend, or a
/// `bpf_probe_read_kernel`-backed view into `skb->data` for the tracepoint
/// backend. Each `load` must itself verify the read stays in bounds before
/// touching memory, since the verifier can't see through the trait.
pub trait PacketView {
    fn len(&self) -> usize;
    fn load_u8(&self, offset: usize) -> Option<u8>;
    fn load_u16_be(&self, offset: usize) -> Option<u16> {
        let hi = self.load_u8(offset)? as u16;
        let lo = self.load_u8(offset + 1)? as u16;
        Some((hi << 8) | lo)
    }
    fn load_bytes<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.load_u8(offset + i)?;
        }
        Some(out)
    }
}

pub enum ParsedFlow {
    V4(FlowKey4),
    V6(FlowKey6),
}

/// Parses an Ethernet frame down through IPv4/IPv6 to the TCP/UDP port
/// pair, mirroring the decoding-layer parser's `IgnoreUnsupported` stance:
/// anything it doesn't recognize (non-IP ethertypes, non-TCP/UDP transport,
/// IP options/extension headers it doesn't walk) yields `None` rather than
/// an error, and the caller simply drops the packet from accounting.
pub fn parse_flow(pkt: &impl PacketView) -> Option<ParsedFlow> {
    let ethertype = pkt.load_u16_be(12)?;
    match ethertype {
        ETH_P_IP => parse_ipv4(pkt).map(ParsedFlow::V4),
        ETH_P_IPV6 => parse_ipv6(pkt).map(ParsedFlow::V6),
        _ => None,
    }
}

fn parse_ipv4(pkt: &impl PacketView) -> Option<FlowKey4> {
    let base = ETH_HDR_LEN;
    let ver_ihl = pkt.load_u8(base)?;
    if ver_ihl >> 4 != 4 {
        return None;
    }
    let ihl = ((ver_ihl & 0x0f) as usize) * 4;
    if ihl < 20 {
        return None;
    }
    let proto = pkt.load_u8(base + 9)?;
    let src_ip: [u8; 4] = pkt.load_bytes(base + 12)?;
    let dst_ip: [u8; 4] = pkt.load_bytes(base + 16)?;
    let (src_port, dst_port) = parse_ports(pkt, base + ihl, proto)?;
    Some(FlowKey4::new(src_ip, dst_ip, src_port, dst_port, proto))
}

fn parse_ipv6(pkt: &impl PacketView) -> Option<FlowKey6> {
    let base = ETH_HDR_LEN;
    let ver = pkt.load_u8(base)? >> 4;
    if ver != 6 {
        return None;
    }
    let proto = pkt.load_u8(base + 6)?;
    let src_ip: [u8; 16] = pkt.load_bytes(base + 8)?;
    let dst_ip: [u8; 16] = pkt.load_bytes(base + 24)?;
    // Extension header chains are not walked, matching the decoding-layer
    // parser's IgnoreUnsupported behavior for anything but a bare TCP/UDP
    // payload directly after the fixed IPv6 header.
    let (src_port, dst_port) = parse_ports(pkt, base + 40, proto)?;
    Some(FlowKey6::new(src_ip, dst_ip, src_port, dst_port, proto))
}

fn parse_ports(pkt: &impl PacketView, l4_offset: usize, proto: u8) -> Option<(u16, u16)> {
    match proto {
        IPPROTO_TCP | IPPROTO_UDP => {
            let src_port = pkt.load_u16_be(l4_offset)?;
            let dst_port = pkt.load_u16_be(l4_offset + 2)?;
            Some((src_port, dst_port))
        }
        // ICMP/ICMPv6 and anything else carry no port pair; the flow key
        // still records the protocol with ports zeroed.
        _ => Some((0, 0)),
    }
}
