//! Userspace capture backend: a zero-copy AF_PACKET ring, decoded with a
//! small decoding-layer parser (Ethernet/IPv4/IPv6/TCP/UDP) that silently
//! ignores anything it doesn't recognize.

use std::collections::HashMap;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::time::Duration;

use afpacket::sync::RawPacketStream;
use async_trait::async_trait;
use chrono::Utc;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::FlushRequest;
use crate::error::ProducerError;
use crate::flow::{FlowSample, Producer, Sample4, Sample6, SampleSource, SharedConsumer, Snapshot};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const SOCK_TOKEN: Token = Token(0);

/// `None` selects the "any" pseudo-interface: L3 mode, frames start at the
/// network layer. `Some(name)` binds a single named interface: L2 mode,
/// frames carry an Ethernet header.
pub struct AfPacketProducer {
    iface: Option<String>,
    sock: Option<RawPacketStream>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl AfPacketProducer {
    pub fn new(iface: Option<String>) -> Self {
        Self {
            iface,
            sock: None,
            task: None,
        }
    }
}

#[async_trait]
impl Producer for AfPacketProducer {
    async fn init(&mut self) -> Result<(), ProducerError> {
        let mut sock = RawPacketStream::new()
            .map_err(|e| ProducerError::Setup(format!("opening AF_PACKET socket: {e}")))?;
        match &self.iface {
            Some(name) => {
                sock.bind(name)
                    .map_err(|e| ProducerError::Setup(format!("binding to {name}: {e}")))?;
                info!(iface = %name, mode = "l2", "af-packet producer initialized");
            }
            None => {
                sock.bind("any")
                    .map_err(|e| ProducerError::Setup(format!("binding to any: {e}")))?;
                info!(mode = "l3", "af-packet producer initialized on all interfaces");
            }
        }
        sock.set_non_blocking();
        self.sock = Some(sock);
        Ok(())
    }

    async fn run(
        &mut self,
        consumer: SharedConsumer,
        cancel: CancellationToken,
        mut flush: mpsc::Receiver<FlushRequest>,
    ) {
        let sock = self
            .sock
            .take()
            .expect("AfPacketProducer::run called before init");
        let l2_mode = self.iface.is_some();

        self.task = Some(tokio::task::spawn_blocking(move || {
            capture_loop(sock, l2_mode, consumer, cancel, &mut flush);
        }));
    }

    async fn finalize(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

fn capture_loop(
    mut sock: RawPacketStream,
    l2_mode: bool,
    consumer: SharedConsumer,
    cancel: CancellationToken,
    flush: &mut mpsc::Receiver<FlushRequest>,
) {
    let handle = tokio::runtime::Handle::current();
    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to create mio poller, af-packet capture cannot start");
            return;
        }
    };
    let raw_fd = sock.as_raw_fd();
    if poll
        .registry()
        .register(&mut SourceFd(&raw_fd), SOCK_TOKEN, Interest::READABLE)
        .is_err()
    {
        warn!("failed to register af-packet socket with poller");
        return;
    }
    let mut events = Events::with_capacity(16);

    let mut flows4: HashMap<Sample4, u64> = HashMap::new();
    let mut flows6: HashMap<Sample6, u64> = HashMap::new();
    let mut buf = [0u8; 65536];
    let mut stuck: Option<ProducerError> = None;

    while !cancel.is_cancelled() {
        if let Ok(req) = flush.try_recv() {
            let status = match &stuck {
                Some(e) => Err(clone_producer_error(e)),
                None => {
                    let snapshot = drain_snapshot(&mut flows4, &mut flows6);
                    handle.block_on(push_snapshot(&consumer, &snapshot))
                }
            };
            let _ = req.reply.send(status);
            continue;
        }

        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) if events.is_empty() => continue, // timeout, not an error
            Ok(()) => match sock.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    accumulate(&buf[..n], l2_mode, &mut flows4, &mut flows6);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!(error = %e, "af-packet read failed, entering stuck state");
                    stuck = Some(ProducerError::CaptureRead(e.to_string()));
                }
            },
            Err(e) => {
                warn!(error = %e, "af-packet poll failed, entering stuck state");
                stuck = Some(ProducerError::CaptureRead(e.to_string()));
            }
        }
    }
}

fn clone_producer_error(e: &ProducerError) -> ProducerError {
    match e {
        ProducerError::Setup(m) => ProducerError::Setup(m.clone()),
        ProducerError::CaptureRead(m) => ProducerError::CaptureRead(m.clone()),
        ProducerError::KernelMapIo(m) => ProducerError::KernelMapIo(m.clone()),
        ProducerError::Decode(m) => ProducerError::Decode(m.clone()),
        ProducerError::ConsumerPush(m) => ProducerError::ConsumerPush(m.clone()),
    }
}

async fn push_snapshot(consumer: &SharedConsumer, snapshot: &Snapshot) -> Result<(), ProducerError> {
    consumer
        .lock()
        .await
        .push(snapshot)
        .await
        .map_err(|e| ProducerError::ConsumerPush(e.to_string()))
}

fn drain_snapshot(
    flows4: &mut HashMap<Sample4, u64>,
    flows6: &mut HashMap<Sample6, u64>,
) -> Snapshot {
    let mut samples = Vec::with_capacity(flows4.len() + flows6.len());
    for (key, tot) in flows4.drain() {
        samples.push(FlowSample::V4(key, tot));
    }
    for (key, tot) in flows6.drain() {
        samples.push(FlowSample::V6(key, tot));
    }
    Snapshot::new(Utc::now(), samples, SampleSource::Map)
}

fn accumulate(
    frame: &[u8],
    l2_mode: bool,
    flows4: &mut HashMap<Sample4, u64>,
    flows6: &mut HashMap<Sample6, u64>,
) {
    let len = frame.len() as u64;
    if l2_mode {
        let Some(eth) = EthernetPacket::new(frame) else {
            return;
        };
        match eth.get_ethertype() {
            EtherTypes::Ipv4 => accumulate_v4(eth.payload(), len, flows4),
            EtherTypes::Ipv6 => accumulate_v6(eth.payload(), len, flows6),
            _ => {}
        }
    } else {
        // Cooked "any" captures start directly at L3; sniff the IP version
        // nibble the way the kernel's cooked-capture header implies.
        match frame.first().map(|b| b >> 4) {
            Some(4) => accumulate_v4(frame, len, flows4),
            Some(6) => accumulate_v6(frame, len, flows6),
            _ => {}
        }
    }
}

fn accumulate_v4(data: &[u8], len: u64, flows4: &mut HashMap<Sample4, u64>) {
    let Some(ip) = Ipv4Packet::new(data) else {
        return;
    };
    let proto = ip.get_next_level_protocol();
    let (src_port, dst_port) = match proto {
        IpNextHeaderProtocols::Tcp => match TcpPacket::new(ip.payload()) {
            Some(tcp) => (tcp.get_source(), tcp.get_destination()),
            None => return,
        },
        IpNextHeaderProtocols::Udp => match UdpPacket::new(ip.payload()) {
            Some(udp) => (udp.get_source(), udp.get_destination()),
            None => return,
        },
        _ => (0, 0),
    };
    let key = Sample4 {
        src_ip: ip.get_source(),
        dst_ip: ip.get_destination(),
        src_port,
        dst_port,
        proto: proto.0,
    };
    *flows4.entry(key).or_insert(0) += len;
}

/// Hop-by-hop, routing and destination-options extension headers share a
/// `[next header][hdr ext len in 8-byte units, minus one]` layout.
const IPV6_EXT_HOP_BY_HOP: u8 = 0;
const IPV6_EXT_ROUTING: u8 = 43;
const IPV6_EXT_FRAGMENT: u8 = 44;
const IPV6_EXT_DEST_OPTS: u8 = 60;
const IPV6_EXT_AUTH: u8 = 51;

/// Walks past IPv6 extension headers to the real transport header, since
/// `get_next_header()` on the fixed header only names the first one.
fn walk_ipv6_extension_headers(mut next_header: u8, mut payload: &[u8]) -> (u8, &[u8]) {
    loop {
        match next_header {
            IPV6_EXT_HOP_BY_HOP | IPV6_EXT_ROUTING | IPV6_EXT_DEST_OPTS => {
                let Some(&hdr_ext_len) = payload.get(1) else {
                    return (next_header, payload);
                };
                let total_len = (hdr_ext_len as usize + 1) * 8;
                if payload.len() < total_len {
                    return (next_header, payload);
                }
                next_header = payload[0];
                payload = &payload[total_len..];
            }
            IPV6_EXT_FRAGMENT => {
                if payload.len() < 8 {
                    return (next_header, payload);
                }
                next_header = payload[0];
                payload = &payload[8..];
            }
            IPV6_EXT_AUTH => {
                let Some(&hdr_ext_len) = payload.get(1) else {
                    return (next_header, payload);
                };
                let total_len = (hdr_ext_len as usize + 2) * 4;
                if payload.len() < total_len {
                    return (next_header, payload);
                }
                next_header = payload[0];
                payload = &payload[total_len..];
            }
            _ => return (next_header, payload),
        }
    }
}

fn accumulate_v6(data: &[u8], len: u64, flows6: &mut HashMap<Sample6, u64>) {
    let Some(ip) = Ipv6Packet::new(data) else {
        return;
    };
    let (next_header, payload) = walk_ipv6_extension_headers(ip.get_next_header().0, ip.payload());
    let (src_port, dst_port, proto) = match next_header {
        p if p == IpNextHeaderProtocols::Tcp.0 => match TcpPacket::new(payload) {
            Some(tcp) => (tcp.get_source(), tcp.get_destination(), IpNextHeaderProtocols::Tcp.0),
            None => return,
        },
        p if p == IpNextHeaderProtocols::Udp.0 => match UdpPacket::new(payload) {
            Some(udp) => (udp.get_source(), udp.get_destination(), IpNextHeaderProtocols::Udp.0),
            None => return,
        },
        _ => (0, 0, next_header),
    };
    let key = Sample6 {
        src_ip: ip.get_source(),
        dst_ip: ip.get_destination(),
        src_port,
        dst_port,
        proto,
    };
    *flows6.entry(key).or_insert(0) += len;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_v4_tcp_adds_full_frame_length() {
        let mut flows4 = HashMap::new();
        // Minimal IPv4 header (20 bytes, no options) + TCP header (20 bytes).
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x45; // version 4, IHL 5
        pkt[9] = 6; // TCP
        pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
        pkt[16..20].copy_from_slice(&[10, 0, 0, 2]);
        pkt[20..22].copy_from_slice(&443u16.to_be_bytes());
        pkt[22..24].copy_from_slice(&55555u16.to_be_bytes());
        accumulate_v4(&pkt, 100, &mut flows4);
        assert_eq!(flows4.len(), 1);
        let (_, tot) = flows4.iter().next().unwrap();
        assert_eq!(*tot, 100);
    }

    #[test]
    fn accumulate_v6_walks_hop_by_hop_extension_header_to_udp() {
        let mut flows6 = HashMap::new();
        // Fixed IPv6 header (40 bytes) + hop-by-hop ext header (8 bytes,
        // next header = UDP) + UDP header (8 bytes).
        let mut pkt = vec![0u8; 56];
        pkt[0] = 0x60; // version 6
        pkt[6] = IPV6_EXT_HOP_BY_HOP; // next header points at the ext header
        pkt[8..24].copy_from_slice(&[0xfd; 16]);
        pkt[24..40].copy_from_slice(&[0xfe; 16]);
        // Hop-by-hop header: next header = UDP, hdr ext len = 0 (8 bytes total).
        pkt[40] = IpNextHeaderProtocols::Udp.0;
        pkt[41] = 0;
        pkt[48..50].copy_from_slice(&53u16.to_be_bytes());
        pkt[50..52].copy_from_slice(&40000u16.to_be_bytes());

        accumulate_v6(&pkt, 120, &mut flows6);

        assert_eq!(flows6.len(), 1);
        let (key, tot) = flows6.iter().next().unwrap();
        assert_eq!(key.proto, IpNextHeaderProtocols::Udp.0);
        assert_eq!(key.dst_port, 40000);
        assert_eq!(*tot, 120);
    }

    #[test]
    fn accumulate_unknown_ethertype_is_dropped_silently() {
        let mut flows4 = HashMap::new();
        let mut flows6 = HashMap::new();
        let mut frame = vec![0u8; 20];
        frame[12] = 0x88;
        frame[13] = 0xcc; // LLDP, not IP
        accumulate(&frame, true, &mut flows4, &mut flows6);
        assert!(flows4.is_empty());
        assert!(flows6.is_empty());
    }
}
