#![cfg_attr(not(any(feature = "user", test)), no_std)]

//! Wire-exact types shared between the `flowsnoop` userspace loader and the
//! `flowsnoop-ebpf` kernel programs.
//!
//! Everything here has to compile both for the host and for the
//! `bpfel-unknown-none` eBPF target, so this crate stays dependency-free
//! except for the optional `aya::Pod` derive pulled in by the `user`
//! feature. Never add a dependency here that doesn't build for `no_std`.

/// Big-endian `[SrcIP || DstIP || SrcPort || DstPort || Proto]`, 13 octets.
///
/// Matches the kernel map key layout byte-for-byte: this struct is read
/// directly out of the eBPF map value by both the kernel program (as a map
/// key) and the userspace loader (as the key type of an `aya::maps::HashMap`
/// view over that same map), so its layout must never change independently
/// on either side.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(aya::Pod))]
pub struct FlowKey4 {
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    src_port_be: [u8; 2],
    dst_port_be: [u8; 2],
    pub proto: u8,
}

impl FlowKey4 {
    pub const LEN: usize = 13;

    pub fn new(src_ip: [u8; 4], dst_ip: [u8; 4], src_port: u16, dst_port: u16, proto: u8) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port_be: src_port.to_be_bytes(),
            dst_port_be: dst_port.to_be_bytes(),
            proto,
        }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.src_port_be)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port_be)
    }

    /// Decode from the 13 raw big-endian octets as they sit in the kernel map.
    pub fn from_bytes(b: &[u8; Self::LEN]) -> Self {
        Self {
            src_ip: [b[0], b[1], b[2], b[3]],
            dst_ip: [b[4], b[5], b[6], b[7]],
            src_port_be: [b[8], b[9]],
            dst_port_be: [b[10], b[11]],
            proto: b[12],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.src_ip);
        out[4..8].copy_from_slice(&self.dst_ip);
        out[8..10].copy_from_slice(&self.src_port_be);
        out[10..12].copy_from_slice(&self.dst_port_be);
        out[12] = self.proto;
        out
    }
}

/// Big-endian `[SrcIP || DstIP || SrcPort || DstPort || Proto]`, 37 octets
/// (16-byte IPv6 addresses in place of `FlowKey4`'s 4-byte IPv4 ones).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(aya::Pod))]
pub struct FlowKey6 {
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    src_port_be: [u8; 2],
    dst_port_be: [u8; 2],
    pub proto: u8,
}

impl FlowKey6 {
    pub const LEN: usize = 37;

    pub fn new(
        src_ip: [u8; 16],
        dst_ip: [u8; 16],
        src_port: u16,
        dst_port: u16,
        proto: u8,
    ) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port_be: src_port.to_be_bytes(),
            dst_port_be: dst_port.to_be_bytes(),
            proto,
        }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.src_port_be)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.dst_port_be)
    }

    pub fn from_bytes(b: &[u8; Self::LEN]) -> Self {
        let mut src_ip = [0u8; 16];
        let mut dst_ip = [0u8; 16];
        src_ip.copy_from_slice(&b[0..16]);
        dst_ip.copy_from_slice(&b[16..32]);
        Self {
            src_ip,
            dst_ip,
            src_port_be: [b[32], b[33]],
            dst_port_be: [b[34], b[35]],
            proto: b[36],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..16].copy_from_slice(&self.src_ip);
        out[16..32].copy_from_slice(&self.dst_ip);
        out[32..34].copy_from_slice(&self.src_port_be);
        out[34..36].copy_from_slice(&self.dst_port_be);
        out[36] = self.proto;
        out
    }
}

/// Selector held in the single-entry `flowsnoop_switch` pinned map: which of
/// the two `{v4,v6}` map pairs the kernel program is currently writing to.
/// Userspace flips this, waits out the quiescence window, then drains the
/// side the kernel just vacated.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferSide {
    A = 0,
    B = 1,
}

impl BufferSide {
    pub fn flipped(self) -> Self {
        match self {
            BufferSide::A => BufferSide::B,
            BufferSide::B => BufferSide::A,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// How long userspace waits after flipping the switch before it is safe to
/// assume no in-flight packet is still writing the old side. Fixed per
/// design note: not worth replacing with RCU-style synchronization.
pub const QUIESCENCE_MILLIS: u64 = 10;

/// Default in-kernel hash map capacity for the tracepoint backend.
pub const DEFAULT_TRACEPOINT_BUCKETS: u32 = 1024;

/// Default per-map capacity for the TC double-buffered backend.
pub const DEFAULT_TC_BUCKETS: u32 = 10240;

/// Pinned-map filesystem names for the TC variant, relative to the
/// configured `ebpfs` bpffs mount point.
pub mod pin_names {
    pub const SWITCH: &str = "flowsnoop_switch";
    pub const V4_A: &str = "flowsnoop_4_0";
    pub const V4_B: &str = "flowsnoop_4_1";
    pub const V6_A: &str = "flowsnoop_6_0";
    pub const V6_B: &str = "flowsnoop_6_1";
}
