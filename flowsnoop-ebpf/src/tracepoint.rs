use aya_ebpf::{
    helpers::bpf_probe_read_kernel,
    macros::tracepoint,
    programs::TracePointContext,
};
use aya_log_ebpf::trace;

use crate::maps::{TP_FLOWS_4, TP_FLOWS_6};
use crate::parse::{ParsedFlow, PacketView, parse_flow};

/// `net/netif_receive_skb` — fires on ingress, once per received `skb`.
/// Offsets below follow the common-format layout of that tracepoint
/// (`common_type`/`common_flags`/`common_preempt_count`/`common_pid`
/// header, then `skbaddr` at offset 8, `len` at offset 16).
const SKBADDR_OFFSET: usize = 8;
const LEN_OFFSET: usize = 16;

/// `skb->head` sits near the front of `struct sk_buff`; `skb->data` is a
/// pointer stored a few words further in. Both offsets are kernel-version
/// dependent in the general case — the same caveat the original bcc-based
/// implementation carried by baking in bcc's generated `struct sk_buff`
/// layout instead of walking BTF.
const SKB_DATA_OFFSET: usize = 0xd0;

/// Bounded by the largest frame we ever need to look past (Ethernet + IPv6
/// + TCP headers); reads past this are simply not attempted.
const MAX_HEADER_LEN: usize = 66;

struct SkbView {
    data_ptr: u64,
    len: u32,
}

impl PacketView for SkbView {
    fn len(&self) -> usize {
        self.len as usize
    }

    fn load_u8(&self, offset: usize) -> Option<u8> {
        if offset >= self.len as usize || offset >= MAX_HEADER_LEN {
            return None;
        }
        unsafe { bpf_probe_read_kernel((self.data_ptr as *const u8).add(offset)).ok() }
    }
}

#[tracepoint]
pub fn netif_receive_skb(ctx: TracePointContext) -> u32 {
    account(&ctx, &TP_FLOWS_4, &TP_FLOWS_6);
    0
}

#[tracepoint]
pub fn net_dev_start_xmit(ctx: TracePointContext) -> u32 {
    account(&ctx, &TP_FLOWS_4, &TP_FLOWS_6);
    0
}

fn account(
    ctx: &TracePointContext,
    flows4: &aya_ebpf::maps::PerCpuHashMap<flowsnoop_common::FlowKey4, u64>,
    flows6: &aya_ebpf::maps::PerCpuHashMap<flowsnoop_common::FlowKey6, u64>,
) {
    let Some(view) = read_skb(ctx) else {
        return;
    };
    let Some(flow) = parse_flow(&view) else {
        return;
    };
    let len = view.len() as u64;
    trace!(ctx, "tracepoint accounting {} bytes", len);

    match flow {
        ParsedFlow::V4(key) => {
            let prev = unsafe { flows4.get(&key) }.copied().unwrap_or(0);
            let _ = flows4.insert(&key, &(prev + len), 0);
        }
        ParsedFlow::V6(key) => {
            let prev = unsafe { flows6.get(&key) }.copied().unwrap_or(0);
            let _ = flows6.insert(&key, &(prev + len), 0);
        }
    }
}

fn read_skb(ctx: &TracePointContext) -> Option<SkbView> {
    let skbaddr: u64 = unsafe { ctx.read_at(SKBADDR_OFFSET).ok()? };
    let len: u32 = unsafe { ctx.read_at(LEN_OFFSET).ok()? };
    let data_ptr: u64 =
        unsafe { bpf_probe_read_kernel((skbaddr + SKB_DATA_OFFSET as u64) as *const u64).ok()? };
    Some(SkbView { data_ptr, len })
}
