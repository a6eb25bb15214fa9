use aya_ebpf::{bindings::TC_ACT_PIPE, macros::classifier, programs::TcContext};
use aya_log_ebpf::trace;

use crate::maps::{FLOWS_4_0, FLOWS_4_1, FLOWS_6_0, FLOWS_6_1, SWITCH};
use crate::parse::{ParsedFlow, PacketView, parse_flow};

struct TcView<'a>(&'a TcContext);

impl PacketView for TcView<'_> {
    fn len(&self) -> usize {
        self.0.len() as usize
    }

    fn load_u8(&self, offset: usize) -> Option<u8> {
        self.0.load(offset).ok()
    }
}

#[classifier]
pub fn tc_ingress(ctx: TcContext) -> i32 {
    account(&ctx);
    TC_ACT_PIPE
}

#[classifier]
pub fn tc_egress(ctx: TcContext) -> i32 {
    account(&ctx);
    TC_ACT_PIPE
}

fn account(ctx: &TcContext) {
    let view = TcView(ctx);
    let Some(flow) = parse_flow(&view) else {
        return;
    };
    let len = view.len() as u64;
    trace!(ctx, "accounting {} bytes", len);
    // SAFETY: SWITCH always has exactly one entry, written by userspace
    // before either classifier is attached; 0 is a safe pre-attach default.
    let side = unsafe { SWITCH.get(0).copied().unwrap_or(0) };

    match flow {
        ParsedFlow::V4(key) => {
            let map = if side == 0 { &FLOWS_4_0 } else { &FLOWS_4_1 };
            bump(map, key, len);
        }
        ParsedFlow::V6(key) => {
            let map = if side == 0 { &FLOWS_6_0 } else { &FLOWS_6_1 };
            bump(map, key, len);
        }
    }
}

fn bump<K: aya_ebpf::Pod>(map: &aya_ebpf::maps::PerCpuHashMap<K, u64>, key: K, len: u64) {
    // Per-CPU map: this CPU's slot is never touched by another CPU, so the
    // read-then-insert here can't race and lose an update.
    let prev = unsafe { map.get(&key) }.copied().unwrap_or(0);
    let _ = map.insert(&key, &(prev + len), 0);
}
