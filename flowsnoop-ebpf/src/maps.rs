use aya_ebpf::{
    macros::map,
    maps::{Array, PerCpuHashMap},
};
use flowsnoop_common::{DEFAULT_TC_BUCKETS, DEFAULT_TRACEPOINT_BUCKETS, FlowKey4, FlowKey6};

/// Per-CPU so the counter update never races: each CPU only ever reads and
/// writes its own slot for a given key, so the get-then-insert accumulation
/// in `bump()` needs no atomic add. Values are summed across CPUs on drain.
///
/// Single hash pair used by the tracepoint backend. No double buffering here
/// — the tracepoint variant accepts losing in-flight counters on drain, per
/// its documented lossy-on-drain contract.
#[map(name = "TP_FLOWS_4")]
pub static TP_FLOWS_4: PerCpuHashMap<FlowKey4, u64> =
    PerCpuHashMap::with_max_entries(DEFAULT_TRACEPOINT_BUCKETS, 0);

#[map(name = "TP_FLOWS_6")]
pub static TP_FLOWS_6: PerCpuHashMap<FlowKey6, u64> =
    PerCpuHashMap::with_max_entries(DEFAULT_TRACEPOINT_BUCKETS, 0);

/// Double-buffered pairs for the TC classifier backend. `SWITCH[0]` selects
/// which side (0 or 1) the classifier programs currently write into;
/// userspace flips it and, after the quiescence window, drains the other
/// side undisturbed.
#[map(name = "FLOWSNOOP_SWITCH")]
pub static SWITCH: Array<u32> = Array::with_max_entries(1, 0);

#[map(name = "FLOWSNOOP_4_0")]
pub static FLOWS_4_0: PerCpuHashMap<FlowKey4, u64> =
    PerCpuHashMap::with_max_entries(DEFAULT_TC_BUCKETS, 0);

#[map(name = "FLOWSNOOP_4_1")]
pub static FLOWS_4_1: PerCpuHashMap<FlowKey4, u64> =
    PerCpuHashMap::with_max_entries(DEFAULT_TC_BUCKETS, 0);

#[map(name = "FLOWSNOOP_6_0")]
pub static FLOWS_6_0: PerCpuHashMap<FlowKey6, u64> =
    PerCpuHashMap::with_max_entries(DEFAULT_TC_BUCKETS, 0);

#[map(name = "FLOWSNOOP_6_1")]
pub static FLOWS_6_1: PerCpuHashMap<FlowKey6, u64> =
    PerCpuHashMap::with_max_entries(DEFAULT_TC_BUCKETS, 0);
