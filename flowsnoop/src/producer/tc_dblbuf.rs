//! Kernel aggregator — TC double-buffered variant. The architecturally
//! important backend: two pairs of maps per address family plus a
//! single-entry switch, so a drain never races an in-flight kernel update.
//!
//! Drain protocol, matching the correctness argument in the design:
//! 1. read the current selector `s`
//! 2. write `¬s` into the switch map — the kernel now writes the other side
//! 3. sleep out the quiescence window so in-flight updates on `s` finish
//! 4. iterate-then-delete the now-quiescent side `s`, build the snapshot

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aya::maps::{Array as AyaArray, MapData, PerCpuHashMap as AyaPerCpuHashMap};
use aya::programs::{tc, SchedClassifier, TcAttachType};
use aya::Ebpf;
use chrono::Utc;
use flowsnoop_common::{pin_names, BufferSide, FlowKey4, FlowKey6, QUIESCENCE_MILLIS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::FlushRequest;
use crate::error::ProducerError;
use crate::flow::{FlowSample, Producer, Sample4, Sample6, SampleSource, SharedConsumer, Snapshot};

pub struct TcDblBufProducer {
    ifaces: Vec<String>,
    buckets: u32,
    ebpfs: PathBuf,
    ebpf: Option<Ebpf>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TcDblBufProducer {
    pub fn new(ifaces: Vec<String>, buckets: u32, ebpfs: PathBuf) -> Self {
        Self {
            ifaces,
            buckets,
            ebpfs,
            ebpf: None,
            task: None,
        }
    }
}

#[async_trait]
impl Producer for TcDblBufProducer {
    async fn init(&mut self) -> Result<(), ProducerError> {
        if self.ifaces.is_empty() {
            return Err(ProducerError::Setup(
                "tc-double-buffered requires at least one interface".into(),
            ));
        }

        std::fs::create_dir_all(&self.ebpfs)
            .map_err(|e| ProducerError::Setup(format!("creating {}: {e}", self.ebpfs.display())))?;

        let mut ebpf = Ebpf::load(aya::include_bytes_aligned!(concat!(
            env!("OUT_DIR"),
            "/flowsnoop-ebpf"
        )))
        .map_err(|e| ProducerError::Setup(format!("loading eBPF object: {e}")))?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!(error = %e, "failed to initialize eBPF logger, continuing without it");
        }

        resize_if_needed(&mut ebpf, "FLOWSNOOP_4_0", self.buckets)?;
        resize_if_needed(&mut ebpf, "FLOWSNOOP_4_1", self.buckets)?;
        resize_if_needed(&mut ebpf, "FLOWSNOOP_6_0", self.buckets)?;
        resize_if_needed(&mut ebpf, "FLOWSNOOP_6_1", self.buckets)?;

        pin_map(&mut ebpf, "FLOWSNOOP_SWITCH", &self.ebpfs, pin_names::SWITCH)?;
        pin_map(&mut ebpf, "FLOWSNOOP_4_0", &self.ebpfs, pin_names::V4_A)?;
        pin_map(&mut ebpf, "FLOWSNOOP_4_1", &self.ebpfs, pin_names::V4_B)?;
        pin_map(&mut ebpf, "FLOWSNOOP_6_0", &self.ebpfs, pin_names::V6_A)?;
        pin_map(&mut ebpf, "FLOWSNOOP_6_1", &self.ebpfs, pin_names::V6_B)?;

        {
            let mut switch: AyaArray<_, u32> = ebpf
                .map_mut("FLOWSNOOP_SWITCH")
                .ok_or_else(|| ProducerError::Setup("FLOWSNOOP_SWITCH map missing".into()))?
                .try_into()
                .map_err(|e| ProducerError::Setup(format!("{e}")))?;
            switch
                .set(0, BufferSide::A.as_u32(), 0)
                .map_err(|e| ProducerError::Setup(format!("initializing switch: {e}")))?;
        }

        for iface in &self.ifaces {
            let _ = tc::qdisc_add_clsact(iface);

            let ingress: &mut SchedClassifier = ebpf
                .program_mut("tc_ingress")
                .ok_or_else(|| ProducerError::Setup("tc_ingress program missing".into()))?
                .try_into()
                .map_err(|e| ProducerError::Setup(format!("{e}")))?;
            ingress
                .load()
                .map_err(|e| ProducerError::Setup(format!("loading tc_ingress: {e}")))?;
            ingress
                .attach(iface, TcAttachType::Ingress)
                .map_err(|e| ProducerError::Setup(format!("attaching tc_ingress to {iface}: {e}")))?;

            let egress: &mut SchedClassifier = ebpf
                .program_mut("tc_egress")
                .ok_or_else(|| ProducerError::Setup("tc_egress program missing".into()))?
                .try_into()
                .map_err(|e| ProducerError::Setup(format!("{e}")))?;
            egress
                .load()
                .map_err(|e| ProducerError::Setup(format!("loading tc_egress: {e}")))?;
            egress
                .attach(iface, TcAttachType::Egress)
                .map_err(|e| ProducerError::Setup(format!("attaching tc_egress to {iface}: {e}")))?;
        }

        info!(
            ifaces = ?self.ifaces,
            buckets = self.buckets,
            ebpfs = %self.ebpfs.display(),
            "tc double-buffered producer attached"
        );
        self.ebpf = Some(ebpf);
        Ok(())
    }

    async fn run(
        &mut self,
        consumer: SharedConsumer,
        cancel: CancellationToken,
        mut flush: mpsc::Receiver<FlushRequest>,
    ) {
        let ebpf = self.ebpf.take().expect("run called before init");
        let mut side = BufferSide::A;
        self.task = Some(tokio::spawn(async move {
            let mut ebpf = ebpf;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    req = flush.recv() => {
                        let Some(req) = req else { break };
                        let status = drain_and_push(&mut ebpf, &mut side, &consumer).await;
                        let failed = status.is_err();
                        let _ = req.reply.send(status);
                        if failed {
                            break;
                        }
                    }
                }
            }
        }));
    }

    async fn finalize(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        for iface in &self.ifaces {
            let _ = tc::qdisc_del_clsact(iface);
        }
        for name in [
            pin_names::SWITCH,
            pin_names::V4_A,
            pin_names::V4_B,
            pin_names::V6_A,
            pin_names::V6_B,
        ] {
            let _ = std::fs::remove_file(self.ebpfs.join(name));
        }
    }
}

fn resize_if_needed(ebpf: &mut Ebpf, map_name: &str, buckets: u32) -> Result<(), ProducerError> {
    let map = ebpf
        .map_mut(map_name)
        .ok_or_else(|| ProducerError::Setup(format!("{map_name} map missing")))?;
    if map.info().map(|i| i.max_entries()).unwrap_or(buckets) != buckets {
        map.resize(buckets)
            .map_err(|e| ProducerError::Setup(format!("resizing {map_name}: {e}")))?;
    }
    Ok(())
}

fn pin_map(ebpf: &mut Ebpf, map_name: &str, ebpfs: &Path, pin_name: &str) -> Result<(), ProducerError> {
    let map = ebpf
        .map_mut(map_name)
        .ok_or_else(|| ProducerError::Setup(format!("{map_name} map missing")))?;
    map.pin(ebpfs.join(pin_name))
        .map_err(|e| ProducerError::Setup(format!("pinning {map_name}: {e}")))
}

async fn drain_and_push(
    ebpf: &mut Ebpf,
    side: &mut BufferSide,
    consumer: &SharedConsumer,
) -> Result<(), ProducerError> {
    let drained_side = *side;
    let next_side = drained_side.flipped();

    {
        let mut switch: AyaArray<_, u32> = ebpf
            .map_mut("FLOWSNOOP_SWITCH")
            .ok_or_else(|| ProducerError::KernelMapIo("FLOWSNOOP_SWITCH map missing".into()))?
            .try_into()
            .map_err(|e| ProducerError::KernelMapIo(format!("{e}")))?;
        switch
            .set(0, next_side.as_u32(), 0)
            .map_err(|e| ProducerError::KernelMapIo(format!("flipping switch: {e}")))?;
    }
    *side = next_side;

    tokio::time::sleep(std::time::Duration::from_millis(QUIESCENCE_MILLIS)).await;

    let (v4_name, v6_name) = match drained_side {
        BufferSide::A => ("FLOWSNOOP_4_0", "FLOWSNOOP_6_0"),
        BufferSide::B => ("FLOWSNOOP_4_1", "FLOWSNOOP_6_1"),
    };

    let mut samples = Vec::new();

    let mut map4: AyaPerCpuHashMap<&mut MapData, FlowKey4, u64> = ebpf
        .map_mut(v4_name)
        .ok_or_else(|| ProducerError::KernelMapIo(format!("{v4_name} map missing")))?
        .try_into()
        .map_err(|e| ProducerError::KernelMapIo(format!("{e}")))?;
    let keys4: Vec<FlowKey4> = map4
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProducerError::KernelMapIo(format!("iterating {v4_name}: {e}")))?
        .into_iter()
        .map(|(k, v)| {
            let total: u64 = v.iter().sum();
            samples.push(FlowSample::V4(to_sample4(&k), total));
            k
        })
        .collect();
    for key in keys4 {
        let _ = map4.remove(&key);
    }

    let mut map6: AyaPerCpuHashMap<&mut MapData, FlowKey6, u64> = ebpf
        .map_mut(v6_name)
        .ok_or_else(|| ProducerError::KernelMapIo(format!("{v6_name} map missing")))?
        .try_into()
        .map_err(|e| ProducerError::KernelMapIo(format!("{e}")))?;
    let keys6: Vec<FlowKey6> = map6
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProducerError::KernelMapIo(format!("iterating {v6_name}: {e}")))?
        .into_iter()
        .map(|(k, v)| {
            let total: u64 = v.iter().sum();
            samples.push(FlowSample::V6(to_sample6(&k), total));
            k
        })
        .collect();
    for key in keys6 {
        let _ = map6.remove(&key);
    }

    let snapshot = Snapshot::new(Utc::now(), samples, SampleSource::List);
    consumer
        .lock()
        .await
        .push(&snapshot)
        .await
        .map_err(|e| ProducerError::ConsumerPush(e.to_string()))
}

fn to_sample4(k: &FlowKey4) -> Sample4 {
    Sample4 {
        src_ip: k.src_ip.into(),
        dst_ip: k.dst_ip.into(),
        src_port: k.src_port(),
        dst_port: k.dst_port(),
        proto: k.proto,
    }
}

fn to_sample6(k: &FlowKey6) -> Sample6 {
    Sample6 {
        src_ip: k.src_ip.into(),
        dst_ip: k.dst_ip.into(),
        src_port: k.src_port(),
        dst_port: k.dst_port(),
        proto: k.proto,
    }
}
