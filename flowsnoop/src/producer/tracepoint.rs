//! Kernel aggregator — tracepoint variant. Attaches to `net/netif_receive_skb`
//! and `net/net_dev_start_xmit`; the kernel program does the 5-tuple
//! accounting, userspace only drains.
//!
//! Drain semantics here are iterate-then-delete: an update landing between
//! the iterate and the delete of its key is lost. This is the documented,
//! accepted limitation the TC double-buffered variant exists to fix.

use async_trait::async_trait;
use aya::maps::PerCpuHashMap as AyaPerCpuHashMap;
use aya::programs::TracePoint;
use aya::Ebpf;
use chrono::Utc;
use flowsnoop_common::{FlowKey4, FlowKey6};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::FlushRequest;
use crate::error::ProducerError;
use crate::flow::{FlowSample, Producer, Sample4, Sample6, SampleSource, SharedConsumer, Snapshot};

pub struct TracepointProducer {
    iface_filter: Vec<String>, // empty means "all"
    buckets: u32,
    ebpf: Option<Ebpf>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TracepointProducer {
    pub fn new(iface: &str, buckets: u32) -> Self {
        let iface_filter = if iface == "all" {
            Vec::new()
        } else {
            iface.split(',').map(str::to_string).collect()
        };
        Self {
            iface_filter,
            buckets,
            ebpf: None,
            task: None,
        }
    }
}

#[async_trait]
impl Producer for TracepointProducer {
    async fn init(&mut self) -> Result<(), ProducerError> {
        let mut ebpf = Ebpf::load(aya::include_bytes_aligned!(concat!(
            env!("OUT_DIR"),
            "/flowsnoop-ebpf"
        )))
        .map_err(|e| ProducerError::Setup(format!("loading eBPF object: {e}")))?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!(error = %e, "failed to initialize eBPF logger, continuing without it");
        }

        let recv: &mut TracePoint = ebpf
            .program_mut("netif_receive_skb")
            .ok_or_else(|| ProducerError::Setup("netif_receive_skb program missing".into()))?
            .try_into()
            .map_err(|e| ProducerError::Setup(format!("{e}")))?;
        recv.load()
            .map_err(|e| ProducerError::Setup(format!("loading netif_receive_skb: {e}")))?;
        recv.attach("net", "netif_receive_skb")
            .map_err(|e| ProducerError::Setup(format!("attaching netif_receive_skb: {e}")))?;

        let xmit: &mut TracePoint = ebpf
            .program_mut("net_dev_start_xmit")
            .ok_or_else(|| ProducerError::Setup("net_dev_start_xmit program missing".into()))?
            .try_into()
            .map_err(|e| ProducerError::Setup(format!("{e}")))?;
        xmit.load()
            .map_err(|e| ProducerError::Setup(format!("loading net_dev_start_xmit: {e}")))?;
        xmit.attach("net", "net_dev_start_xmit")
            .map_err(|e| ProducerError::Setup(format!("attaching net_dev_start_xmit: {e}")))?;

        info!(
            buckets = self.buckets,
            iface_filter = ?self.iface_filter,
            "tracepoint producer attached; drains are lossy between iterate and delete"
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
        self.task = Some(tokio::spawn(async move {
            let mut ebpf = ebpf;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    req = flush.recv() => {
                        let Some(req) = req else { break };
                        let status = drain_and_push(&mut ebpf, &consumer).await;
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
        // Dropping `self.ebpf` (already moved into the task) detaches the
        // tracepoints and unloads the programs.
    }
}

async fn drain_and_push(ebpf: &mut Ebpf, consumer: &SharedConsumer) -> Result<(), ProducerError> {
    let mut samples = Vec::new();

    let mut map4: AyaPerCpuHashMap<_, FlowKey4, u64> = ebpf
        .map_mut("TP_FLOWS_4")
        .ok_or_else(|| ProducerError::KernelMapIo("TP_FLOWS_4 map missing".into()))?
        .try_into()
        .map_err(|e| ProducerError::KernelMapIo(format!("{e}")))?;
    let keys4: Vec<FlowKey4> = map4
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProducerError::KernelMapIo(format!("iterating v4 map: {e}")))?
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

    let mut map6: AyaPerCpuHashMap<_, FlowKey6, u64> = ebpf
        .map_mut("TP_FLOWS_6")
        .ok_or_else(|| ProducerError::KernelMapIo("TP_FLOWS_6 map missing".into()))?
        .try_into()
        .map_err(|e| ProducerError::KernelMapIo(format!("{e}")))?;
    let keys6: Vec<FlowKey6> = map6
        .iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProducerError::KernelMapIo(format!("iterating v6 map: {e}")))?
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
