//! Canonical flow keys, aggregated samples, and the producer/consumer
//! contract that every capture backend and sink is built against.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ConsumerError, ProducerError};

/// L4 protocol number, with the symbolic names the dump consumer prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Proto(pub u8);

impl Proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMP6: u8 = 58;
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::ICMP6 => write!(f, "ICMP6"),
            _ => write!(f, "UNKNOWN"),
        }
    }
}

/// IPv4 5-tuple flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sample4 {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

/// IPv6 5-tuple flow key. `proto` carries the IPv6 next-header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sample6 {
    pub src_ip: Ipv6Addr,
    pub dst_ip: Ipv6Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

/// Which representation a producer populated a [`Snapshot`] from. Kept for
/// provenance even though no current consumer branches on it — every
/// producer converges on the `Vec<FlowSample>` form described below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    List,
    Map,
}

/// One annotated flow: a key plus the bytes accumulated for it since the
/// last drain (`Sample4L`/`Sample6L` in the original two-representation
/// design, collapsed into a single sum type — see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSample {
    V4(Sample4, u64),
    V6(Sample6, u64),
}

impl FlowSample {
    pub fn bytes(&self) -> u64 {
        match self {
            FlowSample::V4(_, tot) => *tot,
            FlowSample::V6(_, tot) => *tot,
        }
    }

    pub fn proto(&self) -> u8 {
        match self {
            FlowSample::V4(s, _) => s.proto,
            FlowSample::V6(s, _) => s.proto,
        }
    }
}

/// A timestamped, immutable batch of flow totals delivered to a consumer in
/// a single `Push`. Owned by the consumer for the duration of that call and
/// never retained beyond it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub samples: Vec<FlowSample>,
    pub source: SampleSource,
}

impl Snapshot {
    pub fn new(timestamp: DateTime<Utc>, samples: Vec<FlowSample>, source: SampleSource) -> Self {
        Self {
            timestamp,
            samples,
            source,
        }
    }
}

/// A pluggable capture backend. Implementors own a long-lived capture task
/// started by [`Producer::run`] and must honor the flush rendezvous
/// contract documented on [`crate::controller`].
#[async_trait]
pub trait Producer: Send {
    /// Acquire kernel/interface resources and prime internal state.
    async fn init(&mut self) -> Result<(), ProducerError>;

    /// Start the capture task. Returns once the task has been spawned; the
    /// task itself runs until `cancel` fires, reading flush requests from
    /// `flush` and, for each one, draining its table into a snapshot,
    /// pushing it through `consumer`, and replying on the one-shot channel
    /// the request carries. The task owns `consumer` for the duration of
    /// `Run` — see the design note on back-references in `DESIGN.md`.
    async fn run(
        &mut self,
        consumer: SharedConsumer,
        cancel: tokio_util::sync::CancellationToken,
        flush: tokio::sync::mpsc::Receiver<crate::controller::FlushRequest>,
    );

    /// Block until the capture task has exited and release resources.
    /// Idempotent.
    async fn finalize(&mut self);
}

/// A consumer shared between the controller (which calls `init`/`finalize`)
/// and whichever producer's capture task is currently pushing into it.
pub type SharedConsumer = std::sync::Arc<tokio::sync::Mutex<Box<dyn Consumer>>>;

/// An abstract sink receiving timestamped snapshots.
#[async_trait]
pub trait Consumer: Send {
    /// Prepare the sink (open a file, dial a database, precompute strings).
    async fn init(&mut self) -> Result<(), ConsumerError>;

    /// Receive one snapshot. Must be fast relative to the flush cadence;
    /// slow consumers delay the next tick rather than being dropped.
    async fn push(&mut self, snapshot: &Snapshot) -> Result<(), ConsumerError>;

    /// Flush, close, release.
    async fn finalize(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_display_matches_symbolic_names() {
        assert_eq!(Proto(Proto::ICMP).to_string(), "ICMP");
        assert_eq!(Proto(Proto::TCP).to_string(), "TCP");
        assert_eq!(Proto(Proto::UDP).to_string(), "UDP");
        assert_eq!(Proto(Proto::ICMP6).to_string(), "ICMP6");
        assert_eq!(Proto(253).to_string(), "UNKNOWN");
    }

    #[test]
    fn flow_sample_bytes_and_proto() {
        let s = FlowSample::V4(
            Sample4 {
                src_ip: Ipv4Addr::new(10, 0, 0, 1),
                dst_ip: Ipv4Addr::new(10, 0, 0, 2),
                src_port: 443,
                dst_port: 55555,
                proto: Proto::TCP,
            },
            1000,
        );
        assert_eq!(s.bytes(), 1000);
        assert_eq!(s.proto(), Proto::TCP);
    }
}
