//! The three interchangeable capture backends the controller treats
//! uniformly through the [`crate::flow::Producer`] trait object.

pub mod afpacket;
pub mod tc_dblbuf;
pub mod tracepoint;

use crate::config::{AppConfig, ProducerKind};
use crate::flow::Producer;

/// Builds the producer selected by configuration, wired with that
/// backend's slice of options.
pub fn build(config: &AppConfig) -> Box<dyn Producer> {
    match config.producer {
        ProducerKind::AfPacket => {
            Box::new(afpacket::AfPacketProducer::new(config.af_packet_iface.clone()))
        }
        ProducerKind::Tracepoint => Box::new(tracepoint::TracepointProducer::new(
            &config.tracepoint_iface,
            config.tracepoint_buckets,
        )),
        ProducerKind::TcDoubleBuffered => Box::new(tc_dblbuf::TcDblBufProducer::new(
            config.tc_iface.clone(),
            config.tc_buckets,
            config.ebpfs.clone(),
        )),
    }
}
