//! The three sinks the controller treats uniformly through the
//! [`crate::flow::Consumer`] trait object.

pub mod dump;
pub mod sqlflows;
pub mod topsites;

use crate::config::{AppConfig, ConsumerKind};
use crate::flow::Consumer;

/// Builds the consumer selected by configuration, wired with that sink's
/// slice of options.
pub fn build(config: &AppConfig) -> Box<dyn Consumer> {
    match config.consumer {
        ConsumerKind::Dump => Box::new(dump::DumpConsumer::new(
            &config.showflows_header,
            config.showflows_sorted,
        )),
        ConsumerKind::TopTalkers => Box::new(topsites::TopSitesConsumer::new(
            config.topsites_resolve,
            config.topsites_n,
            config.topsites_pretty,
            &config.topsites_header,
        )),
        ConsumerKind::Sql => Box::new(sqlflows::SqlFlowsConsumer::new(&config.sqlflows_db)),
    }
}
