//! Human-readable dump consumer: prints a configurable header, then one
//! line per flow, optionally sorted descending by bytes.

use async_trait::async_trait;

use crate::error::ConsumerError;
use crate::flow::{Consumer, FlowSample, Proto, Snapshot};

/// ANSI clear-screen-and-home, the `\f` escape in the original header
/// substitution.
const CLEAR_HOME: &str = "\x1b[2J\x1b[H";

pub struct DumpConsumer {
    header: String,
    sorted: bool,
}

impl DumpConsumer {
    pub fn new(header: &str, sorted: bool) -> Self {
        Self {
            header: expand_header(header),
            sorted,
        }
    }
}

fn expand_header(raw: &str) -> String {
    raw.replace("\\n", "\n").replace("\\f", CLEAR_HOME)
}

#[async_trait]
impl Consumer for DumpConsumer {
    async fn init(&mut self) -> Result<(), ConsumerError> {
        Ok(())
    }

    async fn push(&mut self, snapshot: &Snapshot) -> Result<(), ConsumerError> {
        if !self.header.is_empty() {
            print!("{}", self.header);
        }

        let mut samples: Vec<&FlowSample> = snapshot.samples.iter().collect();
        if self.sorted {
            samples.sort_by(|a, b| b.bytes().cmp(&a.bytes()));
        }

        for sample in samples {
            match sample {
                FlowSample::V4(s, tot) => println!(
                    "{}:{} -> {}:{}, {}: {}",
                    s.src_ip,
                    s.src_port,
                    s.dst_ip,
                    s.dst_port,
                    Proto(s.proto),
                    tot
                ),
                FlowSample::V6(s, tot) => println!(
                    "{}:{} -> {}:{}, {}: {}",
                    s.src_ip,
                    s.src_port,
                    s.dst_ip,
                    s.dst_port,
                    Proto(s.proto),
                    tot
                ),
            }
        }

        Ok(())
    }

    async fn finalize(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_escapes_are_expanded() {
        let expanded = expand_header("top\\n===\\f");
        assert_eq!(expanded, format!("top\n==={CLEAR_HOME}"));
    }

    #[tokio::test]
    async fn push_accepts_empty_snapshot() {
        let mut consumer = DumpConsumer::new("", true);
        let snapshot = Snapshot::new(
            chrono::Utc::now(),
            Vec::new(),
            crate::flow::SampleSource::List,
        );
        assert!(consumer.push(&snapshot).await.is_ok());
    }
}
