//! CLI + optional TOML file configuration: a `clap::Parser` CLI struct of
//! overrides on top of a `serde`-deserialized file, both falling back to
//! hard defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProducerKind {
    AfPacket,
    Tracepoint,
    TcDoubleBuffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsumerKind {
    Dump,
    TopTalkers,
    Sql,
}

/// Fully resolved configuration: CLI flags merged over an optional TOML
/// file, merged over defaults. This is what `controller::Controller` and
/// every backend/consumer constructor actually reads.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_producer")]
    pub producer: ProducerKind,
    #[serde(default = "default_consumer")]
    pub consumer: ConsumerKind,
    #[serde(default = "default_every_secs")]
    pub every_secs: u64,

    #[serde(default)]
    pub af_packet_iface: Option<String>,
    #[serde(default)]
    pub tracepoint_iface: String,
    #[serde(default = "default_tracepoint_buckets")]
    pub tracepoint_buckets: u32,

    #[serde(default)]
    pub tc_iface: Vec<String>,
    #[serde(default = "default_tc_buckets")]
    pub tc_buckets: u32,
    #[serde(default = "default_ebpfs")]
    pub ebpfs: PathBuf,

    #[serde(default = "default_sqlflows_db")]
    pub sqlflows_db: String,

    #[serde(default)]
    pub topsites_resolve: usize,
    #[serde(default = "default_topsites_n")]
    pub topsites_n: usize,
    #[serde(default)]
    pub topsites_pretty: bool,
    #[serde(default = "default_topsites_header")]
    pub topsites_header: String,

    #[serde(default = "default_showflows_header")]
    pub showflows_header: String,
    #[serde(default = "default_showflows_sorted")]
    pub showflows_sorted: bool,
}

fn default_producer() -> ProducerKind {
    ProducerKind::AfPacket
}
fn default_consumer() -> ConsumerKind {
    ConsumerKind::Dump
}
fn default_every_secs() -> u64 {
    30
}
fn default_tracepoint_buckets() -> u32 {
    flowsnoop_common::DEFAULT_TRACEPOINT_BUCKETS
}
fn default_tc_buckets() -> u32 {
    flowsnoop_common::DEFAULT_TC_BUCKETS
}
fn default_ebpfs() -> PathBuf {
    PathBuf::from("/sys/fs/bpf/flowsnoop")
}
fn default_sqlflows_db() -> String {
    "flowsnoop.db".to_string()
}
fn default_topsites_n() -> usize {
    20
}
fn default_topsites_header() -> String {
    String::new()
}
fn default_showflows_header() -> String {
    String::new()
}
fn default_showflows_sorted() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            producer: default_producer(),
            consumer: default_consumer(),
            every_secs: default_every_secs(),
            af_packet_iface: None,
            tracepoint_iface: "all".to_string(),
            tracepoint_buckets: default_tracepoint_buckets(),
            tc_iface: Vec::new(),
            tc_buckets: default_tc_buckets(),
            ebpfs: default_ebpfs(),
            sqlflows_db: default_sqlflows_db(),
            topsites_resolve: 0,
            topsites_n: default_topsites_n(),
            topsites_pretty: false,
            topsites_header: default_topsites_header(),
            showflows_header: default_showflows_header(),
            showflows_sorted: default_showflows_sorted(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::de::from_str(&contents)?;
        Ok(config)
    }

    pub fn every(&self) -> Duration {
        Duration::from_secs(self.every_secs)
    }
}

/// Command-line overrides, per the external-interfaces CLI table. Every
/// field is optional so that a value left unset falls through to the file
/// config (if `--config` was given) or the hard default.
#[derive(Parser, Debug)]
#[command(name = "flowsnoop", version, about)]
pub struct Cli {
    /// Path to a TOML configuration file (optional).
    #[arg(short, long)]
    pub config: Option<String>,

    #[arg(long, value_enum)]
    pub producer: Option<ProducerKind>,
    #[arg(long, value_enum)]
    pub consumer: Option<ConsumerKind>,
    #[arg(long)]
    pub every: Option<u64>,

    #[arg(long)]
    pub af_packet_iface: Option<String>,
    #[arg(long)]
    pub tracepoint_iface: Option<String>,
    #[arg(long)]
    pub tracepoint_buckets: Option<u32>,

    #[arg(long, value_delimiter = ',')]
    pub tc_iface: Option<Vec<String>>,
    #[arg(long)]
    pub tc_buckets: Option<u32>,
    #[arg(long)]
    pub ebpfs: Option<PathBuf>,

    #[arg(long)]
    pub sqlflows_db: Option<String>,

    #[arg(long)]
    pub topsites_resolve: Option<usize>,
    #[arg(long)]
    pub topsites_n: Option<usize>,
    #[arg(long)]
    pub topsites_pretty: Option<bool>,
    #[arg(long)]
    pub topsites_header: Option<String>,

    #[arg(long)]
    pub showflows_header: Option<String>,
    #[arg(long)]
    pub showflows_sorted: Option<bool>,
}

impl Cli {
    /// Merge CLI overrides over an optional file config, falling back to
    /// defaults for anything neither specifies.
    pub fn resolve(self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_file(path)?,
            None => AppConfig::default(),
        };

        if let Some(v) = self.producer {
            config.producer = v;
        }
        if let Some(v) = self.consumer {
            config.consumer = v;
        }
        if let Some(v) = self.every {
            config.every_secs = v;
        }
        if let Some(v) = self.af_packet_iface {
            config.af_packet_iface = Some(v);
        }
        if let Some(v) = self.tracepoint_iface {
            config.tracepoint_iface = v;
        }
        if let Some(v) = self.tracepoint_buckets {
            config.tracepoint_buckets = v;
        }
        if let Some(v) = self.tc_iface {
            config.tc_iface = v;
        }
        if let Some(v) = self.tc_buckets {
            config.tc_buckets = v;
        }
        if let Some(v) = self.ebpfs {
            config.ebpfs = v;
        }
        if let Some(v) = self.sqlflows_db {
            config.sqlflows_db = v;
        }
        if let Some(v) = self.topsites_resolve {
            config.topsites_resolve = v;
        }
        if let Some(v) = self.topsites_n {
            config.topsites_n = v;
        }
        if let Some(v) = self.topsites_pretty {
            config.topsites_pretty = v;
        }
        if let Some(v) = self.topsites_header {
            config.topsites_header = v;
        }
        if let Some(v) = self.showflows_header {
            config.showflows_header = v;
        }
        if let Some(v) = self.showflows_sorted {
            config.showflows_sorted = v;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.every_secs, 30);
        assert_eq!(cfg.tracepoint_buckets, 1024);
        assert_eq!(cfg.tc_buckets, 10240);
        assert_eq!(cfg.topsites_n, 20);
        assert_eq!(cfg.topsites_resolve, 0);
    }

    #[test]
    fn cli_override_wins_over_default() {
        let cli = Cli {
            config: None,
            producer: Some(ProducerKind::TcDoubleBuffered),
            consumer: None,
            every: Some(5),
            af_packet_iface: None,
            tracepoint_iface: None,
            tracepoint_buckets: None,
            tc_iface: None,
            tc_buckets: None,
            ebpfs: None,
            sqlflows_db: None,
            topsites_resolve: None,
            topsites_n: None,
            topsites_pretty: None,
            topsites_header: None,
            showflows_header: None,
            showflows_sorted: None,
        };
        let resolved = cli.resolve().unwrap();
        assert_eq!(resolved.producer, ProducerKind::TcDoubleBuffered);
        assert_eq!(resolved.every_secs, 5);
    }
}
