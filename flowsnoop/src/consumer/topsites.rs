//! Top-talker consumer: aggregates by host (not per-flow) across both
//! directions, with optional bounded-concurrency reverse DNS.
//!
//! IPv4 and IPv6 hosts share one ranked list by unifying the key into an
//! IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) for v4 hosts — see the
//! design note on IPv4-in-IPv6 key unification.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hickory_resolver::TokioAsyncResolver;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::ConsumerError;
use crate::flow::{Consumer, FlowSample, Snapshot};

const DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

struct Site {
    from_bytes: u64,
    to_bytes: u64,
    last_seen: DateTime<Utc>,
    resolved: Option<String>,
}

pub struct TopSitesConsumer {
    resolver: Option<Arc<TokioAsyncResolver>>,
    resolve_limit: usize,
    top_n: usize,
    pretty: bool,
    header: String,
    sites: HashMap<Ipv6Addr, Site>,
}

impl TopSitesConsumer {
    pub fn new(resolve_limit: usize, top_n: usize, pretty: bool, header: &str) -> Self {
        Self {
            resolver: None,
            resolve_limit,
            top_n,
            pretty,
            header: header.replace("\\n", "\n"),
            sites: HashMap::new(),
        }
    }
}

fn unify(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn display_host(key: &Ipv6Addr) -> String {
    match key.to_ipv4_mapped() {
        Some(v4) => v4.to_string(),
        None => key.to_string(),
    }
}

fn format_bytes(n: u64, pretty: bool) -> String {
    if !pretty {
        return n.to_string();
    }
    const UNITS: [&str; 4] = ["B", "K", "M", "G"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n}{}", UNITS[0])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[async_trait]
impl Consumer for TopSitesConsumer {
    async fn init(&mut self) -> Result<(), ConsumerError> {
        if self.resolve_limit > 0 {
            match TokioAsyncResolver::tokio_from_system_conf() {
                Ok(resolver) => self.resolver = Some(Arc::new(resolver)),
                Err(e) => {
                    warn!(error = %e, "failed to load system DNS config; resolution disabled for this run");
                }
            }
        }
        Ok(())
    }

    async fn push(&mut self, snapshot: &Snapshot) -> Result<(), ConsumerError> {
        for sample in &snapshot.samples {
            let (src, dst, tot) = match sample {
                FlowSample::V4(s, tot) => (IpAddr::V4(s.src_ip), IpAddr::V4(s.dst_ip), *tot),
                FlowSample::V6(s, tot) => (IpAddr::V6(s.src_ip), IpAddr::V6(s.dst_ip), *tot),
            };
            let src_key = unify(src);
            let dst_key = unify(dst);

            let from = self.sites.entry(src_key).or_insert_with(|| Site {
                from_bytes: 0,
                to_bytes: 0,
                last_seen: snapshot.timestamp,
                resolved: None,
            });
            from.from_bytes += tot;
            from.last_seen = snapshot.timestamp;

            let to = self.sites.entry(dst_key).or_insert_with(|| Site {
                from_bytes: 0,
                to_bytes: 0,
                last_seen: snapshot.timestamp,
                resolved: None,
            });
            to.to_bytes += tot;
            to.last_seen = snapshot.timestamp;
        }

        if self.resolve_limit > 0 {
            self.resolve_unresolved().await;
        }

        if !self.header.is_empty() {
            print!("{}", self.header);
        }

        let mut ranked: Vec<(&Ipv6Addr, &Site)> = self.sites.iter().collect();
        ranked.sort_by(|a, b| (b.1.from_bytes + b.1.to_bytes).cmp(&(a.1.from_bytes + a.1.to_bytes)));
        for (key, site) in ranked.into_iter().take(self.top_n) {
            let name = site.resolved.clone().unwrap_or_else(|| display_host(key));
            println!(
                "{name}\tfrom={}\tto={}",
                format_bytes(site.from_bytes, self.pretty),
                format_bytes(site.to_bytes, self.pretty)
            );
        }

        Ok(())
    }

    async fn finalize(&mut self) {}
}

impl TopSitesConsumer {
    /// Resolves every site without a cached name, bounding concurrency to
    /// `resolve_limit` in-flight lookups at a time — the same
    /// spawn-then-join_next pattern used for batch device reverse DNS.
    async fn resolve_unresolved(&mut self) {
        let Some(resolver) = self.resolver.clone() else {
            return;
        };
        let pending: Vec<Ipv6Addr> = self
            .sites
            .iter()
            .filter(|(_, s)| s.resolved.is_none())
            .map(|(k, _)| *k)
            .collect();
        if pending.is_empty() {
            return;
        }

        let mut join_set: JoinSet<(Ipv6Addr, Option<String>)> = JoinSet::new();
        let mut queue = pending.into_iter();

        for key in queue.by_ref().take(self.resolve_limit) {
            spawn_lookup(&mut join_set, resolver.clone(), key);
        }

        while let Some(result) = join_set.join_next().await {
            let Ok((key, name)) = result else {
                continue;
            };
            if let Some(site) = self.sites.get_mut(&key) {
                site.resolved = Some(name.unwrap_or_else(|| display_host(&key)));
            }
            if let Some(next_key) = queue.next() {
                spawn_lookup(&mut join_set, resolver.clone(), next_key);
            }
        }
    }
}

fn spawn_lookup(
    join_set: &mut JoinSet<(Ipv6Addr, Option<String>)>,
    resolver: Arc<TokioAsyncResolver>,
    key: Ipv6Addr,
) {
    join_set.spawn(async move {
        let addr = key.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(key));
        let name = match tokio::time::timeout(DNS_LOOKUP_TIMEOUT, resolver.reverse_lookup(addr)).await
        {
            Ok(Ok(response)) => response
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string())
                .filter(|name| name != &addr.to_string()),
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "reverse dns lookup failed");
                None
            }
            Err(_) => {
                warn!(%addr, "reverse dns lookup timed out");
                None
            }
        };
        (key, name)
    });
}
