// src/core/aggregator.rs

//! Folds raw adapter output into the canonical asset graph of one job.
//!
//! Every merge is keyed on a canonical identity and combines attributes with
//! commutative rules (set union, minimum timestamp, maximum severity), so the
//! resulting graph does not depend on the order adapters complete in, and
//! replaying the same output is a no-op.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::adapter::{RawFinding, RawItem, RawService};
use crate::core::models::{
    AssetGraph, Finding, Host, Phase, Service, TARGET_SOURCE, Transport, in_zone, normalize_hostname,
};

type ServiceKey = (String, u16, Transport);

/// Counters describing what one merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    pub rejected: usize,
}

impl MergeStats {
    fn absorb(&mut self, other: MergeStats) {
        self.added += other.added;
        self.updated += other.updated;
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upsert {
    Added,
    Updated,
    Unchanged,
    Rejected,
}

impl From<Upsert> for MergeStats {
    fn from(value: Upsert) -> Self {
        match value {
            Upsert::Added => MergeStats { added: 1, ..Default::default() },
            Upsert::Updated => MergeStats { updated: 1, ..Default::default() },
            Upsert::Unchanged => MergeStats::default(),
            Upsert::Rejected => MergeStats { rejected: 1, ..Default::default() },
        }
    }
}

/// Single-writer owner of a job's assets.
#[derive(Debug, Clone)]
pub struct Aggregator {
    target: String,
    hosts: BTreeMap<String, Host>,
    services: BTreeMap<ServiceKey, Service>,
    findings: BTreeMap<String, Finding>,
}

impl Aggregator {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            hosts: BTreeMap::new(),
            services: BTreeMap::new(),
            findings: BTreeMap::new(),
        }
    }

    /// Rebuilds the engine from a checkpointed graph.
    pub fn from_graph(target: &str, graph: AssetGraph) -> Self {
        let mut aggregator = Self::new(target);
        for host in graph.hosts {
            aggregator.hosts.insert(host.name.clone(), host);
        }
        for service in graph.services {
            aggregator.services.insert((service.host.clone(), service.port, service.transport), service);
        }
        for finding in graph.findings {
            aggregator.findings.insert(finding.id.to_string(), finding);
        }
        aggregator
    }

    /// Makes sure the target itself is part of the host set.
    pub fn seed_target(&mut self, at: DateTime<Utc>) {
        let target = self.target.clone();
        self.upsert_host(&target, TARGET_SOURCE, at);
    }

    /// Merges one adapter's output collected during `phase`.
    pub fn merge(&mut self, phase: Phase, source: &str, items: &[RawItem], at: DateTime<Utc>) -> MergeStats {
        let mut stats = MergeStats::default();
        for item in items {
            let result = match item {
                RawItem::Hostname(raw) if phase == Phase::Discovery => self.upsert_host(raw, source, at),
                RawItem::Hostname(raw) => {
                    trace!(host = %raw, phase = %phase, "Host identity is frozen after discovery.");
                    Upsert::Rejected
                }
                RawItem::Service(raw) => {
                    self.imply_host(phase, &raw.host, source, at);
                    self.upsert_service(raw, source)
                }
                RawItem::Finding(raw) => {
                    self.imply_host(phase, &raw.host, source, at);
                    self.upsert_finding(raw, source, at)
                }
            };
            stats.absorb(result.into());
        }
        debug!(
            source,
            phase = %phase,
            added = stats.added,
            updated = stats.updated,
            rejected = stats.rejected,
            "Merged adapter output."
        );
        stats
    }

    fn upsert_host(&mut self, raw: &str, source: &str, at: DateTime<Utc>) -> Upsert {
        let Some(name) = normalize_hostname(raw) else {
            trace!(host = %raw, "Rejected invalid hostname.");
            return Upsert::Rejected;
        };
        if !in_zone(&name, &self.target) {
            trace!(host = %name, target = %self.target, "Rejected out-of-zone hostname.");
            return Upsert::Rejected;
        }
        match self.hosts.get_mut(&name) {
            Some(host) => {
                let inserted = host.sources.insert(source.to_string());
                let earlier = at < host.first_seen;
                if earlier {
                    host.first_seen = at;
                }
                if inserted || earlier { Upsert::Updated } else { Upsert::Unchanged }
            }
            None => {
                self.hosts.insert(
                    name.clone(),
                    Host { name, sources: BTreeSet::from([source.to_string()]), first_seen: at },
                );
                Upsert::Added
            }
        }
    }

    /// During discovery a service or finding also names its host, so the host
    /// is upserted first and sibling order cannot decide whether it is accepted.
    fn imply_host(&mut self, phase: Phase, raw: &str, source: &str, at: DateTime<Utc>) {
        if phase == Phase::Discovery {
            self.upsert_host(raw, source, at);
        }
    }

    fn upsert_service(&mut self, raw: &RawService, source: &str) -> Upsert {
        let Some(host) = normalize_hostname(&raw.host).filter(|h| self.hosts.contains_key(h)) else {
            trace!(host = %raw.host, port = raw.port, "Rejected service on unknown host.");
            return Upsert::Rejected;
        };
        if raw.port == 0 {
            return Upsert::Rejected;
        }
        let name = non_empty(raw.name.as_deref());
        let version = non_empty(raw.version.as_deref());

        let key = (host.clone(), raw.port, raw.transport);
        match self.services.get_mut(&key) {
            Some(service) => {
                let mut changed = service.sources.insert(source.to_string());
                if richer(service.name.as_deref(), name.as_deref()) {
                    service.name = name;
                    changed = true;
                }
                if richer(service.version.as_deref(), version.as_deref()) {
                    service.version = version;
                    changed = true;
                }
                if changed { Upsert::Updated } else { Upsert::Unchanged }
            }
            None => {
                self.services.insert(
                    key,
                    Service {
                        host,
                        port: raw.port,
                        transport: raw.transport,
                        name,
                        version,
                        sources: BTreeSet::from([source.to_string()]),
                    },
                );
                Upsert::Added
            }
        }
    }

    fn upsert_finding(&mut self, raw: &RawFinding, source: &str, at: DateTime<Utc>) -> Upsert {
        let Some(host) = normalize_hostname(&raw.host).filter(|h| self.hosts.contains_key(h)) else {
            trace!(host = %raw.host, "Rejected finding on unknown host.");
            return Upsert::Rejected;
        };
        let category = raw.category.trim().to_ascii_lowercase();
        let fingerprint = non_empty(raw.fingerprint.as_deref());
        let service_key = match raw.port {
            Some(port) => format!("{port}/{}", raw.transport.unwrap_or(Transport::Tcp)),
            None => "-".to_string(),
        };
        // With a fingerprint the identity is tool-agnostic; without one it stays per adapter.
        let key = match &fingerprint {
            Some(fp) => format!("fp|{host}|{service_key}|{category}|{fp}"),
            None => format!("src|{source}|{host}|{service_key}|{category}|{}", raw.description.trim()),
        };
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
        let title = non_empty(Some(raw.title.as_str())).unwrap_or_else(|| category.clone());
        let description = raw.description.trim().to_string();

        match self.findings.get_mut(&id.to_string()) {
            Some(finding) => {
                let mut changed = finding.sources.insert(source.to_string());
                if raw.severity > finding.severity {
                    finding.severity = raw.severity;
                    changed = true;
                }
                if at < finding.detected_at {
                    finding.detected_at = at;
                    changed = true;
                }
                if preferred(&finding.title, &title) {
                    finding.title = title;
                    changed = true;
                }
                if preferred(&finding.description, &description) {
                    finding.description = description;
                    changed = true;
                }
                if changed { Upsert::Updated } else { Upsert::Unchanged }
            }
            None => {
                self.findings.insert(
                    id.to_string(),
                    Finding {
                        id,
                        host,
                        port: raw.port,
                        transport: raw.port.map(|_| raw.transport.unwrap_or(Transport::Tcp)),
                        severity: raw.severity,
                        category,
                        title,
                        description,
                        fingerprint,
                        sources: BTreeSet::from([source.to_string()]),
                        detected_at: at,
                    },
                );
                Upsert::Added
            }
        }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn finding_count(&self) -> usize {
        self.findings.len()
    }

    /// A by-value copy of the current graph.
    pub fn graph(&self) -> AssetGraph {
        let mut findings: Vec<Finding> = self.findings.values().cloned().collect();
        findings.sort_by(|a, b| {
            (&a.host, a.port, &a.category, a.id).cmp(&(&b.host, b.port, &b.category, b.id))
        });
        AssetGraph {
            hosts: self.hosts.values().cloned().collect(),
            services: self.services.values().cloned().collect(),
            findings,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(String::from)
}

/// Whether `candidate` should replace `current`: anything beats nothing,
/// then [`preferred`] decides.
fn richer(current: Option<&str>, candidate: Option<&str>) -> bool {
    match (current, candidate) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(cur), Some(new)) => preferred(cur, new),
    }
}

/// Longer text wins; equal lengths go to the lexicographically smaller one.
/// This is a total order, so the survivor is the same whatever the merge order.
fn preferred(current: &str, candidate: &str) -> bool {
    (candidate.len(), std::cmp::Reverse(candidate)) > (current.len(), std::cmp::Reverse(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::Severity;

    fn hostnames(names: &[&str]) -> Vec<RawItem> {
        names.iter().map(|n| RawItem::Hostname(n.to_string())).collect()
    }

    fn service(host: &str, port: u16, version: Option<&str>) -> RawItem {
        RawItem::Service(RawService {
            host: host.to_string(),
            port,
            transport: Transport::Tcp,
            name: Some("http".to_string()),
            version: version.map(String::from),
        })
    }

    fn finding(host: &str, fingerprint: Option<&str>, severity: Severity) -> RawItem {
        RawItem::Finding(RawFinding {
            host: host.to_string(),
            port: Some(443),
            transport: Some(Transport::Tcp),
            severity,
            category: "Missing Security Header".to_string(),
            title: "HSTS missing".to_string(),
            description: "Strict-Transport-Security header missing".to_string(),
            fingerprint: fingerprint.map(String::from),
        })
    }

    fn names(graph: &AssetGraph) -> Vec<&str> {
        graph.host_names().collect()
    }

    #[test]
    fn deduplicates_hosts_across_adapters() {
        let now = Utc::now();
        let mut agg = Aggregator::new("example.com");
        agg.merge(Phase::Discovery, "a", &hostnames(&["www.example.com", "EXAMPLE.com.", "api.example.com"]), now);
        agg.merge(Phase::Discovery, "b", &hostnames(&["www.example.com", "mail.example.com"]), now);

        let graph = agg.graph();
        assert_eq!(names(&graph), vec!["api.example.com", "example.com", "mail.example.com", "www.example.com"]);
        let www = graph.hosts.iter().find(|h| h.name == "www.example.com").unwrap();
        assert_eq!(www.sources, BTreeSet::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn merge_order_does_not_matter() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(5);
        let batches: Vec<(&str, Vec<RawItem>, DateTime<Utc>)> = vec![
            ("a", hostnames(&["www.example.com", "api.example.com"]), t1),
            ("b", hostnames(&["WWW.example.com.", "mail.example.com"]), t2),
            ("c", hostnames(&["mail.example.com", "*.dev.example.com"]), t1),
        ];
        let mut forward = Aggregator::new("example.com");
        for (src, items, at) in &batches {
            forward.merge(Phase::Discovery, src, items, *at);
        }
        let mut backward = Aggregator::new("example.com");
        for (src, items, at) in batches.iter().rev() {
            backward.merge(Phase::Discovery, src, items, *at);
        }
        assert_eq!(forward.graph(), backward.graph());
    }

    const ORDERS: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

    fn merged_in_every_order(phase: Phase, batches: &[(&str, Vec<RawItem>, DateTime<Utc>); 3]) -> Vec<AssetGraph> {
        ORDERS
            .iter()
            .map(|order| {
                let mut agg = Aggregator::new("example.com");
                agg.seed_target(batches[0].2);
                for &i in order {
                    let (src, items, at) = &batches[i];
                    agg.merge(phase, src, items, *at);
                }
                agg.graph()
            })
            .collect()
    }

    fn titled(title: &str, description: &str, severity: Severity) -> RawItem {
        RawItem::Finding(RawFinding {
            host: "example.com".to_string(),
            port: Some(443),
            transport: Some(Transport::Tcp),
            severity,
            category: "missing security header".to_string(),
            title: title.to_string(),
            description: description.to_string(),
            fingerprint: Some("missing-header:hsts".to_string()),
        })
    }

    #[test]
    fn folded_finding_text_does_not_depend_on_order() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(3);
        let batches = [
            ("a", vec![titled("HSTS missing", "from tool a", Severity::Low)], t2),
            ("b", vec![titled("Strict-Transport-Security absent", "tool b says so", Severity::Medium)], t1),
            ("c", vec![titled("", "", Severity::Low)], t2),
        ];
        let graphs = merged_in_every_order(Phase::VulnScanning, &batches);
        assert!(graphs.windows(2).all(|w| w[0] == w[1]));

        let finding = &graphs[0].findings[0];
        assert_eq!(graphs[0].findings.len(), 1);
        assert_eq!(finding.title, "Strict-Transport-Security absent");
        assert_eq!(finding.description, "tool b says so");
        assert_eq!(finding.severity, Severity::Medium);
        assert_eq!(finding.detected_at, t1);
    }

    #[test]
    fn services_and_findings_merge_the_same_in_every_order() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(7);
        let tied = |host: &str, version: &str| {
            RawItem::Service(RawService {
                host: host.to_string(),
                port: 80,
                transport: Transport::Tcp,
                name: None,
                version: Some(version.to_string()),
            })
        };
        let batches = [
            (
                "a",
                vec![service("example.com", 80, None), tied("www.example.com", "nginx 1.25"), titled("t", "d1", Severity::Low)],
                t2,
            ),
            (
                "b",
                vec![tied("example.com", "apache 2.4"), finding("www.example.com", None, Severity::High)],
                t1,
            ),
            (
                "c",
                vec![tied("example.com", "nginx 1.25"), tied("www.example.com", "apache 2.4"), titled("x", "d2", Severity::Info)],
                t2,
            ),
        ];
        for phase in [Phase::Discovery, Phase::PortScanning, Phase::VulnScanning] {
            let graphs = merged_in_every_order(phase, &batches);
            assert!(graphs.windows(2).all(|w| w[0] == w[1]), "order-dependent merge in {phase}");
        }

        let graph = &merged_in_every_order(Phase::PortScanning, &batches)[0];
        assert_eq!(graph.services.len(), 1);
        assert_eq!(graph.services[0].version.as_deref(), Some("apache 2.4"));
        assert_eq!(graph.services[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn discovery_services_bring_their_host_along() {
        let now = Utc::now();
        let port_first = [
            ("ports", vec![service("new.example.com", 80, None)], now),
            ("names", hostnames(&["new.example.com"]), now),
            ("other", hostnames(&["evil.net"]), now),
        ];
        let graphs = merged_in_every_order(Phase::Discovery, &port_first);
        assert!(graphs.windows(2).all(|w| w[0] == w[1]));

        let graph = &graphs[0];
        assert_eq!(graph.services.len(), 1);
        let host = graph.hosts.iter().find(|h| h.name == "new.example.com").unwrap();
        assert_eq!(host.sources, BTreeSet::from(["names".to_string(), "ports".to_string()]));
    }

    #[test]
    fn replay_is_idempotent() {
        let now = Utc::now();
        let mut agg = Aggregator::new("example.com");
        agg.seed_target(now);
        let items = vec![finding("example.com", None, Severity::Medium), service("example.com", 443, Some("1.2"))];
        let first = agg.merge(Phase::VulnScanning, "hdr", &items, now);
        let before = agg.graph();
        let second = agg.merge(Phase::VulnScanning, "hdr", &items, now);

        assert_eq!(first.added, 2);
        assert_eq!(second, MergeStats::default());
        assert_eq!(before, agg.graph());
    }

    #[test]
    fn rejects_invalid_and_out_of_zone_hosts() {
        let mut agg = Aggregator::new("example.com");
        let stats =
            agg.merge(Phase::Discovery, "a", &hostnames(&["", "bad host", "evil.net", "notexample.com", "ok.example.com"]), Utc::now());
        assert_eq!(stats.added, 1);
        assert_eq!(stats.rejected, 4);
    }

    #[test]
    fn hosts_are_frozen_after_discovery() {
        let mut agg = Aggregator::new("example.com");
        let stats = agg.merge(Phase::PortScanning, "ports", &hostnames(&["late.example.com"]), Utc::now());
        assert_eq!(stats.rejected, 1);
        assert_eq!(agg.host_count(), 0);
    }

    #[test]
    fn richer_service_version_wins() {
        let now = Utc::now();
        let mut agg = Aggregator::new("example.com");
        agg.seed_target(now);
        agg.merge(Phase::PortScanning, "a", &[service("example.com", 80, None)], now);
        agg.merge(Phase::PortScanning, "b", &[service("example.com", 80, Some("nginx 1.25"))], now);
        agg.merge(Phase::PortScanning, "c", &[service("example.com", 80, Some("nginx"))], now);
        agg.merge(Phase::PortScanning, "d", &[service("example.com", 80, Some("apache"))], now);

        let graph = agg.graph();
        assert_eq!(graph.services.len(), 1);
        assert_eq!(graph.services[0].version.as_deref(), Some("nginx 1.25"));
        assert_eq!(graph.services[0].sources.len(), 4);
    }

    #[test]
    fn services_need_a_known_host() {
        let mut agg = Aggregator::new("example.com");
        let stats = agg.merge(Phase::PortScanning, "a", &[service("ghost.example.com", 22, None)], Utc::now());
        assert_eq!(stats.rejected, 1);
        assert_eq!(agg.service_count(), 0);
    }

    #[test]
    fn findings_stay_distinct_without_fingerprint() {
        let now = Utc::now();
        let mut agg = Aggregator::new("example.com");
        agg.seed_target(now);
        agg.merge(Phase::VulnScanning, "a", &[finding("example.com", None, Severity::Medium)], now);
        agg.merge(Phase::VulnScanning, "b", &[finding("example.com", None, Severity::Medium)], now);
        assert_eq!(agg.finding_count(), 2);
    }

    #[test]
    fn fingerprinted_findings_fold_with_merged_provenance() {
        let now = Utc::now();
        let mut agg = Aggregator::new("example.com");
        agg.seed_target(now);
        agg.merge(Phase::VulnScanning, "a", &[finding("example.com", Some("missing-header:hsts"), Severity::Low)], now);
        agg.merge(Phase::VulnScanning, "b", &[finding("EXAMPLE.com", Some("missing-header:hsts"), Severity::High)], now);

        let graph = agg.graph();
        assert_eq!(graph.findings.len(), 1);
        assert_eq!(graph.findings[0].severity, Severity::High);
        assert_eq!(graph.findings[0].sources.len(), 2);
    }

    #[test]
    fn restores_from_checkpointed_graph() {
        let now = Utc::now();
        let mut agg = Aggregator::new("example.com");
        agg.seed_target(now);
        agg.merge(Phase::VulnScanning, "a", &[finding("example.com", Some("x"), Severity::Low)], now);
        let restored = Aggregator::from_graph("example.com", agg.graph());
        assert_eq!(restored.graph(), agg.graph());
    }
}
