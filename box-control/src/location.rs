//! Location records and the whoswho index.
//!
//! The index lives on root resolvers: every PUT into `/whoswho/<uuid>`
//! refreshes the matching entry, LOCATE reads it back. A record is stale
//! once `now_ms - last_seen_ms` exceeds the threshold (default 120 s, two
//! missed publishes).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

use box_core::{NodeId, TimestampMs, UserId};

/// Reachability scope of one published address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressScope {
    Global,
    Link,
    Loopback,
}

/// How an address ended up in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSource {
    Probe,
    Config,
    Manual,
}

/// One address a peer may try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub ip: IpAddr,
    pub port: u16,
    pub scope: AddressScope,
    pub source: AddressSource,
}

impl AddressEntry {
    /// Classify `ip` into its reachability scope.
    pub fn classify(ip: IpAddr, port: u16, source: AddressSource) -> Self {
        let scope = match ip {
            IpAddr::V4(v4) if v4.is_loopback() => AddressScope::Loopback,
            IpAddr::V4(v4) if v4.is_link_local() || v4.is_private() => AddressScope::Link,
            IpAddr::V4(_) => AddressScope::Global,
            IpAddr::V6(v6) if v6.is_loopback() => AddressScope::Loopback,
            IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80 => AddressScope::Link,
            IpAddr::V6(_) => AddressScope::Global,
        };
        Self {
            ip,
            port,
            scope,
            source,
        }
    }
}

/// Port-mapping facts folded into the published record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PortMappingState {
    pub enabled: bool,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reachability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Connectivity block of a location record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Connectivity {
    pub has_global_ipv6: bool,
    pub global_ipv6: Vec<Ipv6Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_probe_error: Option<String>,
    pub port_mapping: PortMappingState,
}

/// A node's published presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub user_id: UserId,
    pub node_id: NodeId,
    pub addresses: Vec<AddressEntry>,
    pub connectivity: Connectivity,
    pub online: bool,
    pub since_ms: u64,
    pub last_seen_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Answer to a LOCATE query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LocateAnswer {
    Node(LocationRecord),
    User(Vec<LocationRecord>),
}

/// On-demand staleness summary for the admin channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSummary {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub total_users: usize,
    pub stale_nodes: Vec<NodeId>,
    pub stale_users: Vec<UserId>,
    pub threshold: u64,
}

/// NodeId → record, with a secondary UserId → nodes index. Mutated only by
/// the presence subsystem (the broker's Main stage on resolvers).
#[derive(Debug, Default)]
pub struct LocationIndex {
    records: HashMap<NodeId, LocationRecord>,
    by_user: HashMap<UserId, BTreeSet<NodeId>>,
    stale_threshold_ms: u64,
}

impl LocationIndex {
    pub fn new(stale_threshold_ms: u64) -> Self {
        Self {
            records: HashMap::new(),
            by_user: HashMap::new(),
            stale_threshold_ms,
        }
    }

    pub fn stale_threshold_ms(&self) -> u64 {
        self.stale_threshold_ms
    }

    /// Applied on configuration reload.
    pub fn set_stale_threshold(&mut self, threshold_ms: u64) {
        self.stale_threshold_ms = threshold_ms;
    }

    /// Insert or refresh a record. The arrival time becomes `last_seen_ms`;
    /// `since_ms` is clamped so `last_seen_ms >= since_ms` always holds.
    pub fn upsert(&mut self, mut record: LocationRecord, now: TimestampMs) {
        record.last_seen_ms = now.0;
        if record.since_ms > record.last_seen_ms {
            record.since_ms = record.last_seen_ms;
        }
        if let Some(previous) = self.records.get(&record.node_id) {
            if previous.user_id != record.user_id {
                // The node moved accounts; drop the old alias.
                if let Some(nodes) = self.by_user.get_mut(&previous.user_id) {
                    nodes.remove(&record.node_id);
                    if nodes.is_empty() {
                        self.by_user.remove(&previous.user_id);
                    }
                }
            }
        }
        self.by_user
            .entry(record.user_id)
            .or_default()
            .insert(record.node_id);
        self.records.insert(record.node_id, record);
    }

    fn is_stale(&self, record: &LocationRecord, now: TimestampMs) -> bool {
        now.0.saturating_sub(record.last_seen_ms) > self.stale_threshold_ms
    }

    /// Node lookup ignores staleness: the caller sees the age in the record.
    pub fn node(&self, node_id: NodeId) -> Option<&LocationRecord> {
        self.records.get(&node_id)
    }

    /// Non-stale records for one account.
    pub fn user(&self, user_id: UserId, now: TimestampMs) -> Vec<&LocationRecord> {
        let Some(nodes) = self.by_user.get(&user_id) else {
            return Vec::new();
        };
        nodes
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| !self.is_stale(r, now))
            .collect()
    }

    /// LOCATE carries a bare UUID: try node ids first, then accounts.
    pub fn lookup(&self, target: Uuid, now: TimestampMs) -> Option<LocateAnswer> {
        if let Some(record) = self.node(NodeId(target)) {
            return Some(LocateAnswer::Node(record.clone()));
        }
        let records = self.user(UserId(target), now);
        if records.is_empty() && !self.by_user.contains_key(&UserId(target)) {
            return None;
        }
        Some(LocateAnswer::User(records.into_iter().cloned().collect()))
    }

    /// Compute the staleness summary. A user is stale when every one of its
    /// nodes is stale.
    pub fn summary(&self, now: TimestampMs) -> LocationSummary {
        let mut stale_nodes = Vec::new();
        let mut active = 0usize;
        for record in self.records.values() {
            if self.is_stale(record, now) {
                stale_nodes.push(record.node_id);
            } else {
                active += 1;
            }
        }
        stale_nodes.sort_by_key(|n| n.0);

        let mut stale_users: Vec<UserId> = self
            .by_user
            .iter()
            .filter(|(_, nodes)| {
                nodes
                    .iter()
                    .filter_map(|id| self.records.get(id))
                    .all(|r| self.is_stale(r, now))
            })
            .map(|(user, _)| *user)
            .collect();
        stale_users.sort_by_key(|u| u.0);

        LocationSummary {
            total_nodes: self.records.len(),
            active_nodes: active,
            total_users: self.by_user.len(),
            stale_nodes,
            stale_users,
            threshold: self.stale_threshold_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(node: Uuid, user: Uuid) -> LocationRecord {
        LocationRecord {
            user_id: UserId(user),
            node_id: NodeId(node),
            addresses: vec![AddressEntry::classify(
                "127.0.0.1".parse().unwrap(),
                16962,
                AddressSource::Probe,
            )],
            connectivity: Connectivity::default(),
            online: true,
            since_ms: 0,
            last_seen_ms: 0,
            node_public_key: None,
            tags: None,
        }
    }

    #[test]
    fn upsert_updates_last_seen() {
        let mut index = LocationIndex::new(120_000);
        let node = Uuid::new_v4();
        index.upsert(record(node, Uuid::new_v4()), TimestampMs(1_000));
        index.upsert(record(node, Uuid::new_v4()), TimestampMs(5_000));
        assert_eq!(index.node(NodeId(node)).unwrap().last_seen_ms, 5_000);
    }

    #[test]
    fn last_seen_never_precedes_since() {
        let mut index = LocationIndex::new(120_000);
        let node = Uuid::new_v4();
        let mut r = record(node, Uuid::new_v4());
        r.since_ms = 9_999_999;
        index.upsert(r, TimestampMs(1_000));
        let stored = index.node(NodeId(node)).unwrap();
        assert!(stored.last_seen_ms >= stored.since_ms);
    }

    #[test]
    fn user_aggregate_and_staleness() {
        // Scenario: two nodes share an account, both publish, then 130 s of
        // silence pushes them past the 120 s threshold.
        let mut index = LocationIndex::new(120_000);
        let user = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        index.upsert(record(a, user), TimestampMs(10_000));
        index.upsert(record(b, user), TimestampMs(10_000));

        let now = TimestampMs(20_000);
        assert_eq!(index.user(UserId(user), now).len(), 2);
        match index.lookup(user, now) {
            Some(LocateAnswer::User(records)) => assert_eq!(records.len(), 2),
            other => panic!("expected user aggregate, got {other:?}"),
        }

        let later = TimestampMs(10_000 + 130_000);
        assert!(index.user(UserId(user), later).is_empty());
        let summary = index.summary(later);
        assert_eq!(summary.total_nodes, 2);
        assert_eq!(summary.active_nodes, 0);
        assert_eq!(summary.stale_nodes.len(), 2);
        assert_eq!(summary.stale_users, vec![UserId(user)]);
    }

    #[test]
    fn exactly_at_threshold_is_not_stale() {
        let mut index = LocationIndex::new(120_000);
        let user = Uuid::new_v4();
        index.upsert(record(Uuid::new_v4(), user), TimestampMs(0));
        // `now - last_seen > threshold` is the stale condition; equality is active.
        assert_eq!(index.user(UserId(user), TimestampMs(120_000)).len(), 1);
        assert!(index.user(UserId(user), TimestampMs(120_001)).is_empty());
    }

    #[test]
    fn node_lookup_wins_over_user() {
        let mut index = LocationIndex::new(120_000);
        let id = Uuid::new_v4();
        // One uuid acting as both a node id and (for another entry) a user id.
        index.upsert(record(id, Uuid::new_v4()), TimestampMs(0));
        match index.lookup(id, TimestampMs(0)) {
            Some(LocateAnswer::Node(r)) => assert_eq!(r.node_id, NodeId(id)),
            other => panic!("expected node answer, got {other:?}"),
        }
    }

    #[test]
    fn unknown_uuid_yields_none() {
        let index = LocationIndex::new(120_000);
        assert!(index.lookup(Uuid::new_v4(), TimestampMs(0)).is_none());
    }

    #[test]
    fn summary_mixed_users() {
        let mut index = LocationIndex::new(120_000);
        let stale_user = Uuid::new_v4();
        let live_user = Uuid::new_v4();
        index.upsert(record(Uuid::new_v4(), stale_user), TimestampMs(0));
        index.upsert(record(Uuid::new_v4(), live_user), TimestampMs(200_000));

        let summary = index.summary(TimestampMs(200_000));
        assert_eq!(summary.total_users, 2);
        assert_eq!(summary.active_nodes, 1);
        assert_eq!(summary.stale_users, vec![UserId(stale_user)]);
    }

    #[test]
    fn address_classification() {
        let loopback = AddressEntry::classify("127.0.0.1".parse().unwrap(), 1, AddressSource::Probe);
        assert_eq!(loopback.scope, AddressScope::Loopback);
        let private = AddressEntry::classify("192.168.1.2".parse().unwrap(), 1, AddressSource::Probe);
        assert_eq!(private.scope, AddressScope::Link);
        let global4 = AddressEntry::classify("198.51.100.7".parse().unwrap(), 1, AddressSource::Config);
        assert_eq!(global4.scope, AddressScope::Global);
        let link6 = AddressEntry::classify("fe80::1".parse().unwrap(), 1, AddressSource::Probe);
        assert_eq!(link6.scope, AddressScope::Link);
        let global6 = AddressEntry::classify("2001:db8::1".parse().unwrap(), 1, AddressSource::Probe);
        assert_eq!(global6.scope, AddressScope::Global);
    }

    #[test]
    fn record_round_trips_through_json() {
        let r = record(Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_string(&r).unwrap();
        let back: LocationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
