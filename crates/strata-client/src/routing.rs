//! Immutable routing snapshots and their publication slot.
//!
//! A routing table is built in full by the config manager and published by
//! replacing the value in a `watch` slot; readers grab the current `Arc`
//! once per dispatch attempt and never observe a partially built table.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, ErrorKind, Result};
use crate::wire::vbucket_for_key;

/// Revision sentinel meaning "no config received yet".
pub const REV_UNINITIALIZED: i64 = -1;

/// Cluster services a request can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Kv,
    Mgmt,
    Query,
    Analytics,
    Search,
    Views,
}

/// vBucket → replica-list map. Each entry lists endpoint indices, primary
/// first; `-1` marks a slot with no owner during rebalance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VbucketMap {
    entries: Vec<Vec<i16>>,
    num_replicas: usize,
}

impl VbucketMap {
    pub fn new(entries: Vec<Vec<i16>>, num_replicas: usize) -> Self {
        Self {
            entries,
            num_replicas,
        }
    }

    pub fn num_vbuckets(&self) -> usize {
        self.entries.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn vbucket_for_key(&self, key: &[u8]) -> Result<u16> {
        if self.entries.is_empty() {
            return Err(Error::new(ErrorKind::InvalidVbucket)
                .with_context("empty vbucket map"));
        }
        Ok(vbucket_for_key(key, self.entries.len()))
    }

    /// Endpoint index serving `vbucket` at `replica_idx` (0 = primary).
    pub fn node_for(&self, vbucket: u16, replica_idx: usize) -> Result<usize> {
        let entry = self
            .entries
            .get(vbucket as usize)
            .ok_or_else(|| Error::new(ErrorKind::InvalidVbucket))?;
        if replica_idx > self.num_replicas {
            return Err(Error::new(ErrorKind::InvalidReplica));
        }
        match entry.get(replica_idx) {
            Some(&idx) if idx >= 0 => Ok(idx as usize),
            _ => Err(Error::new(ErrorKind::InvalidReplica)
                .with_context(format!("vbucket {vbucket} has no replica {replica_idx}"))),
        }
    }
}

/// Capabilities advertised by the bucket config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCapabilities {
    pub cccp: bool,
    pub collections: bool,
    pub durable_writes: bool,
}

/// One immutable snapshot of cluster topology. Never mutated in place;
/// replaced wholesale on every accepted config envelope.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    pub rev: i64,
    pub bucket: Option<String>,
    /// KV endpoints in server-list order; vBucket map indices point here.
    pub kv_endpoints: Vec<String>,
    pub mgmt_endpoints: Vec<String>,
    pub query_endpoints: Vec<String>,
    pub analytics_endpoints: Vec<String>,
    pub search_endpoints: Vec<String>,
    pub views_endpoints: Vec<String>,
    pub vbucket_map: Option<VbucketMap>,
    /// Server-group name → KV endpoint indices, when the config carries
    /// group placement.
    pub server_groups: Option<HashMap<String, Vec<usize>>>,
    pub capabilities: BucketCapabilities,
    /// Collections manifest uid; a change invalidates cached collection ids.
    pub manifest_uid: Option<u64>,
}

impl RoutingTable {
    /// The pre-bootstrap table: seed endpoints only, revision −1, no
    /// vBucket map. Enough for pollers to reach the cluster, not enough
    /// to route application traffic.
    pub fn seed(kv_seeds: Vec<String>, http_seeds: Vec<String>, bucket: Option<String>) -> Self {
        Self {
            rev: REV_UNINITIALIZED,
            bucket,
            kv_endpoints: kv_seeds,
            mgmt_endpoints: http_seeds,
            query_endpoints: Vec::new(),
            analytics_endpoints: Vec::new(),
            search_endpoints: Vec::new(),
            views_endpoints: Vec::new(),
            vbucket_map: None,
            server_groups: None,
            capabilities: BucketCapabilities {
                // Assume CCCP until a config says otherwise.
                cccp: true,
                ..BucketCapabilities::default()
            },
            manifest_uid: None,
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.rev >= 0
    }

    pub fn endpoints_for(&self, service: ServiceType) -> &[String] {
        match service {
            ServiceType::Kv => &self.kv_endpoints,
            ServiceType::Mgmt => &self.mgmt_endpoints,
            ServiceType::Query => &self.query_endpoints,
            ServiceType::Analytics => &self.analytics_endpoints,
            ServiceType::Search => &self.search_endpoints,
            ServiceType::Views => &self.views_endpoints,
        }
    }

    /// Resolve the endpoint for a key at the given replica index.
    pub fn endpoint_for_key(&self, key: &[u8], replica_idx: usize) -> Result<(u16, &str)> {
        let map = self
            .vbucket_map
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NoEndpointsAvailable)
                .with_context("no vbucket map installed"))?;
        let vbucket = map.vbucket_for_key(key)?;
        let node = map.node_for(vbucket, replica_idx)?;
        let endpoint = self
            .kv_endpoints
            .get(node)
            .ok_or_else(|| Error::new(ErrorKind::NoEndpointsAvailable)
                .with_context(format!("vbucket map points at missing endpoint {node}")))?;
        Ok((vbucket, endpoint.as_str()))
    }
}

/// Single-writer publication slot for routing tables.
pub(crate) struct RoutingPublisher {
    tx: watch::Sender<Arc<RoutingTable>>,
}

impl RoutingPublisher {
    pub fn new(initial: RoutingTable) -> (Self, watch::Receiver<Arc<RoutingTable>>) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        (Self { tx }, rx)
    }

    pub fn publish(&self, table: RoutingTable) {
        self.tx.send_replace(Arc::new(table));
    }

    pub fn current(&self) -> Arc<RoutingTable> {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_map(rev: i64, endpoints: Vec<String>, entries: Vec<Vec<i16>>) -> RoutingTable {
        let mut table = RoutingTable::seed(endpoints, Vec::new(), Some("default".into()));
        table.rev = rev;
        table.vbucket_map = Some(VbucketMap::new(entries, 1));
        table
    }

    #[test]
    fn seed_table_is_unbootstrapped() {
        let table = RoutingTable::seed(vec!["a:11210".into()], vec!["a:8091".into()], None);
        assert_eq!(table.rev, REV_UNINITIALIZED);
        assert!(!table.is_bootstrapped());
        assert!(table.endpoint_for_key(b"foo", 0).is_err());
    }

    #[test]
    fn key_routes_through_map_to_endpoint() {
        let entries = (0..1024)
            .map(|vb| if vb == 115 { vec![1, 0] } else { vec![0, 1] })
            .collect();
        let table = table_with_map(1, vec!["a:11210".into(), "b:11210".into()], entries);
        let (vbucket, endpoint) = table.endpoint_for_key(b"foo", 0).expect("route");
        assert_eq!(vbucket, 115);
        assert_eq!(endpoint, "b:11210");
        let (_, replica) = table.endpoint_for_key(b"foo", 1).expect("replica");
        assert_eq!(replica, "a:11210");
    }

    #[test]
    fn unowned_vbucket_is_invalid_replica() {
        let entries = vec![vec![-1, -1]];
        let table = table_with_map(1, vec!["a:11210".into()], entries);
        let err = table.endpoint_for_key(b"x", 0).expect_err("no owner");
        assert_eq!(err.kind, ErrorKind::InvalidReplica);
    }

    #[test]
    fn readers_see_whole_snapshots() {
        let (publisher, rx) = RoutingPublisher::new(RoutingTable::seed(
            vec!["a:11210".into()],
            Vec::new(),
            None,
        ));

        // Publish tables whose endpoint list length always matches the
        // highest index in their vbucket map; a torn read would break the
        // invariant.
        let reader = {
            let rx = rx.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let table = rx.borrow().clone();
                    if let Some(map) = &table.vbucket_map {
                        let max = (0..map.num_vbuckets())
                            .map(|vb| map.node_for(vb as u16, 0).unwrap())
                            .max()
                            .unwrap();
                        assert!(max < table.kv_endpoints.len());
                    }
                }
            })
        };

        for rev in 1..200i64 {
            let nodes = 1 + (rev as usize % 4);
            let endpoints = (0..nodes).map(|n| format!("n{n}:11210")).collect();
            let entries = (0..64)
                .map(|vb| vec![(vb % nodes) as i16])
                .collect::<Vec<_>>();
            publisher.publish(table_with_map(rev, endpoints, entries));
        }
        reader.join().expect("reader");
    }
}
