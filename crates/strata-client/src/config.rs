//! Cluster-config envelopes and the manager that turns them into routing
//! tables.
//!
//! Envelopes arrive from four places — CCCP polls, server pushes,
//! NOT_MY_VBUCKET response bodies, and the HTTP streaming poller — and
//! race freely. The manager serializes them, rejects anything that is not
//! strictly newer than the installed revision, rewrites endpoints for the
//! configured network, and publishes a fresh snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use tokio::sync::watch;

use crate::error::{Error, ErrorKind, Result};
use crate::routing::{BucketCapabilities, RoutingPublisher, RoutingTable, VbucketMap};

/// Which transport delivered a config envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    CccpPoll,
    CccpPush,
    NotMyVbucket,
    HttpStream,
}

/// Address-family selection for clusters behind NAT / alternate addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkType {
    #[default]
    Default,
    External,
    /// Pick external iff a seed address matches an advertised external
    /// address, otherwise default.
    Auto,
}

impl NetworkType {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "default" => Ok(NetworkType::Default),
            "external" => Ok(NetworkType::External),
            "auto" => Ok(NetworkType::Auto),
            other => Err(Error::new(ErrorKind::InvalidArgument)
                .with_context(format!("unknown network type {other:?}"))),
        }
    }
}

/// Terse bucket config as served by the cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigEnvelope {
    #[serde(default)]
    pub rev: i64,
    pub name: Option<String>,
    #[serde(default, rename = "nodesExt")]
    pub nodes_ext: Vec<NodeExt>,
    #[serde(rename = "vBucketServerMap")]
    pub vbucket_server_map: Option<VbucketServerMap>,
    #[serde(default, rename = "bucketCapabilities")]
    pub bucket_capabilities: Vec<String>,
    #[serde(rename = "collectionsManifestUid")]
    pub collections_manifest_uid: Option<String>,
    #[serde(default, rename = "serverGroups")]
    pub server_groups: HashMap<String, Vec<usize>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeExt {
    #[serde(default)]
    pub services: HashMap<String, u16>,
    pub hostname: Option<String>,
    #[serde(default, rename = "alternateAddresses")]
    pub alternate_addresses: HashMap<String, AlternateAddress>,
    #[serde(default, rename = "thisNode")]
    pub this_node: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlternateAddress {
    pub hostname: Option<String>,
    #[serde(default)]
    pub ports: HashMap<String, u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VbucketServerMap {
    #[serde(default, rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i16>>,
    #[serde(default, rename = "numReplicas")]
    pub num_replicas: usize,
}

/// Parse a raw envelope body, substituting the `$HOST` placeholder with
/// the host the config was fetched from.
pub fn parse_envelope(raw: &[u8], origin_host: &str) -> Result<ConfigEnvelope> {
    let text = String::from_utf8_lossy(raw);
    let substituted = text.replace("$HOST", origin_host);
    serde_json::from_str(&substituted).map_err(|err| {
        Error::new(ErrorKind::Protocol)
            .with_context(format!("config envelope parse failed: {err}"))
    })
}

/// Split a streamed HTTP config body on its four-newline record
/// separator. Returns complete records and leaves the unterminated tail
/// in `buf`.
pub fn split_stream_records(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    const SEPARATOR: &[u8] = b"\n\n\n\n";
    let mut records = Vec::new();
    loop {
        let Some(pos) = buf
            .windows(SEPARATOR.len())
            .position(|window| window == SEPARATOR)
        else {
            return records;
        };
        let mut record: Vec<u8> = buf.drain(..pos + SEPARATOR.len()).collect();
        record.truncate(pos);
        if !record.iter().all(|b| b.is_ascii_whitespace()) {
            records.push(record);
        }
    }
}

pub(crate) struct ConfigManager {
    publisher: RoutingPublisher,
    /// Serializes envelope ingestion; there is exactly one writer at a
    /// time from the routing table's point of view.
    ingest_lock: Mutex<()>,
    network_type: NetworkType,
    seeds: Vec<String>,
    bucket: Option<String>,
}

impl ConfigManager {
    pub fn new(
        seed_table: RoutingTable,
        network_type: NetworkType,
    ) -> (Self, watch::Receiver<std::sync::Arc<RoutingTable>>) {
        let seeds = seed_table.kv_endpoints.clone();
        let bucket = seed_table.bucket.clone();
        let (publisher, rx) = RoutingPublisher::new(seed_table);
        (
            Self {
                publisher,
                ingest_lock: Mutex::new(()),
                network_type,
                seeds,
                bucket,
            },
            rx,
        )
    }

    /// Parse and ingest a raw envelope. Returns true when a new table was
    /// installed, false when the envelope was stale or unusable.
    pub fn ingest_raw(&self, raw: &[u8], origin_host: &str, source: ConfigSource) -> bool {
        match parse_envelope(raw, origin_host) {
            Ok(envelope) => self.ingest(envelope, source),
            Err(err) => {
                tracing::warn!(origin = origin_host, source = ?source, error = %err,
                    "discarding unparseable config envelope");
                false
            }
        }
    }

    pub fn ingest(&self, envelope: ConfigEnvelope, source: ConfigSource) -> bool {
        let _guard = self.ingest_lock.lock().unwrap();
        let current = self.publisher.current();
        if envelope.rev <= current.rev {
            tracing::debug!(
                rev = envelope.rev,
                current_rev = current.rev,
                source = ?source,
                "rejecting stale config envelope"
            );
            return false;
        }
        let table = self.build_table(&envelope);
        tracing::info!(
            rev = table.rev,
            source = ?source,
            kv_endpoints = table.kv_endpoints.len(),
            "installing routing table"
        );
        self.publisher.publish(table);
        true
    }

    fn resolved_network(&self, envelope: &ConfigEnvelope) -> NetworkType {
        match self.network_type {
            NetworkType::Auto => {
                let external_hosts: Vec<String> = envelope
                    .nodes_ext
                    .iter()
                    .filter_map(|node| node.alternate_addresses.get("external"))
                    .filter_map(|alt| {
                        let host = alt.hostname.clone()?;
                        let port = alt.ports.get("kv").copied()?;
                        Some(format!("{host}:{port}"))
                    })
                    .collect();
                if self.seeds.iter().any(|seed| external_hosts.contains(seed)) {
                    NetworkType::External
                } else {
                    NetworkType::Default
                }
            }
            other => other,
        }
    }

    /// Endpoint for one service on one node, honoring the network type.
    fn node_endpoint(
        &self,
        node: &NodeExt,
        service_key: &str,
        network: NetworkType,
    ) -> Option<String> {
        let default_port = node.services.get(service_key).copied()?;
        match network {
            NetworkType::External => {
                let alt = node.alternate_addresses.get("external")?;
                let host = alt.hostname.as_deref().or(node.hostname.as_deref())?;
                let port = alt.ports.get(service_key).copied().unwrap_or(default_port);
                Some(format!("{host}:{port}"))
            }
            _ => {
                let host = node.hostname.as_deref()?;
                Some(format!("{host}:{default_port}"))
            }
        }
    }

    fn build_table(&self, envelope: &ConfigEnvelope) -> RoutingTable {
        let network = self.resolved_network(envelope);

        let collect = |service_key: &str| -> Vec<String> {
            envelope
                .nodes_ext
                .iter()
                .filter_map(|node| self.node_endpoint(node, service_key, network))
                .collect()
        };

        // vBucket map indices refer to the server list, so the KV endpoint
        // order must come from there whenever the config carries one.
        let (kv_endpoints, vbucket_map) = match &envelope.vbucket_server_map {
            Some(map) if !map.server_list.is_empty() => {
                let endpoints = match network {
                    NetworkType::External => map
                        .server_list
                        .iter()
                        .map(|server| self.rewrite_kv_endpoint(envelope, server))
                        .collect(),
                    _ => map.server_list.clone(),
                };
                (
                    endpoints,
                    Some(VbucketMap::new(map.vbucket_map.clone(), map.num_replicas)),
                )
            }
            _ => (collect("kv"), None),
        };

        let capabilities = BucketCapabilities {
            cccp: envelope.bucket_capabilities.iter().any(|c| c == "cccp"),
            collections: envelope
                .bucket_capabilities
                .iter()
                .any(|c| c == "collections"),
            durable_writes: envelope
                .bucket_capabilities
                .iter()
                .any(|c| c == "durableWrite"),
        };

        let manifest_uid = envelope
            .collections_manifest_uid
            .as_deref()
            .and_then(|uid| u64::from_str_radix(uid.trim_start_matches("0x"), 16).ok());

        RoutingTable {
            rev: envelope.rev,
            bucket: envelope.name.clone().or_else(|| self.bucket.clone()),
            kv_endpoints,
            mgmt_endpoints: collect("mgmt"),
            query_endpoints: collect("n1ql"),
            analytics_endpoints: collect("cbas"),
            search_endpoints: collect("fts"),
            views_endpoints: collect("capi"),
            vbucket_map,
            server_groups: if envelope.server_groups.is_empty() {
                None
            } else {
                Some(envelope.server_groups.clone())
            },
            capabilities,
            manifest_uid,
        }
    }

    /// Map a server-list entry onto its external address when one is
    /// advertised for the same node.
    fn rewrite_kv_endpoint(&self, envelope: &ConfigEnvelope, server: &str) -> String {
        let host = server.rsplit_once(':').map(|(h, _)| h).unwrap_or(server);
        for node in &envelope.nodes_ext {
            if node.hostname.as_deref() != Some(host) {
                continue;
            }
            if let Some(endpoint) = self.node_endpoint(node, "kv", NetworkType::External) {
                return endpoint;
            }
        }
        server.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ConfigManager, watch::Receiver<std::sync::Arc<RoutingTable>>) {
        ConfigManager::new(
            RoutingTable::seed(vec!["seed:11210".into()], vec![], Some("default".into())),
            NetworkType::Default,
        )
    }

    fn envelope_json(rev: i64, hosts: &[&str]) -> String {
        let nodes: Vec<String> = hosts
            .iter()
            .map(|h| {
                format!(
                    r#"{{"services":{{"kv":11210,"mgmt":8091}},"hostname":"{h}"}}"#
                )
            })
            .collect();
        let servers: Vec<String> = hosts.iter().map(|h| format!(r#""{h}:11210""#)).collect();
        format!(
            r#"{{"rev":{rev},"name":"default","nodesExt":[{}],
               "vBucketServerMap":{{"serverList":[{}],"numReplicas":0,
               "vBucketMap":[[0],[0]]}},
               "bucketCapabilities":["cccp","collections"]}}"#,
            nodes.join(","),
            servers.join(","),
        )
    }

    #[test]
    fn revisions_are_strictly_monotonic() {
        let (manager, rx) = manager();
        // Arbitrary arrival order; the installed revision must end at the max.
        for rev in [3i64, 1, 7, 7, 5, 2] {
            let envelope = parse_envelope(envelope_json(rev, &["a"]).as_bytes(), "a")
                .expect("parse");
            manager.ingest(envelope, ConfigSource::CccpPoll);
        }
        assert_eq!(rx.borrow().rev, 7);
    }

    #[test]
    fn host_placeholder_is_substituted() {
        let raw = br#"{"rev":4,"nodesExt":[{"services":{"kv":11210},"hostname":"$HOST"}],
            "vBucketServerMap":{"serverList":["$HOST:11210"],"numReplicas":0,"vBucketMap":[[0]]}}"#;
        let envelope = parse_envelope(raw, "10.1.2.3").expect("parse");
        assert_eq!(
            envelope.vbucket_server_map.unwrap().server_list,
            vec!["10.1.2.3:11210".to_string()]
        );
    }

    #[test]
    fn external_network_rewrites_endpoints() {
        let raw = br#"{"rev":9,"nodesExt":[
            {"services":{"kv":11210,"mgmt":8091},"hostname":"private-a",
             "alternateAddresses":{"external":{"hostname":"203.0.113.9",
               "ports":{"kv":31210,"mgmt":38091}}}}],
            "vBucketServerMap":{"serverList":["private-a:11210"],
              "numReplicas":0,"vBucketMap":[[0]]}}"#;
        let (manager, rx) = ConfigManager::new(
            RoutingTable::seed(vec!["203.0.113.9:31210".into()], vec![], None),
            NetworkType::External,
        );
        let envelope = parse_envelope(raw, "private-a").expect("parse");
        assert!(manager.ingest(envelope, ConfigSource::HttpStream));
        let table = rx.borrow().clone();
        assert_eq!(table.kv_endpoints, vec!["203.0.113.9:31210".to_string()]);
        assert_eq!(table.mgmt_endpoints, vec!["203.0.113.9:38091".to_string()]);
    }

    #[test]
    fn auto_network_matches_seeds_against_external() {
        let raw = br#"{"rev":2,"nodesExt":[
            {"services":{"kv":11210},"hostname":"private-a",
             "alternateAddresses":{"external":{"hostname":"pub-a","ports":{"kv":31210}}}}],
            "vBucketServerMap":{"serverList":["private-a:11210"],
              "numReplicas":0,"vBucketMap":[[0]]}}"#;
        let (manager, rx) = ConfigManager::new(
            RoutingTable::seed(vec!["pub-a:31210".into()], vec![], None),
            NetworkType::Auto,
        );
        let envelope = parse_envelope(raw, "private-a").expect("parse");
        assert!(manager.ingest(envelope, ConfigSource::CccpPoll));
        assert_eq!(rx.borrow().kv_endpoints, vec!["pub-a:31210".to_string()]);
    }

    #[test]
    fn stream_records_split_on_quad_newline() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"{\"rev\":1}\n\n\n\n{\"rev\":2}\n\n\n\n{\"rev\":");
        let records = split_stream_records(&mut buf);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], b"{\"rev\":1}");
        assert_eq!(records[1], b"{\"rev\":2}");
        assert_eq!(buf, b"{\"rev\":");

        buf.extend_from_slice(b"3}\n\n\n\n");
        let records = split_stream_records(&mut buf);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], b"{\"rev\":3}");
        assert!(buf.is_empty());
    }

    #[test]
    fn capabilities_and_manifest_uid_parse() {
        let raw = br#"{"rev":5,"bucketCapabilities":["cccp","collections","durableWrite"],
            "collectionsManifestUid":"0x2a",
            "nodesExt":[{"services":{"kv":11210},"hostname":"a"}]}"#;
        let (manager, rx) = manager();
        assert!(manager.ingest(
            parse_envelope(raw, "a").expect("parse"),
            ConfigSource::CccpPush
        ));
        let table = rx.borrow().clone();
        assert!(table.capabilities.cccp);
        assert!(table.capabilities.collections);
        assert!(table.capabilities.durable_writes);
        assert_eq!(table.manifest_uid, Some(0x2a));
        assert_eq!(table.kv_endpoints, vec!["a:11210".to_string()]);
    }
}
