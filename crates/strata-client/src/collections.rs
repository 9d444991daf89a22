//! Collection name → id resolution with single-flight misses.
//!
//! Concurrent lookups for the same (scope, collection) collapse onto one
//! wire request; everyone parks on the pending entry and is unblocked by
//! the fetch that got there first. The cache is capacity-bounded with
//! oldest-first eviction and is invalidated when the server reports an
//! outdated id or the bucket's manifest uid moves.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Error, ErrorKind, Result};
use crate::mux::KvMux;
use crate::routing::RoutingTable;
use crate::wire::{Frame, Opcode};

const FETCH_RETRY_DELAY: Duration = Duration::from_millis(50);

struct CacheEntry {
    cid: u32,
    last_used: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<(String, String), CacheEntry>,
    pending: HashMap<(String, String), Vec<oneshot::Sender<Result<u32>>>>,
    manifest_uid: Option<u64>,
}

pub(crate) struct CollectionResolver {
    mux: KvMux,
    state: Mutex<CacheState>,
    capacity: usize,
}

impl CollectionResolver {
    pub fn new(mux: KvMux, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            mux,
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
        })
    }

    /// Resolve a collection id, joining an in-flight lookup when one
    /// exists for the same key.
    pub async fn resolve(
        self: &Arc<Self>,
        scope: &str,
        collection: &str,
        deadline: Instant,
    ) -> Result<u32> {
        let key = (scope.to_string(), collection.to_string());
        let rx = {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.last_used = Instant::now();
                return Ok(entry.cid);
            }
            let (tx, rx) = oneshot::channel();
            match state.pending.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    rx
                }
                None => {
                    state.pending.insert(key.clone(), vec![tx]);
                    let resolver = self.clone();
                    tokio::spawn(async move {
                        let result = resolver.fetch(&key.0, &key.1, deadline).await;
                        resolver.complete(&key, result);
                    });
                    rx
                }
            }
        };

        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::new(ErrorKind::Shutdown)
                .with_context("collection resolver dropped")),
            Err(_) => Err(Error::new(ErrorKind::UnambiguousTimeout)
                .with_context(format!("resolving {scope}.{collection}"))),
        }
    }

    pub fn invalidate(&self, scope: &str, collection: &str) {
        let key = (scope.to_string(), collection.to_string());
        self.state.lock().unwrap().entries.remove(&key);
    }

    /// React to a routing swap: a manifest uid change drops every cached
    /// id, since the numeric ids may have been reassigned.
    pub fn on_routing_change(&self, table: &RoutingTable) {
        let mut state = self.state.lock().unwrap();
        if table.manifest_uid != state.manifest_uid {
            if state.manifest_uid.is_some() && !state.entries.is_empty() {
                tracing::debug!(
                    old = ?state.manifest_uid,
                    new = ?table.manifest_uid,
                    dropped = state.entries.len(),
                    "collections manifest changed, dropping cached ids"
                );
            }
            state.entries.clear();
            state.manifest_uid = table.manifest_uid;
        }
    }

    fn complete(&self, key: &(String, String), result: Result<u32>) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            if let Ok(cid) = &result {
                if state.entries.len() >= self.capacity {
                    evict_oldest(&mut state.entries);
                }
                state.entries.insert(
                    key.clone(),
                    CacheEntry {
                        cid: *cid,
                        last_used: Instant::now(),
                    },
                );
            }
            state.pending.remove(key).unwrap_or_default()
        };
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
    }

    /// Issue GET_COLLECTION_ID against the cluster, retrying transport
    /// failures until the deadline.
    async fn fetch(&self, scope: &str, collection: &str, deadline: Instant) -> Result<u32> {
        let mut rotation = 0usize;
        loop {
            if self.mux.is_shut_down() {
                return Err(Error::new(ErrorKind::Shutdown)
                    .with_context(format!("resolving {scope}.{collection}")));
            }
            let table = self.mux.current_table();
            let endpoint = table
                .kv_endpoints
                .get(rotation % table.kv_endpoints.len().max(1))
                .cloned()
                .ok_or_else(|| Error::new(ErrorKind::NoEndpointsAvailable))?;
            rotation += 1;

            let mut frame = Frame::request(Opcode::COLLECTIONS_GET_CID);
            frame.value = Bytes::from(format!("{scope}.{collection}").into_bytes());
            let dispatched = Arc::new(AtomicBool::new(false));
            match self
                .mux
                .submit_to_endpoint(&endpoint, frame, deadline, dispatched)
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    // Extras: manifest uid (8) then collection id (4).
                    if resp.extras.len() < 12 {
                        return Err(Error::new(ErrorKind::Protocol)
                            .with_endpoint(&endpoint)
                            .with_context("short GET_COLLECTION_ID extras"));
                    }
                    let cid = u32::from_be_bytes([
                        resp.extras[8],
                        resp.extras[9],
                        resp.extras[10],
                        resp.extras[11],
                    ]);
                    return Ok(cid);
                }
                Ok(resp) => {
                    return Err(Error::from_status(resp.status())
                        .with_endpoint(&endpoint)
                        .with_context(format!("resolving {scope}.{collection}")))
                }
                Err(err) if err.kind.is_transport() || err.kind == ErrorKind::QueueFull => {
                    if Instant::now() + FETCH_RETRY_DELAY >= deadline {
                        return Err(err);
                    }
                    tokio::time::sleep(FETCH_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn evict_oldest(entries: &mut HashMap<(String, String), CacheEntry>) {
    if let Some(oldest) = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(key, _)| key.clone())
    {
        entries.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entry_is_evicted_first() {
        let mut entries = HashMap::new();
        let base = Instant::now();
        for (idx, name) in ["a", "b", "c"].iter().enumerate() {
            entries.insert(
                ("s".to_string(), name.to_string()),
                CacheEntry {
                    cid: idx as u32,
                    last_used: base + Duration::from_secs(idx as u64),
                },
            );
        }
        evict_oldest(&mut entries);
        assert!(!entries.contains_key(&("s".to_string(), "a".to_string())));
        assert_eq!(entries.len(), 2);
    }
}
