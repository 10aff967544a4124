//! Federated read fan-out with per-peer health tracking.
//!
//! Reads are issued against the `ers-public` and `ers-cache` databases of
//! every known peer in parallel and the results are unioned. The caller gets
//! control back only once every call has completed or run into its deadline;
//! nothing is streamed.
//!
//! Each peer URL has a timeout counter: a timed-out call increments it, any
//! successful response resets it. Before calling a peer, a uniform integer
//! in `[0, counter]` is drawn and the peer is skipped when it is nonzero, so
//! a failing peer degrades from the occasional skip to near-total
//! suppression while a single success restores full participation. Other
//! error classes are only logged; they say nothing about the peer's latency.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_buffered::join_all;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    docdb::Connector,
    model::Document,
    peers::PeerInfo,
    store::{EntityDb, StoreError, StoreKind},
};

/// Default per-peer call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(300);

/// The peer databases consulted by a federated read.
const REMOTE_STORES: [StoreKind; 2] = [StoreKind::Public, StoreKind::Cache];

/// Fans read operations out to peers.
#[derive(derive_more::Debug)]
pub struct Federation {
    #[debug("Connector")]
    connector: Arc<dyn Connector>,
    call_timeout: Duration,
    timeouts: Mutex<HashMap<String, u32>>,
}

impl Federation {
    /// Create a federation with the default call deadline.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_call_timeout(connector, DEFAULT_CALL_TIMEOUT)
    }

    /// Create a federation with a custom per-call deadline.
    pub fn with_call_timeout(connector: Arc<dyn Connector>, call_timeout: Duration) -> Self {
        Self {
            connector,
            call_timeout,
            timeouts: Mutex::new(HashMap::new()),
        }
    }

    /// Collect the documents describing `entity` from every peer.
    pub async fn docs_by_entity(&self, peers: &[PeerInfo], entity: &str) -> Vec<Document> {
        let calls = peers.iter().map(|peer| self.peer_docs(peer, entity));
        join_all(calls).await.into_iter().flatten().collect()
    }

    /// Union the property/value search results of every peer.
    pub async fn by_property_value(
        &self,
        peers: &[PeerInfo],
        prop: &str,
        value: Option<&Value>,
    ) -> BTreeSet<String> {
        let calls = peers.iter().map(|peer| self.peer_search(peer, prop, value));
        join_all(calls).await.into_iter().flatten().collect()
    }

    /// The current timeout counter of a peer URL.
    pub fn timeout_count(&self, url: &str) -> u32 {
        *self.timeouts.lock().unwrap().get(url).unwrap_or(&0)
    }

    async fn peer_docs(&self, peer: &PeerInfo, entity: &str) -> Vec<Document> {
        self.call(peer, |dbs| async move {
            let mut docs = Vec::new();
            for db in dbs {
                docs.extend(db.docs_by_entity(entity).await?);
            }
            Ok(docs)
        })
        .await
        .unwrap_or_default()
    }

    async fn peer_search(
        &self,
        peer: &PeerInfo,
        prop: &str,
        value: Option<&Value>,
    ) -> BTreeSet<String> {
        self.call(peer, |dbs| async move {
            let mut hits = BTreeSet::new();
            for db in dbs {
                hits.extend(db.by_property_value(prop, value).await?);
            }
            Ok(hits)
        })
        .await
        .unwrap_or_default()
    }

    /// Run one operation against a peer's remote stores under the deadline,
    /// maintaining the peer's health counter.
    async fn call<T, F, Fut>(&self, peer: &PeerInfo, op: F) -> Option<T>
    where
        F: FnOnce(Vec<EntityDb>) -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let url = peer.server_url();
        if self.should_skip(&url) {
            trace!(peer = %url, "skipping suppressed peer");
            return None;
        }
        let attempt = async {
            let docdb = self.connector.connect(&url).await?;
            let dbs = REMOTE_STORES
                .map(|kind| EntityDb::new(docdb.db(kind.db_name())))
                .into_iter()
                .collect();
            op(dbs).await
        };
        match tokio::time::timeout(self.call_timeout, attempt).await {
            Ok(Ok(result)) => {
                self.record_success(&url);
                Some(result)
            }
            Ok(Err(err)) => {
                debug!(peer = %url, %err, "peer query failed");
                None
            }
            Err(_) => {
                let count = self.record_timeout(&url);
                debug!(peer = %url, count, "peer query timed out");
                None
            }
        }
    }

    fn should_skip(&self, url: &str) -> bool {
        let count = self.timeout_count(url);
        count > 0 && rand::thread_rng().gen_range(0..=count) != 0
    }

    fn record_timeout(&self, url: &str) -> u32 {
        let mut timeouts = self.timeouts.lock().unwrap();
        let count = timeouts.entry(url.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn record_success(&self, url: &str) {
        self.timeouts.lock().unwrap().remove(url);
    }
}
