//! Replication-link controller.
//!
//! From the current peer snapshot and the cache contents, the controller
//! computes the set of replication tasks this node should own and reconciles
//! it against the tasks present in the DocDB replicator collection. A task
//! that is already present with the same endpoints and id filter is left
//! alone, since replacing a replicator document aborts its ongoing
//! replication and can trigger a large re-scan.
//!
//! When any bridge peer is visible the plan focuses on bridges: the node
//! pulls its subscriptions from bridge caches and pushes its own public
//! store to them. Without bridges, contributors pull from each other
//! directly, restricted to their subscriptions; a bridge node pulls
//! everything, unrestricted.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    docdb::ReplicationDoc,
    model::Document,
    peers::{PeerInfo, PeerSnapshot, PeerType},
    store::{Store, StoreError, StoreKind},
};

/// Per-document write attempts during reconciliation.
const MAX_WRITE_ATTEMPTS: usize = 4;

/// Direction and endpoint pair of a replication task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TaskKind {
    /// Pull subscribed documents from a bridge's cache.
    PullFromBridge,
    /// Pull from a contributor's cache.
    GetFromCacheOf,
    /// Pull from a contributor's public store.
    AutoGetFromPublicOf,
    /// Push the local public store to a bridge's cache.
    AutoLocalTo,
}

/// The deterministic id of a replication task.
pub fn task_id(host: &str, kind: TaskKind, peer: &PeerInfo) -> String {
    let address = match peer.ipv4 {
        Some(ip) => ip.to_string(),
        None => peer.host.clone(),
    };
    format!("ers-{host}-{kind}-{address}:{}", peer.port)
}

/// The id prefix of every task authored by `host`.
pub fn owned_prefix(host: &str) -> String {
    format!("ers-{host}-")
}

/// Compute the target task set for a node.
///
/// Tasks whose id filter would be empty are omitted; there is nothing to
/// pull for them. The result is deterministic in its inputs.
pub fn plan(
    host: &str,
    self_type: PeerType,
    peers: &PeerSnapshot,
    cached: &BTreeSet<String>,
) -> BTreeMap<String, ReplicationDoc> {
    let mut target = BTreeMap::new();
    let mut add = |kind: TaskKind, peer: &PeerInfo, source: String, sink: String, doc_ids: Option<&BTreeSet<String>>| {
        if matches!(doc_ids, Some(ids) if ids.is_empty()) {
            return;
        }
        let id = task_id(host, kind, peer);
        target.insert(
            id.clone(),
            ReplicationDoc {
                id,
                source,
                target: sink,
                continuous: true,
                doc_ids: doc_ids.cloned(),
            },
        );
    };
    // own-subscription restriction: bridges pull everything
    let restriction = match self_type {
        PeerType::Contributor => Some(cached),
        PeerType::Bridge => None,
    };
    let cache_db = StoreKind::Cache.db_name();
    let public_db = StoreKind::Public.db_name();
    if !peers.bridges.is_empty() {
        for bridge in &peers.bridges {
            add(
                TaskKind::PullFromBridge,
                bridge,
                format!("{}{cache_db}", bridge.server_url()),
                cache_db.to_string(),
                Some(cached),
            );
            add(
                TaskKind::AutoLocalTo,
                bridge,
                public_db.to_string(),
                format!("{}{cache_db}", bridge.server_url()),
                None,
            );
        }
    } else {
        for contributor in &peers.contributors {
            add(
                TaskKind::GetFromCacheOf,
                contributor,
                format!("{}{cache_db}", contributor.server_url()),
                cache_db.to_string(),
                restriction,
            );
            add(
                TaskKind::AutoGetFromPublicOf,
                contributor,
                format!("{}{public_db}", contributor.server_url()),
                cache_db.to_string(),
                restriction,
            );
        }
    }
    target
}

/// What a reconciliation run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Tasks written.
    pub created: usize,
    /// Tasks tombstoned.
    pub removed: usize,
    /// Tasks left untouched.
    pub kept: usize,
    /// Whether the run was cut short because the target matched the last
    /// applied one.
    pub unchanged: bool,
}

/// Nudges the owner of a [`ReplicationController`] to run a reconciliation.
///
/// Cheap to clone. Notifications coalesce: nudging while one is already
/// pending is a no-op, and the owner drains all pending nudges into a
/// single run.
#[derive(Debug, Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    /// Wrap the sending side of the owner's trigger channel.
    pub fn new(tx: mpsc::Sender<()>) -> Self {
        Self { tx }
    }

    /// Request a reconciliation. Never blocks.
    pub fn notify(&self) {
        // a full channel means a run is already pending
        let _ = self.tx.try_send(());
    }
}

/// Reconciles the replicator collection against the computed plan.
#[derive(Debug)]
pub struct ReplicationController {
    store: Store,
    host: String,
    self_type: PeerType,
    last_applied: Option<BTreeMap<String, ReplicationDoc>>,
}

impl ReplicationController {
    /// Create a controller for a node.
    pub fn new(store: Store, host: impl Into<String>, self_type: PeerType) -> Self {
        Self {
            store,
            host: host.into(),
            self_type,
            last_applied: None,
        }
    }

    /// Bring the replicator collection in line with the plan for `peers`.
    pub async fn reconcile(&mut self, peers: &PeerSnapshot) -> Result<ReconcileOutcome, StoreError> {
        let cached = self.store.kind(StoreKind::Cache).all_entity_doc_ids().await?;
        let target = plan(&self.host, self.self_type, peers, &cached);
        if self.last_applied.as_ref() == Some(&target) {
            debug!("replication target unchanged, skipping reconciliation");
            return Ok(ReconcileOutcome {
                kept: target.len(),
                unchanged: true,
                ..Default::default()
            });
        }

        let current = self.current_tasks().await?;
        let mut tombstones = Vec::new();
        let mut creations = Vec::new();
        let mut kept = 0;
        for (id, doc) in &current {
            match target.get(id) {
                Some(wanted) => {
                    let present = ReplicationDoc::from_document(doc);
                    if present.as_ref().map(|p| p.same_task(wanted)).unwrap_or(false) {
                        kept += 1;
                    } else {
                        // changed task: stop the old replication, start anew
                        tombstones.push(doc.tombstone());
                        creations.push(wanted.to_document());
                    }
                }
                None => tombstones.push(doc.tombstone()),
            }
        }
        for (id, wanted) in &target {
            if !current.contains_key(id) {
                creations.push(wanted.to_document());
            }
        }

        let outcome = ReconcileOutcome {
            created: creations.len(),
            removed: tombstones.len(),
            kept,
            unchanged: false,
        };
        self.apply(tombstones).await?;
        self.apply(creations).await?;
        info!(
            created = outcome.created,
            removed = outcome.removed,
            kept = outcome.kept,
            "reconciled replication tasks"
        );
        self.last_applied = Some(target);
        Ok(outcome)
    }

    /// Tombstone every task this node authored, e.g. at startup after a
    /// crash or on shutdown. Returns the number of removed tasks.
    pub async fn clear(&mut self) -> Result<usize, StoreError> {
        let current = self.current_tasks().await?;
        let count = current.len();
        let tombstones = current.values().map(Document::tombstone).collect();
        self.apply(tombstones).await?;
        self.last_applied = None;
        Ok(count)
    }

    /// The replicator documents this node authored, keyed by task id.
    async fn current_tasks(&self) -> Result<BTreeMap<String, Document>, StoreError> {
        let prefix = owned_prefix(&self.host);
        let docs = self.store.docdb().replicator().all_docs().await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| {
                let id = doc.doc_id()?.to_string();
                id.starts_with(&prefix).then_some((id, doc))
            })
            .collect())
    }

    /// Write a batch, retrying each failed document with a refreshed
    /// revision token a bounded number of times.
    async fn apply(&self, docs: Vec<Document>) -> Result<(), StoreError> {
        if docs.is_empty() {
            return Ok(());
        }
        let replicator = self.store.docdb().replicator();
        let outcomes = replicator.bulk_put(docs.clone()).await?;
        for (doc, outcome) in docs.into_iter().zip(outcomes) {
            let Err(mut err) = outcome else {
                continue;
            };
            let id = doc.doc_id().unwrap_or_default().to_string();
            let mut written = false;
            for _ in 1..MAX_WRITE_ATTEMPTS {
                let mut retry = doc.clone();
                match replicator.get(&id).await? {
                    Some(present) => {
                        if let Some(rev) = present.rev() {
                            retry.set_rev(rev);
                        }
                    }
                    None if retry.is_deleted() => {
                        // already gone
                        written = true;
                        break;
                    }
                    None => retry.clear_rev(),
                }
                match replicator.put(&retry).await {
                    Ok(_) => {
                        written = true;
                        break;
                    }
                    Err(retry_err) => err = retry_err,
                }
            }
            if !written {
                warn!(task = %id, %err, "giving up on replicator write");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docdb::memory::MemoryDb;

    fn peer(name: &str, ip: [u8; 4], peer_type: PeerType) -> PeerInfo {
        PeerInfo {
            service_name: name.to_string(),
            host: name.to_string(),
            ipv4: Some(ip.into()),
            port: 5984,
            prefix: "ers".to_string(),
            peer_type,
        }
    }

    fn snapshot(contributors: Vec<PeerInfo>, bridges: Vec<PeerInfo>) -> PeerSnapshot {
        PeerSnapshot {
            contributors,
            bridges,
        }
    }

    #[test]
    fn task_ids_are_deterministic() {
        let p = peer("bob", [10, 0, 0, 2], PeerType::Contributor);
        assert_eq!(
            task_id("alice", TaskKind::GetFromCacheOf, &p),
            "ers-alice-get-from-cache-of-10.0.0.2:5984"
        );
        assert_eq!(
            task_id("alice", TaskKind::PullFromBridge, &p),
            "ers-alice-pull-from-bridge-10.0.0.2:5984"
        );
    }

    #[test]
    fn plan_without_bridges_pulls_from_contributors() {
        let peers = snapshot(
            vec![peer("bob", [10, 0, 0, 2], PeerType::Contributor)],
            vec![],
        );
        let cached = BTreeSet::from(["d1".to_string()]);
        let target = plan("alice", PeerType::Contributor, &peers, &cached);

        assert_eq!(target.len(), 2);
        let pull = &target["ers-alice-get-from-cache-of-10.0.0.2:5984"];
        assert_eq!(pull.source, "http://10.0.0.2:5984/ers-cache");
        assert_eq!(pull.target, "ers-cache");
        assert_eq!(pull.doc_ids, Some(cached.clone()));
        let public = &target["ers-alice-auto-get-from-public-of-10.0.0.2:5984"];
        assert_eq!(public.source, "http://10.0.0.2:5984/ers-public");
        assert_eq!(public.doc_ids, Some(cached));
    }

    #[test]
    fn plan_with_bridges_ignores_contributors() {
        let peers = snapshot(
            vec![peer("bob", [10, 0, 0, 2], PeerType::Contributor)],
            vec![peer("hub", [10, 0, 0, 9], PeerType::Bridge)],
        );
        let cached = BTreeSet::from(["d1".to_string()]);
        let target = plan("alice", PeerType::Contributor, &peers, &cached);

        assert!(target.keys().all(|id| id.contains("10.0.0.9")));
        let pull = &target["ers-alice-pull-from-bridge-10.0.0.9:5984"];
        assert_eq!(pull.doc_ids, Some(cached));
        // the public store is pushed up so the bridge can aggregate it
        let push = &target["ers-alice-auto-local-to-10.0.0.9:5984"];
        assert_eq!(push.source, "ers-public");
        assert_eq!(push.target, "http://10.0.0.9:5984/ers-cache");
        assert_eq!(push.doc_ids, None);
    }

    #[test]
    fn bridge_nodes_pull_unrestricted() {
        let peers = snapshot(
            vec![peer("bob", [10, 0, 0, 2], PeerType::Contributor)],
            vec![],
        );
        let cached = BTreeSet::from(["d1".to_string()]);
        let target = plan("hub", PeerType::Bridge, &peers, &cached);
        assert!(target.values().all(|task| task.doc_ids.is_none()));
    }

    #[test]
    fn empty_filters_produce_no_tasks() {
        let peers = snapshot(
            vec![peer("bob", [10, 0, 0, 2], PeerType::Contributor)],
            vec![],
        );
        let target = plan("alice", PeerType::Contributor, &peers, &BTreeSet::new());
        assert!(target.is_empty());
    }

    async fn controller() -> (ReplicationController, Store) {
        let store = Store::open(MemoryDb::new().as_docdb()).await.unwrap();
        (
            ReplicationController::new(store.clone(), "alice", PeerType::Contributor),
            store,
        )
    }

    async fn cache_something(store: &Store, entity: &str) {
        let mut doc = Document::for_entity(entity);
        doc.add_property("p", &"v".into()).unwrap();
        store.kind(StoreKind::Cache).save(&mut doc).await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_creates_and_clears_tasks() {
        let (mut controller, store) = controller().await;
        cache_something(&store, "e1").await;
        let peers = snapshot(
            vec![peer("bob", [10, 0, 0, 2], PeerType::Contributor)],
            vec![],
        );

        let outcome = controller.reconcile(&peers).await.unwrap();
        assert_eq!(outcome.created, 2);
        assert_eq!(store.docdb().replicator().all_docs().await.unwrap().len(), 2);

        let removed = controller.clear().await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.docdb().replicator().all_docs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_twice_is_stable() {
        let (mut controller, store) = controller().await;
        cache_something(&store, "e1").await;
        let peers = snapshot(
            vec![peer("bob", [10, 0, 0, 2], PeerType::Contributor)],
            vec![],
        );

        controller.reconcile(&peers).await.unwrap();
        let outcome = controller.reconcile(&peers).await.unwrap();
        assert!(outcome.unchanged);
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.removed, 0);

        // a fresh controller (no memory of the last target) still leaves the
        // existing tasks untouched
        let mut fresh = ReplicationController::new(store.clone(), "alice", PeerType::Contributor);
        let outcome = fresh.reconcile(&peers).await.unwrap();
        assert!(!outcome.unchanged);
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.kept, 2);
    }

    #[tokio::test]
    async fn changed_filters_recreate_tasks() {
        let (mut controller, store) = controller().await;
        cache_something(&store, "e1").await;
        let peers = snapshot(
            vec![peer("bob", [10, 0, 0, 2], PeerType::Contributor)],
            vec![],
        );
        controller.reconcile(&peers).await.unwrap();

        // subscribing to a second entity changes every id filter
        cache_something(&store, "e2").await;
        let outcome = controller.reconcile(&peers).await.unwrap();
        assert_eq!(outcome.removed, 2);
        assert_eq!(outcome.created, 2);

        let docs = store.docdb().replicator().all_docs().await.unwrap();
        assert_eq!(docs.len(), 2);
        for doc in docs {
            let task = ReplicationDoc::from_document(&doc).unwrap();
            assert_eq!(task.doc_ids.as_ref().map(BTreeSet::len), Some(2));
        }
    }

    #[tokio::test]
    async fn foreign_tasks_are_left_alone() {
        let (mut controller, store) = controller().await;
        let foreign = ReplicationDoc {
            id: "ers-zelda-get-from-cache-of-10.0.0.3:5984".to_string(),
            source: "http://10.0.0.3:5984/ers-cache".to_string(),
            target: "ers-cache".to_string(),
            continuous: true,
            doc_ids: None,
        };
        store
            .docdb()
            .replicator()
            .put(&foreign.to_document())
            .await
            .unwrap();

        controller.reconcile(&PeerSnapshot::default()).await.unwrap();
        controller.clear().await.unwrap();
        let docs = store.docdb().replicator().all_docs().await.unwrap();
        assert_eq!(docs.len(), 1, "foreign task must survive");
    }
}
