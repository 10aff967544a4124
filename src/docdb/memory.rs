//! In-memory DocDB implementation.
//!
//! A [`MemoryHub`] holds the DocDB of every node in a deployment, keyed by
//! server URL, so tests can wire several registry nodes together without a
//! real database server. The hub's [`MemoryHub::settle`] applies every
//! registered continuous replication task once, honoring `doc_ids` filters
//! and propagating tombstones, which is enough to exercise the replication
//! scenarios end to end.
//!
//! Documents carry revision chains of the form `N-<hex>`. The two index
//! views of the registry's design document (`by_entity`,
//! `by_property_value`) are evaluated natively once `_design/index` is
//! present in a database; arbitrary map functions are not interpreted.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tracing::trace;

use super::{
    Change, ChangesPage, Connector, Database, DbError, DocDb, PutOutcome, ReplicationDoc,
    ViewQuery, ViewRow, REPLICATOR_DB,
};
use crate::model::Document;

const DESIGN_PREFIX: &str = "_design/";
const LOCAL_PREFIX: &str = "_local/";

/// Holds the in-memory DocDB of every node in a deployment.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    inner: Arc<RwLock<HashMap<String, MemoryDb>>>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh DocDB under a server URL and return it.
    pub fn add_node(&self, url: &str) -> MemoryDb {
        let db = MemoryDb::new();
        self.inner
            .write()
            .unwrap()
            .insert(url.to_string(), db.clone());
        db
    }

    /// Look up the DocDB registered under a server URL.
    pub fn node(&self, url: &str) -> Option<MemoryDb> {
        self.inner.read().unwrap().get(url).cloned()
    }

    /// A connector resolving server URLs against this hub.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector { hub: self.clone() })
    }

    /// Make every database of the node at `url` hang instead of answering,
    /// so callers run into their deadlines. Reversible.
    pub fn set_stalled(&self, url: &str, stalled: bool) {
        if let Some(db) = self.node(url) {
            db.shared.stalled.store(stalled, Relaxed);
        }
    }

    /// Apply every live replication task of every node once.
    ///
    /// Returns the number of documents copied. Calling it repeatedly until
    /// it returns zero brings the deployment to a fixpoint.
    pub fn settle(&self) -> usize {
        let nodes: Vec<(String, MemoryDb)> = self
            .inner
            .read()
            .unwrap()
            .iter()
            .map(|(url, db)| (url.clone(), db.clone()))
            .collect();
        let mut copied = 0;
        for (url, node) in &nodes {
            let tasks: Vec<ReplicationDoc> = {
                let state = node.shared.state.read().unwrap();
                let Some(repl) = state.dbs.get(REPLICATOR_DB) else {
                    continue;
                };
                repl.docs
                    .values()
                    .filter(|stored| !stored.doc.is_deleted())
                    .filter_map(|stored| ReplicationDoc::from_document(&stored.doc))
                    .collect()
            };
            for task in tasks {
                copied += self.apply_task(url, node, &task);
            }
        }
        copied
    }

    fn apply_task(&self, node_url: &str, node: &MemoryDb, task: &ReplicationDoc) -> usize {
        let Some((source, source_db)) = self.resolve(node_url, node, &task.source) else {
            trace!(task = %task.id, source = %task.source, "replication source unreachable");
            return 0;
        };
        let Some((target, target_db)) = self.resolve(node_url, node, &task.target) else {
            trace!(task = %task.id, target = %task.target, "replication target unreachable");
            return 0;
        };

        let batch: Vec<Stored> = {
            let state = source.shared.state.read().unwrap();
            let Some(db) = state.dbs.get(&source_db) else {
                return 0;
            };
            db.docs
                .iter()
                .filter(|(id, _)| !id.starts_with(DESIGN_PREFIX) && !id.starts_with(LOCAL_PREFIX))
                .filter(|(id, _)| {
                    task.doc_ids
                        .as_ref()
                        .map(|ids| ids.contains(*id))
                        .unwrap_or(true)
                })
                .map(|(_, stored)| stored.clone())
                .collect()
        };

        let mut copied = 0;
        let mut state = target.shared.state.write().unwrap();
        let Some(db) = state.dbs.get_mut(&target_db) else {
            return 0;
        };
        for stored in batch {
            let id = stored
                .doc
                .doc_id()
                .expect("stored documents have ids")
                .to_string();
            let incoming_gen = rev_generation(stored.doc.rev());
            let present_gen = db
                .docs
                .get(&id)
                .and_then(|s| s.doc.rev())
                .map(|r| rev_generation(Some(r)))
                .unwrap_or(0);
            // replication preserves revisions; newer generations win
            if db.docs.contains_key(&id) && incoming_gen <= present_gen {
                continue;
            }
            db.seq += 1;
            let seq = db.seq;
            db.docs.insert(
                id,
                Stored {
                    doc: stored.doc,
                    seq,
                },
            );
            copied += 1;
        }
        copied
    }

    /// Resolve a replication endpoint to `(node, database name)`.
    fn resolve(
        &self,
        node_url: &str,
        node: &MemoryDb,
        endpoint: &str,
    ) -> Option<(MemoryDb, String)> {
        if let Some(rest) = endpoint.strip_prefix("http") {
            let (base, db_name) = rest.rsplit_once('/')?;
            let url = format!("http{base}/");
            if url == node_url {
                return Some((node.clone(), db_name.to_string()));
            }
            return self.node(&url).map(|db| (db, db_name.to_string()));
        }
        Some((node.clone(), endpoint.to_string()))
    }
}

/// One node's in-memory DocDB.
#[derive(Debug, Clone)]
pub struct MemoryDb {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    uid: String,
    stalled: AtomicBool,
    state: RwLock<ServerState>,
}

#[derive(Debug, Default)]
struct ServerState {
    dbs: BTreeMap<String, DbState>,
}

#[derive(Debug, Default)]
struct DbState {
    docs: BTreeMap<String, Stored>,
    seq: u64,
}

#[derive(Debug, Clone)]
struct Stored {
    doc: Document,
    seq: u64,
}

impl MemoryDb {
    /// Create a standalone DocDB with only the replicator collection.
    pub fn new() -> Self {
        let mut state = ServerState::default();
        state.dbs.insert(REPLICATOR_DB.to_string(), DbState::default());
        Self {
            shared: Arc::new(Shared {
                uid: fresh_hex(),
                stalled: AtomicBool::new(false),
                state: RwLock::new(state),
            }),
        }
    }

    /// This DocDB as a trait object.
    pub fn as_docdb(&self) -> Arc<dyn DocDb> {
        Arc::new(self.clone())
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocDb for MemoryDb {
    async fn instance_uid(&self) -> Result<Option<String>, DbError> {
        Ok(Some(self.shared.uid.clone()))
    }

    async fn create_db(&self, name: &str) -> Result<(), DbError> {
        let mut state = self.shared.state.write().unwrap();
        state.dbs.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn drop_db(&self, name: &str) -> Result<(), DbError> {
        let mut state = self.shared.state.write().unwrap();
        state
            .dbs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DbError::NoDatabase {
                name: name.to_string(),
            })
    }

    async fn list_dbs(&self) -> Result<Vec<String>, DbError> {
        let state = self.shared.state.read().unwrap();
        Ok(state.dbs.keys().cloned().collect())
    }

    fn db(&self, name: &str) -> Arc<dyn Database> {
        Arc::new(MemoryDatabase {
            name: name.to_string(),
            shared: self.shared.clone(),
        })
    }
}

/// Handle on one database of a [`MemoryDb`].
#[derive(Debug)]
struct MemoryDatabase {
    name: String,
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    /// Suspends forever while the owning node is marked stalled.
    async fn stall_point(&self) {
        if self.shared.stalled.load(Relaxed) {
            std::future::pending::<()>().await;
        }
    }

    fn with_db<T>(&self, f: impl FnOnce(&DbState) -> T) -> Result<T, DbError> {
        let state = self.shared.state.read().unwrap();
        let db = state.dbs.get(&self.name).ok_or_else(|| DbError::NoDatabase {
            name: self.name.clone(),
        })?;
        Ok(f(db))
    }

    fn put_locked(db: &mut DbState, doc: &Document) -> Result<PutOutcome, DbError> {
        let mut doc = doc.clone();
        let id = match doc.doc_id() {
            Some(id) => id.to_string(),
            None => {
                let id = fresh_hex();
                doc.set_doc_id(&id);
                id
            }
        };
        // `_local` documents are non-versioned bookkeeping; last write wins.
        let versioned = !id.starts_with(LOCAL_PREFIX);
        let mut generation = 0;
        if let Some(existing) = db.docs.get(&id) {
            generation = rev_generation(existing.doc.rev());
            if versioned {
                let given = doc.rev().map(str::to_string);
                let current = existing.doc.rev().map(str::to_string);
                let stale = if existing.doc.is_deleted() {
                    // recreating a tombstoned document needs no revision
                    given.is_some() && given != current
                } else {
                    given != current
                };
                if stale {
                    return Err(DbError::Conflict { id });
                }
            }
        } else if versioned && doc.rev().is_some() {
            return Err(DbError::Conflict { id });
        }
        let rev = format!("{}-{:016x}", generation + 1, rand::thread_rng().gen::<u64>());
        doc.set_rev(&rev);
        db.seq += 1;
        let seq = db.seq;
        db.docs.insert(id.clone(), Stored { doc, seq });
        Ok(PutOutcome { id, rev })
    }

    fn index_installed(db: &DbState) -> bool {
        db.docs
            .get("_design/index")
            .map(|stored| !stored.doc.is_deleted())
            .unwrap_or(false)
    }

    fn entity_rows(db: &DbState, include_docs: bool) -> Vec<ViewRow> {
        let mut rows: Vec<ViewRow> = live_entity_docs(db)
            .map(|(id, doc)| ViewRow {
                id: id.clone(),
                key: Value::String(doc.entity().expect("filtered on @id").to_string()),
                value: json!({ "rev": doc.rev(), "doc_id": id }),
                doc: include_docs.then(|| doc.clone()),
            })
            .collect();
        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        rows
    }

    fn property_value_rows(db: &DbState, include_docs: bool) -> Vec<ViewRow> {
        let mut rows = Vec::new();
        for (id, doc) in live_entity_docs(db) {
            let entity = doc.entity().expect("filtered on @id").to_string();
            for (prop, _) in doc.properties() {
                for value in doc.values_of(prop) {
                    rows.push(ViewRow {
                        id: id.clone(),
                        key: json!([prop, value]),
                        value: Value::String(entity.clone()),
                        doc: include_docs.then(|| doc.clone()),
                    });
                }
            }
        }
        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        rows
    }
}

fn live_entity_docs(db: &DbState) -> impl Iterator<Item = (&String, &Document)> {
    db.docs
        .iter()
        .filter(|(id, _)| !id.starts_with(DESIGN_PREFIX) && !id.starts_with(LOCAL_PREFIX))
        .filter(|(_, stored)| !stored.doc.is_deleted() && stored.doc.entity().is_some())
        .map(|(id, stored)| (id, &stored.doc))
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Option<Document>, DbError> {
        self.stall_point().await;
        self.with_db(|db| {
            db.docs
                .get(id)
                .filter(|stored| !stored.doc.is_deleted())
                .map(|stored| stored.doc.clone())
        })
    }

    async fn put(&self, doc: &Document) -> Result<PutOutcome, DbError> {
        self.stall_point().await;
        let mut state = self.shared.state.write().unwrap();
        let db = state.dbs.get_mut(&self.name).ok_or_else(|| DbError::NoDatabase {
            name: self.name.clone(),
        })?;
        Self::put_locked(db, doc)
    }

    async fn bulk_put(
        &self,
        docs: Vec<Document>,
    ) -> Result<Vec<Result<PutOutcome, DbError>>, DbError> {
        self.stall_point().await;
        let mut state = self.shared.state.write().unwrap();
        let db = state.dbs.get_mut(&self.name).ok_or_else(|| DbError::NoDatabase {
            name: self.name.clone(),
        })?;
        Ok(docs.iter().map(|doc| Self::put_locked(db, doc)).collect())
    }

    async fn all_docs(&self) -> Result<Vec<Document>, DbError> {
        self.stall_point().await;
        self.with_db(|db| {
            db.docs
                .iter()
                .filter(|(id, _)| !id.starts_with(LOCAL_PREFIX))
                .filter(|(_, stored)| !stored.doc.is_deleted())
                .map(|(_, stored)| stored.doc.clone())
                .collect()
        })
    }

    async fn view(&self, view: &str, query: ViewQuery) -> Result<Vec<ViewRow>, DbError> {
        self.stall_point().await;
        let rows = self.with_db(|db| {
            if !Self::index_installed(db) {
                return Err(DbError::InvalidDocument {
                    reason: format!("database `{}` has no index design document", self.name),
                });
            }
            match view {
                "by_entity" => Ok(Self::entity_rows(db, query.include_docs)),
                "by_property_value" => Ok(Self::property_value_rows(db, query.include_docs)),
                other => Err(DbError::InvalidDocument {
                    reason: format!("unknown view `{other}`"),
                }),
            }
        })??;
        Ok(rows
            .into_iter()
            .filter(|row| match (&query.key, &query.startkey, &query.endkey) {
                (Some(key), _, _) => collate(&row.key, key) == Ordering::Equal,
                (None, start, end) => {
                    start
                        .as_ref()
                        .map(|s| collate(&row.key, s) != Ordering::Less)
                        .unwrap_or(true)
                        && end
                            .as_ref()
                            .map(|e| collate(&row.key, e) != Ordering::Greater)
                            .unwrap_or(true)
                }
            })
            .collect())
    }

    async fn changes(
        &self,
        since: u64,
        doc_ids: Option<Vec<String>>,
    ) -> Result<ChangesPage, DbError> {
        self.stall_point().await;
        self.with_db(|db| {
            let mut changes: Vec<Change> = db
                .docs
                .iter()
                .filter(|(_, stored)| stored.seq > since)
                .filter(|(id, _)| {
                    doc_ids
                        .as_ref()
                        .map(|ids| ids.iter().any(|x| x == *id))
                        .unwrap_or(true)
                })
                .map(|(id, stored)| Change {
                    id: id.clone(),
                    seq: stored.seq,
                    deleted: stored.doc.is_deleted(),
                    doc: Some(stored.doc.clone()),
                })
                .collect();
            changes.sort_by_key(|c| c.seq);
            ChangesPage {
                last_seq: db.seq,
                changes,
            }
        })
    }
}

#[derive(Debug, Clone)]
struct MemoryConnector {
    hub: MemoryHub,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn DocDb>, DbError> {
        self.hub
            .node(url)
            .map(|db| db.as_docdb())
            .ok_or_else(|| DbError::unavailable(anyhow::anyhow!("no DocDB at {url}")))
    }
}

fn fresh_hex() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

fn rev_generation(rev: Option<&str>) -> u64 {
    rev.and_then(|r| r.split_once('-'))
        .and_then(|(n, _)| n.parse().ok())
        .unwrap_or(0)
}

/// Total order over JSON values in the CouchDB view collation style:
/// null < booleans < numbers < strings < arrays < objects.
fn collate(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xa, ya) in x.iter().zip(y.iter()) {
                let ord = collate(xa, ya);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn entity_doc(entity: &str, prop: &str, value: &str) -> Document {
        let mut doc = Document::for_entity(entity);
        doc.add_property(prop, &value.into()).unwrap();
        doc
    }

    #[tokio::test]
    async fn put_assigns_ids_and_detects_conflicts() {
        let server = MemoryDb::new();
        server.create_db("db").await.unwrap();
        let db = server.db("db");

        let doc = entity_doc("e1", "p", "v");
        let outcome = db.put(&doc).await.unwrap();
        assert!(outcome.rev.starts_with("1-"));

        // a stale write (no rev against an existing doc) conflicts
        let mut again = entity_doc("e1", "p", "v2");
        again.set_doc_id(&outcome.id);
        assert!(matches!(
            db.put(&again).await,
            Err(DbError::Conflict { .. })
        ));

        again.set_rev(outcome.rev);
        let outcome = db.put(&again).await.unwrap();
        assert!(outcome.rev.starts_with("2-"));
    }

    #[tokio::test]
    async fn tombstoned_documents_disappear_from_reads() {
        let server = MemoryDb::new();
        server.create_db("db").await.unwrap();
        let db = server.db("db");
        let mut doc = entity_doc("e1", "p", "v");
        doc.set_doc_id("d1");
        let outcome = db.put(&doc).await.unwrap();
        doc.set_rev(outcome.rev);
        db.put(&doc.tombstone()).await.unwrap();

        assert!(db.get("d1").await.unwrap().is_none());
        assert!(db.all_docs().await.unwrap().is_empty());

        // changes still report the deletion
        let page = db.changes(0, Some(vec!["d1".to_string()])).await.unwrap();
        assert!(page.changes.last().unwrap().deleted);

        // and the id can be recreated without a revision
        let mut fresh = entity_doc("e1", "p", "v2");
        fresh.set_doc_id("d1");
        let outcome = db.put(&fresh).await.unwrap();
        assert!(outcome.rev.starts_with("3-"));
    }

    #[tokio::test]
    async fn views_require_the_index_design_doc() {
        let server = MemoryDb::new();
        server.create_db("db").await.unwrap();
        let db = server.db("db");
        assert!(db.view("by_entity", ViewQuery::default()).await.is_err());

        let mut design = Document::new();
        design.set_doc_id("_design/index");
        db.put(&design).await.unwrap();
        db.put(&entity_doc("e1", "p", "v")).await.unwrap();

        let rows = db
            .view("by_entity", ViewQuery::key("e1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value["doc_id"], Value::String(rows[0].id.clone()));
    }

    #[tokio::test]
    async fn property_value_view_unrolls_sequences_and_scans() {
        let server = MemoryDb::new();
        server.create_db("db").await.unwrap();
        let db = server.db("db");
        let mut design = Document::new();
        design.set_doc_id("_design/index");
        db.put(&design).await.unwrap();

        let mut doc = Document::for_entity("e1");
        doc.add_property("p", &"a".into()).unwrap();
        doc.add_property("p", &"b".into()).unwrap();
        db.put(&doc).await.unwrap();
        db.put(&entity_doc("e2", "q", "a")).await.unwrap();

        let rows = db
            .view("by_property_value", ViewQuery::key(json!(["p", "a"])))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, Value::String("e1".to_string()));

        // prefix scan over all values of `p`
        let rows = db
            .view(
                "by_property_value",
                ViewQuery::range(json!(["p"]), json!(["p", {}])),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn settle_honors_doc_ids_and_tombstones() {
        let hub = MemoryHub::new();
        let a = hub.add_node("http://10.0.0.1:5984/");
        let b = hub.add_node("http://10.0.0.2:5984/");
        for node in [&a, &b] {
            node.create_db("ers-public").await.unwrap();
            node.create_db("ers-cache").await.unwrap();
        }
        let mut wanted = entity_doc("e1", "p", "v");
        wanted.set_doc_id("d1");
        let outcome = a.db("ers-public").put(&wanted).await.unwrap();
        let mut other = entity_doc("e2", "p", "v");
        other.set_doc_id("d2");
        a.db("ers-public").put(&other).await.unwrap();

        let task = ReplicationDoc {
            id: "ers-b-auto-get-from-public-of-10.0.0.1:5984".to_string(),
            source: "http://10.0.0.1:5984/ers-public".to_string(),
            target: "ers-cache".to_string(),
            continuous: true,
            doc_ids: Some(BTreeSet::from(["d1".to_string()])),
        };
        b.replicator().put(&task.to_document()).await.unwrap();

        assert_eq!(hub.settle(), 1);
        assert!(b.db("ers-cache").get("d1").await.unwrap().is_some());
        assert!(b.db("ers-cache").get("d2").await.unwrap().is_none());
        assert_eq!(hub.settle(), 0);

        // tombstone on the source propagates through the filter
        wanted.set_rev(outcome.rev);
        a.db("ers-public").put(&wanted.tombstone()).await.unwrap();
        assert_eq!(hub.settle(), 1);
        assert!(b.db("ers-cache").get("d1").await.unwrap().is_none());
    }
}
