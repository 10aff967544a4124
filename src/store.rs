//! The local three-store layout plus the state database.
//!
//! Every node owns four named databases: `ers-public` and `ers-private` for
//! its own documents, `ers-cache` for subscribed copies of other peers'
//! documents, and `ers-state` for node-local bookkeeping. Each database
//! carries the same index design document with two views: `by_entity` maps
//! entity names to document locations, `by_property_value` maps
//! `[property, value]` pairs to entity names with sequence values unrolled.

use std::{collections::BTreeSet, sync::Arc};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    docdb::{Database, DbError, DocDb, ViewQuery},
    entity::Scope,
    model::Document,
    peers::PeerInfo,
};

/// Id of the index design document installed in every database.
pub const INDEX_DESIGN_ID: &str = "_design/index";
/// Id of the node-state document in the state database.
pub const STATE_DOC_ID: &str = "_local/state";
/// Name of the entity-location view.
pub const BY_ENTITY: &str = "by_entity";
/// Name of the property/value search view.
pub const BY_PROPERTY_VALUE: &str = "by_property_value";

const BY_ENTITY_MAP: &str =
    "function(doc) {if ('@id' in doc) {emit(doc['@id'], {'rev': doc._rev, 'doc_id': doc._id})}}";

const BY_PROPERTY_VALUE_MAP: &str = "\
function(doc) {
  if ('@id' in doc) {
    var entity = doc['@id'];
    for (var property in doc) {
      if (property[0] != '_' && property[0] != '@') {
        var values = doc[property];
        if (!Array.isArray(values)) { values = [values]; }
        values.forEach(function(value) { emit([property, value], entity); });
      }
    }
  }
}";

/// Errors from the store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A save collided with a concurrent write; re-read and retry.
    #[error("write conflict on document `{id}`")]
    Conflict {
        /// Id of the contested document.
        id: String,
    },
    /// The backing DocDB failed.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// The four databases a node owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StoreKind {
    /// Locally authored, replicated to peer caches.
    Public,
    /// Locally authored, never replicated.
    Private,
    /// Subscribed copies pulled from peers.
    Cache,
    /// Node-local bookkeeping.
    State,
}

impl StoreKind {
    /// All four stores.
    pub const ALL: [StoreKind; 4] = [
        StoreKind::Public,
        StoreKind::Private,
        StoreKind::Cache,
        StoreKind::State,
    ];

    /// The stores holding entity documents on this node.
    pub const LOCAL: [StoreKind; 3] = [StoreKind::Public, StoreKind::Private, StoreKind::Cache];

    /// The database name of this store.
    pub fn db_name(self) -> &'static str {
        match self {
            StoreKind::Public => "ers-public",
            StoreKind::Private => "ers-private",
            StoreKind::Cache => "ers-cache",
            StoreKind::State => "ers-state",
        }
    }

    /// The read scope documents from this store carry, if any.
    pub fn scope(self) -> Option<Scope> {
        match self {
            StoreKind::Public => Some(Scope::Public),
            StoreKind::Private => Some(Scope::Private),
            StoreKind::Cache => Some(Scope::Cache),
            StoreKind::State => None,
        }
    }
}

/// The index design document shared by all databases.
pub fn index_doc() -> Document {
    let mut doc = Document::new();
    doc.set_doc_id(INDEX_DESIGN_ID);
    doc.insert(
        "views",
        json!({
            BY_ENTITY: { "map": BY_ENTITY_MAP },
            BY_PROPERTY_VALUE: { "map": BY_PROPERTY_VALUE_MAP },
        }),
    );
    doc
}

fn state_doc() -> Document {
    let mut doc = Document::new();
    doc.set_doc_id(STATE_DOC_ID);
    doc.insert("peers", json!([]));
    doc
}

/// One database plus the entity-level operations over its index.
#[derive(derive_more::Debug, Clone)]
pub struct EntityDb {
    #[debug("Database")]
    db: Arc<dyn Database>,
}

impl EntityDb {
    /// Wrap a database handle.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// The underlying database handle.
    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Whether at least one document describes `entity`.
    pub async fn exists(&self, entity: &str) -> Result<bool, StoreError> {
        let rows = self.db.view(BY_ENTITY, ViewQuery::key(entity)).await?;
        Ok(!rows.is_empty())
    }

    /// The full documents describing `entity`.
    pub async fn docs_by_entity(&self, entity: &str) -> Result<Vec<Document>, StoreError> {
        let rows = self
            .db
            .view(BY_ENTITY, ViewQuery::key(entity).include_docs())
            .await?;
        Ok(rows.into_iter().filter_map(|row| row.doc).collect())
    }

    /// The database ids of the documents describing `entity`.
    pub async fn doc_ids_by_entity(&self, entity: &str) -> Result<BTreeSet<String>, StoreError> {
        let rows = self.db.view(BY_ENTITY, ViewQuery::key(entity)).await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// The ids of every entity-bearing document in this database.
    pub async fn all_entity_doc_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        let rows = self.db.view(BY_ENTITY, ViewQuery::default()).await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// Unique entity names holding `value` under `prop`; with `value`
    /// absent, a prefix scan over every value of `prop`.
    pub async fn by_property_value(
        &self,
        prop: &str,
        value: Option<&Value>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let query = match value {
            Some(value) => ViewQuery::key(json!([prop, value])),
            // `{}` collates after every literal, closing the prefix range
            None => ViewQuery::range(json!([prop]), json!([prop, {}])),
        };
        let rows = self.db.view(BY_PROPERTY_VALUE, query).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.value.as_str().map(str::to_string))
            .collect())
    }

    /// Write a document, updating its id and revision token in place.
    pub async fn save(&self, doc: &mut Document) -> Result<(), StoreError> {
        match self.db.put(doc).await {
            Ok(outcome) => {
                doc.set_doc_id(outcome.id);
                doc.set_rev(outcome.rev);
                Ok(())
            }
            Err(DbError::Conflict { id }) => Err(StoreError::Conflict { id }),
            Err(err) => Err(err.into()),
        }
    }

    /// Tombstone every document describing `entity`.
    ///
    /// The tombstones keep `_id`, `_rev`, `@id` and `@owner` so filtered
    /// replications propagate the deletion. Returns true when every
    /// tombstone was written.
    pub async fn delete_entity(&self, entity: &str) -> Result<bool, StoreError> {
        let docs = self.docs_by_entity(entity).await?;
        if docs.is_empty() {
            return Ok(true);
        }
        let tombstones: Vec<Document> = docs.iter().map(Document::tombstone).collect();
        let outcomes = self.db.bulk_put(tombstones).await?;
        let mut all_ok = true;
        for (doc, outcome) in docs.iter().zip(outcomes) {
            if let Err(err) = outcome {
                warn!(
                    db = self.db.name(),
                    id = doc.doc_id().unwrap_or("?"),
                    %err,
                    "failed to tombstone document"
                );
                all_ok = false;
            }
        }
        Ok(all_ok)
    }
}

/// The four databases of one node.
#[derive(derive_more::Debug, Clone)]
pub struct Store {
    #[debug("DocDb")]
    docdb: Arc<dyn DocDb>,
    public: EntityDb,
    private: EntityDb,
    cache: EntityDb,
    state: EntityDb,
}

impl Store {
    /// Open the store on a DocDB, creating missing databases and installing
    /// the index design document and the state document where absent.
    pub async fn open(docdb: Arc<dyn DocDb>) -> Result<Self, StoreError> {
        for kind in StoreKind::ALL {
            docdb.create_db(kind.db_name()).await?;
            let db = docdb.db(kind.db_name());
            if db.get(INDEX_DESIGN_ID).await?.is_none() {
                debug!(db = kind.db_name(), "installing index design document");
                db.put(&index_doc()).await?;
            }
        }
        let store = Self {
            public: EntityDb::new(docdb.db(StoreKind::Public.db_name())),
            private: EntityDb::new(docdb.db(StoreKind::Private.db_name())),
            cache: EntityDb::new(docdb.db(StoreKind::Cache.db_name())),
            state: EntityDb::new(docdb.db(StoreKind::State.db_name())),
            docdb,
        };
        if store.state.database().get(STATE_DOC_ID).await?.is_none() {
            store.state.database().put(&state_doc()).await?;
        }
        Ok(store)
    }

    /// The backing DocDB.
    pub fn docdb(&self) -> &Arc<dyn DocDb> {
        &self.docdb
    }

    /// The entity operations of one store.
    pub fn kind(&self, kind: StoreKind) -> &EntityDb {
        match kind {
            StoreKind::Public => &self.public,
            StoreKind::Private => &self.private,
            StoreKind::Cache => &self.cache,
            StoreKind::State => &self.state,
        }
    }

    /// Every local document describing `entity`, tagged with its scope.
    pub async fn docs_by_entity_local(
        &self,
        entity: &str,
    ) -> Result<Vec<(Scope, Document)>, StoreError> {
        let mut out = Vec::new();
        for kind in StoreKind::LOCAL {
            let scope = kind.scope().expect("local stores carry a scope");
            for doc in self.kind(kind).docs_by_entity(entity).await? {
                out.push((scope, doc));
            }
        }
        Ok(out)
    }

    /// Property/value search across the three local stores.
    pub async fn by_property_value_local(
        &self,
        prop: &str,
        value: Option<&Value>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let mut out = BTreeSet::new();
        for kind in StoreKind::LOCAL {
            out.extend(self.kind(kind).by_property_value(prop, value).await?);
        }
        Ok(out)
    }

    /// Drop and recreate every database, reinstalling indexes and an empty
    /// peer state.
    pub async fn reset(&self) -> Result<(), StoreError> {
        for kind in StoreKind::ALL {
            match self.docdb.drop_db(kind.db_name()).await {
                Ok(()) | Err(DbError::NoDatabase { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            self.docdb.create_db(kind.db_name()).await?;
            self.docdb.db(kind.db_name()).put(&index_doc()).await?;
        }
        self.state.database().put(&state_doc()).await?;
        Ok(())
    }

    /// The dynamic peer list from the state document.
    pub async fn state_peers(&self) -> Result<Vec<PeerInfo>, StoreError> {
        let Some(doc) = self.state.database().get(STATE_DOC_ID).await? else {
            return Ok(Vec::new());
        };
        let peers = doc
            .get("peers")
            .cloned()
            .unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(peers).unwrap_or_default())
    }

    /// Replace the dynamic peer list in the state document.
    pub async fn set_state_peers(&self, peers: &[PeerInfo]) -> Result<(), StoreError> {
        let mut doc = self
            .state
            .database()
            .get(STATE_DOC_ID)
            .await?
            .unwrap_or_else(state_doc);
        doc.insert("peers", serde_json::to_value(peers).expect("peers serialize"));
        self.state.database().put(&doc).await?;
        Ok(())
    }

    /// The DocDB instance identifier, if the backend exposes one.
    pub async fn instance_uid(&self) -> Result<Option<String>, StoreError> {
        Ok(self.docdb.instance_uid().await?)
    }
}
