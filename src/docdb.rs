//! The document database interface the registry is built against.
//!
//! The registry never talks to a concrete database directly. It consumes the
//! traits in this module: [`DocDb`] for a server holding named databases,
//! [`Database`] for one database, and [`Connector`] for reaching the DocDB of
//! a remote peer. The [`memory`] module provides an in-process implementation
//! used by tests and by local-only deployments.

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Document;

pub mod memory;

/// A revision token mediating optimistic concurrency.
pub type Rev = String;

/// Name of the replicator collection.
///
/// Replication tasks are plain documents in this database. Writing one starts
/// the described replication; tombstoning it stops the replication.
pub const REPLICATOR_DB: &str = "_replicator";

/// Errors surfaced by a DocDB backend.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The write carried a stale revision token.
    #[error("update conflict on document `{id}`")]
    Conflict {
        /// Id of the contested document.
        id: String,
    },
    /// The named database does not exist.
    #[error("no such database `{name}`")]
    NoDatabase {
        /// Name of the missing database.
        name: String,
    },
    /// The backend could not be reached.
    #[error("document database unavailable")]
    Unavailable {
        /// Transport-level cause.
        #[source]
        error: anyhow::Error,
    },
    /// The document is not acceptable to the backend.
    #[error("invalid document: {reason}")]
    InvalidDocument {
        /// Why the document was rejected.
        reason: String,
    },
}

impl DbError {
    pub(crate) fn unavailable(error: impl Into<anyhow::Error>) -> Self {
        Self::Unavailable {
            error: error.into(),
        }
    }
}

/// Options for a view query.
#[derive(Debug, Clone, Default)]
pub struct ViewQuery {
    /// Exact key to match.
    pub key: Option<Value>,
    /// Inclusive lower bound of a range scan.
    pub startkey: Option<Value>,
    /// Inclusive upper bound of a range scan.
    pub endkey: Option<Value>,
    /// Attach the full document to each row.
    pub include_docs: bool,
}

impl ViewQuery {
    /// Query rows with an exact key.
    pub fn key(key: impl Into<Value>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Query rows within an inclusive key range.
    pub fn range(startkey: impl Into<Value>, endkey: impl Into<Value>) -> Self {
        Self {
            startkey: Some(startkey.into()),
            endkey: Some(endkey.into()),
            ..Default::default()
        }
    }

    /// Attach full documents to the result rows.
    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }
}

/// Outcome of a successful document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Id of the written document, assigned by the backend when the
    /// document carried none.
    pub id: String,
    /// The new revision token.
    pub rev: Rev,
}

/// One row of a view result.
#[derive(Debug, Clone)]
pub struct ViewRow {
    /// Id of the emitting document.
    pub id: String,
    /// Emitted key.
    pub key: Value,
    /// Emitted value.
    pub value: Value,
    /// The emitting document, when `include_docs` was requested.
    pub doc: Option<Document>,
}

/// One entry of a change feed page.
#[derive(Debug, Clone)]
pub struct Change {
    /// Id of the changed document.
    pub id: String,
    /// Sequence number of the change.
    pub seq: u64,
    /// Whether the change is a deletion.
    pub deleted: bool,
    /// The changed document.
    pub doc: Option<Document>,
}

/// A page of the change feed.
#[derive(Debug, Clone, Default)]
pub struct ChangesPage {
    /// Cursor to resume from.
    pub last_seq: u64,
    /// The changes since the requested cursor.
    pub changes: Vec<Change>,
}

/// A server holding named document databases.
#[async_trait]
pub trait DocDb: Send + Sync + 'static {
    /// A stable identifier of this DocDB instance, if the backend has one.
    async fn instance_uid(&self) -> Result<Option<String>, DbError>;

    /// Create a named database. Creating an existing database is a no-op.
    async fn create_db(&self, name: &str) -> Result<(), DbError>;

    /// Drop a named database and everything in it.
    async fn drop_db(&self, name: &str) -> Result<(), DbError>;

    /// List the database names present on this server.
    async fn list_dbs(&self) -> Result<Vec<String>, DbError>;

    /// A handle on a named database. The database may not exist yet;
    /// operations on a missing database fail with [`DbError::NoDatabase`].
    fn db(&self, name: &str) -> Arc<dyn Database>;

    /// The replicator collection of this server.
    fn replicator(&self) -> Arc<dyn Database> {
        self.db(REPLICATOR_DB)
    }
}

/// One named document database.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// The database name.
    fn name(&self) -> &str;

    /// Fetch a document by id. Missing and tombstoned documents read as
    /// `None`.
    async fn get(&self, id: &str) -> Result<Option<Document>, DbError>;

    /// Write a document, returning the assigned id and new revision token.
    ///
    /// A document without `_id` is assigned one. A write against an existing
    /// document must carry its current `_rev` or fail with
    /// [`DbError::Conflict`]; recreating a tombstoned document needs no
    /// revision.
    async fn put(&self, doc: &Document) -> Result<PutOutcome, DbError>;

    /// Write a batch of documents, returning a per-document outcome in input
    /// order.
    async fn bulk_put(
        &self,
        docs: Vec<Document>,
    ) -> Result<Vec<Result<PutOutcome, DbError>>, DbError>;

    /// All live documents, excluding `_local` ones.
    async fn all_docs(&self) -> Result<Vec<Document>, DbError>;

    /// Query a view of the installed design document.
    async fn view(&self, view: &str, query: ViewQuery) -> Result<Vec<ViewRow>, DbError>;

    /// Read the change feed from a sequence cursor, optionally filtered to a
    /// set of document ids.
    async fn changes(
        &self,
        since: u64,
        doc_ids: Option<Vec<String>>,
    ) -> Result<ChangesPage, DbError>;
}

/// Reaches the DocDB of a peer by server URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to the DocDB at `url`.
    async fn connect(&self, url: &str) -> Result<Arc<dyn DocDb>, DbError>;
}

/// A replication task as stored in the replicator collection.
///
/// `source` and `target` are either a local database name or a full
/// `http://host:port/dbname` reference on another server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationDoc {
    /// Task id, also the document `_id`.
    #[serde(rename = "_id")]
    pub id: String,
    /// Database to copy from.
    pub source: String,
    /// Database to copy into.
    pub target: String,
    /// Whether the replication keeps running after catching up.
    pub continuous: bool,
    /// Restrict the replication to these document ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_ids: Option<BTreeSet<String>>,
}

impl ReplicationDoc {
    /// Render into a plain document, without a revision.
    pub fn to_document(&self) -> Document {
        let value = serde_json::to_value(self).expect("replication doc serializes");
        match value {
            Value::Object(map) => Document::from(map),
            _ => unreachable!("replication doc is an object"),
        }
    }

    /// Parse from a stored document. Returns `None` for documents that do
    /// not describe a replication task.
    pub fn from_document(doc: &Document) -> Option<ReplicationDoc> {
        let value = serde_json::to_value(doc).ok()?;
        serde_json::from_value(value).ok()
    }

    /// Whether this task copies the same documents the same way as `other`.
    ///
    /// Revision tokens are not part of the comparison; two tasks are the
    /// same when id, endpoints, mode and id filter all match.
    pub fn same_task(&self, other: &ReplicationDoc) -> bool {
        self == other
    }
}
