//! The registry API over an entity name.
//!
//! A [`Registry`] owns the node's host identity and orchestrates the store
//! layer, the entity aggregate and the federated query path. Peer-side
//! failures never fail a read; only local-store failures that survive the
//! bounded retry are surfaced.

use std::sync::Arc;

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    docdb::Connector,
    entity::{Entity, Scope},
    federation::Federation,
    model::Literal,
    peers::PeerInfo,
    replication::RefreshHandle,
    store::{Store, StoreError, StoreKind},
};

/// Attempts for a conflicted save before surfacing the error.
const MAX_SAVE_ATTEMPTS: usize = 4;

/// Construction options for a [`Registry`].
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Statically configured peers, merged with the discovered ones.
    pub fixed_peers: Vec<PeerInfo>,
    /// Never talk to peers at all.
    pub local_only: bool,
}

/// Read/write operations over entity names.
#[derive(Debug)]
pub struct Registry {
    store: Store,
    federation: Federation,
    fixed_peers: Vec<PeerInfo>,
    local_only: bool,
    host_urn: String,
    refresh: Option<RefreshHandle>,
}

impl Registry {
    /// Open a registry over a store.
    ///
    /// The host URN is derived from the DocDB instance identifier when the
    /// backend has one, otherwise from a fingerprint of the hostname.
    pub async fn open(
        store: Store,
        connector: Arc<dyn Connector>,
        options: RegistryOptions,
    ) -> Result<Self, StoreError> {
        let uid = match store.instance_uid().await? {
            Some(uid) => uid,
            None => hostname_fingerprint(),
        };
        Ok(Self {
            store,
            federation: Federation::new(connector),
            fixed_peers: options.fixed_peers,
            local_only: options.local_only,
            host_urn: format!("urn:ers:host:{uid}"),
            refresh: None,
        })
    }

    /// Wire the replication controller's trigger, so cache changes get
    /// picked up without waiting for the next discovery event.
    pub fn with_refresh_handle(mut self, refresh: RefreshHandle) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// The URN stamped into `@owner` on documents this node authors.
    pub fn host_urn(&self) -> &str {
        &self.host_urn
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The federated query engine.
    pub fn federation(&self) -> &Federation {
        &self.federation
    }

    /// Build the aggregate for an entity from the local stores and, when
    /// `include_remote` is set, from every reachable peer.
    pub async fn get(&self, entity_name: &str, include_remote: bool) -> Result<Entity, StoreError> {
        let mut entity = Entity::new(entity_name);
        for (scope, doc) in self.store.docs_by_entity_local(entity_name).await? {
            entity.attach(doc, scope);
        }
        if include_remote {
            let peers = self.peers().await?;
            if !peers.is_empty() {
                for doc in self.federation.docs_by_entity(&peers, entity_name).await {
                    entity.attach(doc, Scope::Remote);
                }
            }
        }
        Ok(entity)
    }

    /// Save the owned slots of an aggregate into their stores.
    ///
    /// `@owner` is stamped on first save and never rewritten. The two saves
    /// are independent; the first error is reported after both ran.
    pub async fn persist(&self, entity: &mut Entity) -> Result<(), StoreError> {
        let mut first_err = None;
        for private in [false, true] {
            let kind = if private {
                StoreKind::Private
            } else {
                StoreKind::Public
            };
            let Some(doc) = entity.owned_document_mut(private) else {
                continue;
            };
            if doc.owner().is_none() {
                doc.set_owner(&self.host_urn);
            }
            if let Err(err) = self.save_with_retry(kind, entity, private).await {
                warn!(entity = entity.name(), store = %kind, %err, "persist failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Tombstone an entity in the public and private stores. The cache is
    /// untouched. Returns true only when both stores fully deleted.
    pub async fn delete(&self, entity_name: &str) -> Result<bool, StoreError> {
        let public = self
            .store
            .kind(StoreKind::Public)
            .delete_entity(entity_name)
            .await?;
        let private = self
            .store
            .kind(StoreKind::Private)
            .delete_entity(entity_name)
            .await?;
        Ok(public && private)
    }

    /// Entity names holding `value` under `prop`, locally and on peers,
    /// deduplicated. With `value` absent, every entity carrying `prop`.
    pub async fn search(
        &self,
        prop: &str,
        value: Option<&Literal>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let encoded: Option<Value> = value.map(|v| v.encode().0);
        let mut hits = self
            .store
            .by_property_value_local(prop, encoded.as_ref())
            .await?;
        let peers = self.peers().await?;
        if !peers.is_empty() {
            hits.extend(
                self.federation
                    .by_property_value(&peers, prop, encoded.as_ref())
                    .await,
            );
        }
        Ok(hits)
    }

    /// Whether the public or private store describes this entity.
    pub async fn exists_locally(&self, entity_name: &str) -> Result<bool, StoreError> {
        Ok(self.store.kind(StoreKind::Public).exists(entity_name).await?
            || self
                .store
                .kind(StoreKind::Private)
                .exists(entity_name)
                .await?)
    }

    /// Whether the cache store holds at least one document for this entity.
    pub async fn is_cached(&self, entity_name: &str) -> Result<bool, StoreError> {
        self.store.kind(StoreKind::Cache).exists(entity_name).await
    }

    /// Subscribe to an entity: persist its remote-scope documents into the
    /// cache store and nudge the replication controller. A no-op when the
    /// entity is already cached. Returns whether anything changed.
    pub async fn cache(&self, entity: &Entity) -> Result<bool, StoreError> {
        if self.is_cached(entity.name()).await? {
            debug!(entity = entity.name(), "already cached");
            return Ok(false);
        }
        for doc in entity.remote_documents() {
            let mut copy = doc.clone();
            // the copy starts a fresh revision chain in the cache store
            copy.clear_rev();
            self.store.kind(StoreKind::Cache).save(&mut copy).await?;
        }
        self.notify_replication();
        Ok(true)
    }

    /// Drop an entity from the cache store and nudge the replication
    /// controller. Returns whether all cache documents were tombstoned.
    pub async fn uncache(&self, entity_name: &str) -> Result<bool, StoreError> {
        let removed = self
            .store
            .kind(StoreKind::Cache)
            .delete_entity(entity_name)
            .await?;
        self.notify_replication();
        Ok(removed)
    }

    /// The peers consulted by federated reads: the fixed list from the
    /// configuration merged with the discovered peers from the state
    /// document. Empty in local-only mode.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, StoreError> {
        if self.local_only {
            return Ok(Vec::new());
        }
        let mut peers = self.fixed_peers.clone();
        for peer in self.store.state_peers().await? {
            if !peers.iter().any(|p| p.server_url() == peer.server_url()) {
                peers.push(peer);
            }
        }
        Ok(peers)
    }

    fn notify_replication(&self) {
        if let Some(refresh) = &self.refresh {
            refresh.notify();
        }
    }

    async fn save_with_retry(
        &self,
        kind: StoreKind,
        entity: &mut Entity,
        private: bool,
    ) -> Result<(), StoreError> {
        let db = self.store.kind(kind).clone();
        let name = entity.name().to_string();
        for attempt in 1.. {
            let doc = entity
                .owned_document_mut(private)
                .expect("checked by caller");
            match db.save(doc).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict { id }) if attempt < MAX_SAVE_ATTEMPTS => {
                    debug!(entity = %name, %id, attempt, "save conflict, refreshing revision");
                    // last-writer-wins: refresh the token, keep our content
                    match db.database().get(&id).await? {
                        Some(current) => {
                            if let Some(rev) = current.rev() {
                                doc.set_rev(rev);
                            }
                        }
                        None => doc.clear_rev(),
                    }
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("the retry loop returns")
    }
}

fn hostname_fingerprint() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    hex::encode(blake3::hash(host.as_bytes()).as_bytes())
}
