//! In-memory aggregate of one entity's documents.
//!
//! An [`Entity`] collects the documents describing one entity name across
//! the four scopes. The locally owned scopes hold at most one document each;
//! cache and remote hold any number. Writes only ever touch the public or
//! private slot: scope is an authoring decision, so a single edit can never
//! leak into the other owned scope.

use serde::{Deserialize, Serialize};

use crate::model::{Document, Literal, ModelError};

/// Provenance of a document inside an aggregate.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Locally owned, replicated to subscribing peers.
    Public,
    /// Locally owned, never leaves this node.
    Private,
    /// Pulled from peers by subscription.
    Cache,
    /// Fetched live from a peer during a read.
    Remote,
}

/// One `(property, value, scope)` assertion of an aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    /// Property name.
    pub property: String,
    /// Decoded value.
    pub value: Literal,
    /// Scope of the contributing document.
    pub scope: Scope,
}

/// The in-memory view of one entity.
#[derive(Debug, Clone)]
pub struct Entity {
    name: String,
    public: Option<Document>,
    private: Option<Document>,
    cache: Vec<Document>,
    remote: Vec<Document>,
}

impl Entity {
    /// Create an empty aggregate for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public: None,
            private: None,
            cache: Vec::new(),
            remote: Vec::new(),
        }
    }

    /// The entity name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a document under a scope.
    ///
    /// Documents whose `@id` does not match the aggregate's name are
    /// ignored. A second document for an owned scope replaces the first.
    pub fn attach(&mut self, doc: Document, scope: Scope) {
        if doc.entity() != Some(self.name.as_str()) {
            return;
        }
        match scope {
            Scope::Public => self.public = Some(doc),
            Scope::Private => self.private = Some(doc),
            Scope::Cache => self.cache.push(doc),
            Scope::Remote => self.remote.push(doc),
        }
    }

    /// Add a property value to the public slot, or to the private slot when
    /// `private` is set. The slot document is created on first use.
    pub fn add(&mut self, prop: &str, value: &Literal, private: bool) -> Result<(), ModelError> {
        let name = self.name.clone();
        let slot = if private {
            &mut self.private
        } else {
            &mut self.public
        };
        slot.get_or_insert_with(|| Document::for_entity(&name))
            .add_property(prop, value)
    }

    /// Replace a property: remove it from both owned slots, then add the
    /// value into the chosen one.
    pub fn set(&mut self, prop: &str, value: &Literal, private: bool) -> Result<(), ModelError> {
        self.delete(prop, None)?;
        self.add(prop, value, private)
    }

    /// Delete a property, or one value of it, from both owned slots.
    /// Deleting something absent is a no-op.
    pub fn delete(&mut self, prop: &str, value: Option<&Literal>) -> Result<(), ModelError> {
        for slot in [&mut self.public, &mut self.private] {
            if let Some(doc) = slot {
                doc.delete_property(prop, value)?;
            }
        }
        Ok(())
    }

    /// The document of an owned scope, if present.
    pub fn owned_document(&self, private: bool) -> Option<&Document> {
        if private {
            self.private.as_ref()
        } else {
            self.public.as_ref()
        }
    }

    /// Mutable access to the document of an owned scope.
    pub fn owned_document_mut(&mut self, private: bool) -> Option<&mut Document> {
        if private {
            self.private.as_mut()
        } else {
            self.public.as_mut()
        }
    }

    /// All documents with their scope, public first, remote last.
    pub fn documents(&self) -> impl Iterator<Item = (&Document, Scope)> {
        self.public
            .iter()
            .map(|d| (d, Scope::Public))
            .chain(self.private.iter().map(|d| (d, Scope::Private)))
            .chain(self.cache.iter().map(|d| (d, Scope::Cache)))
            .chain(self.remote.iter().map(|d| (d, Scope::Remote)))
    }

    /// The documents fetched live from peers.
    pub fn remote_documents(&self) -> &[Document] {
        &self.remote
    }

    /// Database ids of every attached document that has one.
    pub fn document_ids(&self) -> Vec<String> {
        self.documents()
            .filter_map(|(doc, _)| doc.doc_id())
            .map(str::to_string)
            .collect()
    }

    /// Whether the aggregate holds no documents at all.
    pub fn is_empty(&self) -> bool {
        self.documents().next().is_none()
    }

    /// Project every property/value across all scopes, decoding literals
    /// per document context. Multiplicity within one scope is preserved.
    pub fn tuples(&self) -> Vec<Tuple> {
        let mut out = Vec::new();
        for (doc, scope) in self.documents() {
            for (property, value) in doc.tuples() {
                out.push(Tuple {
                    property,
                    value,
                    scope,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(prop: &str, value: &str, scope: Scope) -> Tuple {
        Tuple {
            property: prop.to_string(),
            value: value.into(),
            scope,
        }
    }

    #[test]
    fn add_routes_by_scope() {
        let mut entity = Entity::new("urn:ers:test");
        entity.add("p", &"pub".into(), false).unwrap();
        entity.add("p", &"priv".into(), true).unwrap();

        let tuples = entity.tuples();
        assert_eq!(
            tuples,
            vec![
                tuple("p", "pub", Scope::Public),
                tuple("p", "priv", Scope::Private),
            ]
        );
    }

    #[test]
    fn set_removes_from_both_owned_scopes() {
        let mut entity = Entity::new("urn:ers:test");
        entity.add("p", &"pub".into(), false).unwrap();
        entity.add("p", &"priv".into(), true).unwrap();
        entity.set("p", &"new".into(), true).unwrap();

        assert_eq!(entity.tuples(), vec![tuple("p", "new", Scope::Private)]);
    }

    #[test]
    fn set_twice_is_idempotent() {
        let mut entity = Entity::new("urn:ers:test");
        entity.set("p", &"v".into(), false).unwrap();
        entity.set("p", &"v".into(), false).unwrap();
        assert_eq!(entity.tuples(), vec![tuple("p", "v", Scope::Public)]);
    }

    #[test]
    fn delete_spans_both_owned_scopes() {
        let mut entity = Entity::new("urn:ers:test");
        entity.add("p", &"a".into(), false).unwrap();
        entity.add("p", &"b".into(), true).unwrap();
        entity.delete("p", None).unwrap();
        assert!(entity.tuples().is_empty());
    }

    #[test]
    fn attach_ignores_foreign_documents() {
        let mut entity = Entity::new("urn:ers:test");
        entity.attach(Document::for_entity("urn:ers:other"), Scope::Cache);
        entity.attach(Document::new(), Scope::Cache);
        assert!(entity.is_empty());
    }

    #[test]
    fn tuples_order_public_private_cache_remote() {
        let mut entity = Entity::new("e");
        let mut cached = Document::for_entity("e");
        cached.add_property("p", &"c".into()).unwrap();
        let mut remote = Document::for_entity("e");
        remote.add_property("p", &"r".into()).unwrap();

        entity.attach(remote, Scope::Remote);
        entity.attach(cached, Scope::Cache);
        entity.add("p", &"pub".into(), false).unwrap();

        let scopes: Vec<Scope> = entity.tuples().into_iter().map(|t| t.scope).collect();
        assert_eq!(scopes, vec![Scope::Public, Scope::Cache, Scope::Remote]);
    }
}
