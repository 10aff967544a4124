#![doc = include_str!("../README.md")]
//! A peer-to-peer store of entity descriptions for local networks.
//!
//! Every node keeps its entity documents in three local stores (public,
//! private, and a cache of subscriptions) on top of an opaque document
//! database (the [`docdb`] traits). A [`registry::Registry`] reads and
//! writes entities, fanning reads out to discovered peers with per-peer
//! health tracking. The [`daemon::Daemon`] reacts to service discovery and
//! reshapes the replication links between nodes through the
//! [`replication::ReplicationController`] without disturbing replications
//! that are already in the desired shape.
//!
//! The crate ships an [in-memory DocDB](docdb::memory) and a
//! [manually driven discovery backend](discovery::ManualDiscovery), which
//! make a whole fleet of nodes testable inside one process; production
//! deployments plug their own providers into the same seams.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod daemon;
pub mod discovery;
pub mod docdb;
pub mod entity;
pub mod federation;
pub mod http;
pub mod model;
pub mod peers;
pub mod registry;
pub mod replication;
pub mod store;

pub use self::{
    entity::{Entity, Scope, Tuple},
    model::{Document, Literal},
    registry::{Registry, RegistryOptions},
    store::{Store, StoreKind},
};
