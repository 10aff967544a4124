//! Shared harness: a fleet of registry nodes wired through the in-memory
//! DocDB hub, with peers injected by hand instead of a discovery daemon.

use std::net::Ipv4Addr;

use ers_node::{
    docdb::memory::{MemoryDb, MemoryHub},
    peers::{self, PeerInfo, PeerType},
    registry::{Registry, RegistryOptions},
    replication::ReplicationController,
    store::Store,
};

/// A set of nodes sharing one in-memory hub.
#[derive(Debug, Default)]
pub struct Fleet {
    pub hub: MemoryHub,
}

/// One node of the fleet.
#[derive(Debug)]
pub struct TestNode {
    pub name: String,
    pub ip: Ipv4Addr,
    pub db: MemoryDb,
    pub store: Store,
    pub registry: Registry,
    pub controller: ReplicationController,
    pub peer_type: PeerType,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a node at `10.0.0.<index>` with empty stores.
    pub async fn spawn(&self, name: &str, index: u8, peer_type: PeerType) -> TestNode {
        let ip = Ipv4Addr::new(10, 0, 0, index);
        let db = self.hub.add_node(&format!("http://{ip}:5984/"));
        let store = Store::open(db.as_docdb()).await.expect("store opens");
        let registry = Registry::open(
            store.clone(),
            self.hub.connector(),
            RegistryOptions::default(),
        )
        .await
        .expect("registry opens");
        let controller = ReplicationController::new(store.clone(), name, peer_type);
        TestNode {
            name: name.to_string(),
            ip,
            db,
            store,
            registry,
            controller,
            peer_type,
        }
    }

    /// Run replications until nothing moves anymore.
    pub fn settle(&self) {
        while self.hub.settle() > 0 {}
    }
}

impl TestNode {
    /// This node as a peer descriptor, the way discovery would report it.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            service_name: peers::format_service_name(&self.name, "ers", self.peer_type, "0000"),
            host: self.name.clone(),
            ipv4: Some(self.ip),
            port: 5984,
            prefix: "ers".to_string(),
            peer_type: self.peer_type,
        }
    }

    /// Make `other` visible to this node's registry, as if discovered.
    pub async fn add_peer(&self, other: &TestNode) {
        let mut peers = self.store.state_peers().await.expect("state readable");
        if !peers.iter().any(|p| p.service_name == other.peer_info().service_name) {
            peers.push(other.peer_info());
        }
        self.store.set_state_peers(&peers).await.expect("state writable");
    }
}
