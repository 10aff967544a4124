//! Replication-link scenarios: bridge focus, reshaping on peer loss, and the
//! daemon-driven event flow from discovery to the replicator collection.

use std::{sync::Arc, time::Duration};

use ers_node::{
    config::Config,
    daemon::Daemon,
    discovery::{ManualDiscovery, ServiceInfo},
    docdb::{memory::MemoryDb, DocDb},
    entity::Entity,
    peers::{self, PeerRegistry, PeerSnapshot, PeerType},
    store::StoreKind,
};
use testresult::TestResult;

mod util;
use util::{Fleet, TestNode};

fn snapshot_of(peers: &[&TestNode]) -> PeerSnapshot {
    let mut registry = PeerRegistry::new();
    for peer in peers {
        registry.on_join(peer.peer_info());
    }
    registry.snapshot()
}

/// Publish an entity on `publisher` and subscribe `node` to it.
async fn subscribe(node: &TestNode, publisher: &TestNode, entity: &str) -> TestResult {
    let mut e = Entity::new(entity);
    e.add("p", &"v".into(), false)?;
    publisher.registry.persist(&mut e).await?;

    node.add_peer(publisher).await;
    let remote = node.registry.get(entity, true).await?;
    assert!(node.registry.cache(&remote).await?, "subscription must stick");
    Ok(())
}

async fn task_ids(db: &MemoryDb) -> Vec<String> {
    db.replicator()
        .all_docs()
        .await
        .unwrap()
        .into_iter()
        .filter_map(|doc| doc.doc_id().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn bridge_focus_and_failover() -> TestResult {
    let fleet = Fleet::new();
    let mut a = fleet.spawn("alice", 1, PeerType::Contributor).await;
    let mut b = fleet.spawn("bob", 2, PeerType::Contributor).await;
    let c = fleet.spawn("hub", 3, PeerType::Bridge).await;

    subscribe(&a, &b, "urn:e-bob").await?;
    subscribe(&b, &a, "urn:e-alice").await?;

    // with the bridge around, every replication of a and b points at it
    a.controller.reconcile(&snapshot_of(&[&b, &c])).await?;
    b.controller.reconcile(&snapshot_of(&[&a, &c])).await?;
    for node in [&a, &b] {
        let ids = task_ids(&node.db).await;
        assert!(!ids.is_empty());
        assert!(
            ids.iter().all(|id| id.contains("10.0.0.3")),
            "all tasks must target the bridge: {ids:?}"
        );
    }

    // the bridge goes away: a and b re-plan against each other
    a.controller.reconcile(&snapshot_of(&[&b])).await?;
    b.controller.reconcile(&snapshot_of(&[&a])).await?;
    let ids = task_ids(&a.db).await;
    assert!(ids.iter().all(|id| id.contains("10.0.0.2")), "{ids:?}");
    assert!(ids
        .iter()
        .any(|id| id.starts_with("ers-alice-get-from-cache-of-")));
    assert!(ids
        .iter()
        .any(|id| id.starts_with("ers-alice-auto-get-from-public-of-")));
    let ids = task_ids(&b.db).await;
    assert!(ids.iter().all(|id| id.contains("10.0.0.1")), "{ids:?}");
    Ok(())
}

#[tokio::test]
async fn updates_flow_through_the_bridge() -> TestResult {
    let fleet = Fleet::new();
    let mut a = fleet.spawn("alice", 1, PeerType::Contributor).await;
    let mut b = fleet.spawn("bob", 2, PeerType::Contributor).await;
    let mut c = fleet.spawn("hub", 3, PeerType::Bridge).await;

    subscribe(&b, &a, "urn:e").await?;

    a.controller.reconcile(&snapshot_of(&[&b, &c])).await?;
    b.controller.reconcile(&snapshot_of(&[&a, &c])).await?;
    // the bridge sees two contributors and no other bridge
    c.controller.reconcile(&snapshot_of(&[&a, &b])).await?;
    fleet.settle();

    // the bridge aggregated a's public document
    assert!(c.store.kind(StoreKind::Cache).exists("urn:e").await?);

    // an update by a reaches b through the bridge, not directly
    let mut e = a.registry.get("urn:e", false).await?;
    e.set("p", &"v2".into(), false)?;
    a.registry.persist(&mut e).await?;
    fleet.settle();

    let cached = b.store.kind(StoreKind::Cache).docs_by_entity("urn:e").await?;
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].tuples(), vec![("p".to_string(), "v2".into())]);
    Ok(())
}

#[tokio::test]
async fn reconciliation_is_stable_without_changes() -> TestResult {
    let fleet = Fleet::new();
    let mut a = fleet.spawn("alice", 1, PeerType::Contributor).await;
    let b = fleet.spawn("bob", 2, PeerType::Contributor).await;
    subscribe(&a, &b, "urn:e").await?;

    let snapshot = snapshot_of(&[&b]);
    a.controller.reconcile(&snapshot).await?;
    let before = a.db.replicator().changes(0, None).await?.last_seq;

    let outcome = a.controller.reconcile(&snapshot).await?;
    assert!(outcome.unchanged);
    let after = a.db.replicator().changes(0, None).await?.last_seq;
    assert_eq!(before, after, "a stable reconcile must not write");
    Ok(())
}

async fn wait_until<F, Fut>(mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn daemon_reshapes_on_discovery_events() -> TestResult {
    let fleet = Fleet::new();
    let bob = fleet.spawn("bob", 2, PeerType::Contributor).await;
    let mut e = Entity::new("urn:e");
    e.add("p", &"v".into(), false)?;
    bob.registry.persist(&mut e).await?;

    let local = fleet.hub.add_node("http://127.0.0.1:5984/");
    let discovery = Arc::new(ManualDiscovery::new());
    let config: Config = "[node]\npid_file = none\n[couchdb]\ntries = 1\n".parse()?;
    let daemon = Daemon::start(config, fleet.hub.connector(), discovery.clone()).await?;

    let bob_service = ServiceInfo {
        name: peers::format_service_name("bob", "ers", PeerType::Contributor, "b0b"),
        host: "bob".to_string(),
        ipv4: Some([10, 0, 0, 2].into()),
        port: 5984,
    };
    discovery.announce_join(bob_service.clone());

    // the join lands in the state document for the registry API to see
    let registry = daemon.registry().clone();
    assert!(
        wait_until(|| {
            let registry = registry.clone();
            async move { !registry.peers().await.unwrap().is_empty() }
        })
        .await,
        "daemon must publish the discovered peer"
    );

    // subscribing triggers a reconciliation that creates pull tasks
    let remote = registry.get("urn:e", true).await?;
    assert_eq!(remote.remote_documents().len(), 1);
    registry.cache(&remote).await?;
    assert!(
        wait_until(|| {
            let local = local.clone();
            async move { !local.replicator().all_docs().await.unwrap().is_empty() }
        })
        .await,
        "cache change must create replication tasks"
    );

    // the peer leaving tears the tasks down again
    discovery.announce_leave(bob_service);
    assert!(
        wait_until(|| {
            let local = local.clone();
            async move { local.replicator().all_docs().await.unwrap().is_empty() }
        })
        .await,
        "leave must clear the tasks"
    );

    assert!(daemon.handle().refresh_replication().await);
    daemon.stop().await?;
    Ok(())
}
