//! Several store engines syncing against one HQ over the loopback transport.

use std::sync::Arc;
use std::thread;
use tillsync_engine::{
    Change, ManualClock, MemoryRepository, NodeConfig, NodeKind, QueueStatus, SyncConfiguration,
    SyncEngine, SyncError, SyncNode,
};
use tillsync_hq::{HqConfig, HqServer, LoopbackTransport};
use tillsync_protocol::{ConflictPolicy, Priority, StoreId, SyncEntityRule, Timestamp, Version};

type StoreEngine = SyncEngine<LoopbackTransport<MemoryRepository>, MemoryRepository>;

fn rules(store: StoreId) -> SyncConfiguration {
    SyncConfiguration::new(store)
        .with_rule(SyncEntityRule::new("Product"))
        .with_rule(SyncEntityRule::new("Sale").with_priority(Priority::High))
        .with_rule(
            SyncEntityRule::new("Stock").with_policy(ConflictPolicy::Manual),
        )
}

fn hq(stores: &[StoreId], clock: Arc<ManualClock>) -> Arc<HqServer<MemoryRepository>> {
    let node =
        SyncNode::in_memory(NodeKind::Hq, Arc::new(MemoryRepository::new()), clock).unwrap();
    for store in stores {
        node.configure(rules(*store)).unwrap();
    }
    Arc::new(HqServer::new(HqConfig::default(), Arc::new(node)))
}

fn store(
    id: StoreId,
    server: &Arc<HqServer<MemoryRepository>>,
    clock: Arc<ManualClock>,
) -> StoreEngine {
    let node =
        SyncNode::in_memory(NodeKind::Store(id), Arc::new(MemoryRepository::new()), clock)
            .unwrap();
    node.configure(rules(id)).unwrap();
    SyncEngine::new(
        Arc::new(node),
        Arc::new(LoopbackTransport::new(Arc::clone(server))),
    )
    .unwrap()
}

fn edit(engine: &StoreEngine, entity_type: &str, id: &str, payload: &[u8], at: u64) {
    let ts = Timestamp::from_millis(at);
    engine
        .node()
        .repository()
        .insert(entity_type, id, Version::new(payload.to_vec(), ts));
    engine
        .node()
        .enqueue(Change::update(entity_type, id, payload.to_vec(), ts))
        .unwrap();
}

#[test]
fn stores_sync_concurrently() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let ids: Vec<StoreId> = (1..=4).map(StoreId).collect();
    let server = hq(&ids, clock.clone());
    let engines: Vec<_> = ids.iter().map(|id| store(*id, &server, clock.clone())).collect();

    for engine in &engines {
        let store_id = engine.store_id();
        for n in 0..25 {
            let sale = format!("{}-{n}", store_id.0);
            edit(engine, "Sale", &sale, sale.as_bytes(), 100);
        }
    }

    thread::scope(|scope| {
        for engine in &engines {
            scope.spawn(move || {
                let result = engine.sync().unwrap();
                assert_eq!(result.upload.completed, 25);
            });
        }
    });

    let repo = server.node().repository();
    assert_eq!(repo.len(), 100);
    assert_eq!(repo.payload("Sale", "3-17"), Some(b"3-17".to_vec()));
    for id in &ids {
        assert_eq!(server.session(*id).unwrap().uploads, 1);
        assert_eq!(server.node().health(*id).unwrap().open_conflicts, 0);
    }
}

#[test]
fn price_update_fans_out_to_every_store() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let ids = [StoreId(1), StoreId(2)];
    let server = hq(&ids, clock.clone());
    let engines: Vec<_> = ids.iter().map(|id| store(*id, &server, clock.clone())).collect();

    let hq_node = server.node();
    let price = Version::new(b"cola 2.49".to_vec(), Timestamp::from_millis(500));
    hq_node.repository().insert("Product", "42", price);
    for id in ids {
        hq_node
            .enqueue_for(
                id,
                Change::update("Product", "42", b"cola 2.49".to_vec(), Timestamp::from_millis(500)),
            )
            .unwrap();
    }

    for engine in &engines {
        let result = engine.sync().unwrap();
        assert_eq!(result.batches_received, 1);
        assert_eq!(
            engine.node().repository().payload("Product", "42"),
            Some(b"cola 2.49".to_vec())
        );
    }
    for id in ids {
        assert!(hq_node
            .queue_snapshot(id)
            .iter()
            .all(|i| i.status == QueueStatus::Completed));
    }
}

#[test]
fn stock_conflict_is_held_until_resolved() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let server = hq(&[StoreId(5)], clock.clone());
    let engine = store(StoreId(5), &server, clock);

    server.node().repository().insert(
        "Stock",
        "42",
        Version::new(b"12".to_vec(), Timestamp::from_millis(300)),
    );
    edit(&engine, "Stock", "42", b"9", 400);

    let result = engine.sync().unwrap();
    assert_eq!(result.upload.held, 1);

    let conflicts = server.node().list_conflicts(StoreId(5));
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local.payload, Some(b"12".to_vec()));
    assert_eq!(conflicts[0].remote.payload, Some(b"9".to_vec()));

    server
        .node()
        .resolve_conflict(conflicts[0].id, Some(b"10".to_vec()), "area manager", Some("recount".into()))
        .unwrap();
    engine.sync().unwrap();

    assert_eq!(engine.node().repository().payload("Stock", "42"), Some(b"10".to_vec()));
    assert_eq!(engine.node().health(StoreId(5)).unwrap().held, 0);
    assert!(server.node().list_conflicts(StoreId(5)).is_empty());
}

#[test]
fn link_down_leaves_queue_untouched() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let server = hq(&[StoreId(1)], clock.clone());
    let node = SyncNode::in_memory(
        NodeKind::Store(StoreId(1)),
        Arc::new(MemoryRepository::new()),
        clock,
    )
    .unwrap();
    node.configure(rules(StoreId(1))).unwrap();
    let transport = Arc::new(LoopbackTransport::new(Arc::clone(&server)));
    let engine = SyncEngine::new(Arc::new(node), Arc::clone(&transport)).unwrap();
    edit(&engine, "Product", "1", b"a", 10);

    transport.set_connected(false);
    let err = engine.sync().unwrap_err();
    assert!(err.is_retryable());
    let health = engine.node().health(StoreId(1)).unwrap();
    assert_eq!(health.pending, 1);
    assert!(health.last_sync_error.is_some());

    transport.set_connected(true);
    engine.sync().unwrap();
    assert_eq!(engine.node().health(StoreId(1)).unwrap().pending, 0);
    assert_eq!(server.node().repository().payload("Product", "1"), Some(b"a".to_vec()));
}

#[test]
fn store_unknown_to_hq_dead_letters() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let server = hq(&[StoreId(1)], clock.clone());
    let engine = store(StoreId(2), &server, clock);
    edit(&engine, "Product", "1", b"a", 10);

    let result = engine.sync();
    // Upload dead-letters; the pull is refused as well.
    assert!(matches!(result, Err(SyncError::UnknownStore(StoreId(2)))));
    assert_eq!(engine.node().health(StoreId(2)).unwrap().dead_letters, 1);
}

#[test]
fn durable_hq_keeps_replay_protection_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig::new(NodeKind::Hq, dir.path())
        .with_sync_on_write(false)
        .with_store(rules(StoreId(1)));
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));

    let store_node = {
        let node = SyncNode::in_memory(
            NodeKind::Store(StoreId(1)),
            Arc::new(MemoryRepository::new()),
            clock,
        )
        .unwrap();
        node.configure(rules(StoreId(1))).unwrap();
        node
    };
    store_node
        .enqueue(Change::create("Product", "1", b"a".to_vec(), Timestamp::from_millis(10)))
        .unwrap();
    let batch = store_node.assemble_next(StoreId(1)).unwrap().unwrap();

    let first = {
        let node = SyncNode::open(&config, Arc::new(MemoryRepository::new())).unwrap();
        let server = HqServer::new(HqConfig::default(), Arc::new(node));
        server.handle_upload(&batch.envelope).unwrap()
    };

    let node = SyncNode::open(&config, Arc::new(MemoryRepository::new())).unwrap();
    let server = HqServer::new(HqConfig::default(), Arc::new(node));
    let second = server.handle_upload(&batch.envelope).unwrap();
    assert!(second.replayed);
    assert_eq!(first.ack, second.ack);
    // The fresh repository proves nothing was written again.
    assert!(server.node().repository().is_empty());
}
