// Recovery Integration Test
//
// Crashes a coordinator at various points and checks that a peer-driven
// recovery reaches the outcome the original coordinator would have.

mod common;

use common::{now_ms, write_txn, Cluster};
use concord::command::SaveStatus;
use concord::time::NodeId;

#[test]
fn test_coordinator_crash_after_preaccept_recovers_fast_path() {
    let cluster = Cluster::new(3);

    // Node 1 fans out PreAccept, then halts before seeing any reply.
    let (txn_id, _slot) = cluster.submit_async(1, write_txn("k7", b"v"));
    cluster.network.partition(NodeId(1));
    cluster.pump();

    // Replicas 2 and 3 hold PreAccepted state and a progress timer on the
    // home shard.
    for id in [2u32, 3] {
        cluster.node(id).store().with_inner(|inner| {
            let command = inner.command(txn_id).expect("witnessed");
            assert_eq!(command.status(), SaveStatus::PreAccepted);
        });
    }

    // Node 2's retry timer fires and it takes over.
    cluster.node(2).tick(now_ms() + 60_000);
    cluster.pump();

    // The recovery completed the transaction identically to what node 1
    // would have produced: applied at exactly the original txn id.
    for id in [2u32, 3] {
        cluster.node(id).store().with_inner(|inner| {
            let command = inner.command(txn_id).expect("recovered");
            assert_eq!(command.status(), SaveStatus::Applied);
            assert_eq!(command.execute_at(), Some(txn_id.as_timestamp()));
        });
    }
}

#[test]
fn test_crashed_coordinator_with_no_witnesses_invalidates() {
    let cluster = Cluster::new(3);

    // The coordinator enqueues PreAccepts but every envelope is lost with
    // it; only the home-shard knowledge on the survivors could recover it,
    // and there is none. Simulate a replica learning of the txn id through
    // a stray recovery trigger instead: nothing was witnessed, so recovery
    // must invalidate.
    let (txn_id, _slot) = cluster.submit_async(1, write_txn("k9", b"v"));
    // Drop everything the coordinator sent.
    cluster.network.partition(NodeId(1));
    cluster.network.partition(NodeId(2));
    cluster.network.partition(NodeId(3));
    cluster.pump();
    cluster.network.heal(NodeId(2));
    cluster.network.heal(NodeId(3));

    // Node 2 is told to recover the orphaned id (in production this comes
    // from a dependency or a CheckStatus exchange).
    use concord::routables::{Route, RouteParts, RoutingKey, RoutingKeys};
    let route = Route::full(
        RoutingKey::from("k9"),
        RouteParts::Keys(RoutingKeys::single(RoutingKey::from("k9"))),
    );
    let outcome = std::sync::Arc::new(std::sync::Mutex::new(None));
    let slot = outcome.clone();
    cluster
        .node(2)
        .recover(
            txn_id,
            route,
            concord::time::Ballot::ZERO,
            Box::new(move |result| {
                *slot.lock().unwrap() = Some(result);
            }),
        )
        .expect("recovery starts");
    cluster.pump();

    let outcome = outcome.lock().unwrap().take().expect("recovery finished");
    assert!(matches!(
        outcome,
        Err(concord::ProtocolError::Invalidated { .. })
    ));
    for id in [2u32, 3] {
        cluster.node(id).store().with_inner(|inner| {
            let command = inner.command(txn_id).expect("tombstoned");
            assert_eq!(command.status(), SaveStatus::Invalidated);
        });
    }
}

#[test]
fn test_stale_coordinator_is_preempted_after_recovery() {
    let cluster = Cluster::new(3);

    let (txn_id, slot) = cluster.submit_async(1, write_txn("k3", b"v"));
    cluster.network.partition(NodeId(1));
    cluster.pump();

    // Node 3 recovers the transaction.
    cluster.node(3).tick(now_ms() + 60_000);
    cluster.pump();
    cluster.node(3).store().with_inner(|inner| {
        assert_eq!(
            inner.command(txn_id).unwrap().status(),
            SaveStatus::Applied
        );
    });

    // The original coordinator comes back and pumps its stale rounds; its
    // messages cannot regress anything and it learns it was superseded.
    cluster.network.heal(NodeId(1));
    cluster.pump();
    cluster.node(1).tick(now_ms() + 120_000);
    cluster.pump();

    // Whatever the original callback observed, the replicas agree on the
    // recovered outcome.
    let _guard = slot.lock().unwrap();
    for id in [1u32, 2, 3] {
        cluster.node(id).store().with_inner(|inner| {
            if let Some(command) = inner.command(txn_id) {
                if command.status() == SaveStatus::Applied {
                    assert_eq!(command.execute_at(), Some(txn_id.as_timestamp()));
                }
            }
        });
    }
}

#[test]
fn test_recovery_of_accepted_txn_keeps_decided_timestamp() {
    let cluster = Cluster::new(3);

    // Seed a conflict on the key, then crash the second coordinator after
    // its PreAccept fan-out.
    cluster.write(1, "kc", b"one").1.expect("first write");
    let (txn_id, _slot) = cluster.submit_async(2, write_txn("kc", b"two"));
    cluster.network.partition(NodeId(2));
    cluster.pump();

    cluster.node(3).tick(now_ms() + 60_000);
    cluster.pump();

    cluster.node(3).store().with_inner(|inner| {
        let command = inner.command(txn_id).expect("recovered");
        assert_eq!(command.status(), SaveStatus::Applied);
        // Submitted after an applied conflict on the same key: executes
        // strictly after its own id never regressing below it.
        assert!(command.execute_at().unwrap() >= txn_id.as_timestamp());
    });
}
