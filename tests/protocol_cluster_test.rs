// 3-Node Protocol Integration Test
//
// Drives client transactions through the full PreAccept -> Stable ->
// Execute -> Persist pipeline on an in-memory cluster and checks the
// cross-replica agreement invariants.

mod common;

use bytes::Bytes;

use common::{whole_range, write_txn, Cluster};
use concord::command::SaveStatus;
use concord::coordinate::decode_result;
use concord::routables::{Key, Ranges};
use concord::time::TxnKind;

#[test]
fn test_fast_path_write_three_of_three() {
    let cluster = Cluster::new(3);

    let (txn_id, outcome) = cluster.write(1, "k5", b"42");
    assert!(outcome.is_ok(), "uncontended write commits: {:?}", outcome);

    // Every replica applied at exactly the transaction id: the fast path.
    for node in &cluster.nodes {
        node.store().with_inner(|inner| {
            let command = inner.command(txn_id).expect("replicated everywhere");
            assert_eq!(command.status(), SaveStatus::Applied);
            assert_eq!(command.execute_at(), Some(txn_id.as_timestamp()));
        });
    }

    // And the value is readable through the protocol.
    let (_, read) = cluster.read(2, "k5");
    let data = decode_result(&read.expect("read commits")).expect("decodable");
    assert_eq!(
        data.values.get(&Key::from("k5")).cloned().flatten(),
        Some(Bytes::from_static(b"42"))
    );
}

#[test]
fn test_conflicting_writes_agree_on_order() {
    let cluster = Cluster::new(3);

    // Submit both before any delivery so their PreAccepts interleave.
    let (id1, slot1) = cluster.submit_async(1, write_txn("k", b"first"));
    let (id2, slot2) = cluster.submit_async(2, write_txn("k", b"second"));
    cluster.pump();

    assert!(slot1.lock().unwrap().as_ref().expect("done").is_ok());
    assert!(slot2.lock().unwrap().as_ref().expect("done").is_ok());

    // Invariant: every replica decided the same execute_at per txn, and the
    // same relative order for the conflicting pair.
    let mut orders = Vec::new();
    for node in &cluster.nodes {
        node.store().with_inner(|inner| {
            let a = inner.command(id1).expect("present");
            let b = inner.command(id2).expect("present");
            assert_eq!(a.status(), SaveStatus::Applied);
            assert_eq!(b.status(), SaveStatus::Applied);
            let at_a = a.execute_at().expect("applied");
            let at_b = b.execute_at().expect("applied");
            assert_ne!(at_a, at_b);
            orders.push(at_a < at_b);
        });
    }
    assert!(
        orders.iter().all(|o| *o == orders[0]),
        "replicas disagree on execution order"
    );

    // The later-executing write is the one whose value survives.
    let winner = if orders[0] { b"second".as_ref() } else { b"first".as_ref() };
    let (_, read) = cluster.read(3, "k");
    let data = decode_result(&read.expect("read commits")).expect("decodable");
    assert_eq!(
        data.values.get(&Key::from("k")).cloned().flatten(),
        Some(Bytes::copy_from_slice(winner))
    );
}

#[test]
fn test_dependent_write_observes_predecessor() {
    let cluster = Cluster::new(3);

    let (first, r1) = cluster.write(1, "acct", b"100");
    assert!(r1.is_ok());
    let (second, r2) = cluster.write(2, "acct", b"250");
    assert!(r2.is_ok());

    for node in &cluster.nodes {
        node.store().with_inner(|inner| {
            let a = inner.command(first).unwrap();
            let b = inner.command(second).unwrap();
            // Submitted strictly after the first applied: must order after.
            assert!(b.execute_at().unwrap() > a.execute_at().unwrap());
        });
    }

    let (_, read) = cluster.read(1, "acct");
    let data = decode_result(&read.unwrap()).unwrap();
    assert_eq!(
        data.values.get(&Key::from("acct")).cloned().flatten(),
        Some(Bytes::from_static(b"250"))
    );
}

#[test]
fn test_sync_point_barrier_commits() {
    let cluster = Cluster::new(3);

    cluster.write(1, "a", b"1").1.expect("write commits");
    cluster.write(2, "b", b"2").1.expect("write commits");

    let outcome = std::sync::Arc::new(std::sync::Mutex::new(None));
    let slot = outcome.clone();
    let barrier_id = cluster
        .node(3)
        .barrier(
            TxnKind::SyncPoint,
            Ranges::single(whole_range()),
            Box::new(move |result| {
                *slot.lock().unwrap() = Some(result);
            }),
        )
        .expect("barrier starts");
    cluster.pump();

    assert!(outcome.lock().unwrap().as_ref().expect("done").is_ok());
    for node in &cluster.nodes {
        node.store().with_inner(|inner| {
            let command = inner.command(barrier_id).expect("barrier replicated");
            assert_eq!(command.status(), SaveStatus::Applied);
        });
    }
}

#[test]
fn test_writes_on_disjoint_keys_take_fast_path_concurrently() {
    let cluster = Cluster::new(3);

    let (id1, slot1) = cluster.submit_async(1, write_txn("x", b"1"));
    let (id2, slot2) = cluster.submit_async(2, write_txn("y", b"2"));
    let (id3, slot3) = cluster.submit_async(3, write_txn("z", b"3"));
    cluster.pump();

    for slot in [&slot1, &slot2, &slot3] {
        assert!(slot.lock().unwrap().as_ref().expect("done").is_ok());
    }
    // No conflicts anywhere: all three kept their own id as execute_at.
    for (id, _) in [(id1, "x"), (id2, "y"), (id3, "z")] {
        cluster.node(1).store().with_inner(|inner| {
            let command = inner.command(id).unwrap();
            assert_eq!(command.execute_at(), Some(id.as_timestamp()));
        });
    }
}
