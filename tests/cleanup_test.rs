// Cleanup Integration Test
//
// Advances the redundancy and durability watermarks past applied
// transactions and checks the cleanup ladder removes exactly what it may.

mod common;

use common::{whole_range, Cluster};
use concord::cleanup::{Cleanup, DurableBefore, DurableEntry, RedundantBefore, RedundantEntry};
use concord::command::SaveStatus;
use concord::time::{KeyDomain, NodeId, TxnId, TxnKind};

fn watermark_above(txn_id: TxnId) -> TxnId {
    // Far enough above that the pruning guard band is also cleared.
    TxnId::new(
        txn_id.epoch(),
        txn_id.0.hlc + (1 << 26),
        TxnKind::Write,
        KeyDomain::Key,
        NodeId(u32::MAX),
    )
}

#[test]
fn test_cleanup_across_redundant_watermark_expunges() {
    let cluster = Cluster::new(3);
    let (txn_id, outcome) = cluster.write(1, "gone", b"v");
    assert!(outcome.is_ok());

    let bound = watermark_above(txn_id);
    let node = cluster.node(2);
    node.store().with_inner_mut(|inner| {
        assert_eq!(
            inner.command(txn_id).map(|c| c.status()),
            Some(SaveStatus::Applied)
        );

        // Everything below `bound` is universally durable and GC-able.
        let mut rb = RedundantBefore::default();
        rb.merge_entry(
            whole_range(),
            RedundantEntry::new(TxnId::min_value(), bound, bound, bound),
        );
        inner.advance_redundant_before(rb);
        let mut db = DurableBefore::default();
        db.merge_entry(whole_range(), DurableEntry::new(bound, bound));
        inner.advance_durable_before(db);

        let decision = inner.run_cleanup(txn_id);
        assert_eq!(decision, Cleanup::Expunge);
        assert!(inner.command(txn_id).is_none());
    });
}

#[test]
fn test_cleanup_keeps_live_commands() {
    let cluster = Cluster::new(3);
    let (txn_id, outcome) = cluster.write(1, "live", b"v");
    assert!(outcome.is_ok());

    cluster.node(2).store().with_inner_mut(|inner| {
        let decision = inner.run_cleanup(txn_id);
        assert_eq!(decision, Cleanup::No);
        assert!(inner.command(txn_id).is_some());
    });
}

#[test]
fn test_cleanup_truncates_majority_durable_below_gc() {
    let cluster = Cluster::new(3);
    let (txn_id, outcome) = cluster.write(1, "trunc", b"v");
    assert!(outcome.is_ok());

    let bound = watermark_above(txn_id);
    cluster.node(3).store().with_inner_mut(|inner| {
        let mut rb = RedundantBefore::default();
        rb.merge_entry(
            whole_range(),
            RedundantEntry::new(TxnId::min_value(), bound, bound, bound),
        );
        inner.advance_redundant_before(rb);

        // Durability recorded per command from the persist round is at
        // least shard-universal here; without a universal watermark the
        // record truncates while keeping the outcome, or fully truncates
        // once majority-durable.
        let decision = inner.run_cleanup(txn_id);
        assert!(
            matches!(decision, Cleanup::TruncateWithOutcome | Cleanup::Truncate),
            "unexpected decision {:?}",
            decision
        );
        let command = inner.command(txn_id).expect("tombstone kept");
        assert_eq!(command.status(), SaveStatus::Truncated);
    });
}

#[test]
fn test_cfk_pruning_drops_entries_below_watermark() {
    let cluster = Cluster::new(3);
    let mut last = None;
    for i in 0..8u32 {
        let (txn_id, outcome) = cluster.write(1, "hot", format!("v{i}").as_bytes());
        assert!(outcome.is_ok());
        last = Some(txn_id);
    }
    let bound = watermark_above(last.unwrap());

    cluster.node(1).store().with_inner_mut(|inner| {
        let mut rb = RedundantBefore::default();
        rb.merge_entry(
            whole_range(),
            RedundantEntry::new(TxnId::min_value(), bound, bound, bound),
        );
        inner.advance_redundant_before(rb);
        // All applied entries below the watermark pruned, modulo the
        // synthetic ordering bound.
        let remaining: usize = inner
            .cfk_keys()
            .iter()
            .filter_map(|k| inner.cfk(k))
            .map(|cfk| cfk.len())
            .sum();
        assert!(remaining <= 1, "cfk retained {remaining} entries");
    });
}
