// Shared in-memory cluster harness for protocol integration tests.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use once_cell::sync::Lazy;

use concord::command::{PartialTxn, Update};
use concord::node::{LoggingAgent, LoopbackNetwork, Node};
use concord::routables::{Key, KeyRange, Keys, RouteParts, RoutingKey, RoutingKeys};
use concord::store::{MemoryJournal, MemoryStore};
use concord::time::{NodeId, TxnId, TxnKind};
use concord::topology::{Shard, Topology};
use concord::{ProtocolConfig, Result};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// The whole routing space as one range.
pub fn whole_range() -> KeyRange {
    KeyRange::new(
        RoutingKey::from_slice(b""),
        RoutingKey::from_slice(&[0xff; 16]),
    )
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A cluster of in-process nodes joined by a pumped loopback network.
pub struct Cluster {
    pub network: Arc<LoopbackNetwork>,
    pub nodes: Vec<Arc<Node>>,
    pub stores: Vec<Arc<MemoryStore>>,
}

impl Cluster {
    /// `n` nodes, one shard over the whole routing space, every replica in
    /// the fast-path electorate.
    pub fn new(n: u32) -> Self {
        init_tracing();
        let network = Arc::new(LoopbackNetwork::default());
        let mut nodes = Vec::new();
        let mut stores = Vec::new();
        let members: Vec<NodeId> = (1..=n).map(NodeId).collect();
        for id in &members {
            let data = Arc::new(MemoryStore::default());
            let node = Node::new(
                *id,
                ProtocolConfig::default(),
                network.clone(),
                Arc::new(LoggingAgent),
                data.clone(),
                Arc::new(MemoryJournal::default()),
            );
            stores.push(data);
            nodes.push(node);
        }
        let cluster = Self {
            network,
            nodes,
            stores,
        };
        cluster.install_epoch(1, members);
        cluster
    }

    pub fn install_epoch(&self, epoch: u64, members: Vec<NodeId>) {
        let topology = Topology::new(epoch, vec![Shard::with_all_fast(whole_range(), members)]);
        for node in &self.nodes {
            node.receive_topology(topology.clone())
                .expect("topologies install in order");
        }
    }

    pub fn node(&self, id: u32) -> &Arc<Node> {
        self.nodes
            .iter()
            .find(|n| n.id() == NodeId(id))
            .expect("unknown node id")
    }

    pub fn pump(&self) {
        self.network.pump(&self.nodes);
    }

    /// Submit a write of `value` under `key` via `via`, pump to completion,
    /// and return the outcome.
    pub fn write(&self, via: u32, key: &str, value: &[u8]) -> (TxnId, Result<Bytes>) {
        let txn = write_txn(key, value);
        self.submit(via, txn)
    }

    /// Submit a read of `key` via `via` and return the outcome.
    pub fn read(&self, via: u32, key: &str) -> (TxnId, Result<Bytes>) {
        let txn = PartialTxn {
            kind: TxnKind::Read,
            scope: RouteParts::Keys(RoutingKeys::single(RoutingKey::from(key))),
            read: Keys::single(Key::from(key)),
            update: None,
        };
        self.submit(via, txn)
    }

    pub fn submit(&self, via: u32, txn: PartialTxn) -> (TxnId, Result<Bytes>) {
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let txn_id = self
            .node(via)
            .coordinate(
                txn,
                Box::new(move |result| {
                    *slot.lock().unwrap() = Some(result);
                }),
            )
            .expect("coordination starts");
        self.pump();
        let result = outcome
            .lock()
            .unwrap()
            .take()
            .expect("pumped to completion");
        (txn_id, result)
    }

    /// Submit without pumping; the caller stages delivery.
    pub fn submit_async(&self, via: u32, txn: PartialTxn) -> (TxnId, Arc<Mutex<Option<Result<Bytes>>>>) {
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        let txn_id = self
            .node(via)
            .coordinate(
                txn,
                Box::new(move |result| {
                    *slot.lock().unwrap() = Some(result);
                }),
            )
            .expect("coordination starts");
        (txn_id, outcome)
    }
}

pub fn write_txn(key: &str, value: &[u8]) -> PartialTxn {
    PartialTxn {
        kind: TxnKind::Write,
        scope: RouteParts::Keys(RoutingKeys::single(RoutingKey::from(key))),
        read: Keys::EMPTY,
        update: Some(Update {
            writes: vec![(Key::from(key), Bytes::copy_from_slice(value))],
        }),
    }
}
