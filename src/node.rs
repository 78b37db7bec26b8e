// Node glue: one protocol participant.
//
// A node owns the clock, the topology manager, its command stores, and the
// in-flight coordinations and recoveries it is driving. Inbound envelopes
// are routed either to a store task (requests) or to the driving state
// machine registered for the reply's request id. All sends are buffered and
// flushed outside locks.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::command::PartialTxn;
use crate::config::ProtocolConfig;
use crate::coordinate::{ClientCallback, Coordination, CoordinatorContext, Outbound};
use crate::error::{ProtocolError, Result};
use crate::messages::{Envelope, Packet, Reply, ReplyContext, RequestHeader};
use crate::progress::{LogGroupTimers, ProgressTimerKind};
use crate::recover::{Recovery, RecoveryCallback};
use crate::routables::{Ranges, Route, RouteParts};
use crate::store::{CommandStore, DataStore, Journal, StoreId};
use crate::time::{Ballot, Hlc, KeyDomain, NodeId, TxnId, TxnKind};
use crate::topology::{Topologies, Topology, TopologyManager};

/// External transport: fire-and-forget delivery. Timing, ordering and loss
/// are the embedder's concern.
pub trait MessageSink: Send + Sync {
    fn send(&self, envelope: Envelope);
}

/// The host-embedding agent: where unhandled failures surface.
pub trait Agent: Send + Sync {
    fn on_failure(&self, txn_id: Option<TxnId>, error: &ProtocolError);
}

/// Agent that only logs.
pub struct LoggingAgent;

impl Agent for LoggingAgent {
    fn on_failure(&self, txn_id: Option<TxnId>, error: &ProtocolError) {
        warn!(?txn_id, %error, "unhandled protocol failure");
    }
}

enum Driver {
    Coordination(Coordination),
    Recovery(Recovery),
}

impl Driver {
    fn is_done(&self) -> bool {
        match self {
            Driver::Coordination(c) => c.is_done(),
            Driver::Recovery(r) => r.is_done(),
        }
    }

    fn on_reply(&mut self, ctx: &mut NodeCtx<'_>, from: NodeId, reply: Reply) {
        match self {
            Driver::Coordination(c) => c.on_reply(ctx, from, reply),
            Driver::Recovery(r) => r.on_reply(ctx, from, reply),
        }
    }

    fn on_expired(&mut self) {
        match self {
            Driver::Coordination(c) => c.on_expired(),
            Driver::Recovery(r) => r.on_expired(),
        }
    }
}

/// One protocol node.
pub struct Node {
    id: NodeId,
    config: ProtocolConfig,
    hlc: Arc<Hlc>,
    topology: RwLock<TopologyManager>,
    stores: Vec<Arc<CommandStore>>,
    sink: Arc<dyn MessageSink>,
    agent: Arc<dyn Agent>,

    drivers: DashMap<TxnId, Arc<Mutex<Driver>>>,
    /// request id -> the driver awaiting that reply.
    reply_routes: DashMap<u64, TxnId>,
    next_request_id: AtomicU64,
    /// Coordination deadlines.
    deadlines: Mutex<LogGroupTimers<TxnId>>,
    /// Requests for epochs this node has not learned yet.
    parked: Mutex<Vec<Envelope>>,
}

impl Node {
    pub fn new(
        id: NodeId,
        config: ProtocolConfig,
        sink: Arc<dyn MessageSink>,
        agent: Arc<dyn Agent>,
        data: Arc<dyn DataStore>,
        journal: Arc<dyn Journal>,
    ) -> Arc<Self> {
        let hlc = Arc::new(Hlc::new(id));
        let stores = vec![Arc::new(CommandStore::new(
            StoreId(0),
            id,
            config.clone(),
            hlc.clone(),
            data,
            journal,
        ))];
        Arc::new(Self {
            id,
            config,
            hlc,
            topology: RwLock::new(TopologyManager::new(id)),
            stores,
            sink,
            agent,
            drivers: DashMap::new(),
            reply_routes: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            deadlines: Mutex::new(LogGroupTimers::new(4, 64)),
            parked: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn hlc(&self) -> &Hlc {
        &self.hlc
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CommandStore> {
        &self.stores[0]
    }

    pub fn current_epoch(&self) -> u64 {
        self.topology.read().current_epoch()
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    /// Install the next epoch and acknowledge it once the stores know their
    /// ranges. Parked requests whose epoch arrived are re-delivered.
    pub fn receive_topology(&self, topology: Topology) -> Result<()> {
        let epoch = topology.epoch();
        {
            let mut tm = self.topology.write();
            let local = topology.ranges_for_node(self.id);
            tm.receive(topology)?;
            for store in &self.stores {
                store.with_inner_mut(|inner| inner.update_ranges(epoch, local.clone()));
            }
            tm.acknowledge(epoch)?;
        }
        let ready: Vec<Envelope> = {
            let mut parked = self.parked.lock();
            let (ready, keep): (Vec<_>, Vec<_>) =
                parked.drain(..).partition(|envelope| match &envelope.packet {
                    Packet::Request { header, .. } => header.wait_for_epoch <= epoch,
                    Packet::Reply { .. } => true,
                });
            *parked = keep;
            ready
        };
        for envelope in ready {
            self.receive(envelope);
        }
        Ok(())
    }

    pub fn mark_faulty(&self, node: NodeId) {
        self.topology.write().mark_faulty(node);
    }

    pub fn mark_healthy(&self, node: NodeId) {
        self.topology.write().mark_healthy(node);
    }

    /// Feed a peer's sync-completion report into the epoch tracking.
    pub fn sync_complete(&self, node: NodeId, epoch: u64) {
        self.topology.write().sync_complete(node, epoch);
    }

    pub fn epoch_closed(&self, ranges: Ranges, epoch: u64) {
        self.topology.write().epoch_closed(ranges, epoch);
    }

    pub fn epoch_redundant(&self, ranges: Ranges, epoch: u64) {
        self.topology.write().epoch_redundant(ranges, epoch);
    }

    // ------------------------------------------------------------------
    // Client surface
    // ------------------------------------------------------------------

    /// Coordinate a client transaction. The callback observes the outcome
    /// exactly once.
    pub fn coordinate(&self, txn: PartialTxn, callback: ClientCallback) -> Result<TxnId> {
        let epoch = self.current_epoch();
        let domain = match txn.scope {
            RouteParts::Keys(_) => KeyDomain::Key,
            RouteParts::Ranges(_) => KeyDomain::Range,
        };
        let txn_id = self.hlc.unique_txn_id(epoch, txn.kind, domain);
        let route = route_for(&txn)?;
        self.start_coordination(txn_id, txn, route, callback)
    }

    /// Async variant of `coordinate` for embeddings running on a runtime:
    /// resolves once the outcome callback fires.
    pub async fn coordinate_async(&self, txn: PartialTxn) -> Result<bytes::Bytes> {
        let (tx, rx) = futures::channel::oneshot::channel();
        self.coordinate(
            txn,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;
        rx.await
            .map_err(|_| ProtocolError::Internal("coordination dropped without outcome".into()))?
    }

    /// Coordinate a payload-free barrier over `ranges`.
    pub fn barrier(
        &self,
        kind: TxnKind,
        ranges: Ranges,
        callback: ClientCallback,
    ) -> Result<TxnId> {
        let mut txn = crate::command::empty_system_txn(kind, KeyDomain::Range);
        txn.scope = RouteParts::Ranges(ranges);
        self.coordinate(txn, callback)
    }

    fn start_coordination(
        &self,
        txn_id: TxnId,
        txn: PartialTxn,
        route: Route,
        callback: ClientCallback,
    ) -> Result<TxnId> {
        let mut ctx = NodeCtx {
            node: self,
            buffered: Vec::new(),
        };
        let mut coordination = Coordination::new(txn_id, txn, route, &ctx, callback)?;
        coordination.start(&mut ctx);
        let buffered = std::mem::take(&mut ctx.buffered);
        self.drivers.insert(
            txn_id,
            Arc::new(Mutex::new(Driver::Coordination(coordination))),
        );
        self.deadlines.lock().add(
            self.now_ms() + self.config.local_expires_at.as_millis() as u64,
            txn_id,
        );
        self.flush(txn_id, buffered);
        Ok(txn_id)
    }

    /// Take over a stalled coordination.
    pub fn recover(
        &self,
        txn_id: TxnId,
        route: Route,
        prior_ballot: Ballot,
        callback: RecoveryCallback,
    ) -> Result<()> {
        let mut ctx = NodeCtx {
            node: self,
            buffered: Vec::new(),
        };
        let mut recovery = Recovery::new(txn_id, route, prior_ballot, &ctx, callback)?;
        recovery.start(&mut ctx);
        let buffered = std::mem::take(&mut ctx.buffered);
        self.drivers
            .insert(txn_id, Arc::new(Mutex::new(Driver::Recovery(recovery))));
        self.deadlines.lock().add(
            self.now_ms() + self.config.local_expires_at.as_millis() as u64,
            txn_id,
        );
        self.flush(txn_id, buffered);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub fn receive(&self, envelope: Envelope) {
        self.hlc.observe(envelope.clock);
        let Envelope {
            from,
            to,
            clock,
            packet,
        } = envelope;
        match packet {
            Packet::Request { header, request } => {
                if header.wait_for_epoch > self.current_epoch() {
                    debug!(
                        wait_for = header.wait_for_epoch,
                        current = self.current_epoch(),
                        "parking request for future epoch"
                    );
                    self.parked.lock().push(Envelope {
                        from,
                        to,
                        clock,
                        packet: Packet::Request { header, request },
                    });
                    return;
                }
                let store = self.store().clone();
                let ctx = crate::store::PreLoadContext::for_txn(header.txn_id);
                store.execute_with(
                    ctx,
                    Box::new(move |inner| {
                        inner.handle_request(&header, request);
                    }),
                );
                let outbox = store.drain(self.now_ms());
                self.send_packets(outbox);
            }
            Packet::Reply {
                request_id,
                txn_id,
                reply,
            } => {
                let Some((_, routed)) = self.reply_routes.remove(&request_id) else {
                    // Stale or duplicate; trackers would ignore it anyway.
                    return;
                };
                debug_assert_eq!(routed, txn_id);
                let Some(driver) = self.drivers.get(&txn_id).map(|d| d.value().clone()) else {
                    return;
                };
                let mut ctx = NodeCtx {
                    node: self,
                    buffered: Vec::new(),
                };
                let done = {
                    let mut driver = driver.lock();
                    driver.on_reply(&mut ctx, from, reply);
                    driver.is_done()
                };
                let buffered = std::mem::take(&mut ctx.buffered);
                self.flush(txn_id, buffered);
                if done {
                    self.drivers.remove(&txn_id);
                    self.deadlines.lock().remove(&txn_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Drive timers: coordination deadlines and per-store progress. The
    /// embedding calls this from its timer loop; tests call it directly.
    pub fn tick(&self, now_ms: u64) {
        // Expire driver deadlines.
        let mut expired = Vec::new();
        self.deadlines.lock().advance(now_ms, &mut |_, txn_id| {
            expired.push(txn_id);
        });
        for txn_id in expired {
            if let Some(driver) = self.drivers.get(&txn_id).map(|d| d.value().clone()) {
                let mut driver = driver.lock();
                driver.on_expired();
                if driver.is_done() {
                    drop(driver);
                    self.drivers.remove(&txn_id);
                }
            }
        }

        // Per-store progress timers.
        for store in &self.stores {
            let fires = store.with_inner_mut(|inner| {
                inner.now_ms = now_ms;
                inner.progress.advance(now_ms)
            });
            for fire in fires {
                match fire.kind {
                    ProgressTimerKind::AttemptRecovery | ProgressTimerKind::SeekProgress => {
                        self.attempt_recovery(store, fire.txn_id, now_ms);
                    }
                    ProgressTimerKind::ExpireEphemeral => {
                        store.execute(Box::new(move |inner| {
                            inner.expire_ephemeral(fire.txn_id);
                        }));
                    }
                }
            }
            let outbox = store.drain(now_ms);
            self.send_packets(outbox);
        }
    }

    fn attempt_recovery(&self, store: &Arc<CommandStore>, txn_id: TxnId, now_ms: u64) {
        // Skip if this node is already driving the transaction.
        if self.drivers.contains_key(&txn_id) {
            return;
        }
        let Some((route, promised, actionable)) = store.with_inner(|inner| {
            inner.command(txn_id).map(|c| {
                let status = c.status();
                // Undecided: the coordinator is suspected. Stable but not
                // yet applied: execution is blocked and needs driving.
                let actionable = !status.is_decided()
                    || (status.has_stable_deps() && status < crate::command::SaveStatus::Applied);
                (c.participants().route().cloned(), c.promised(), actionable)
            })
        }) else {
            return;
        };
        let Some(route) = route else {
            return;
        };
        if !actionable {
            return;
        }
        debug!(%txn_id, node = %self.id, "progress timer fired; attempting recovery");
        // Re-arm the monitor so a failed attempt retries with backoff.
        store.with_inner_mut(|inner| {
            let config = inner.config.clone();
            inner.progress.await_coordination(txn_id, now_ms, &config);
        });
        let agent = self.agent.clone();
        let result = self.recover(
            txn_id,
            route,
            promised,
            Box::new(move |outcome| {
                if let Err(error) = outcome {
                    agent.on_failure(Some(txn_id), &error);
                }
            }),
        );
        if let Err(error) = result {
            self.agent.on_failure(Some(txn_id), &error);
        }
    }

    /// Background timer driver for async embeddings: sleeps until the next
    /// pending deadline and ticks. Runs until aborted.
    pub fn spawn_timer_driver(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let now = node.now_ms();
                let wake = node.wake_at().unwrap_or(now + 1_000);
                let delay = wake.saturating_sub(now).max(10);
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                node.tick(node.now_ms());
            }
        })
    }

    /// The earliest instant `tick` has work to do.
    pub fn wake_at(&self) -> Option<u64> {
        let mut wake = self.deadlines.lock().wake_at();
        for store in &self.stores {
            wake = match (wake, store.wake_at()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        wake
    }

    // ------------------------------------------------------------------
    // Outbound plumbing
    // ------------------------------------------------------------------

    fn flush(&self, txn_id: TxnId, buffered: Vec<Outbound>) {
        for outbound in buffered {
            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            self.reply_routes.insert(request_id, txn_id);
            let header = RequestHeader {
                txn_id,
                wait_for_epoch: outbound.wait_for_epoch,
                scope: outbound.scope,
                reply: ReplyContext {
                    request_id,
                    source: self.id,
                    expires_at: Some(
                        self.now_ms() + self.config.local_expires_at.as_millis() as u64,
                    ),
                },
            };
            self.sink.send(Envelope {
                from: self.id,
                to: outbound.to,
                clock: self.hlc.next(),
                packet: Packet::Request {
                    header,
                    request: outbound.request,
                },
            });
        }
    }

    fn send_packets(&self, packets: Vec<(NodeId, Packet)>) {
        for (to, packet) in packets {
            self.sink.send(Envelope {
                from: self.id,
                to,
                clock: self.hlc.next(),
                packet,
            });
        }
    }

    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

fn route_for(txn: &PartialTxn) -> Result<Route> {
    let home = match &txn.scope {
        RouteParts::Keys(keys) => keys.iter().next().cloned(),
        RouteParts::Ranges(ranges) => ranges.iter().next().map(|r| r.start().clone()),
    }
    .ok_or_else(|| ProtocolError::Internal("transaction with empty scope".into()))?;
    Ok(Route::full(home, txn.scope.clone()))
}

/// Borrowed view implementing the coordinator's context against this node.
struct NodeCtx<'a> {
    node: &'a Node,
    buffered: Vec<Outbound>,
}

impl CoordinatorContext for NodeCtx<'_> {
    fn node_id(&self) -> NodeId {
        self.node.id
    }

    fn config(&self) -> &ProtocolConfig {
        &self.node.config
    }

    fn faulty(&self) -> BTreeSet<NodeId> {
        self.node.topology.read().faulty().clone()
    }

    fn unsynced_topologies(
        &self,
        parts: &RouteParts,
        min_epoch: u64,
        max_epoch: u64,
    ) -> Result<Topologies> {
        self.node
            .topology
            .read()
            .with_unsynced_epochs(parts, min_epoch, max_epoch)
    }

    fn epoch_topologies(&self, epoch: u64) -> Result<Topologies> {
        self.node.topology.read().precise_epochs(epoch, epoch)
    }

    fn push(&mut self, outbound: Outbound) {
        self.buffered.push(outbound);
    }
}

/// In-memory transport for tests: envelopes queue centrally and are pumped
/// to their destination nodes explicitly, keeping delivery deterministic.
#[derive(Default)]
pub struct LoopbackNetwork {
    queue: Mutex<std::collections::VecDeque<Envelope>>,
    /// Nodes currently unreachable; their envelopes are dropped.
    down: Mutex<BTreeSet<NodeId>>,
}

impl LoopbackNetwork {
    pub fn partition(&self, node: NodeId) {
        self.down.lock().insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.down.lock().remove(&node);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Deliver queued envelopes until quiescent. A partitioned node
    /// receives nothing, but envelopes it queued before going down still
    /// deliver, which is exactly a crash after send.
    pub fn pump(&self, nodes: &[Arc<Node>]) {
        loop {
            let Some(envelope) = self.queue.lock().pop_front() else {
                return;
            };
            if self.down.lock().contains(&envelope.to) {
                continue;
            }
            if let Some(node) = nodes.iter().find(|n| n.id() == envelope.to) {
                node.receive(envelope);
            }
        }
    }
}

impl MessageSink for LoopbackNetwork {
    fn send(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
    }
}
