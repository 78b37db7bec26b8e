// Command stores.
//
// A node hosts one or more command stores, each exclusively owning the
// command records and per-key indexes for the ranges assigned to it. Stores
// are single-threaded actors: work arrives as queued tasks, runs to
// completion against the store lock, and leaves behind outbound packets for
// the node to send. Cross-store references are by TxnId value only.

mod replica;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cfk::{CommandsForKey, SummaryStatus};
use crate::cleanup::{self, Cleanup, DurableBefore, RedundantBefore};
use crate::command::{Command, Data, SaveStatus, Update, WaitingOn};
use crate::config::ProtocolConfig;
use crate::deps::Deps;
use crate::messages::Packet;
use crate::progress::ProgressLog;
use crate::routables::{Keys, Ranges, RoutingKey};
use crate::time::{Hlc, NodeId, Timestamp, TxnId};

/// Identifies one command store within its node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StoreId(pub u32);

/// External data plane: user reads and writes at a timestamp.
pub trait DataStore: Send + Sync {
    fn read(&self, keys: &Keys, at: Timestamp) -> Data;
    fn write(&self, update: &Update, at: Timestamp);
}

/// Timestamped last-writer-wins store backing tests and examples.
#[derive(Default)]
pub struct MemoryStore {
    cells: RwLock<BTreeMap<crate::routables::Key, (Timestamp, Bytes)>>,
}

impl DataStore for MemoryStore {
    fn read(&self, keys: &Keys, _at: Timestamp) -> Data {
        let cells = self.cells.read();
        let mut data = Data::default();
        for key in keys.iter() {
            data.values
                .insert(key.clone(), cells.get(key).map(|(_, v)| v.clone()));
        }
        data
    }

    fn write(&self, update: &Update, at: Timestamp) {
        let mut cells = self.cells.write();
        for (key, value) in &update.writes {
            match cells.get(key) {
                Some((existing, _)) if *existing > at => {}
                _ => {
                    cells.insert(key.clone(), (at, value.clone()));
                }
            }
        }
    }
}

/// Everything a store persists, replayable in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalRecord {
    Command(Command),
    RedundantBefore(RedundantBefore),
    DurableBefore(DurableBefore),
    BootstrapBeganAt(TxnId),
    SafeToRead(Ranges),
    RangesForEpoch(u64, Ranges),
}

/// External persistence: opaque append/replay per store.
pub trait Journal: Send + Sync {
    fn append(&self, store: StoreId, record: JournalRecord);
    fn replay(&self, store: StoreId) -> Vec<JournalRecord>;
}

/// In-memory journal for tests.
#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<HashMap<u32, Vec<JournalRecord>>>,
}

impl Journal for MemoryJournal {
    fn append(&self, store: StoreId, record: JournalRecord) {
        self.records.lock().entry(store.0).or_default().push(record);
    }

    fn replay(&self, store: StoreId) -> Vec<JournalRecord> {
        self.records
            .lock()
            .get(&store.0)
            .cloned()
            .unwrap_or_default()
    }
}

/// A read waiting for local dependencies to apply.
#[derive(Debug, Clone)]
struct PendingRead {
    keys: Keys,
    execute_at: Timestamp,
    reply_to: NodeId,
    request_id: u64,
}

/// An apply acknowledgement deferred until the command actually applies.
#[derive(Debug, Clone)]
struct PendingApplyAck {
    reply_to: NodeId,
    request_id: u64,
}

pub type Task = Box<dyn FnOnce(&mut StoreInner) + Send>;

/// What a task declares it will touch. Records and indexes are materialised
/// before the task body runs; a task discovering it needs more re-submits
/// itself with a wider context rather than suspending mid-task.
#[derive(Debug, Clone, Default)]
pub struct PreLoadContext {
    pub txn_ids: Vec<TxnId>,
    pub keys: Vec<RoutingKey>,
}

impl PreLoadContext {
    pub fn for_txn(txn_id: TxnId) -> Self {
        Self {
            txn_ids: vec![txn_id],
            keys: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: RoutingKey) -> Self {
        self.keys.push(key);
        self
    }
}

/// The store's mutable state. Exclusively owned; tasks get `&mut` access.
pub struct StoreInner {
    pub(crate) id: StoreId,
    pub(crate) node: NodeId,
    pub(crate) config: ProtocolConfig,
    pub(crate) hlc: Arc<Hlc>,
    pub(crate) data: Arc<dyn DataStore>,
    pub(crate) journal: Arc<dyn Journal>,

    pub(crate) commands: HashMap<TxnId, Command>,
    pub(crate) cfks: BTreeMap<RoutingKey, CommandsForKey>,
    /// Active range-domain transactions and the ranges they cover.
    pub(crate) range_txns: BTreeMap<TxnId, Ranges>,
    /// Reverse dependency edges: dep -> commands waiting on it.
    pub(crate) dependents: HashMap<TxnId, BTreeSet<TxnId>>,
    pending_reads: HashMap<TxnId, Vec<PendingRead>>,
    pending_apply_acks: HashMap<TxnId, Vec<PendingApplyAck>>,

    pub(crate) redundant_before: RedundantBefore,
    pub(crate) durable_before: DurableBefore,
    pub(crate) bootstrap_began_at: TxnId,
    pub(crate) safe_to_read: Ranges,
    /// Owned ranges per epoch, as learned from topology updates.
    pub(crate) ranges_for_epoch: BTreeMap<u64, Ranges>,

    pub(crate) progress: ProgressLog,
    /// Milliseconds; refreshed by the node before each drain.
    pub(crate) now_ms: u64,
    /// Packets produced by tasks, collected after each drain.
    pub(crate) outbox: Vec<(NodeId, Packet)>,
}

/// One command store: the queue plus the exclusively-owned inner state.
pub struct CommandStore {
    id: StoreId,
    queue: SegQueue<Task>,
    draining: AtomicBool,
    inner: Mutex<StoreInner>,
}

impl CommandStore {
    pub fn new(
        id: StoreId,
        node: NodeId,
        config: ProtocolConfig,
        hlc: Arc<Hlc>,
        data: Arc<dyn DataStore>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            id,
            queue: SegQueue::new(),
            draining: AtomicBool::new(false),
            inner: Mutex::new(StoreInner {
                id,
                node,
                config,
                hlc,
                data,
                journal,
                commands: HashMap::new(),
                cfks: BTreeMap::new(),
                range_txns: BTreeMap::new(),
                dependents: HashMap::new(),
                pending_reads: HashMap::new(),
                pending_apply_acks: HashMap::new(),
                redundant_before: RedundantBefore::default(),
                durable_before: DurableBefore::default(),
                bootstrap_began_at: TxnId::min_value(),
                safe_to_read: Ranges::EMPTY,
                ranges_for_epoch: BTreeMap::new(),
                progress: ProgressLog::default(),
                now_ms: 0,
                outbox: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    /// Submit a task. Tasks never run re-entrantly: a task submitting more
    /// work extends the current drain instead of nesting.
    pub fn execute(&self, task: Task) {
        self.queue.push(task);
    }

    /// Submit a task with its declared working set.
    pub fn execute_with(&self, ctx: PreLoadContext, task: Task) {
        self.queue.push(Box::new(move |inner| {
            for txn_id in &ctx.txn_ids {
                inner.command_mut(*txn_id);
            }
            for key in &ctx.keys {
                inner.cfk_mut(key);
            }
            task(inner);
        }));
    }

    /// Run queued tasks to completion and return the packets they produced.
    /// Reentrant submissions from within tasks are drained in the same call.
    pub fn drain(&self, now_ms: u64) -> Vec<(NodeId, Packet)> {
        if self.draining.swap(true, Ordering::AcqRel) {
            // Another drain is in progress on this store; it will consume
            // the queue.
            return Vec::new();
        }
        let mut inner = self.inner.lock();
        inner.now_ms = now_ms;
        while let Some(task) = self.queue.pop() {
            task(&mut inner);
        }
        let out = std::mem::take(&mut inner.outbox);
        drop(inner);
        self.draining.store(false, Ordering::Release);
        out
    }

    /// Inspect store state outside the task model (tests, snapshots).
    pub fn with_inner<T>(&self, f: impl FnOnce(&StoreInner) -> T) -> T {
        f(&self.inner.lock())
    }

    pub fn with_inner_mut<T>(&self, f: impl FnOnce(&mut StoreInner) -> T) -> T {
        f(&mut self.inner.lock())
    }

    /// The earliest progress deadline, for the embedding's timer driver.
    pub fn wake_at(&self) -> Option<u64> {
        self.inner.lock().progress.wake_at()
    }
}

impl StoreInner {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn command(&self, txn_id: TxnId) -> Option<&Command> {
        self.commands.get(&txn_id)
    }

    pub fn cfk(&self, key: &RoutingKey) -> Option<&CommandsForKey> {
        self.cfks.get(key)
    }

    pub fn cfk_keys(&self) -> Vec<RoutingKey> {
        self.cfks.keys().cloned().collect()
    }

    pub fn owned_ranges(&self) -> Ranges {
        self.ranges_for_epoch
            .values()
            .next_back()
            .cloned()
            .unwrap_or(Ranges::EMPTY)
    }

    /// Owned ranges in `epoch`, falling back to the closest earlier epoch.
    pub fn owned_at(&self, epoch: u64) -> Ranges {
        self.ranges_for_epoch
            .range(..=epoch)
            .next_back()
            .map(|(_, r)| r.clone())
            .unwrap_or(Ranges::EMPTY)
    }

    pub fn update_ranges(&mut self, epoch: u64, ranges: Ranges) {
        self.journal
            .append(self.id, JournalRecord::RangesForEpoch(epoch, ranges.clone()));
        self.safe_to_read = self.safe_to_read.union(&ranges);
        self.ranges_for_epoch.insert(epoch, ranges);
    }

    pub(crate) fn command_mut(&mut self, txn_id: TxnId) -> &mut Command {
        self.commands
            .entry(txn_id)
            .or_insert_with(|| Command::uninitialised(txn_id))
    }

    pub(crate) fn cfk_mut(&mut self, key: &RoutingKey) -> &mut CommandsForKey {
        self.cfks
            .entry(key.clone())
            .or_insert_with(|| CommandsForKey::new(key.clone()))
    }

    pub(crate) fn save(&self, txn_id: TxnId) {
        if let Some(command) = self.commands.get(&txn_id) {
            self.journal
                .append(self.id, JournalRecord::Command(command.clone()));
        }
    }

    /// Routing keys of a command's participants that this store owns in the
    /// given epoch.
    pub(crate) fn owned_keys_of(
        &self,
        scope: &crate::routables::RouteParts,
        epoch: u64,
    ) -> Vec<RoutingKey> {
        let owned = self.owned_at(epoch);
        match scope {
            crate::routables::RouteParts::Keys(keys) => keys
                .iter()
                .filter(|k| owned.contains(k))
                .cloned()
                .collect(),
            crate::routables::RouteParts::Ranges(ranges) => {
                // Range transactions index through the keys already tracked.
                let cut = ranges.intersect(&owned);
                self.cfks
                    .keys()
                    .filter(|k| cut.contains(k))
                    .cloned()
                    .collect()
            }
        }
    }

    // ------------------------------------------------------------------
    // Execution graph
    // ------------------------------------------------------------------

    /// Compute the waiting-on set for a stabilising command, registering the
    /// reverse edges, and return it.
    pub(crate) fn build_waiting_on(
        &mut self,
        txn_id: TxnId,
        execute_at: Timestamp,
        deps: &Deps,
        epoch: u64,
    ) -> WaitingOn {
        let owned = self.owned_at(epoch);
        let mut pending: BTreeSet<TxnId> = BTreeSet::new();

        for (key, ids) in deps.key_deps.iter() {
            if !owned.contains(key) {
                continue;
            }
            let shard_applied = self.redundant_before.shard_applied(key);
            for id in ids {
                if *id < shard_applied {
                    continue;
                }
                pending.insert(*id);
            }
        }
        for id in deps.range_deps.txn_ids() {
            let relevant = deps
                .range_deps
                .ranges_for(id)
                .map(|r| !r.intersect(&owned).is_empty())
                .unwrap_or(false);
            if relevant {
                pending.insert(id);
            }
        }

        // Drop dependencies that are already satisfied locally, or that are
        // decided to execute after us (they wait for us, not the reverse).
        pending.retain(|id| {
            if *id == txn_id {
                return false;
            }
            match self.commands.get(id) {
                Some(dep) => match dep.status() {
                    SaveStatus::Applied | SaveStatus::Invalidated | SaveStatus::Truncated => false,
                    _ => match dep.execute_at() {
                        Some(at) if dep.status().has_execute_at() && at > execute_at => false,
                        _ => true,
                    },
                },
                None => true,
            }
        });

        for id in &pending {
            self.dependents.entry(*id).or_default().insert(txn_id);
        }
        WaitingOn::new(pending.into_iter().collect())
    }

    /// A dependency resolved (applied, invalidated, or excluded): clear it
    /// from its dependents and push any that became executable.
    pub(crate) fn notify_resolved(&mut self, dep: TxnId) {
        let mut worklist = vec![dep];
        while let Some(resolved) = worklist.pop() {
            let Some(waiters) = self.dependents.remove(&resolved) else {
                continue;
            };
            for waiter in waiters {
                let ready = {
                    let Some(command) = self.commands.get_mut(&waiter) else {
                        continue;
                    };
                    match command.waiting_on_mut() {
                        Some(waiting) => {
                            waiting.clear(resolved);
                            waiting.is_done()
                        }
                        None => false,
                    }
                };
                if ready {
                    if let Some(newly_resolved) = self.try_execute(waiter) {
                        worklist.push(newly_resolved);
                    }
                }
            }
        }
    }

    /// Attempt to move a ready command forward: serve its pending reads and
    /// finish a pending apply. Returns the id if it reached Applied.
    pub(crate) fn try_execute(&mut self, txn_id: TxnId) -> Option<TxnId> {
        let (ready, execute_at, has_result) = {
            let command = self.commands.get(&txn_id)?;
            let ready = command.status().has_stable_deps()
                && command
                    .waiting_on()
                    .map(WaitingOn::is_done)
                    .unwrap_or(false);
            (ready, command.execute_at(), command.result().is_some())
        };
        if !ready {
            return None;
        }
        let execute_at = execute_at.expect("stable implies execute_at");

        // Serve reads that were waiting on dependencies.
        if let Some(reads) = self.pending_reads.remove(&txn_id) {
            for read in reads {
                let data = self.data.read(&read.keys, read.execute_at);
                self.outbox.push((
                    read.reply_to,
                    Packet::Reply {
                        request_id: read.request_id,
                        txn_id,
                        reply: crate::messages::Reply::ReadOk { data },
                    },
                ));
            }
        }

        // Finish a pre-applied command.
        if has_result {
            self.finish_apply(txn_id, execute_at);
            return Some(txn_id);
        }
        None
    }

    /// Write the update, mark applied, notify the graph and ack waiters.
    pub(crate) fn finish_apply(&mut self, txn_id: TxnId, execute_at: Timestamp) {
        let (update, result) = {
            let command = self.commands.get(&txn_id).expect("caller checked");
            let update = command.partial_txn().and_then(|t| t.update.clone());
            let result = command.result().cloned().unwrap_or_default();
            (update, result)
        };
        if let Some(update) = &update {
            let owned = self.owned_ranges();
            self.data.write(&update.slice(&owned), execute_at);
        }
        {
            let command = self.commands.get_mut(&txn_id).expect("caller checked");
            if command.applied(result).is_err() {
                return;
            }
        }
        trace!(%txn_id, store = ?self.id, "applied");

        let scope = self
            .commands
            .get(&txn_id)
            .and_then(|c| c.partial_txn().map(|t| t.scope.clone()));
        if let Some(scope) = scope {
            for key in self.owned_keys_of(&scope, txn_id.epoch()) {
                self.cfk_mut(&key).mark_applied(txn_id, execute_at);
            }
        }
        self.progress.settled(txn_id);
        self.save(txn_id);

        if let Some(acks) = self.pending_apply_acks.remove(&txn_id) {
            for ack in acks {
                self.outbox.push((
                    ack.reply_to,
                    Packet::Reply {
                        request_id: ack.request_id,
                        txn_id,
                        reply: crate::messages::Reply::ApplyOk,
                    },
                ));
            }
        }
        // Callers propagate the resolution through `notify_resolved`.
    }

    pub(crate) fn queue_pending_read(
        &mut self,
        txn_id: TxnId,
        keys: Keys,
        execute_at: Timestamp,
        reply_to: NodeId,
        request_id: u64,
    ) {
        self.pending_reads.entry(txn_id).or_default().push(PendingRead {
            keys,
            execute_at,
            reply_to,
            request_id,
        });
    }

    pub(crate) fn queue_apply_ack(&mut self, txn_id: TxnId, reply_to: NodeId, request_id: u64) {
        self.pending_apply_acks
            .entry(txn_id)
            .or_default()
            .push(PendingApplyAck {
                reply_to,
                request_id,
            });
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Evaluate and apply the cleanup decision for one command.
    pub fn run_cleanup(&mut self, txn_id: TxnId) -> Cleanup {
        let Some(command) = self.commands.get(&txn_id) else {
            return Cleanup::No;
        };
        let decision = cleanup::should_cleanup(
            txn_id,
            command.status(),
            command.durability(),
            command.participants(),
            &self.redundant_before,
            &self.durable_before,
        );
        match decision {
            Cleanup::No => {}
            Cleanup::Invalidate => {
                if let Some(command) = self.commands.get_mut(&txn_id) {
                    let _ = command.invalidate();
                }
                let scope = self
                    .commands
                    .get(&txn_id)
                    .and_then(|c| c.partial_txn().map(|t| t.scope.clone()));
                if let Some(scope) = scope {
                    for key in self.owned_keys_of(&scope, txn_id.epoch()) {
                        self.cfk_mut(&key).mark_invalidated(txn_id);
                    }
                }
                self.progress.settled(txn_id);
                self.save(txn_id);
                self.notify_resolved(txn_id);
            }
            Cleanup::TruncateWithOutcome => {
                if let Some(command) = self.commands.get_mut(&txn_id) {
                    command.truncate(true);
                }
                self.save(txn_id);
            }
            Cleanup::Truncate | Cleanup::Vestigial | Cleanup::ExpungePartial => {
                if let Some(command) = self.commands.get_mut(&txn_id) {
                    command.truncate(false);
                }
                self.save(txn_id);
            }
            Cleanup::Erase | Cleanup::Expunge => {
                self.commands.remove(&txn_id);
                self.dependents.remove(&txn_id);
                self.range_txns.remove(&txn_id);
                self.progress.settled(txn_id);
            }
        }
        decision
    }

    /// Merge a redundancy watermark update and prune the per-key indexes.
    pub fn advance_redundant_before(&mut self, update: RedundantBefore) {
        self.redundant_before = RedundantBefore::merge(&self.redundant_before, &update);
        self.journal.append(
            self.id,
            JournalRecord::RedundantBefore(self.redundant_before.clone()),
        );
        let delta = self.config.cfk_hlc_prune_delta;
        let interval = self.config.cfk_prune_interval;
        let watermarks: Vec<(RoutingKey, TxnId)> = self
            .cfks
            .keys()
            .map(|k| (k.clone(), self.redundant_before.gc_before(k)))
            .collect();
        for (key, gc_before) in watermarks {
            let cfk = self.cfk_mut(&key);
            if cfk.should_prune(interval) || gc_before > cfk.pruned_before() {
                cfk.prune(gc_before, delta);
            }
        }
    }

    pub fn advance_durable_before(&mut self, update: DurableBefore) {
        self.durable_before = DurableBefore::merge(&self.durable_before, &update);
        self.journal.append(
            self.id,
            JournalRecord::DurableBefore(self.durable_before.clone()),
        );
    }

    /// Rebuild state from the journal. Later records win.
    pub fn replay_journal(&mut self) {
        for record in self.journal.replay(self.id) {
            match record {
                JournalRecord::Command(command) => {
                    self.commands.insert(command.txn_id(), command);
                }
                JournalRecord::RedundantBefore(rb) => self.redundant_before = rb,
                JournalRecord::DurableBefore(db) => self.durable_before = db,
                JournalRecord::BootstrapBeganAt(at) => self.bootstrap_began_at = at,
                JournalRecord::SafeToRead(ranges) => self.safe_to_read = ranges,
                JournalRecord::RangesForEpoch(epoch, ranges) => {
                    self.ranges_for_epoch.insert(epoch, ranges);
                }
            }
        }
        // Re-derive the per-key indexes from the surviving commands.
        let commands: Vec<(TxnId, Option<SummaryStatus>, Option<Timestamp>, Option<crate::routables::RouteParts>)> = self
            .commands
            .values()
            .map(|c| {
                (
                    c.txn_id(),
                    c.status().summary(),
                    c.execute_at(),
                    c.partial_txn().map(|t| t.scope.clone()),
                )
            })
            .collect();
        for (txn_id, summary, execute_at, scope) in commands {
            let (Some(summary), Some(scope)) = (summary, scope) else {
                continue;
            };
            for key in self.owned_keys_of(&scope, txn_id.epoch()) {
                self.cfk_mut(&key).update(txn_id, summary, execute_at);
            }
        }
    }
}
