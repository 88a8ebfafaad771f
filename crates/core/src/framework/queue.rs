//! Operation queues: a bounded pool of worker tasks draining pending
//! operations in FIFO or priority order.
//!
//! Every queue hands the [Completed] operations to an outcome channel
//! returned at construction. The owning coordinator reads that channel
//! and decides what to do next.
//!
//! ### Deduplication
//!
//! A queue created with `dedup = true` discards an operation whose key
//! already has an instance pending or executing. The caller relies on the
//! outcome of the existing instance.
//!
//! ### Preemption
//!
//! A [PriorityOperationQueue] checks, synchronously inside `queue()`, whether
//! all worker slots are busy. If so, the executing operation with the least
//! urgent priority is cancelled with
//! [PrioritizedOperation::preempted_reason] when it is less urgent than the
//! newcomer. An operation preempted `max_preemptions` times is no longer
//! eligible for preemption until it completes, so that a stream of urgent
//! requests cannot starve it forever.

use super::operation::*;
use futures::FutureExt;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

/// Receiving end of the outcome channel of a queue.
pub type OutcomeRecv<O> = mpsc::UnboundedReceiver<Completed<O>>;
type OutcomeSend<O> = mpsc::UnboundedSender<Completed<O>>;

/// How a numeric priority maps to urgency.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum PriorityOrder {
    /// Lower numeric value means more urgent.
    LowerIsMoreUrgent,
    /// Higher numeric value means more urgent.
    HigherIsMoreUrgent,
}

impl PriorityOrder {
    /// Map a priority onto a rank where lower always means more urgent.
    pub fn rank(self, priority: i64) -> i64 {
        match self {
            Self::LowerIsMoreUrgent => priority,
            Self::HigherIsMoreUrgent => priority.saturating_neg(),
        }
    }
}

struct Pending<O: Operation> {
    rank: i64,
    seq: u64,
    op: Arc<O>,
}

impl<O: Operation> PartialEq for Pending<O> {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl<O: Operation> Eq for Pending<O> {}

impl<O: Operation> PartialOrd for Pending<O> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<O: Operation> Ord for Pending<O> {
    // BinaryHeap pops the max, we want the lowest (rank, seq).
    fn cmp(&self, other: &Self) -> Ordering {
        (other.rank, other.seq).cmp(&(self.rank, self.seq))
    }
}

struct Executing<O: Operation> {
    key: OperationKey,
    rank: i64,
    cancel: Option<oneshot::Sender<O::Reason>>,
    preempted: bool,
}

struct Preemption<R> {
    max_preemptions: u32,
    reason: R,
}

struct QueueState<O: Operation> {
    pending: BinaryHeap<Pending<O>>,
    executing: HashMap<u64, Executing<O>>,
    in_flight: HashMap<OperationKey, usize>,
    preempt_counts: HashMap<OperationKey, u32>,
    next_seq: u64,
}

impl<O: Operation> QueueState<O> {
    fn release_key(&mut self, key: &OperationKey) {
        if let Some(count) = self.in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(key);
            }
        }
    }
}

struct QueueInner<O: Operation> {
    name: String,
    concurrency: usize,
    dedup: bool,
    state: Mutex<QueueState<O>>,
    notify: Notify,
    outcome_send: OutcomeSend<O>,
}

impl<O: Operation> QueueInner<O> {
    fn admit(
        &self,
        op: Arc<O>,
        rank: i64,
        preemption: Option<Preemption<O::Reason>>,
    ) -> bool {
        let key = op.key();
        let mut lock = self.state.lock().unwrap();
        let state = &mut *lock;

        if self.dedup && state.in_flight.contains_key(&key) {
            tracing::debug!(
                queue = %self.name,
                %key,
                "discarding duplicate operation"
            );
            return false;
        }

        *state.in_flight.entry(key.clone()).or_default() += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(Pending { rank, seq, op });

        if let Some(Preemption {
            max_preemptions,
            reason,
        }) = preemption
        {
            if state.executing.len() >= self.concurrency {
                let counts = &state.preempt_counts;
                let victim = state
                    .executing
                    .iter_mut()
                    .filter(|(_, e)| {
                        e.cancel.is_some()
                            && counts.get(&e.key).copied().unwrap_or(0)
                                < max_preemptions
                    })
                    .max_by_key(|(seq, e)| (e.rank, **seq))
                    .map(|(_, e)| e);

                if let Some(victim) = victim {
                    if victim.rank > rank {
                        tracing::debug!(
                            queue = %self.name,
                            victim = %victim.key,
                            preempted_by = %key,
                            "preempting less urgent operation"
                        );
                        victim.preempted = true;
                        *state
                            .preempt_counts
                            .entry(victim.key.clone())
                            .or_default() += 1;
                        if let Some(cancel) = victim.cancel.take() {
                            let _ = cancel.send(reason);
                        }
                    }
                }
            }
        }

        drop(lock);
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<(u64, Arc<O>, oneshot::Receiver<O::Reason>)> {
        let mut lock = self.state.lock().unwrap();
        let Pending { rank, seq, op } = lock.pending.pop()?;
        let (cancel, cancel_recv) = oneshot::channel();
        lock.executing.insert(
            seq,
            Executing {
                key: op.key(),
                rank,
                cancel: Some(cancel),
                preempted: false,
            },
        );
        Some((seq, op, cancel_recv))
    }

    fn complete(&self, seq: u64, op: Arc<O>, outcome: Outcome<O>) {
        {
            let mut lock = self.state.lock().unwrap();
            if let Some(exec) = lock.executing.remove(&seq) {
                // Only a run that actually stopped for a preemption comes
                // back with its count; one that finished first starts over.
                let requeued = exec.preempted
                    && matches!(outcome, Outcome::Cancelled(Some(_)));
                if !requeued {
                    lock.preempt_counts.remove(&exec.key);
                }
                lock.release_key(&exec.key);
            }
        }

        // The key is released before the outcome is handed over, so the
        // coordinator may re-queue the same subject right away.
        if self.outcome_send.send(Completed { op, outcome }).is_err() {
            tracing::debug!(queue = %self.name, "outcome receiver dropped");
        }
    }

    fn cancel(&self, key: &OperationKey, reason: O::Reason) -> bool {
        let mut removed = Vec::new();
        let mut signalled = false;
        {
            let mut lock = self.state.lock().unwrap();
            let state = &mut *lock;

            let pending = std::mem::take(&mut state.pending);
            for p in pending.into_vec() {
                if p.op.key() == *key {
                    removed.push(p.op);
                } else {
                    state.pending.push(p);
                }
            }
            for _ in 0..removed.len() {
                state.release_key(key);
            }
            if !removed.is_empty() {
                state.preempt_counts.remove(key);
            }

            for exec in state.executing.values_mut() {
                if exec.key == *key {
                    exec.preempted = false;
                    if let Some(cancel) = exec.cancel.take() {
                        signalled |= cancel.send(reason.clone()).is_ok();
                    }
                }
            }
        }

        let cancelled = signalled || !removed.is_empty();
        for op in removed {
            let _ = self.outcome_send.send(Completed {
                op,
                outcome: Outcome::Cancelled(Some(reason.clone())),
            });
        }
        cancelled
    }

    fn state_of(&self, key: &OperationKey) -> Option<OperationState> {
        let lock = self.state.lock().unwrap();
        if lock.executing.values().any(|e| e.key == *key) {
            Some(OperationState::Executing)
        } else if lock.in_flight.contains_key(key) {
            Some(OperationState::Pending)
        } else {
            None
        }
    }
}

async fn worker<O: Operation>(inner: Arc<QueueInner<O>>) {
    loop {
        let (seq, op, mut cancel) = loop {
            let notified = inner.notify.notified();
            if let Some(next) = inner.pop() {
                break next;
            }
            notified.await;
        };

        let outcome = {
            let exec = std::panic::AssertUnwindSafe(op.execute()).catch_unwind();
            tokio::select! {
                Ok(reason) = &mut cancel => Outcome::Cancelled(Some(reason)),
                res = exec => match res {
                    Ok(Ok(output)) => Outcome::Finished(output),
                    Ok(Err(reason)) => Outcome::Cancelled(Some(reason)),
                    Err(_) => {
                        tracing::error!(
                            queue = %inner.name,
                            key = %op.key(),
                            "operation panicked"
                        );
                        Outcome::Cancelled(None)
                    }
                },
            }
        };

        inner.complete(seq, op, outcome);
    }
}

/// A FIFO queue of operations run by a fixed pool of worker tasks.
pub struct OperationQueue<O: Operation> {
    inner: Arc<QueueInner<O>>,
    workers: Vec<JoinHandle<()>>,
}

impl<O: Operation> std::fmt::Debug for OperationQueue<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("name", &self.inner.name)
            .field("concurrency", &self.inner.concurrency)
            .field("dedup", &self.inner.dedup)
            .finish()
    }
}

impl<O: Operation> Drop for OperationQueue<O> {
    fn drop(&mut self) {
        for w in self.workers.iter() {
            w.abort();
        }
    }
}

impl<O: Operation> OperationQueue<O> {
    /// Construct a queue running `concurrency` workers. Must be called
    /// within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        concurrency: usize,
        dedup: bool,
    ) -> (Self, OutcomeRecv<O>) {
        let concurrency = concurrency.max(1);
        let (outcome_send, outcome_recv) = mpsc::unbounded_channel();
        let inner = Arc::new(QueueInner {
            name: name.into(),
            concurrency,
            dedup,
            state: Mutex::new(QueueState {
                pending: BinaryHeap::new(),
                executing: HashMap::new(),
                in_flight: HashMap::new(),
                preempt_counts: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            outcome_send,
        });

        let workers = (0..concurrency)
            .map(|_| tokio::task::spawn(worker(inner.clone())))
            .collect();

        (Self { inner, workers }, outcome_recv)
    }

    /// Admit an operation. Returns false if it was discarded as a
    /// duplicate.
    pub fn queue(&self, op: impl Into<Arc<O>>) -> bool {
        self.inner.admit(op.into(), 0, None)
    }

    /// Cancel every pending or executing operation with this key.
    ///
    /// Returns true if at least one of them will complete as cancelled
    /// with `reason`. An executing operation already told to stop for
    /// another reason is not counted.
    pub fn cancel(&self, key: &OperationKey, reason: O::Reason) -> bool {
        self.inner.cancel(key, reason)
    }

    /// Lifecycle state of the operation with this key, `None` if there is
    /// no non-terminal one.
    pub fn state_of(&self, key: &OperationKey) -> Option<OperationState> {
        self.inner.state_of(key)
    }

    /// Number of operations currently executing.
    pub fn executing_count(&self) -> usize {
        self.inner.state.lock().unwrap().executing.len()
    }

    /// Number of operations waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }
}

/// A deduplicating queue ordered by priority, with preemption.
pub struct PriorityOperationQueue<O: PrioritizedOperation> {
    queue: OperationQueue<O>,
    order: PriorityOrder,
    max_preemptions: u32,
}

impl<O: PrioritizedOperation> std::fmt::Debug for PriorityOperationQueue<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityOperationQueue")
            .field("queue", &self.queue)
            .field("order", &self.order)
            .field("max_preemptions", &self.max_preemptions)
            .finish()
    }
}

impl<O: PrioritizedOperation> PriorityOperationQueue<O> {
    /// Construct a priority queue running `concurrency` workers.
    pub fn new(
        name: impl Into<String>,
        concurrency: usize,
        order: PriorityOrder,
        max_preemptions: u32,
    ) -> (Self, OutcomeRecv<O>) {
        let (queue, outcome_recv) = OperationQueue::new(name, concurrency, true);
        (
            Self {
                queue,
                order,
                max_preemptions,
            },
            outcome_recv,
        )
    }

    /// Admit an operation, preempting a less urgent executing one if all
    /// slots are busy. Returns false if it was discarded as a duplicate.
    pub fn queue(&self, op: impl Into<Arc<O>>) -> bool {
        let op = op.into();
        let rank = self.order.rank(op.priority());
        self.queue.inner.admit(
            op,
            rank,
            Some(Preemption {
                max_preemptions: self.max_preemptions,
                reason: O::preempted_reason(),
            }),
        )
    }

    /// Cancel every pending or executing operation with this key. See
    /// [OperationQueue::cancel].
    pub fn cancel(&self, key: &OperationKey, reason: O::Reason) -> bool {
        self.queue.cancel(key, reason)
    }

    /// Lifecycle state of the operation with this key.
    pub fn state_of(&self, key: &OperationKey) -> Option<OperationState> {
        self.queue.state_of(key)
    }

    /// Number of operations currently executing.
    pub fn executing_count(&self) -> usize {
        self.queue.executing_count()
    }
}
