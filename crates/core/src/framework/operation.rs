//! The unit of asynchronous work run by the queues.

use netfetch_api::BoxFut;
use std::sync::Arc;

/// Stable identifier of the logical subject of an operation, e.g. an
/// identity, or an identity, a message and an attachment number.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationKey(Arc<str>);

impl OperationKey {
    /// Build a key from the display form of its parts.
    pub fn from_parts<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: std::fmt::Display,
    {
        let key = parts
            .into_iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self(key.into_boxed_str().into())
    }
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of asynchronous work with a single-shot lifecycle:
/// pending, executing, then finished or cancelled with a reason.
///
/// `execute` is called at most once. It reports a cancellation by
/// returning `Err(reason)`. A cancellation requested from outside while it
/// is executing takes effect at its next suspension point.
pub trait Operation: 'static + Send + Sync + std::fmt::Debug {
    /// Value produced by a finished operation.
    type Output: 'static + Send;

    /// Closed set of reasons this operation can be cancelled for.
    type Reason: 'static + Clone + Send + Sync + std::fmt::Debug;

    /// The key of the subject of this operation.
    fn key(&self) -> OperationKey;

    /// Do the work.
    fn execute(&self) -> BoxFut<'_, Result<Self::Output, Self::Reason>>;
}

/// An operation whose queue orders it by priority.
pub trait PrioritizedOperation: Operation {
    /// Numeric priority. Its meaning depends on the queue's
    /// [PriorityOrder](super::queue::PriorityOrder).
    fn priority(&self) -> i64;

    /// The reason used when a more urgent operation takes the slot.
    fn preempted_reason() -> Self::Reason;
}

/// How an operation ended.
#[derive(Debug)]
pub enum Outcome<O: Operation> {
    /// The operation ran to completion.
    Finished(O::Output),
    /// The operation was cancelled. `None` is the null reason, reported
    /// when the operation panicked; it is never treated as success.
    Cancelled(Option<O::Reason>),
}

/// A finished or cancelled operation, handed to its coordinator.
pub struct Completed<O: Operation> {
    /// The operation.
    pub op: Arc<O>,
    /// How it ended.
    pub outcome: Outcome<O>,
}

impl<O: Operation> std::fmt::Debug for Completed<O>
where
    Outcome<O>: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completed")
            .field("op", &self.op)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Lifecycle state of a non-terminal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// Picked up by a worker.
    Executing,
}
