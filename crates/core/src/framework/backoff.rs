//! Per-key exponential backoff and delayed re-execution.
//!
//! A coordinator that sees an operation fail for a transient reason hands
//! the re-queue closure to [BackoffScheduler::schedule]. The closure runs
//! once the delay for the key's current failure count elapses, or earlier
//! when [BackoffScheduler::retry_scheduled_runnables] is called, typically
//! because the network came back.

use super::operation::OperationKey;
use backon::BackoffBuilder;
use netfetch_api::config::ModConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Configuration parameters for a [BackoffScheduler].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay after the first failure of a key.
    ///
    /// Default: 500 ms.
    pub base_delay_ms: u32,

    /// Cap of the delay.
    ///
    /// Default: 5 min.
    pub max_delay_ms: u32,

    /// Growth factor between two consecutive failures.
    ///
    /// Default: 2.
    pub factor: f32,

    /// Add random jitter to each delay. Delays are then no longer
    /// monotone in the failure count.
    ///
    /// Default: false.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 1000 * 60 * 5,
            factor: 2.0,
            jitter: false,
        }
    }
}

impl ModConfig for BackoffConfig {}

impl BackoffConfig {
    fn build(&self) -> backon::ExponentialBackoff {
        let builder = backon::ExponentialBuilder::default()
            .with_factor(self.factor)
            .with_min_delay(Duration::from_millis(self.base_delay_ms as u64))
            .with_max_delay(Duration::from_millis(self.max_delay_ms as u64))
            .with_max_times(usize::MAX);
        if self.jitter {
            builder.with_jitter().build()
        } else {
            builder.build()
        }
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms as u64)
    }
}

type Work = Box<dyn FnOnce() + Send + 'static>;

struct KeyBackoff {
    back_off: backon::ExponentialBackoff,
    failed_count: u32,
}

struct ScheduledWork {
    key: OperationKey,
    label: String,
    work: Work,
    handle: tokio::task::AbortHandle,
}

#[derive(Default)]
struct State {
    keys: HashMap<OperationKey, KeyBackoff>,
    scheduled: HashMap<u64, ScheduledWork>,
    next_id: u64,
}

/// Schedules delayed work keyed by operation subject.
pub struct BackoffScheduler {
    name: String,
    config: BackoffConfig,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for BackoffScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffScheduler")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for BackoffScheduler {
    fn drop(&mut self) {
        for (_, s) in self.state.lock().unwrap().scheduled.drain() {
            s.handle.abort();
        }
    }
}

impl BackoffScheduler {
    /// Construct a new scheduler.
    pub fn new(name: impl Into<String>, config: BackoffConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Count one more failure for `key` and run `work` once the resulting
    /// delay elapses. Returns the delay.
    pub fn schedule<F>(
        &self,
        key: OperationKey,
        label: impl Into<String>,
        work: F,
    ) -> Duration
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = {
            let mut lock = self.state.lock().unwrap();
            let entry = lock.keys.entry(key.clone()).or_insert_with(|| {
                KeyBackoff {
                    back_off: self.config.build(),
                    failed_count: 0,
                }
            });
            entry.failed_count += 1;
            entry
                .back_off
                .next()
                .unwrap_or_else(|| self.config.max_delay())
        };
        self.schedule_after(key, label.into(), delay, Box::new(work));
        delay
    }

    /// Run `work` after a fixed delay, without counting a failure.
    pub fn schedule_with_initial_delay<F>(
        &self,
        key: OperationKey,
        label: impl Into<String>,
        delay: Duration,
        work: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_after(key, label.into(), delay, Box::new(work));
    }

    fn schedule_after(
        &self,
        key: OperationKey,
        label: String,
        delay: Duration,
        work: Work,
    ) {
        tracing::debug!(
            scheduler = %self.name,
            %key,
            %label,
            ?delay,
            "scheduling delayed work"
        );

        let mut lock = self.state.lock().unwrap();
        let id = lock.next_id;
        lock.next_id += 1;

        let state = Arc::downgrade(&self.state);
        let handle = tokio::task::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let scheduled = state.lock().unwrap().scheduled.remove(&id);
            if let Some(scheduled) = scheduled {
                (scheduled.work)();
            }
        })
        .abort_handle();

        lock.scheduled.insert(
            id,
            ScheduledWork {
                key,
                label,
                work,
                handle,
            },
        );
    }

    /// Number of failures counted for `key` since it last succeeded.
    pub fn failed_count(&self, key: &OperationKey) -> u32 {
        self.state
            .lock()
            .unwrap()
            .keys
            .get(key)
            .map(|k| k.failed_count)
            .unwrap_or(0)
    }

    /// Reset the failure count of `key`, its next failure gets the base
    /// delay again.
    pub fn clear_failed_count(&self, key: &OperationKey) {
        self.state.lock().unwrap().keys.remove(key);
    }

    /// Number of works waiting for their delay to elapse.
    pub fn scheduled_count(&self) -> usize {
        self.state.lock().unwrap().scheduled.len()
    }

    /// Run every scheduled work now, abandoning its timer.
    pub fn retry_scheduled_runnables(&self) {
        let works = {
            let mut lock = self.state.lock().unwrap();
            lock.scheduled.drain().map(|(_, s)| s).collect::<Vec<_>>()
        };

        if !works.is_empty() {
            tracing::debug!(
                scheduler = %self.name,
                count = works.len(),
                "retrying scheduled work now"
            );
        }

        for s in works {
            s.handle.abort();
            tracing::trace!(
                scheduler = %self.name,
                key = %s.key,
                label = %s.label,
                "retry"
            );
            (s.work)();
        }
    }
}
