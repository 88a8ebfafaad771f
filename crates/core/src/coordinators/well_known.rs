//! The cache of the servers' well-known data.
//!
//! The cache is loaded from storage at startup, then every server is
//! refreshed in the background and again on a recurring timer. Getters never
//! wait: a miss returns [NfError::NotCachedYet] and triggers a download,
//! callers wait for [Notification::WellKnownCacheUpdated].

use crate::context::Context;
use crate::framework::*;
use netfetch_api::{
    config::ModConfig, delegate::*, notification::*, record::*, server::*, *,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Module name of the [WellKnownConfig].
pub const MOD_NAME: &str = "WellKnown";

/// Configuration parameters for [WellKnownCoordinator].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WellKnownConfig {
    /// Interval between two refreshes of every known server.
    ///
    /// Default: 6 h.
    pub refresh_interval_ms: u64,
}

impl Default for WellKnownConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1000 * 60 * 60 * 6,
        }
    }
}

impl ModConfig for WellKnownConfig {}

/// Why a well-known download was cancelled.
#[derive(Debug, Clone, PartialEq)]
pub enum WellKnownCancelReason {
    /// The server could not be reached.
    NetworkError,
    /// The server refused the request.
    ServerError(ServerError),
    /// The downloaded json could not be parsed.
    Malformed,
}

impl From<ServerError> for WellKnownCancelReason {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Network(_) => Self::NetworkError,
            ServerError::Malformed(_) => Self::Malformed,
            oth => Self::ServerError(oth),
        }
    }
}

#[derive(Debug)]
pub(crate) struct DownloadWellKnownOp {
    ctx: Context,
    server: ServerUrl,
}

impl Operation for DownloadWellKnownOp {
    type Output = (String, WellKnownData);
    type Reason = WellKnownCancelReason;

    fn key(&self) -> OperationKey {
        OperationKey::from_parts([self.server.as_str()])
    }

    fn execute(
        &self,
    ) -> BoxFut<'_, Result<(String, WellKnownData), WellKnownCancelReason>>
    {
        Box::pin(async move {
            let json =
                self.ctx.server.download_well_known(self.server.clone()).await?;
            let data = serde_json::from_str(&json).map_err(|err| {
                tracing::warn!(
                    server = %self.server,
                    ?err,
                    "malformed well-known"
                );
                WellKnownCancelReason::Malformed
            })?;
            Ok((json, data))
        })
    }
}

type Cache = HashMap<ServerUrl, (String, WellKnownData)>;

struct Inner {
    ctx: Context,
    queue: OperationQueue<DownloadWellKnownOp>,
    backoff: BackoffScheduler,
    cache: Mutex<Cache>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WellKnownInner")
            .field("queue", &self.queue)
            .finish()
    }
}

impl Inner {
    fn queue_download(&self, server: ServerUrl) -> bool {
        self.queue.queue(DownloadWellKnownOp {
            ctx: self.ctx.clone(),
            server,
        })
    }

    fn get(&self, server: &ServerUrl) -> NfResult<WellKnownData> {
        let cached = self
            .cache
            .lock()
            .unwrap()
            .get(server)
            .map(|(_, d)| d.clone());
        match cached {
            Some(data) => Ok(data),
            None => {
                tracing::debug!(%server, "well-known cache miss");
                self.queue_download(server.clone());
                Err(NfError::not_cached_yet(server))
            }
        }
    }

    async fn refresh_all(&self) {
        let mut servers = self
            .cache
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>();
        match self.ctx.store.get_owned_identities().await {
            Ok(identities) => {
                servers.extend(identities.into_iter().map(|i| i.server))
            }
            Err(err) => tracing::warn!(?err, "cannot read owned identities"),
        }
        for server in servers {
            self.queue_download(server);
        }
    }
}

/// Keeps the well-known data of every server.
#[derive(Debug)]
pub struct WellKnownCoordinator {
    inner: Arc<Inner>,
    _outcome_task: DropAbortHandle,
    _refresh_task: DropAbortHandle,
}

impl WellKnownCoordinator {
    /// Construct a new WellKnownCoordinator.
    pub fn create(
        ctx: Context,
        config: WellKnownConfig,
        backoff: BackoffConfig,
    ) -> Arc<Self> {
        let (queue, outcomes) = OperationQueue::new("well-known", 1, true);
        let inner = Arc::new(Inner {
            ctx,
            queue,
            backoff: BackoffScheduler::new("well-known", backoff),
            cache: Mutex::new(HashMap::new()),
        });

        let _outcome_task = DropAbortHandle::spawn(
            "well-known-outcomes",
            outcome_task(inner.clone(), outcomes),
        );
        let _refresh_task = DropAbortHandle::spawn(
            "well-known-refresh",
            refresh_task(
                Arc::downgrade(&inner),
                Duration::from_millis(config.refresh_interval_ms),
            ),
        );

        Arc::new(Self {
            inner,
            _outcome_task,
            _refresh_task,
        })
    }

    /// Load the cached data from storage, then refresh every known server.
    pub async fn load_from_store_and_refresh(&self) -> NfResult<()> {
        let cached = self.inner.ctx.store.get_cached_well_known().await?;
        {
            let mut lock = self.inner.cache.lock().unwrap();
            for (server, json) in cached {
                match serde_json::from_str::<WellKnownData>(&json) {
                    Ok(data) => {
                        lock.insert(server, (json, data));
                    }
                    Err(err) => {
                        tracing::warn!(
                            %server,
                            ?err,
                            "ignoring malformed cached well-known"
                        )
                    }
                }
            }
        }
        self.inner.refresh_all().await;
        Ok(())
    }

    /// Download the well-known data of a server now.
    pub fn refresh(&self, server: ServerUrl) {
        self.inner.queue_download(server);
    }

    /// The cached well-known data of a server, or
    /// [NfError::NotCachedYet].
    pub fn get_well_known(&self, server: &ServerUrl) -> NfResult<WellKnownData> {
        self.inner.get(server)
    }

    /// Run every scheduled retry now.
    pub fn retry_scheduled(&self) {
        self.inner.backoff.retry_scheduled_runnables();
    }
}

impl WellKnownCacheDelegate for WellKnownCoordinator {
    fn get_web_socket_url(&self, server: ServerUrl) -> NfResult<String> {
        self.inner.get(&server)?.web_socket_url.ok_or_else(|| {
            NfError::other(format!("{server} has no websocket url"))
        })
    }

    fn get_turn_urls(&self, server: ServerUrl) -> NfResult<Vec<String>> {
        Ok(self.inner.get(&server)?.turn_server_urls)
    }
}

async fn refresh_task(inner: Weak<Inner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        tracing::debug!("periodic well-known refresh");
        inner.refresh_all().await;
    }
}

async fn outcome_task(
    inner: Arc<Inner>,
    mut outcomes: OutcomeRecv<DownloadWellKnownOp>,
) {
    while let Some(Completed { op, outcome }) = outcomes.recv().await {
        let key = op.key();
        let server = op.server.clone();
        match outcome {
            Outcome::Finished((json, data)) => {
                inner.backoff.clear_failed_count(&key);
                let changed = {
                    let mut lock = inner.cache.lock().unwrap();
                    let changed = lock
                        .get(&server)
                        .map(|(cached, _)| *cached != json)
                        .unwrap_or(true);
                    lock.insert(server.clone(), (json.clone(), data));
                    changed
                };
                if changed {
                    if let Err(err) =
                        inner.ctx.store.save_well_known(server.clone(), json).await
                    {
                        tracing::warn!(%server, ?err, "cannot save well-known");
                    }
                }
                tracing::debug!(%server, changed, "well-known updated");
                inner
                    .ctx
                    .bus
                    .post(Notification::WellKnownCacheUpdated { server, changed });
            }
            Outcome::Cancelled(Some(WellKnownCancelReason::Malformed)) => {
                // the periodic refresh tries again
                inner.backoff.clear_failed_count(&key);
            }
            Outcome::Cancelled(
                reason @ (Some(
                    WellKnownCancelReason::NetworkError
                    | WellKnownCancelReason::ServerError(_),
                )
                | None),
            ) => {
                let weak = Arc::downgrade(&inner);
                let s = server.clone();
                let delay =
                    inner.backoff.schedule(key, "well-known", move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.queue_download(s);
                        }
                    });
                tracing::warn!(
                    %server,
                    ?reason,
                    ?delay,
                    "well-known download failed, will retry"
                );
            }
        }
    }
}
