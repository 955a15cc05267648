//! Monotonic timestamp provider backed by an external TSO.
//!
//! `get_ts` pops from the lock-free batch cache and never blocks on the TSO;
//! when the cache runs dry it triggers a renew on the single renew worker and
//! retries up to `max_retry` times before giving up with 0.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::TsProviderConfig;
use crate::error::{StoreError, StoreResult};
use crate::ts::batch::{BatchTs, BatchTsList};
use crate::types::current_time_ms;

/// One TSO response: `count` timestamps starting at `(physical, logical)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsoBatch {
    pub physical: i64,
    pub logical: i64,
    pub count: u32,
}

/// External timestamp source (the coordinator's TSO service).
pub trait TsSource: Send + Sync {
    fn fetch_batch(&self, count: u32) -> StoreResult<TsoBatch>;
}

/// In-process timestamp source driven by the local clock. Used by tests and
/// single-node deployments.
#[derive(Debug, Default)]
pub struct LocalTsSource {
    state: Mutex<(i64, i64)>,
}

impl LocalTsSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TsSource for LocalTsSource {
    fn fetch_batch(&self, count: u32) -> StoreResult<TsoBatch> {
        let mut state = self.state.lock();
        let now_ms = current_time_ms();
        if now_ms > state.0 {
            *state = (now_ms, 0);
        }
        let batch = TsoBatch {
            physical: state.0,
            logical: state.1,
            count,
        };
        state.1 += count as i64;
        Ok(batch)
    }
}

struct RenewTask {
    done: Option<mpsc::SyncSender<()>>,
}

/// Shared state the renew worker operates on.
struct RenewShared {
    list: Arc<BatchTsList>,
    source: Arc<dyn TsSource>,
    cfg: TsProviderConfig,
    renew_epoch: AtomicU64,
}

impl RenewShared {
    /// Fetch one batch with bounded retries and publish it.
    fn renew_once(&self) {
        for attempt in 0..self.cfg.renew_max_retry {
            match self.source.fetch_batch(self.cfg.batch_size) {
                Ok(batch) => {
                    debug!(
                        physical = batch.physical,
                        logical = batch.logical,
                        count = batch.count,
                        "tso batch fetched"
                    );
                    self.list
                        .push(BatchTs::alloc(batch.physical, batch.logical, batch.count));
                    self.renew_epoch.fetch_add(1, Ordering::Relaxed);
                    self.list.clean_dead();
                    return;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "tso fetch failed");
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
        error!(
            retries = self.cfg.renew_max_retry,
            "ts renew exhausted retries, cache not replenished"
        );
    }
}

/// Process-wide timestamp provider. Construct once at boot, share via `Arc`.
pub struct TsProvider {
    shared: Arc<RenewShared>,
    issued: AtomicU64,
    failed: AtomicU64,
    sender: Mutex<Option<mpsc::Sender<RenewTask>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TsProvider {
    pub fn new(source: Arc<dyn TsSource>, cfg: TsProviderConfig) -> Self {
        let shared = Arc::new(RenewShared {
            list: Arc::new(BatchTsList::new(
                cfg.stale_interval_ms,
                cfg.clean_dead_interval_ms,
            )),
            source,
            cfg,
            renew_epoch: AtomicU64::new(0),
        });

        let (sender, receiver) = mpsc::channel::<RenewTask>();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("ts-renew".to_string())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    worker_shared.renew_once();
                    if let Some(done) = task.done {
                        let _ = done.send(());
                    }
                }
            })
            .expect("spawn ts renew worker");

        Self {
            shared,
            issued: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Pop a timestamp strictly greater than `after_ts`.
    ///
    /// Returns 0 after `max_retry` renew-and-retry rounds; the caller is
    /// expected to retry the whole operation.
    pub fn get_ts_after(&self, after_ts: i64) -> i64 {
        for _ in 0..self.shared.cfg.max_retry {
            let ts = self.shared.list.get_ts(after_ts);
            if ts > 0 {
                self.issued.fetch_add(1, Ordering::Relaxed);
                return ts;
            }
            self.launch_renew(true);
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            retries = self.shared.cfg.max_retry,
            "get_ts retried too many times"
        );
        0
    }

    pub fn get_ts(&self) -> i64 {
        self.get_ts_after(0)
    }

    /// `get_ts` as a result, for call sites that cannot retry.
    pub fn acquire_ts(&self) -> StoreResult<i64> {
        let ts = self.get_ts();
        if ts == 0 {
            return Err(StoreError::Internal("timestamp unavailable".to_string()));
        }
        Ok(ts)
    }

    /// Trigger a renew on the worker. `sync` waits for the round to finish.
    pub fn launch_renew(&self, sync: bool) {
        let (done_tx, done_rx) = if sync {
            let (tx, rx) = mpsc::sync_channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let sent = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(sender) => sender.send(RenewTask { done: done_tx }).is_ok(),
                None => false,
            }
        };
        if !sent {
            // Worker already shut down; renew inline rather than dropping
            // the request.
            self.shared.renew_once();
            return;
        }
        if let Some(done_rx) = done_rx {
            let _ = done_rx.recv();
        }
    }

    /// Discard every buffered timestamp. Used when TSO leadership moves and
    /// the cached batches may no longer be authoritative.
    pub fn flush(&self) {
        self.shared.list.flush();
    }

    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn renew_epoch(&self) -> u64 {
        self.shared.renew_epoch.load(Ordering::Relaxed)
    }

    pub fn debug_info(&self) -> String {
        format!(
            "{} ts_count({}/{}) renew({})",
            self.shared.list.debug_info(),
            self.issued_count(),
            self.failed_count(),
            self.renew_epoch(),
        )
    }

    /// Stop the renew worker. Called automatically on drop.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TsProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ts_physical_ms;

    fn provider() -> TsProvider {
        TsProvider::new(Arc::new(LocalTsSource::new()), TsProviderConfig::default())
    }

    #[test]
    fn test_get_ts_is_strictly_increasing() {
        let provider = provider();
        let mut last = 0;
        for _ in 0..1000 {
            let ts = provider.get_ts();
            assert!(ts > last);
            last = ts;
        }
        assert_eq!(provider.issued_count(), 1000);
    }

    #[test]
    fn test_after_ts_contract() {
        let provider = provider();
        let first = provider.get_ts();
        let far_future = first + (1000 << 18);
        let ts = provider.get_ts_after(far_future);
        assert!(ts == 0 || ts > far_future);
    }

    #[test]
    fn test_physical_component_tracks_clock() {
        let provider = provider();
        let ts = provider.get_ts();
        let physical = ts_physical_ms(ts);
        let now_ms = current_time_ms();
        assert!((now_ms - physical).abs() < 10_000);
    }

    #[test]
    fn test_flush_forces_renew() {
        let provider = provider();
        let before = provider.get_ts();
        provider.flush();
        let after = provider.get_ts();
        assert!(after > before);
        assert!(provider.renew_epoch() >= 2);
    }

    #[test]
    fn test_failing_source_returns_zero() {
        struct FailingSource;
        impl TsSource for FailingSource {
            fn fetch_batch(&self, _count: u32) -> StoreResult<TsoBatch> {
                Err(StoreError::Internal("tso unreachable".to_string()))
            }
        }

        let cfg = TsProviderConfig {
            max_retry: 2,
            renew_max_retry: 1,
            ..Default::default()
        };
        let provider = TsProvider::new(Arc::new(FailingSource), cfg);
        assert_eq!(provider.get_ts(), 0);
        assert!(provider.acquire_ts().is_err());
        assert_eq!(provider.failed_count(), 1);
    }

    #[test]
    fn test_parallel_distinct_and_monotonic() {
        let provider = Arc::new(provider());
        let threads = 16;
        let per_thread = 2000;

        let mut handles = Vec::new();
        for _ in 0..threads {
            let provider = Arc::clone(&provider);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::with_capacity(per_thread);
                let mut last = 0;
                for _ in 0..per_thread {
                    let ts = provider.get_ts();
                    assert!(ts > last, "no thread may observe a decrease");
                    last = ts;
                    seen.push(ts);
                }
                seen
            }));
        }

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), threads * per_thread);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), threads * per_thread);
        assert!(all[0] > 0);
    }
}
