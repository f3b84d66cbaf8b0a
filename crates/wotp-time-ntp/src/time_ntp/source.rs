//! NTP-corrected time source.
//!
//! `now()` is always `local clock + offset` and never fails or blocks on the
//! network. `sync()` measures a new offset and applies it atomically; a
//! failed, timed-out or cancelled sync leaves the previous offset in place.

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::time_ntp::clock::{Clock, SystemClock};
use crate::time_ntp::provider::ReferenceTimeProvider;
use crate::time_ntp::types::*;

#[derive(Debug, Clone, Default)]
struct SourceState {
    offset: f64,
    state: SyncState,
    last_sync: Option<chrono::DateTime<Utc>>,
    last_error: Option<String>,
    last_server: Option<String>,
}

/// Local clock plus a measured correction.
#[derive(Debug)]
pub struct TimeSource {
    clock: Arc<dyn Clock>,
    options: SyncOptions,
    inner: RwLock<SourceState>,
    /// Serialises `sync` calls.
    sync_gate: Mutex<()>,
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), SyncOptions::default())
    }
}

impl TimeSource {
    pub fn new(clock: Arc<dyn Clock>, options: SyncOptions) -> Self {
        Self {
            clock,
            options,
            inner: RwLock::new(SourceState::default()),
            sync_gate: Mutex::new(()),
        }
    }

    /// Corrected unix time in fractional seconds.
    pub fn now(&self) -> f64 {
        self.clock.now() + self.read().offset
    }

    /// Applied correction in seconds (0.0 until the first successful sync).
    pub fn offset(&self) -> f64 {
        self.read().offset
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn status(&self) -> NtpStatus {
        let s = self.read();
        NtpStatus {
            state: s.state,
            offset_ms: s.last_sync.map(|_| s.offset * 1000.0),
            last_sync: s.last_sync,
            last_error: s.last_error.clone(),
            last_server: s.last_server.clone(),
        }
    }

    /// Measure the reference clock and apply the new offset.
    ///
    /// Takes `options.samples` measurements and keeps the one with the
    /// smallest round trip. Returns the offset now in effect.
    pub async fn sync(&self, provider: &dyn ReferenceTimeProvider) -> Result<f64, SyncError> {
        let _gate = self.sync_gate.lock().await;

        let previous = self.read().clone();
        self.write().state = SyncState::Syncing;
        let mut rollback = Rollback {
            source: self,
            previous: Some(previous.clone()),
        };

        let outcome = match tokio::time::timeout(self.options.timeout, self.best_sample(provider)).await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.options.timeout)),
        };
        rollback.disarm();

        match outcome {
            Ok(sample) => {
                let measured = sample.offset();
                let applied = match previous.state {
                    SyncState::Synced if self.options.smoothing => {
                        SMOOTHING_WEIGHT * measured + (1.0 - SMOOTHING_WEIGHT) * previous.offset
                    }
                    _ => measured,
                };

                let mut s = self.write();
                s.offset = applied;
                s.state = SyncState::Synced;
                s.last_sync = Some(Utc::now());
                s.last_error = None;
                if sample.server.is_some() {
                    s.last_server = sample.server;
                }
                info!(
                    "Time synced: offset {:.1} ms (measured {:.1} ms)",
                    applied * 1000.0,
                    measured * 1000.0
                );
                Ok(applied)
            }
            Err(e) => {
                warn!("Time sync failed, keeping previous offset: {}", e);
                let mut s = self.write();
                *s = previous;
                s.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn best_sample(
        &self,
        provider: &dyn ReferenceTimeProvider,
    ) -> Result<ReferenceSample, SyncError> {
        let mut best: Option<ReferenceSample> = None;
        let mut last_err = None;

        for n in 0..self.options.samples.max(1) {
            match provider.query().await {
                Ok(sample) => {
                    debug!("sample {}: rtt {:.4}s", n, sample.round_trip);
                    let better = best
                        .as_ref()
                        .map_or(true, |b| sample.round_trip < b.round_trip);
                    if better {
                        best = Some(sample);
                    }
                }
                Err(e) => last_err = Some(e),
            }
        }

        best.ok_or_else(|| last_err.unwrap_or_else(|| SyncError::Failed("no samples".into())))
    }

    /// Re-sync every `interval` (clamped to the allowed range) until the
    /// returned handle is stopped or dropped. The first sync runs immediately.
    pub fn spawn_periodic_sync(
        self: &Arc<Self>,
        provider: Arc<dyn ReferenceTimeProvider>,
        interval: Duration,
    ) -> PeriodicSync {
        let interval = clamp_sync_interval(interval);
        let source = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = source.sync(provider.as_ref()).await {
                    debug!("periodic sync attempt failed: {}", e);
                }
            }
        });
        info!("Periodic time sync every {:?}", interval);
        PeriodicSync {
            handle: Some(handle),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SourceState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SourceState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Restores the pre-sync state if the sync future is dropped mid-flight.
struct Rollback<'a> {
    source: &'a TimeSource,
    previous: Option<SourceState>,
}

impl Rollback<'_> {
    fn disarm(&mut self) {
        self.previous = None;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            debug!("time sync cancelled, restoring previous state");
            *self.source.write() = previous;
        }
    }
}

/// Handle to a background sync loop.
#[derive(Debug)]
pub struct PeriodicSync {
    handle: Option<JoinHandle<()>>,
}

impl PeriodicSync {
    pub fn stop(mut self) {
        self.abort();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for PeriodicSync {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_ntp::clock::ManualClock;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted results; an empty script yields a failure.
    struct ScriptedProvider {
        script: std::sync::Mutex<VecDeque<Result<ReferenceSample, SyncError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<ReferenceSample, SyncError>>) -> Self {
            Self {
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReferenceTimeProvider for ScriptedProvider {
        async fn query(&self) -> Result<ReferenceSample, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SyncError::Failed("script exhausted".into())))
        }
    }

    /// Never answers.
    struct HangingProvider;

    #[async_trait]
    impl ReferenceTimeProvider for HangingProvider {
        async fn query(&self) -> Result<ReferenceSample, SyncError> {
            std::future::pending().await
        }
    }

    fn sample(reference: f64, rtt: f64, received: f64) -> Result<ReferenceSample, SyncError> {
        Ok(ReferenceSample {
            reference_time: reference,
            round_trip: rtt,
            received_at: received,
            server: Some("test".into()),
        })
    }

    fn source(samples: usize, smoothing: bool) -> (Arc<ManualClock>, TimeSource) {
        let clock = Arc::new(ManualClock::new(1000.0));
        let src = TimeSource::new(
            clock.clone(),
            SyncOptions {
                timeout: Duration::from_millis(200),
                samples,
                smoothing,
            },
        );
        (clock, src)
    }

    // ── now() ────────────────────────────────────────────────────

    #[test]
    fn unsynced_now_is_local_clock() {
        let (clock, src) = source(1, true);
        assert_eq!(src.now(), 1000.0);
        clock.advance(1.5);
        assert_eq!(src.now(), 1001.5);
        assert_eq!(src.status().state, SyncState::Unsynced);
        assert_eq!(src.status().offset_ms, None);
    }

    // ── sync ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn sync_applies_offset() {
        let (_clock, src) = source(1, true);
        let provider = ScriptedProvider::new(vec![sample(1010.0, 0.0, 1000.0)]);

        let offset = src.sync(&provider).await.unwrap();
        assert!((offset - 10.0).abs() < 1e-9);
        assert!((src.now() - 1010.0).abs() < 1e-9);

        let status = src.status();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.last_server.as_deref(), Some("test"));
        assert!(status.last_sync.is_some());
        assert!((status.offset_ms.unwrap() - 10_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn best_sample_has_smallest_round_trip() {
        let (_clock, src) = source(3, false);
        let provider = ScriptedProvider::new(vec![
            sample(1005.0, 0.8, 1000.0),
            sample(1002.0, 0.02, 1000.0),
            Err(SyncError::Failed("lost".into())),
        ]);

        let offset = src.sync(&provider).await.unwrap();
        assert!((offset - 2.01).abs() < 1e-9);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn second_sync_is_smoothed() {
        let (_clock, src) = source(1, true);
        let provider = ScriptedProvider::new(vec![
            sample(1010.0, 0.0, 1000.0),
            sample(1020.0, 0.0, 1000.0),
        ]);

        src.sync(&provider).await.unwrap();
        let offset = src.sync(&provider).await.unwrap();
        // 0.7 * 20 + 0.3 * 10
        assert!((offset - 17.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn smoothing_disabled_replaces_offset() {
        let (_clock, src) = source(1, false);
        let provider = ScriptedProvider::new(vec![
            sample(1010.0, 0.0, 1000.0),
            sample(1020.0, 0.0, 1000.0),
        ]);
        src.sync(&provider).await.unwrap();
        let offset = src.sync(&provider).await.unwrap();
        assert!((offset - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_sync_keeps_previous_offset() {
        let (_clock, src) = source(1, true);
        let provider = ScriptedProvider::new(vec![
            sample(1010.0, 0.0, 1000.0),
            Err(SyncError::Failed("unreachable".into())),
        ]);
        src.sync(&provider).await.unwrap();

        let err = src.sync(&provider).await.unwrap_err();
        assert!(!err.is_timeout());
        assert!((src.offset() - 10.0).abs() < 1e-9);

        let status = src.status();
        assert_eq!(status.state, SyncState::Synced);
        assert!(status.last_error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn first_sync_failure_stays_unsynced() {
        let (_clock, src) = source(2, true);
        let provider = ScriptedProvider::new(vec![]);
        tokio_test::assert_err!(src.sync(&provider).await);
        assert_eq!(src.status().state, SyncState::Unsynced);
        assert_eq!(src.offset(), 0.0);
    }

    #[tokio::test]
    async fn sync_times_out() {
        let (_clock, src) = source(1, true);
        let err = src.sync(&HangingProvider).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(src.status().state, SyncState::Unsynced);
        assert_eq!(src.offset(), 0.0);
    }

    #[tokio::test]
    async fn cancelled_sync_restores_state() {
        let (_clock, src) = source(1, true);
        let provider = ScriptedProvider::new(vec![sample(1003.0, 0.0, 1000.0)]);
        src.sync(&provider).await.unwrap();

        {
            let fut = src.sync(&HangingProvider);
            tokio::pin!(fut);
            let polled = tokio::time::timeout(Duration::from_millis(20), &mut fut).await;
            assert!(polled.is_err());
            assert_eq!(src.status().state, SyncState::Syncing);
            // dropping `fut` here cancels the sync
        }

        assert_eq!(src.status().state, SyncState::Synced);
        assert!((src.offset() - 3.0).abs() < 1e-9);
        assert!(src.status().last_error.is_none());
    }

    #[tokio::test]
    async fn now_never_blocks_during_sync() {
        let (clock, src) = source(1, true);
        let src = Arc::new(src);
        let bg = {
            let src = src.clone();
            tokio::spawn(async move { src.sync(&HangingProvider).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        clock.advance(1.0);
        assert_eq!(src.now(), 1001.0);
        let res = bg.await.unwrap();
        assert!(res.is_err());
    }

    // ── periodic sync ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn periodic_sync_runs_until_stopped() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let src = Arc::new(TimeSource::new(clock, SyncOptions::default()));
        let provider = Arc::new(ScriptedProvider::new(vec![
            sample(1001.0, 0.0, 1000.0),
            sample(1001.0, 0.0, 1000.0),
            sample(1001.0, 0.0, 1000.0),
            sample(1001.0, 0.0, 1000.0),
            sample(1001.0, 0.0, 1000.0),
            sample(1001.0, 0.0, 1000.0),
            sample(1001.0, 0.0, 1000.0),
            sample(1001.0, 0.0, 1000.0),
            sample(1001.0, 0.0, 1000.0),
        ]));

        let handle = src.spawn_periodic_sync(provider.clone(), Duration::from_secs(1));
        assert!(handle.is_running());

        // Interval is clamped to 60 s: immediate tick, then one per minute.
        tokio::time::sleep(Duration::from_secs(61)).await;
        let calls = provider.calls.load(Ordering::SeqCst);
        assert_eq!(calls, 2 * SyncOptions::default().samples);
        assert_eq!(src.status().state, SyncState::Synced);

        handle.stop();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls);
    }
}
