//! Cache Monitor
//!
//! Periodic stats polling with threshold alerts.
//!
//! ```text
//!   NotInitialized ──start──► Running ──stop──► Stopped
//!                               ▲                  │
//!                               └──────start───────┘
//! ```
//!
//! One background task per monitor. A failed poll is logged and the loop
//! carries on; a streak of same-kind failures raises `MonitorDegraded` once.
//! Stopping cancels an in-flight poll, including its alert callbacks.

use crate::cache::metrics::CacheStats;
use crate::cache::CacheManager;
use crate::error::{Error, ErrorKind, Result};
use crate::monitoring::alerts::{AlertManager, AlertRecord, AlertType};
use crate::monitoring::history::{
    HistoryBucket, HistoryPeriod, MetricsHistory, MetricsSample, StatsDelta, DEFAULT_SAMPLE_CAPACITY,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Alert history capacity of the monitor
pub const MONITOR_ALERT_CAPACITY: usize = 100;

// =============================================================================
// Stats Source
// =============================================================================

/// Source of stats for the monitor
#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn collect_stats(&self) -> Result<CacheStats>;

    /// Periodic housekeeping run after each successful poll
    async fn maintenance(&self) -> Result<usize> {
        Ok(0)
    }

    /// Remote tier health, if one is configured
    fn remote_healthy(&self) -> Option<bool> {
        None
    }
}

#[async_trait]
impl StatsProvider for CacheManager {
    async fn collect_stats(&self) -> Result<CacheStats> {
        Ok(self.get_stats())
    }

    async fn maintenance(&self) -> Result<usize> {
        Ok(self.purge_expired().await)
    }

    fn remote_healthy(&self) -> Option<bool> {
        CacheManager::remote_healthy(self)
    }
}

// =============================================================================
// Configuration & State
// =============================================================================

/// Configuration for the cache monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Poll interval used when none is given to `start_monitoring`
    pub interval: Duration,
    /// Consecutive same-kind failures before `MonitorDegraded`
    pub failure_threshold: u32,
    /// Poll samples kept for history
    pub sample_capacity: usize,
    /// Run provider maintenance (expiry sweep) after each poll
    pub maintenance: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            failure_threshold: 3,
            sample_capacity: DEFAULT_SAMPLE_CAPACITY,
            maintenance: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    NotInitialized,
    Running,
    Stopped,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::NotInitialized => write!(f, "not_initialized"),
            MonitorState::Running => write!(f, "running"),
            MonitorState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health summary for the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub monitor_state: MonitorState,
    pub monitor_degraded: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_healthy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<DateTime<Utc>>,
}

// =============================================================================
// Shared Poll State
// =============================================================================

#[derive(Default)]
struct PollState {
    last_stats: Option<CacheStats>,
    last_poll: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    failure_kind: Option<ErrorKind>,
    degraded: bool,
}

struct Shared {
    config: MonitorConfig,
    provider: Arc<dyn StatsProvider>,
    alerts: Arc<AlertManager>,
    recent: SyncMutex<VecDeque<AlertRecord>>,
    history: SyncMutex<MetricsHistory>,
    poll: SyncMutex<PollState>,
}

impl Shared {
    async fn poll(&self) -> Result<Vec<AlertRecord>> {
        match self.provider.collect_stats().await {
            Ok(stats) => {
                let alerts = self.on_success(stats);
                for alert in &alerts {
                    self.raise(alert.clone()).await;
                }

                if self.config.maintenance {
                    match self.provider.maintenance().await {
                        Ok(0) => {}
                        Ok(n) => debug!(purged = n, "Monitor maintenance pass"),
                        Err(e) => warn!(error = %e, "Monitor maintenance failed"),
                    }
                }
                Ok(alerts)
            }
            Err(e) => {
                warn!(error = %e, "Cache stats collection failed");
                if let Some(alert) = self.on_failure(&e) {
                    self.raise(alert).await;
                }
                Err(e)
            }
        }
    }

    fn on_success(&self, stats: CacheStats) -> Vec<AlertRecord> {
        let mut poll = self.poll.lock();
        let delta = StatsDelta::between(poll.last_stats.as_ref(), &stats);
        let alerts = self.alerts.evaluate(&stats, &delta);

        self.history
            .lock()
            .record(MetricsSample::from_stats(&stats, &delta));
        if poll.degraded {
            info!("Cache stats collection recovered");
        }
        poll.consecutive_failures = 0;
        poll.failure_kind = None;
        poll.degraded = false;
        poll.last_poll = Some(stats.timestamp);
        poll.last_stats = Some(stats);
        alerts
    }

    fn on_failure(&self, error: &Error) -> Option<AlertRecord> {
        let mut poll = self.poll.lock();
        let kind = error.kind();
        if poll.failure_kind == Some(kind) {
            poll.consecutive_failures += 1;
        } else {
            poll.failure_kind = Some(kind);
            poll.consecutive_failures = 1;
        }

        if poll.degraded || poll.consecutive_failures < self.config.failure_threshold {
            return None;
        }
        poll.degraded = true;
        Some(AlertRecord::new(
            AlertType::MonitorDegraded,
            format!(
                "Cache stats collection failed {} consecutive times",
                poll.consecutive_failures
            ),
            json!({
                "consecutive_failures": poll.consecutive_failures,
                "error_kind": kind.to_string(),
                "last_error": error.to_string(),
            }),
        ))
    }

    async fn raise(&self, alert: AlertRecord) {
        {
            let mut recent = self.recent.lock();
            if recent.len() == MONITOR_ALERT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(alert.clone());
        }
        self.alerts.raise(alert).await;
    }
}

// =============================================================================
// Cache Monitor
// =============================================================================

struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic cache monitor
pub struct CacheMonitor {
    shared: Arc<Shared>,
    task: Mutex<Option<MonitorTask>>,
    state: SyncMutex<MonitorState>,
}

impl CacheMonitor {
    pub fn new(provider: Arc<dyn StatsProvider>, alerts: Arc<AlertManager>) -> Self {
        Self::with_config(provider, alerts, MonitorConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn StatsProvider>,
        alerts: Arc<AlertManager>,
        config: MonitorConfig,
    ) -> Self {
        let history = MetricsHistory::with_capacity(config.sample_capacity);
        Self {
            shared: Arc::new(Shared {
                config,
                provider,
                alerts,
                recent: SyncMutex::new(VecDeque::new()),
                history: SyncMutex::new(history),
                poll: SyncMutex::new(PollState::default()),
            }),
            task: Mutex::new(None),
            state: SyncMutex::new(MonitorState::NotInitialized),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    pub fn alert_manager(&self) -> &Arc<AlertManager> {
        &self.shared.alerts
    }

    /// Start the polling loop. Returns `false` (and changes nothing) when a
    /// loop is already running. The first poll happens one interval in.
    pub async fn start_monitoring(&self, interval: Option<Duration>) -> Result<bool> {
        let interval = interval.unwrap_or(self.shared.config.interval);
        if interval.is_zero() {
            return Err(Error::validation("monitor interval must be greater than 0"));
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("Cache monitor already running");
            return Ok(false);
        }

        let token = CancellationToken::new();
        let shared = self.shared.clone();
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = child.cancelled() => break,
                            _ = shared.poll() => {}
                        }
                    }
                }
            }
            debug!("Cache monitor loop exited");
        });

        *task = Some(MonitorTask { token, handle });
        *self.state.lock() = MonitorState::Running;
        info!(interval_ms = interval.as_millis() as u64, "Cache monitor started");
        Ok(true)
    }

    /// Cancel the loop and wait for it to finish. No-op when not running.
    pub async fn stop_monitoring(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        task.token.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Cache monitor task ended abnormally");
        }
        *self.state.lock() = MonitorState::Stopped;
        info!("Cache monitor stopped");
    }

    /// Run one poll now, outside the loop
    pub async fn poll_once(&self) -> Result<Vec<AlertRecord>> {
        self.shared.poll().await
    }

    /// Alerts raised by this monitor, newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertRecord> {
        self.shared
            .recent
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Stats from the last successful poll
    pub fn latest_stats(&self) -> Option<CacheStats> {
        self.shared.poll.lock().last_stats.clone()
    }

    pub fn history(&self, period: HistoryPeriod) -> Vec<HistoryBucket> {
        self.shared.history.lock().buckets(period)
    }

    pub fn is_degraded(&self) -> bool {
        self.shared.poll.lock().degraded
    }

    pub fn health(&self) -> HealthReport {
        let (degraded, failures, last_poll) = {
            let poll = self.shared.poll.lock();
            (poll.degraded, poll.consecutive_failures, poll.last_poll)
        };
        let remote_healthy = self.shared.provider.remote_healthy();

        let status = if degraded {
            HealthStatus::Unhealthy
        } else if failures > 0 || remote_healthy == Some(false) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            monitor_state: self.state(),
            monitor_degraded: degraded,
            consecutive_failures: failures,
            remote_healthy,
            last_poll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManagerConfig;
    use crate::monitoring::alerts::AlertCallback;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyProvider {
        cache: CacheManager,
        failing: AtomicBool,
    }

    #[async_trait]
    impl StatsProvider for FlakyProvider {
        async fn collect_stats(&self) -> Result<CacheStats> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Timeout {
                    operation: "stats".into(),
                    duration: Duration::from_millis(5),
                });
            }
            Ok(self.cache.get_stats())
        }
    }

    fn provider() -> Arc<FlakyProvider> {
        Arc::new(FlakyProvider {
            cache: CacheManager::new(CacheManagerConfig::default()).unwrap(),
            failing: AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn test_degraded_after_three_failures() {
        let provider = provider();
        let monitor = CacheMonitor::new(provider.clone(), Arc::new(AlertManager::new()));

        provider.failing.store(true, Ordering::SeqCst);
        for _ in 0..2 {
            assert!(monitor.poll_once().await.is_err());
        }
        assert!(!monitor.is_degraded());
        assert_eq!(monitor.health().status, HealthStatus::Degraded);

        for _ in 0..3 {
            assert!(monitor.poll_once().await.is_err());
        }
        assert!(monitor.is_degraded());
        assert_eq!(monitor.health().status, HealthStatus::Unhealthy);
        let degraded: Vec<_> = monitor
            .recent_alerts(10)
            .into_iter()
            .filter(|a| a.alert_type == AlertType::MonitorDegraded)
            .collect();
        assert_eq!(degraded.len(), 1);

        provider.failing.store(false, Ordering::SeqCst);
        monitor.poll_once().await.unwrap();
        assert!(!monitor.is_degraded());
        assert_eq!(monitor.health().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_low_hit_ratio_alert() {
        let provider = provider();
        for i in 0..12 {
            provider.cache.get(&format!("missing-{}", i)).await;
        }
        let alerts = Arc::new(AlertManager::new());
        let monitor = CacheMonitor::new(provider.clone(), alerts.clone());

        let raised = monitor.poll_once().await.unwrap();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].alert_type, AlertType::LowHitRatio);
        assert_eq!(alerts.alerts(5).len(), 1);
        assert_eq!(monitor.history(HistoryPeriod::Hourly)[0].samples, 1);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let monitor = CacheMonitor::new(provider(), Arc::new(AlertManager::new()));
        assert_eq!(monitor.state(), MonitorState::NotInitialized);

        assert!(monitor
            .start_monitoring(Some(Duration::from_millis(10)))
            .await
            .unwrap());
        assert!(!monitor
            .start_monitoring(Some(Duration::from_millis(10)))
            .await
            .unwrap());
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop_monitoring().await;
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(monitor.latest_stats().is_some());

        monitor.stop_monitoring().await;
        assert!(monitor
            .start_monitoring(Some(Duration::from_millis(10)))
            .await
            .unwrap());
        monitor.stop_monitoring().await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_slow_callback() {
        let provider = provider();
        for i in 0..12 {
            provider.cache.get(&format!("missing-{}", i)).await;
        }
        let started = Arc::new(AtomicBool::new(false));
        let alerts = Arc::new(AlertManager::new());
        let flag = started.clone();
        alerts.register_callback(AlertCallback::from_async(move |_| {
            let flag = flag.clone();
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
        }));

        let monitor = CacheMonitor::new(provider, alerts);
        monitor
            .start_monitoring(Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !started.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(1), monitor.stop_monitoring()).await;
        assert!(stopped.is_ok());
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let monitor = CacheMonitor::new(provider(), Arc::new(AlertManager::new()));
        assert!(monitor.start_monitoring(Some(Duration::ZERO)).await.is_err());
        assert_eq!(monitor.state(), MonitorState::NotInitialized);
    }
}
