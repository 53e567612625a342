//! Alert Management
//!
//! Threshold evaluation over cache stats, a bounded alert history and
//! notification of registered callbacks. Alerts are observational only:
//! nothing here feeds back into cache behavior.

use crate::cache::metrics::CacheStats;
use crate::error::{Error, Result};
use crate::monitoring::history::StatsDelta;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Alert history capacity of the alert manager
pub const ALERT_HISTORY_CAPACITY: usize = 1000;

/// Longest a single callback may run before it is abandoned
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Lookups required before the hit ratio is judged
pub const MIN_REQUESTS_FOR_HIT_RATIO: u64 = 10;

// =============================================================================
// Alert Records
// =============================================================================

/// Kind of alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LowHitRatio,
    HighMemoryUsage,
    HighLatency,
    HighErrorRate,
    /// Stat collection failed repeatedly
    MonitorDegraded,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertType::LowHitRatio => "low_hit_ratio",
            AlertType::HighMemoryUsage => "high_memory_usage",
            AlertType::HighLatency => "high_latency",
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::MonitorDegraded => "monitor_degraded",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// One raised alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Observed value, threshold and any extra context
    pub data: serde_json::Value,
}

impl AlertRecord {
    pub fn new(alert_type: AlertType, message: impl Into<String>, data: serde_json::Value) -> Self {
        let severity = match alert_type {
            AlertType::MonitorDegraded | AlertType::HighErrorRate => AlertSeverity::Critical,
            _ => AlertSeverity::Warning,
        };
        Self {
            alert_type,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

// =============================================================================
// Thresholds
// =============================================================================

/// A single threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub value: f64,
    pub enabled: bool,
}

impl Threshold {
    pub const fn new(value: f64) -> Self {
        Self {
            value,
            enabled: true,
        }
    }
}

/// Alert thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Alert when the hit ratio falls below this
    pub hit_ratio: Threshold,
    /// Alert when the L1 usage ratio rises above this
    pub memory_usage: Threshold,
    /// Alert when average latency (ms) rises above this
    pub latency_ms: Threshold,
    /// Alert when the error rate rises above this
    pub error_rate: Threshold,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            hit_ratio: Threshold::new(0.5),
            memory_usage: Threshold::new(0.9),
            latency_ms: Threshold::new(100.0),
            error_rate: Threshold::new(0.05),
        }
    }
}

impl AlertThresholds {
    /// Update one threshold by name.
    ///
    /// Accepts the short names (`hit_ratio`) and the long configuration
    /// names (`hit_ratio_threshold`, `latency_threshold_ms`).
    pub fn update(&mut self, name: &str, value: Option<f64>, enabled: Option<bool>) -> Result<()> {
        let (threshold, ratio) = match name {
            "hit_ratio" | "hit_ratio_threshold" => (&mut self.hit_ratio, true),
            "memory_usage" | "memory_usage_threshold" => (&mut self.memory_usage, true),
            "latency" | "latency_ms" | "latency_threshold_ms" => (&mut self.latency_ms, false),
            "error_rate" | "error_rate_threshold" => (&mut self.error_rate, true),
            other => {
                return Err(Error::validation(format!("unknown threshold '{}'", other)));
            }
        };

        if let Some(value) = value {
            if !value.is_finite() || value < 0.0 || (ratio && value > 1.0) {
                return Err(Error::validation(format!(
                    "invalid value {} for threshold '{}'",
                    value, name
                )));
            }
            threshold.value = value;
        }
        if let Some(enabled) = enabled {
            threshold.enabled = enabled;
        }
        Ok(())
    }

    /// Check a snapshot against every enabled threshold
    pub fn evaluate(&self, stats: &CacheStats, delta: &StatsDelta) -> Vec<AlertRecord> {
        let mut alerts = Vec::new();

        if self.hit_ratio.enabled
            && stats.total_requests >= MIN_REQUESTS_FOR_HIT_RATIO
            && stats.hit_ratio < self.hit_ratio.value
        {
            alerts.push(AlertRecord::new(
                AlertType::LowHitRatio,
                format!(
                    "Cache hit ratio {:.2} is below {:.2}",
                    stats.hit_ratio, self.hit_ratio.value
                ),
                json!({
                    "hit_ratio": stats.hit_ratio,
                    "threshold": self.hit_ratio.value,
                    "total_requests": stats.total_requests,
                }),
            ));
        }

        let l1_usage = stats.l1_memory_usage_ratio();
        if self.memory_usage.enabled && l1_usage > self.memory_usage.value {
            alerts.push(AlertRecord::new(
                AlertType::HighMemoryUsage,
                format!(
                    "L1 memory usage {:.2} exceeds {:.2}",
                    l1_usage, self.memory_usage.value
                ),
                json!({
                    "memory_usage": l1_usage,
                    "threshold": self.memory_usage.value,
                    "l1_bytes": stats.l1.memory_bytes,
                    "l1_capacity_bytes": stats.l1.capacity_bytes,
                }),
            ));
        }

        if self.latency_ms.enabled && delta.avg_latency_ms > self.latency_ms.value {
            alerts.push(AlertRecord::new(
                AlertType::HighLatency,
                format!(
                    "Average cache latency {:.2}ms exceeds {:.2}ms",
                    delta.avg_latency_ms, self.latency_ms.value
                ),
                json!({
                    "latency_ms": delta.avg_latency_ms,
                    "threshold": self.latency_ms.value,
                }),
            ));
        }

        let error_rate = delta.error_rate();
        if self.error_rate.enabled && error_rate > self.error_rate.value {
            alerts.push(AlertRecord::new(
                AlertType::HighErrorRate,
                format!(
                    "Cache error rate {:.3} exceeds {:.3}",
                    error_rate, self.error_rate.value
                ),
                json!({
                    "error_rate": error_rate,
                    "threshold": self.error_rate.value,
                    "errors": delta.errors,
                }),
            ));
        }

        alerts
    }
}

// =============================================================================
// Callbacks
// =============================================================================

type SyncCallbackFn = dyn Fn(&AlertRecord) -> Result<()> + Send + Sync;
type AsyncCallbackFn = dyn Fn(AlertRecord) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Alert notification hook
#[derive(Clone)]
pub enum AlertCallback {
    Sync(Arc<SyncCallbackFn>),
    Async(Arc<AsyncCallbackFn>),
}

impl AlertCallback {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&AlertRecord) -> Result<()> + Send + Sync + 'static,
    {
        AlertCallback::Sync(Arc::new(f))
    }

    pub fn from_async<F>(f: F) -> Self
    where
        F: Fn(AlertRecord) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        AlertCallback::Async(Arc::new(f))
    }

    async fn notify(&self, alert: &AlertRecord) -> Result<()> {
        match self {
            AlertCallback::Sync(f) => f(alert),
            AlertCallback::Async(f) => f(alert.clone()).await,
        }
    }
}

impl fmt::Debug for AlertCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertCallback::Sync(_) => write!(f, "AlertCallback::Sync"),
            AlertCallback::Async(_) => write!(f, "AlertCallback::Async"),
        }
    }
}

// =============================================================================
// Alert Manager
// =============================================================================

/// Thresholds, history and callbacks shared by the monitor and the API
pub struct AlertManager {
    thresholds: RwLock<AlertThresholds>,
    history: Mutex<VecDeque<AlertRecord>>,
    callbacks: RwLock<Vec<AlertCallback>>,
    capacity: usize,
    callback_timeout: Duration,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::with_thresholds(AlertThresholds::default())
    }

    pub fn with_thresholds(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds: RwLock::new(thresholds),
            history: Mutex::new(VecDeque::new()),
            callbacks: RwLock::new(Vec::new()),
            capacity: ALERT_HISTORY_CAPACITY,
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }

    /// Bound how long each callback may run
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub fn thresholds(&self) -> AlertThresholds {
        *self.thresholds.read()
    }

    /// Update one threshold, returning the resulting set
    pub fn update_threshold(
        &self,
        name: &str,
        value: Option<f64>,
        enabled: Option<bool>,
    ) -> Result<AlertThresholds> {
        let mut thresholds = self.thresholds.write();
        thresholds.update(name, value, enabled)?;
        Ok(*thresholds)
    }

    pub fn register_callback(&self, callback: AlertCallback) {
        self.callbacks.write().push(callback);
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Evaluate a snapshot against the current thresholds
    pub fn evaluate(&self, stats: &CacheStats, delta: &StatsDelta) -> Vec<AlertRecord> {
        self.thresholds.read().evaluate(stats, delta)
    }

    /// Record an alert and notify every callback.
    ///
    /// A failing or timed-out callback is logged and does not stop the
    /// others.
    pub async fn raise(&self, alert: AlertRecord) {
        warn!(
            alert_type = %alert.alert_type,
            severity = ?alert.severity,
            "{}",
            alert.message
        );

        {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        let callbacks = self.callbacks.read().clone();
        for callback in &callbacks {
            match tokio::time::timeout(self.callback_timeout, callback.notify(&alert)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(alert_type = %alert.alert_type, error = %e, "Alert callback failed");
                }
                Err(_) => {
                    warn!(
                        alert_type = %alert.alert_type,
                        timeout_ms = self.callback_timeout.as_millis() as u64,
                        "Alert callback timed out"
                    );
                }
            }
        }
    }

    /// Most recent alerts, newest first
    pub fn alerts(&self, limit: usize) -> Vec<AlertRecord> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stats_with(hit_ratio: f64, total_requests: u64, l1_usage: f64) -> CacheStats {
        let mut stats = crate::cache::CacheManager::new(Default::default())
            .unwrap()
            .get_stats();
        stats.hit_ratio = hit_ratio;
        stats.total_requests = total_requests;
        stats.l1.usage_ratio = l1_usage;
        stats
    }

    #[test]
    fn test_update_threshold() {
        let mut thresholds = AlertThresholds::default();
        thresholds
            .update("hit_ratio_threshold", Some(0.7), None)
            .unwrap();
        assert_eq!(thresholds.hit_ratio.value, 0.7);

        thresholds.update("latency_ms", None, Some(false)).unwrap();
        assert!(!thresholds.latency_ms.enabled);

        assert!(thresholds.update("nope", Some(1.0), None).is_err());
        assert!(thresholds.update("error_rate", Some(1.5), None).is_err());
        assert!(thresholds.update("latency_ms", Some(-1.0), None).is_err());
    }

    #[test]
    fn test_evaluate_breaches() {
        let thresholds = AlertThresholds::default();
        let stats = stats_with(0.2, 50, 0.95);
        let delta = StatsDelta {
            requests: 50,
            errors: 10,
            avg_latency_ms: 250.0,
            ..Default::default()
        };

        let alerts = thresholds.evaluate(&stats, &delta);
        let types: Vec<_> = alerts.iter().map(|a| a.alert_type).collect();
        assert_eq!(
            types,
            vec![
                AlertType::LowHitRatio,
                AlertType::HighMemoryUsage,
                AlertType::HighLatency,
                AlertType::HighErrorRate,
            ]
        );
        assert_eq!(alerts[0].data["threshold"], 0.5);
    }

    #[test]
    fn test_hit_ratio_needs_traffic() {
        let thresholds = AlertThresholds::default();
        let stats = stats_with(0.0, 3, 0.0);
        assert!(thresholds
            .evaluate(&stats, &StatsDelta::default())
            .is_empty());
    }

    #[tokio::test]
    async fn test_history_cap_and_order() {
        let manager = AlertManager::new();
        for i in 0..(ALERT_HISTORY_CAPACITY + 5) {
            manager
                .raise(AlertRecord::new(
                    AlertType::HighLatency,
                    format!("alert {}", i),
                    json!({}),
                ))
                .await;
        }
        assert_eq!(manager.len(), ALERT_HISTORY_CAPACITY);
        let latest = manager.alerts(2);
        assert_eq!(latest[0].message, format!("alert {}", ALERT_HISTORY_CAPACITY + 4));
        assert_eq!(latest[1].message, format!("alert {}", ALERT_HISTORY_CAPACITY + 3));
    }

    #[tokio::test]
    async fn test_sync_and_async_callbacks() {
        let manager = AlertManager::new();
        let sync_calls = Arc::new(AtomicUsize::new(0));
        let async_calls = Arc::new(AtomicUsize::new(0));

        let counter = sync_calls.clone();
        manager.register_callback(AlertCallback::sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        manager.register_callback(AlertCallback::sync(|_| {
            Err(Error::Internal("callback down".into()))
        }));
        let counter = async_calls.clone();
        manager.register_callback(AlertCallback::from_async(move |alert| {
            let counter = counter.clone();
            Box::pin(async move {
                assert_eq!(alert.alert_type, AlertType::MonitorDegraded);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        manager
            .raise(AlertRecord::new(AlertType::MonitorDegraded, "down", json!({})))
            .await;
        assert_eq!(sync_calls.load(Ordering::SeqCst), 1);
        assert_eq!(async_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.callback_count(), 3);
        assert_eq!(manager.alerts(10)[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_slow_callback_is_abandoned() {
        let manager = AlertManager::new().with_callback_timeout(Duration::from_millis(20));
        let after = Arc::new(AtomicUsize::new(0));

        manager.register_callback(AlertCallback::from_async(|_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
        }));
        let counter = after.clone();
        manager.register_callback(AlertCallback::sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let raised = tokio::time::timeout(
            Duration::from_secs(1),
            manager.raise(AlertRecord::new(AlertType::HighLatency, "slow", json!({}))),
        )
        .await;
        assert!(raised.is_ok());
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(manager.len(), 1);
    }
}
