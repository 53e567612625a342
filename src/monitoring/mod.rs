//! Cache Monitoring
//!
//! Periodic polling of cache stats, threshold alerts with sync or async
//! callbacks, and bucketed metrics history for the monitoring API.

pub mod alerts;
pub mod history;
pub mod monitor;

pub use alerts::{
    AlertCallback, AlertManager, AlertRecord, AlertSeverity, AlertThresholds, AlertType, Threshold,
};
pub use history::{HistoryBucket, HistoryPeriod, MetricsHistory, MetricsSample, StatsDelta};
pub use monitor::{
    CacheMonitor, HealthReport, HealthStatus, MonitorConfig, MonitorState, StatsProvider,
};
