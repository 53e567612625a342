//! Monitor lifecycle, alert delivery and the monitoring HTTP surface,
//! driven in-process through the router.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures::FutureExt;
use ngx_cache::api::{
    AlertConfigResponse, AlertsResponse, HistoryResponse, InvalidateResponse, MetricsResponse,
    RestRouter,
};
use ngx_cache::cache::{CacheManager, CacheManagerConfig, CacheStoreRef};
use ngx_cache::monitoring::{
    AlertCallback, AlertManager, AlertType, CacheMonitor, HistoryPeriod, MonitorConfig,
    MonitorState,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Harness {
    cache: Arc<CacheManager>,
    monitor: Arc<CacheMonitor>,
    router: Router,
}

fn harness() -> Harness {
    let cache = Arc::new(
        CacheManager::new(CacheManagerConfig {
            max_memory_bytes: 1024 * 1024,
            partitions: 4,
            ..Default::default()
        })
        .unwrap(),
    );
    let monitor = Arc::new(CacheMonitor::with_config(
        cache.clone(),
        Arc::new(AlertManager::new()),
        MonitorConfig {
            interval: Duration::from_millis(20),
            ..Default::default()
        },
    ));
    let store: CacheStoreRef = cache.clone();
    let router = RestRouter::new(store, monitor.clone()).build();
    Harness {
        cache,
        monitor,
        router,
    }
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn decode<T: DeserializeOwned>(value: Value) -> T {
    serde_json::from_value(value).unwrap()
}

/// Ten misses and one hit: enough traffic for a hit-ratio alert
async fn poor_traffic(cache: &CacheManager) {
    cache.set("warm", b"value").await.unwrap();
    cache.get("warm").await;
    for i in 0..10 {
        cache.get(&format!("cold:{}", i)).await;
    }
}

#[tokio::test]
async fn monitor_loop_delivers_sync_and_async_callbacks() {
    let h = harness();
    let sync_calls = Arc::new(AtomicUsize::new(0));
    let async_calls = Arc::new(AtomicUsize::new(0));

    let counter = sync_calls.clone();
    h.monitor
        .alert_manager()
        .register_callback(AlertCallback::sync(move |alert| {
            if alert.alert_type == AlertType::LowHitRatio {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));
    let counter = async_calls.clone();
    h.monitor
        .alert_manager()
        .register_callback(AlertCallback::from_async(move |alert| {
            let counter = counter.clone();
            async move {
                if alert.alert_type == AlertType::LowHitRatio {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
            .boxed()
        }));
    // A failing callback must not stop delivery to the others
    h.monitor
        .alert_manager()
        .register_callback(AlertCallback::sync(|_| {
            Err(ngx_cache::Error::Internal("pager offline".into()))
        }));

    poor_traffic(&h.cache).await;

    assert_eq!(h.monitor.state(), MonitorState::NotInitialized);
    assert!(h.monitor.start_monitoring(None).await.unwrap());
    assert!(!h.monitor.start_monitoring(None).await.unwrap());

    tokio::time::sleep(Duration::from_millis(120)).await;
    h.monitor.stop_monitoring().await;
    assert_eq!(h.monitor.state(), MonitorState::Stopped);

    assert!(sync_calls.load(Ordering::SeqCst) >= 1);
    assert!(async_calls.load(Ordering::SeqCst) >= 1);
    assert!(h.monitor.latest_stats().is_some());
    assert!(!h.monitor.history(HistoryPeriod::Hourly).is_empty());

    let recent = h.monitor.recent_alerts(5);
    assert!(!recent.is_empty() && recent.len() <= 5);
}

#[tokio::test]
async fn metrics_endpoint_reports_cache_stats() {
    let h = harness();
    h.cache.set("a", b"1").await.unwrap();
    h.cache.get("a").await;
    h.cache.get("b").await;

    let (status, body) = call(&h.router, Method::GET, "/api/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let metrics: MetricsResponse = decode(body);
    assert_eq!(metrics.stats.hits, 1);
    assert_eq!(metrics.stats.misses, 1);
    assert_eq!(metrics.current_items, 1);
    assert!((metrics.stats.hit_ratio - 0.5).abs() < 1e-9);
    assert_eq!(metrics.monitor_state, MonitorState::NotInitialized);
}

#[tokio::test]
async fn history_endpoint_validates_period() {
    let h = harness();
    h.monitor.poll_once().await.unwrap();
    h.monitor.poll_once().await.unwrap();

    let (status, body) = call(&h.router, Method::GET, "/api/metrics/history?period=daily", None).await;
    assert_eq!(status, StatusCode::OK);
    let history: HistoryResponse = decode(body);
    assert_eq!(history.period, HistoryPeriod::Daily);
    assert_eq!(history.buckets.len(), 1);
    assert_eq!(history.buckets[0].samples, 2);

    let (status, body) = call(&h.router, Method::GET, "/api/metrics/history?period=weekly", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_period");
}

#[tokio::test]
async fn alerts_endpoint_honours_limit() {
    let h = harness();
    poor_traffic(&h.cache).await;
    for _ in 0..3 {
        h.monitor.poll_once().await.unwrap();
    }

    let (status, body) = call(&h.router, Method::GET, "/api/alerts", None).await;
    assert_eq!(status, StatusCode::OK);
    let all: AlertsResponse = decode(body);
    assert!(all.count >= 3);
    assert!(all
        .alerts
        .iter()
        .any(|a| a.alert_type == AlertType::LowHitRatio));

    let (_, body) = call(&h.router, Method::GET, "/api/alerts?limit=2", None).await;
    let limited: AlertsResponse = decode(body);
    assert_eq!(limited.count, 2);
    assert!(limited.alerts[0].timestamp >= limited.alerts[1].timestamp);
}

#[tokio::test]
async fn alert_config_updates_thresholds() {
    let h = harness();

    let (status, body) = call(
        &h.router,
        Method::POST,
        "/api/alerts/config",
        Some(json!({"threshold_name": "hit_ratio_threshold", "value": 0.75})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let updated: AlertConfigResponse = decode(body);
    assert!((updated.thresholds.hit_ratio.value - 0.75).abs() < 1e-9);

    let (_, body) = call(
        &h.router,
        Method::POST,
        "/api/alerts/config",
        Some(json!({"threshold_name": "latency_threshold_ms", "enabled": false})),
    )
    .await;
    let updated: AlertConfigResponse = decode(body);
    assert!(!updated.thresholds.latency_ms.enabled);

    let (status, body) = call(&h.router, Method::GET, "/api/alerts/config", None).await;
    assert_eq!(status, StatusCode::OK);
    let current: AlertConfigResponse = decode(body);
    assert_eq!(current.thresholds, updated.thresholds);

    let (status, _) = call(
        &h.router,
        Method::POST,
        "/api/alerts/config",
        Some(json!({"threshold_name": "disk_usage", "value": 0.5})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &h.router,
        Method::POST,
        "/api/alerts/config",
        Some(json!({"threshold_name": "hit_ratio"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "empty_update");
}

#[tokio::test]
async fn cache_administration_endpoints() {
    let h = harness();
    for key in ["vertex:generate_content:user_1:a", "vertex:generate_content:user_1:b", "vertex:generate_content:user_2:c"] {
        h.cache.set(key, b"x").await.unwrap();
    }

    let (status, body) = call(
        &h.router,
        Method::POST,
        "/api/cache/invalidate",
        Some(json!({"pattern": "vertex:generate_content:user_1:*"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let invalidated: InvalidateResponse = decode(body);
    assert_eq!(invalidated.deleted, 2);
    assert_eq!(h.cache.get_stats().current_items(), 1);

    let (status, body) = call(
        &h.router,
        Method::POST,
        "/api/cache/invalidate",
        Some(json!({"pattern": "vertex:[unclosed"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, body) = call(&h.router, Method::POST, "/api/cache/flush", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "flushed");
    assert_eq!(h.cache.get_stats().current_items(), 0);
    assert_eq!(h.cache.get_stats().flushes, 1);
}

#[tokio::test]
async fn health_endpoint_reflects_monitor_state() {
    let h = harness();
    h.monitor.poll_once().await.unwrap();

    let (status, body) = call(&h.router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["consecutive_failures"], 0);
}
