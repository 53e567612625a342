//! NGX Cache - Multi-Tier Response Cache
//!
//! A partitioned, two-tier cache for generated model responses, with
//! pluggable eviction policies, compression, access-frequency promotion,
//! an optional Redis L2 tier, and a monitoring surface with alerts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                ContentGenerator (Vertex AI | Simulated)                      │
//! │                              │ CachedGenerator                               │
//! ├──────────────────────────────┼──────────────────────────────────────────────┤
//! │                         Cache Manager                                        │
//! │  ┌─────────────┐  ┌─────────┴───────┐  ┌───────────────┐  ┌──────────────┐  │
//! │  │  KeyCodec   │  │   Partitions    │  │  Compression  │  │   Prefetch   │  │
//! │  │  (xxh3)     │  │  L1 ◄──► L2     │  │  (deflate..)  │  │   Advisor    │  │
//! │  └─────────────┘  └────────┬────────┘  └───────────────┘  └──────────────┘  │
//! │                            │ (optional)                                      │
//! │                    ┌───────┴────────┐                                        │
//! │                    │  Redis L2 tier │                                        │
//! │                    └────────────────┘                                        │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │   CacheMonitor ──► AlertManager ──► callbacks      REST API  /  /metrics     │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: cache engine, tiers, policies and the manager façade
//! - [`monitoring`]: periodic stats polling, alerts and history
//! - [`api`]: monitoring and administration REST API
//! - [`generation`]: content generation backends and the cached client
//! - [`config`]: process-level cache settings
//! - [`error`]: Error types and handling

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod generation;
pub mod monitoring;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use cache::{
    CacheEvent, CacheManager, CacheManagerConfig, CacheStats, CacheStore, CacheStoreRef,
    CacheTier, EvictionPolicy, KeyCodec, PrometheusTelemetry, RedisConfig, Telemetry,
};

pub use config::CacheSettings;

pub use error::{Error, ErrorKind, Result};

pub use generation::{
    CachedGenerator, ContentGenerator, GenerationRequest, GenerationResponse, SimulatedBackend,
    VertexBackend, VertexConfig,
};

pub use monitoring::{
    AlertCallback, AlertManager, AlertRecord, AlertType, CacheMonitor, HealthStatus,
    HistoryPeriod, MonitorConfig, MonitorState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
