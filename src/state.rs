//! Application state
//!
//! Holds all shared components and state

use crate::config_store::{ConfigStore, DispatchPolicy, StoreRetryPolicy, WorkerPolicy};
use crate::error::Result;
use crate::event_store::EventStore;
use crate::frame_adapter::{AdapterFactory, DefaultAdapterFactory};
use crate::notification_dispatcher::{AlertSink, NotificationDispatcher, TelegramSink, WebhookSink};
use crate::realtime_hub::RealtimeHub;
use crate::snapshot_store::SnapshotStore;
use crate::stream_registry::StreamRegistry;
use crate::stream_worker::WorkerDeps;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `memory` or an sqlx SQLite URL
    pub database_url: String,
    /// Server port
    pub port: u16,
    /// Server host
    pub host: String,
    /// JSON array of sources
    pub sources_file: Option<PathBuf>,
    /// Concurrent detections across all sources
    pub inference_permits: usize,
    /// Timeout for adapter and sink HTTP calls
    pub http_timeout: Duration,
    pub telegram_enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_ids: Vec<String>,
    pub webhook_urls: Vec<String>,
    /// Event snapshot directory, `None` attaches snapshots to alerts only
    pub snapshot_dir: Option<PathBuf>,
    pub worker: WorkerPolicy,
    pub dispatch: DispatchPolicy,
    pub store_retry: StoreRetryPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        let worker_defaults = WorkerPolicy::default();
        let worker = WorkerPolicy {
            frame_timeout_ms: env_or("FRAME_TIMEOUT_MS", worker_defaults.frame_timeout_ms),
            detect_timeout_ms: env_or("DETECT_TIMEOUT_MS", worker_defaults.detect_timeout_ms),
            max_consecutive_timeouts: env_or(
                "MAX_CONSECUTIVE_TIMEOUTS",
                worker_defaults.max_consecutive_timeouts,
            ),
            fps_window_sec: env_or("FPS_WINDOW_SEC", worker_defaults.fps_window_sec),
            stop_timeout_ms: env_or("STOP_TIMEOUT_MS", worker_defaults.stop_timeout_ms),
            store_write_timeout_ms: env_or(
                "STORE_WRITE_TIMEOUT_MS",
                worker_defaults.store_write_timeout_ms,
            ),
            ..worker_defaults
        };

        let dispatch_defaults = DispatchPolicy::default();
        let dispatch = DispatchPolicy {
            min_interval_sec: env_or("ALERT_MIN_INTERVAL_SEC", dispatch_defaults.min_interval_sec),
            notify_on_extend: env_or("NOTIFY_ON_EXTEND", dispatch_defaults.notify_on_extend),
            extend_interval_sec: env_or(
                "EXTEND_INTERVAL_SEC",
                dispatch_defaults.extend_interval_sec,
            ),
            sink_max_attempts: env_or("SINK_MAX_ATTEMPTS", dispatch_defaults.sink_max_attempts),
            ..dispatch_defaults
        };

        let retry_defaults = StoreRetryPolicy::default();
        let store_retry = StoreRetryPolicy {
            max_attempts: env_or("STORE_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts),
            reconciliation_capacity: env_or(
                "RECONCILIATION_CAPACITY",
                retry_defaults.reconciliation_capacity,
            ),
            reconcile_interval_sec: env_or(
                "RECONCILE_INTERVAL_SEC",
                retry_defaults.reconcile_interval_sec,
            ),
            ..retry_defaults
        };

        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://watchpost.db".to_string()),
            port: env_or("PORT", 8080),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            sources_file: std::env::var("SOURCES_FILE").ok().map(PathBuf::from),
            inference_permits: env_or("INFERENCE_PERMITS", 4usize).max(1),
            http_timeout: Duration::from_millis(env_or("HTTP_TIMEOUT_MS", 10_000u64)),
            telegram_enabled: env_or("TELEGRAM_ENABLED", false),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            telegram_chat_ids: env_list("TELEGRAM_CHAT_IDS"),
            webhook_urls: env_list("WEBHOOK_URLS"),
            snapshot_dir: match std::env::var("SNAPSHOT_DIR") {
                Ok(dir) if dir.is_empty() => None,
                Ok(dir) => Some(PathBuf::from(dir)),
                Err(_) => Some(PathBuf::from("snapshots")),
            },
            worker,
            dispatch,
            store_retry,
        }
    }
}

impl AppConfig {
    /// Defaults without reading the environment (tests)
    pub fn in_memory() -> Self {
        Self {
            database_url: "memory".to_string(),
            port: 0,
            host: "127.0.0.1".to_string(),
            sources_file: None,
            inference_permits: 4,
            http_timeout: Duration::from_secs(10),
            telegram_enabled: false,
            telegram_bot_token: None,
            telegram_chat_ids: Vec::new(),
            webhook_urls: Vec::new(),
            snapshot_dir: None,
            worker: WorkerPolicy::default(),
            dispatch: DispatchPolicy::default(),
            store_retry: StoreRetryPolicy::default(),
        }
    }

    /// Alert sinks described by this configuration
    pub fn build_sinks(&self, client: &reqwest::Client) -> Vec<Arc<dyn AlertSink>> {
        let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();

        match (&self.telegram_bot_token, self.telegram_enabled) {
            (Some(token), true) if !self.telegram_chat_ids.is_empty() => {
                for chat_id in &self.telegram_chat_ids {
                    sinks.push(Arc::new(TelegramSink::new(
                        client.clone(),
                        token.clone(),
                        chat_id.clone(),
                    )));
                }
            }
            (_, true) => {
                tracing::warn!("Telegram enabled but TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_IDS not set")
            }
            _ => tracing::info!("Telegram notifications disabled"),
        }

        for url in &self.webhook_urls {
            sinks.push(Arc::new(WebhookSink::new(client.clone(), url.clone())));
        }
        sinks
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Source configuration cache
    pub config_store: Arc<ConfigStore>,
    pub events: Arc<EventStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub dispatcher: Arc<NotificationDispatcher>,
    /// RealtimeHub (WebSocket)
    pub realtime: Arc<RealtimeHub>,
    pub registry: Arc<StreamRegistry>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component with the default adapter factory
    pub async fn initialize(config: AppConfig, config_store: Arc<ConfigStore>) -> Result<Self> {
        let factory = Arc::new(DefaultAdapterFactory::new(config.http_timeout)?);
        Self::with_factory(config, config_store, factory).await
    }

    pub async fn with_factory(
        config: AppConfig,
        config_store: Arc<ConfigStore>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Result<Self> {
        let events = Arc::new(
            EventStore::connect(&config.database_url, config.store_retry.clone()).await?,
        );

        let snapshots = Arc::new(SnapshotStore::new(config.snapshot_dir.clone()));
        if let Some(dir) = &config.snapshot_dir {
            tracing::info!(dir = %dir.display(), "Event snapshots enabled");
        }

        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        let sinks = config.build_sinks(&client);
        tracing::info!(sinks = sinks.len(), "Alert sinks configured");

        let realtime = Arc::new(RealtimeHub::new());
        let dispatcher = Arc::new(NotificationDispatcher::spawn(
            realtime.clone(),
            sinks,
            config.dispatch.clone(),
        ));

        let deps = WorkerDeps {
            store: events.clone(),
            snapshots: snapshots.clone(),
            dispatcher: dispatcher.clone(),
            hub: realtime.clone(),
            inference_gate: Arc::new(Semaphore::new(config.inference_permits)),
            policy: config.worker.clone(),
        };
        let registry = Arc::new(StreamRegistry::new(config_store.clone(), factory, deps));

        Ok(Self {
            config,
            config_store,
            events,
            snapshots,
            dispatcher,
            realtime,
            registry,
            started_at: Instant::now(),
        })
    }

    pub fn uptime_sec(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
