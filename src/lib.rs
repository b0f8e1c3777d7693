//! watchpost Library
//!
//! Multi-stream detection event aggregation engine
//!
//! ## Architecture (10 Components)
//!
//! 1. ConfigStore - Source definitions and policies
//! 2. FrameAdapter - Frame acquisition and detector seam
//! 3. StreamWorker - One task per running source
//! 4. EventAggregator - Per-source debouncing state machine
//! 5. EventStore - Durable event records and status transitions
//! 6. NotificationDispatcher - Fan-out to live subscribers and alert sinks
//! 7. RealtimeHub - WebSocket distribution
//! 8. StreamRegistry - Single worker per source, aggregate stats
//! 9. SnapshotStore - Best frame of each event
//! 10. WebAPI - REST API endpoints
//!
//! ## Design Principles
//!
//! - Each aggregator is owned by exactly one worker
//! - Shared state is limited to the registry and the event store
//! - Notification delivery never blocks detection

pub mod config_store;
pub mod error;
pub mod event_aggregator;
pub mod event_store;
pub mod frame_adapter;
pub mod models;
pub mod notification_dispatcher;
pub mod realtime_hub;
pub mod snapshot_store;
pub mod state;
pub mod stream_registry;
pub mod stream_worker;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
