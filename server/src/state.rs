//! # Shared Application State
//!
//! The single `AppState` cloned into every axum handler: the registry
//! (C2), the persistent store backing the alias allocator and request
//! logger (spec §5's "Shared resources" item (c)), and the resolved
//! [`Config`].

use crate::config::Config;
use crate::registry::Registry;
use crate::storage::Store;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the dashboard broadcast channel. Observers that fall this
/// far behind (they never should — the channel only ever carries one
/// frame per 5s tick) miss the oldest frames rather than block the
/// ticker, per spec §4.6's "observers never send to the server" — they
/// are read-only consumers, never a source of backpressure.
const DASHBOARD_CHANNEL_CAPACITY: usize = 8;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
    /// Process-wide fan-out of dashboard snapshot frames (serialized
    /// JSON text), so every observer is driven by the same 5s timer
    /// instead of an independent per-connection one (spec §4.6).
    pub dashboard_tick: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let (dashboard_tick, _) = broadcast::channel(DASHBOARD_CHANNEL_CAPACITY);
        Self {
            registry: Arc::new(Registry::new()),
            store,
            config: Arc::new(config),
            dashboard_tick,
        }
    }
}
