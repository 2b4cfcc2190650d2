//! Shared application state.

use std::sync::Arc;

use kassa_buffer::Buffer;
use kassa_sync::{AdapterConfig, Orchestrator, SyncDaemonHandle};

/// State shared by every request handler.
pub struct AppState {
    pub config: AdapterConfig,
    pub buffer: Buffer,
    pub orchestrator: Orchestrator,
    pub daemon: SyncDaemonHandle,
}

/// Handler-friendly alias.
pub type SharedState = Arc<AppState>;
