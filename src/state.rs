//! # Application State Management
//!
//! State shared by every HTTP handler and every WebSocket actor.
//!
//! ## What is shared:
//! - **config**: the loaded [`AppConfig`], behind `Arc<RwLock<_>>`
//! - **metrics**: [`RelayMetrics`], a set of atomic counters. The relay
//!   updates these from actor handlers and from the engine pump tasks, so
//!   they are lock-free rather than sitting behind the config lock.
//! - **sessions**: the [`SessionRegistry`] holding sessions whose client
//!   disconnected while the engine was still running
//!
//! Nothing else is shared between sessions. Each connection owns its own
//! session; the counters are diagnostics only and never drive behaviour,
//! apart from the live-engine gauge used for the concurrency cap.

use crate::config::AppConfig;
use crate::session::registry::SessionRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared application state, cloned into every handler and actor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RelayMetrics>,
    pub sessions: Arc<SessionRegistry>,
    pub start_time: Instant,
}

/// Relay-wide counters.
///
/// ## Gauges vs counters:
/// - `connections_active` and `engines_live` go up and down
/// - everything else only increases
///
/// `engines_spawned` doubles as the generation counter for engine process
/// ids, so every engine gets a distinct id for the lifetime of the relay.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub connections_opened: AtomicU64,
    pub connections_active: AtomicU64,
    pub engines_spawned: AtomicU64,
    pub engines_exited: AtomicU64,
    pub engines_live: AtomicU64,
    pub spawn_failures: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub frames_dropped_not_ready: AtomicU64,
    pub frames_dropped_backpressure: AtomicU64,
    pub frames_dropped_closed: AtomicU64,
    pub frames_to_client: AtomicU64,
    pub sessions_parked: AtomicU64,
    pub sessions_rebound: AtomicU64,
    pub sessions_reaped: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`] for serialization.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_active: u64,
    pub engines_spawned: u64,
    pub engines_exited: u64,
    pub engines_live: u64,
    pub spawn_failures: u64,
    pub frames_forwarded: u64,
    pub frames_dropped_not_ready: u64,
    pub frames_dropped_backpressure: u64,
    pub frames_dropped_closed: u64,
    pub frames_to_client: u64,
    pub sessions_parked: u64,
    pub sessions_rebound: u64,
    pub sessions_reaped: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement a gauge without wrapping below zero.
    pub fn decr(gauge: &AtomicU64) {
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
            Some(value.saturating_sub(1))
        });
    }

    /// Allocate the next engine process id and count the spawn.
    pub fn next_process_id(&self) -> u64 {
        self.engines_spawned.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn live_engines(&self) -> u64 {
        self.engines_live.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_opened: load(&self.connections_opened),
            connections_active: load(&self.connections_active),
            engines_spawned: load(&self.engines_spawned),
            engines_exited: load(&self.engines_exited),
            engines_live: load(&self.engines_live),
            spawn_failures: load(&self.spawn_failures),
            frames_forwarded: load(&self.frames_forwarded),
            frames_dropped_not_ready: load(&self.frames_dropped_not_ready),
            frames_dropped_backpressure: load(&self.frames_dropped_backpressure),
            frames_dropped_closed: load(&self.frames_dropped_closed),
            frames_to_client: load(&self.frames_to_client),
            sessions_parked: load(&self.sessions_parked),
            sessions_rebound: load(&self.sessions_rebound),
            sessions_reaped: load(&self.sessions_reaped),
        }
    }
}

impl MetricsSnapshot {
    /// Every frame the relay refused to forward, whatever the reason.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped_not_ready + self.frames_dropped_backpressure + self.frames_dropped_closed
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RelayMetrics::new()),
            sessions: Arc::new(SessionRegistry::new()),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately so actors never hold it
    /// across a message.
    pub fn get_config(&self) -> AppConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
