//! # Parked Session Registry
//!
//! When a client disconnects, its session is not stopped. The relay parks it
//! here, keyed by owner and session id, and a later `start-voice` from the
//! same owner carrying the same id takes it back. The owner is the admission
//! token the connection presented, so one client can never pick up or
//! displace another client's session. Parked sessions keep their engine
//! running; their output is discarded until they are re-bound.
//!
//! Parked sessions only leave the registry by being taken, by their engine
//! exiting (pruned lazily), or by the optional idle reaper.

use crate::engine::supervisor::EngineHandle;
use crate::session::machine::{EngineLink, Session};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

struct Parked<L: EngineLink> {
    session: Session<L>,
    parked_at: Instant,
}

/// Owner token and session id.
type ParkingKey = (String, String);

pub struct SessionRegistry<L: EngineLink = EngineHandle> {
    parked: DashMap<ParkingKey, Parked<L>>,
}

impl<L: EngineLink> Default for SessionRegistry<L> {
    fn default() -> Self {
        Self { parked: DashMap::new() }
    }
}

impl<L: EngineLink> SessionRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a session for `owner`. A session the same owner already parked
    /// under the same id is returned so the caller can stop it.
    pub fn park(&self, owner: &str, session: Session<L>) -> Option<Session<L>> {
        let session_id = session.session_id().to_string();
        info!(session_id = %session_id, process_id = ?session.process_id(), "Parking voice session");
        self.parked
            .insert(
                (owner.to_string(), session_id),
                Parked {
                    session,
                    parked_at: Instant::now(),
                },
            )
            .map(|displaced| displaced.session)
    }

    /// Take `owner`'s parked session whose engine is still running.
    pub fn take(&self, owner: &str, session_id: &str) -> Option<Session<L>> {
        let (_, parked) = self.parked.remove(&(owner.to_string(), session_id.to_string()))?;
        if parked.session.has_engine() {
            Some(parked.session)
        } else {
            debug!(session_id, "Parked session's engine already exited");
            None
        }
    }

    pub fn contains(&self, owner: &str, session_id: &str) -> bool {
        self.parked.contains_key(&(owner.to_string(), session_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Drop parked sessions whose engine has exited on its own.
    pub fn prune_exited(&self) -> usize {
        let before = self.parked.len();
        self.parked.retain(|_, parked| parked.session.has_engine());
        before - self.parked.len()
    }

    /// Stop and remove sessions parked for longer than `max_idle`.
    /// Returns how many were reaped.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<ParkingKey> = self
            .parked
            .iter()
            .filter(|entry| now.duration_since(entry.parked_at) >= max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for key in expired {
            if let Some((_, mut parked)) = self.parked.remove(&key) {
                info!(session_id = %parked.session.session_id(), "Reaping idle parked voice session");
                parked.session.stop();
                reaped += 1;
            }
        }
        reaped
    }

    /// Stop every parked session. Used at shutdown.
    pub fn stop_all(&self) -> usize {
        let keys: Vec<ParkingKey> = self.parked.iter().map(|entry| entry.key().clone()).collect();
        let mut stopped = 0;
        for key in keys {
            if let Some((_, mut parked)) = self.parked.remove(&key) {
                if parked.session.stop() {
                    stopped += 1;
                }
            }
        }
        stopped
    }
}
