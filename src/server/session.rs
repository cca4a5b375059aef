//! Server session table.
//!
//! Maps session ids to running sessions so fork hellos can be authenticated
//! against the current secrets and their connections routed to the right
//! driver.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::crypto::{SessionId, SessionSecrets};
use crate::session::SessionHandle;

#[derive(Debug)]
struct ManagedSession {
    handle: SessionHandle,
    created_at: Instant,
}

/// Sessions owned by one server instance.
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<SessionId, ManagedSession>,
    max_sessions: usize,
}

impl SessionManager {
    /// Create an empty table holding at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Check if another session fits.
    pub fn has_capacity(&self) -> bool {
        self.sessions.len() < self.max_sessions
    }

    /// Handle of a live session.
    pub fn get(&self, id: &SessionId) -> Option<&SessionHandle> {
        self.sessions
            .get(id)
            .map(|entry| &entry.handle)
            .filter(|handle| !handle.is_closed())
    }

    /// Current secrets of a live session.
    pub fn secrets(&self, id: &SessionId) -> Option<SessionSecrets> {
        self.get(id).and_then(SessionHandle::secrets)
    }

    /// Ids of every session.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Age of a session.
    pub fn age(&self, id: &SessionId) -> Option<Duration> {
        self.sessions.get(id).map(|entry| entry.created_at.elapsed())
    }

    /// Register a session, returning the handle it replaced.
    pub fn insert(&mut self, handle: SessionHandle) -> Option<SessionHandle> {
        let entry = ManagedSession {
            handle,
            created_at: Instant::now(),
        };
        self.sessions
            .insert(entry.handle.id(), entry)
            .map(|old| old.handle)
    }

    /// Remove `handle`'s entry unless it was already replaced.
    pub fn remove_if_same(&mut self, handle: &SessionHandle) -> bool {
        let same = self
            .sessions
            .get(&handle.id())
            .is_some_and(|entry| entry.handle.same_session(handle));
        if same {
            self.sessions.remove(&handle.id());
        }
        same
    }

    /// Drop entries whose sessions have closed.
    pub fn prune(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| !entry.handle.is_closed());
        before - self.sessions.len()
    }

    /// Remove and return every handle.
    pub fn drain(&mut self) -> Vec<SessionHandle> {
        self.sessions.drain().map(|(_, entry)| entry.handle).collect()
    }
}
