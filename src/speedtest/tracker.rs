//! Session admission control.
//!
//! Speedtest participants wait in a FIFO queue. The first `max_active`
//! entries are unchoked and may measure; everybody else waits. After every
//! mutation the queue is renumbered so that `queue_pos` is the 1-based rank
//! and `active` holds exactly for the head of the queue.
//!
//! Sessions leave the queue when they finish (collect), when they go quiet
//! for longer than the staleness window, or as soon as the connection they
//! were tracked on goes away.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Transport connection identifier assigned by the HTTP collaborator.
pub type ConnectionId = u64;

/// Server-side state of one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque token handed to the client
    pub identifier: String,
    /// Last time the client showed activity
    pub last_touch: Duration,
    /// Whether the session may measure now
    pub active: bool,
    /// 1-based rank in the queue
    pub queue_pos: usize,
    /// Number of negotiations seen
    pub negotiations: u32,
}

/// FIFO queue of sessions plus connection tracking.
#[derive(Debug)]
pub struct SessionTracker {
    sessions: HashMap<String, Session>,
    queue: VecDeque<String>,
    connections: HashMap<ConnectionId, String>,
    max_active: usize,
    stale_after: Duration,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

impl SessionTracker {
    /// Create a tracker unchoking `max_active` sessions at a time.
    pub fn new(max_active: usize, stale_after: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            queue: VecDeque::new(),
            connections: HashMap::new(),
            max_active,
            stale_after,
        }
    }

    /// Return the session named by `identifier`, or queue a new one.
    pub fn negotiate(&mut self, identifier: Option<&str>, now: Duration) -> Session {
        if let Some(session) = identifier.and_then(|id| self.sessions.get_mut(id)) {
            session.negotiations += 1;
            session.last_touch = now;
            return session.clone();
        }

        let identifier = uuid::Uuid::new_v4().to_string();
        let session = Session {
            identifier: identifier.clone(),
            last_touch: now,
            active: false,
            queue_pos: 0,
            negotiations: 1,
        };
        self.sessions.insert(identifier.clone(), session);
        self.queue.push_back(identifier.clone());
        self.update_queue();

        tracing::debug!("queued session {} at {}", identifier, self.queue.len());
        self.sessions[&identifier].clone()
    }

    /// Whether the session may measure; counts as activity.
    pub fn is_active(&mut self, identifier: Option<&str>, now: Duration) -> bool {
        match identifier.and_then(|id| self.sessions.get_mut(id)) {
            Some(session) => {
                session.last_touch = now;
                session.active
            },
            None => false,
        }
    }

    /// Drop a session and renumber the queue.
    pub fn remove(&mut self, identifier: &str) -> bool {
        if self.sessions.remove(identifier).is_none() {
            return false;
        }
        self.queue.retain(|id| id != identifier);
        self.connections.retain(|_, id| id != identifier);
        self.update_queue();
        true
    }

    /// Drop every session idle for longer than the staleness window.
    pub fn prune_stale(&mut self, now: Duration) -> bool {
        let stale: Vec<String> = self
            .queue
            .iter()
            .filter(|id| {
                self.sessions
                    .get(*id)
                    .is_some_and(|s| now.saturating_sub(s.last_touch) > self.stale_after)
            })
            .cloned()
            .collect();

        if stale.is_empty() {
            return false;
        }
        for identifier in &stale {
            tracing::info!("pruning stale session {}", identifier);
            self.sessions.remove(identifier);
        }
        self.queue.retain(|id| self.sessions.contains_key(id));
        self.connections.retain(|_, id| self.sessions.contains_key(id));
        self.update_queue();
        true
    }

    /// Track `connection` as belonging to `identifier`.
    ///
    /// Ignored when the session is unknown or the connection already tracked.
    /// Entries leave the registry together with their session, so a reused
    /// connection can be linked to its next session.
    pub fn register_connection(&mut self, connection: ConnectionId, identifier: Option<&str>) {
        let Some(identifier) = identifier else {
            return;
        };
        if self.connections.contains_key(&connection) || !self.sessions.contains_key(identifier) {
            return;
        }
        self.connections.insert(connection, identifier.to_string());
    }

    /// Forget `connection` and drop the session it belonged to.
    ///
    /// Returns the identifier of the removed session.
    pub fn unregister_connection(&mut self, connection: ConnectionId) -> Option<String> {
        let identifier = self.connections.remove(&connection)?;
        if self.remove(&identifier) {
            tracing::info!("connection {} lost, dropped session {}", connection, identifier);
            Some(identifier)
        } else {
            None
        }
    }

    /// Session by identifier
    pub fn get(&self, identifier: &str) -> Option<&Session> {
        self.sessions.get(identifier)
    }

    /// Sessions in queue order
    pub fn queue(&self) -> impl Iterator<Item = &Session> {
        self.queue.iter().filter_map(|id| self.sessions.get(id))
    }

    /// Queue length
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nobody is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of tracked connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn update_queue(&mut self) {
        for (index, identifier) in self.queue.iter().enumerate() {
            if let Some(session) = self.sessions.get_mut(identifier) {
                session.queue_pos = index + 1;
                session.active = index < self.max_active;
            }
        }
    }
}
