//! Bounded per-session-key connection pool.
//!
//! The pool owns idle connections by value, so a connection can only ever
//! sit under one session key. It never performs I/O itself: connections it
//! refuses or evicts are handed back to the caller to close.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default maximum number of idle connections kept per session key.
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;

/// A connection the pool can hold.
pub trait PoolableConnection: Send {
    /// Whether the underlying transport is still usable.
    fn is_open(&self) -> bool;

    /// Picks up anything the peer did while the connection sat idle, such
    /// as closing it, without blocking. Returns the refreshed [`is_open`].
    ///
    /// [`is_open`]: PoolableConnection::is_open
    fn check_alive(&mut self) -> bool {
        self.is_open()
    }
}

/// A live connection plus pool metadata.
#[derive(Debug)]
pub struct PooledConnection<C> {
    conn: C,
    session_key: String,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
}

impl<C: PoolableConnection> PooledConnection<C> {
    pub fn new(conn: C, session_key: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            conn,
            session_key: session_key.into(),
            created_at: now,
            last_used: now,
            healthy: true,
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Flags the connection so it is closed instead of pooled on release.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn is_reusable(&self) -> bool {
        self.healthy && self.conn.is_open()
    }

    fn refresh_reusable(&mut self) -> bool {
        self.healthy && self.conn.check_alive()
    }

    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    pub fn get_mut(&mut self) -> &mut C {
        self.last_used = Instant::now();
        &mut self.conn
    }

    pub fn into_inner(self) -> C {
        self.conn
    }
}

/// Outcome of looking up a connection for a session key.
#[derive(Debug)]
pub struct Checkout<C> {
    /// A reusable connection, if the pool had one.
    pub reused: Option<PooledConnection<C>>,
    /// Entries found closed, unhealthy or idle too long. Close these.
    pub evicted: Vec<PooledConnection<C>>,
}

#[derive(Debug)]
pub struct ConnectionPool<C> {
    max_per_key: usize,
    max_idle: Option<Duration>,
    entries: HashMap<String, Vec<PooledConnection<C>>>,
}

impl<C: PoolableConnection> ConnectionPool<C> {
    pub fn new(max_per_key: usize) -> Self {
        Self {
            max_per_key,
            max_idle: None,
            entries: HashMap::new(),
        }
    }

    /// Idle entries older than `max_idle` are evicted on checkout.
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    pub fn max_per_key(&self) -> usize {
        self.max_per_key
    }

    /// Takes the most recently returned reusable connection for `key`.
    /// Unusable entries met on the way are removed and returned as evicted.
    pub fn checkout(&mut self, key: &str) -> Checkout<C> {
        let mut evicted = Vec::new();
        let mut reused = None;

        if let Some(idle) = self.entries.get_mut(key) {
            while let Some(mut candidate) = idle.pop() {
                let stale = self
                    .max_idle
                    .is_some_and(|max| candidate.last_used.elapsed() > max);
                if !stale && candidate.refresh_reusable() {
                    reused = Some(candidate);
                    break;
                }
                evicted.push(candidate);
            }
            if idle.is_empty() {
                self.entries.remove(key);
            }
        }

        if let Some(conn) = reused.as_mut() {
            conn.last_used = Instant::now();
        }
        Checkout { reused, evicted }
    }

    /// Returns a connection to the pool under `key`.
    ///
    /// Gives the connection back as `Err` when it must be closed instead:
    /// it is not reusable, it was opened for a different key, or the pool
    /// for `key` is full. On success returns the new pool size for `key`.
    pub fn checkin(
        &mut self,
        key: &str,
        mut conn: PooledConnection<C>,
    ) -> Result<usize, PooledConnection<C>> {
        if conn.session_key != key || !conn.refresh_reusable() {
            return Err(conn);
        }
        let idle = self.entries.entry(key.to_string()).or_default();
        if idle.len() >= self.max_per_key {
            return Err(conn);
        }
        conn.last_used = Instant::now();
        idle.push(conn);
        Ok(idle.len())
    }

    pub fn size(&self, key: &str) -> usize {
        self.entries.get(key).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Idle connection count per session key.
    pub fn stats(&self) -> HashMap<String, usize> {
        self.entries
            .iter()
            .map(|(key, idle)| (key.clone(), idle.len()))
            .collect()
    }

    /// Removes every pooled connection across all keys.
    pub fn drain(&mut self) -> Vec<PooledConnection<C>> {
        self.entries.drain().flat_map(|(_, idle)| idle).collect()
    }
}

impl<C: PoolableConnection> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOL_SIZE)
    }
}
