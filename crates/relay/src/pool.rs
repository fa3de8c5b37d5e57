//! Per-exchange cache of upstream connections
//!
//! A [`ConnectionPool`] keeps at most one live connection per
//! [`ConnectionKey`]. It is owned by a single exchange (blocking discipline)
//! or a single client channel (selector discipline) and is never shared
//! between them, so it needs no locking of its own.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::io;

use tracing::{debug, trace};

/// Identifies one pooled upstream: host, port and whether TLS is spoken.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    host: String,
    port: u16,
    tls: bool,
}

impl ConnectionKey {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self { host: host.into(), port, tls }
    }

    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, false)
    }

    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, true)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// A connection that can live in a [`ConnectionPool`].
pub trait PooledConnection {
    /// Best-effort close; errors are not reported.
    fn close(&mut self);

    /// `false` once the connection is known to be unusable.
    fn is_open(&self) -> bool {
        true
    }
}

/// Upstream connections keyed by destination.
pub struct ConnectionPool<C> {
    connections: HashMap<ConnectionKey, C>,
}

impl<C: PooledConnection> ConnectionPool<C> {
    pub fn new() -> Self {
        Self { connections: HashMap::new() }
    }

    /// Returns the cached connection for `key`, connecting on a miss.
    ///
    /// A cached connection that reports itself closed is replaced.
    ///
    /// # Errors
    ///
    /// Whatever `connect` fails with; nothing is cached in that case.
    pub fn get_or_connect<F>(&mut self, key: &ConnectionKey, connect: F) -> io::Result<&mut C>
    where
        F: FnOnce(&ConnectionKey) -> io::Result<C>,
    {
        match self.connections.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_open() {
                    trace!(%key, "reuse pooled upstream");
                    return Ok(entry.into_mut());
                }

                debug!(%key, "replace closed upstream");
                entry.get_mut().close();
                let connection = connect(key);
                match connection {
                    Ok(connection) => {
                        entry.insert(connection);
                        Ok(entry.into_mut())
                    }
                    Err(e) => {
                        entry.remove();
                        Err(e)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let connection = connect(key)?;
                debug!(%key, "connected upstream");
                Ok(entry.insert(connection))
            }
        }
    }

    pub fn get_mut(&mut self, key: &ConnectionKey) -> Option<&mut C> {
        self.connections.get_mut(key)
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections.contains_key(key)
    }

    /// Drops `key` from the pool without closing it.
    pub fn remove(&mut self, key: &ConnectionKey) -> Option<C> {
        self.connections.remove(key)
    }

    /// Closes every cached connection and empties the pool. Safe to call
    /// more than once.
    pub fn close_all(&mut self) {
        for (key, mut connection) in self.connections.drain() {
            trace!(%key, "close pooled upstream");
            connection.close();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConnectionKey> {
        self.connections.keys()
    }
}

impl<C: PooledConnection> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool").field("keys", &self.connections.keys().collect::<Vec<_>>()).finish()
    }
}
