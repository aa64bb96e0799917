//! Reference-counted pool of shared external connections.
//!
//! Several subscriptions and commands can point at the same resource (for
//! example the same WebSocket URL). The pool keeps exactly one physical
//! connection per key, counts the holders, and closes the connection only
//! when the last holder lets go.
//!
//! The pool is an ordinary value injected into the effect handlers that need
//! it. Counting happens under a single lock, and [`Connector::connect`] is
//! synchronous (it registers the connection and leaves the handshake to a
//! background task), so an open can never race with a close for the same key.

use crate::error::PoolError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// A live, shareable connection.
pub trait Socket: Send + Sync + 'static {
    /// Queue a text frame for sending.
    fn send(&self, frame: String) -> Result<(), PoolError>;

    /// Subscribe to inbound text frames. Only frames received after this call
    /// are delivered.
    fn frames(&self) -> broadcast::Receiver<String>;

    /// Close the connection after flushing queued frames.
    fn close(&self);

    /// Whether the connection can still carry frames. A socket whose
    /// transport failed or was closed by the peer reports `false`, and the
    /// pool replaces it on the next acquire.
    fn is_open(&self) -> bool {
        true
    }
}

/// Opens connections on behalf of the pool.
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `key`. Must return promptly: a transport with
    /// an asynchronous handshake performs it in the background and queues
    /// frames until it completes.
    fn connect(&self, key: &str) -> Result<Arc<dyn Socket>, PoolError>;
}

struct Entry {
    holders: usize,
    socket: Arc<dyn Socket>,
}

/// One connection per key, shared and reference counted.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ConnectionPool {
    /// Create a pool that opens connections through `connector`.
    pub fn new(connector: impl Connector) -> Arc<Self> {
        Self::with_connector(Arc::new(connector))
    }

    /// Create a pool from an already shared connector.
    pub fn with_connector(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Take an interest in the connection for `key`, opening it if no one
    /// holds it yet or if the shared connection has died.
    ///
    /// The interest lasts until the returned [`Lease`] is released or
    /// dropped.
    pub fn acquire(self: &Arc<Self>, key: &str) -> Result<Lease, PoolError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut retired = None;
        let socket = match entries.get_mut(key) {
            Some(entry) if entry.socket.is_open() => {
                entry.holders += 1;
                tracing::trace!(key, holders = entry.holders, "reusing connection");
                entry.socket.clone()
            }
            Some(entry) => {
                let socket = self.connector.connect(key)?;
                entry.holders += 1;
                tracing::debug!(key, holders = entry.holders, "replaced dead connection");
                retired = Some(std::mem::replace(&mut entry.socket, socket.clone()));
                socket
            }
            None => {
                let socket = self.connector.connect(key)?;
                tracing::debug!(key, "opened connection");
                entries.insert(
                    key.to_owned(),
                    Entry {
                        holders: 1,
                        socket: socket.clone(),
                    },
                );
                socket
            }
        };
        drop(entries);
        if let Some(dead) = retired {
            dead.close();
        }
        Ok(Lease {
            pool: self.clone(),
            key: key.to_owned(),
            socket,
            released: false,
        })
    }

    /// Number of holders of `key` (zero if no connection is open).
    pub fn holders(&self, key: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |entry| entry.holders)
    }

    /// Number of open connections.
    pub fn open_connections(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, key: &str) {
        let closing = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let remaining = entries.get_mut(key).map(|entry| {
                entry.holders -= 1;
                entry.holders
            });
            match remaining {
                Some(0) => entries.remove(key),
                Some(holders) => {
                    tracing::trace!(key, holders, "released connection");
                    None
                }
                None => {
                    tracing::warn!(key, "released a connection that is not open");
                    None
                }
            }
        };
        if let Some(entry) = closing {
            tracing::debug!(key, "closing connection");
            entry.socket.close();
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut map = f.debug_map();
        for (key, entry) in entries.iter() {
            map.entry(key, &entry.holders);
        }
        map.finish()
    }
}

/// One holder's interest in a pooled connection.
///
/// Releasing (explicitly or by dropping) gives up exactly this interest;
/// the connection closes only if no other lease remains.
pub struct Lease {
    pool: Arc<ConnectionPool>,
    key: String,
    socket: Arc<dyn Socket>,
    released: bool,
}

impl Lease {
    /// The pooled connection.
    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    /// The key this lease holds.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Give up this interest now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.key);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("key", &self.key).finish()
    }
}
