//! Test doubles for driving a runtime without real I/O.
//!
//! * [`MemoryConnector`] / [`MemorySocket`] -- an in-memory transport for the
//!   [`ConnectionPool`](crate::pool::ConnectionPool) that records every open,
//!   send and close, and lets tests inject inbound frames.
//! * [`Notifications`] -- records what the runtime's subscriber saw after each
//!   transition.
//!
//! # Example
//!
//! ```rust,ignore
//! use realm_core::testing::Notifications;
//!
//! let seen = Notifications::new();
//! runtime.subscribe(seen.recorder(|model: &Counter| model.count));
//! runtime.dispatch(Msg::Inc)?;
//! runtime.dispatch(Msg::Inc)?;
//! assert_eq!(seen.take(), vec![1, 2]);
//! ```

use crate::error::PoolError;
use crate::pool::{Connector, Socket};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

const FRAME_CAPACITY: usize = 64;

/// An in-memory [`Socket`].
pub struct MemorySocket {
    key: String,
    sent: Mutex<Vec<String>>,
    inbound: Mutex<Option<broadcast::Sender<String>>>,
    failure: Mutex<Option<String>>,
    close_calls: AtomicUsize,
}

impl MemorySocket {
    fn new(key: &str) -> Self {
        let (inbound, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            key: key.to_owned(),
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(Some(inbound)),
            failure: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Deliver an inbound frame to every current listener. Returns how many
    /// listeners received it.
    pub fn push(&self, frame: impl Into<String>) -> usize {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |inbound| inbound.send(frame.into()).unwrap_or(0))
    }

    /// Simulate a transport failure: listeners see the frame stream end and
    /// later sends fail with [`PoolError::Send`].
    pub fn fail(&self, reason: impl Into<String>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Frames written through [`Socket::send`], in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of attached listeners.
    pub fn listeners(&self) -> usize {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Whether [`Socket::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }

    /// How many times [`Socket::close`] has been called.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Socket for MemorySocket {
    fn send(&self, frame: String) -> Result<(), PoolError> {
        if let Some(reason) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(PoolError::Send {
                key: self.key.clone(),
                reason,
            });
        }
        if self.is_closed() {
            return Err(PoolError::Closed(self.key.clone()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        Ok(())
    }

    fn frames(&self) -> broadcast::Receiver<String> {
        match &*self.inbound.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(inbound) => inbound.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.is_closed() && self.failure.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

#[derive(Default)]
struct Opened {
    sockets: HashMap<String, Vec<Arc<MemorySocket>>>,
    refused: HashSet<String>,
}

/// A [`Connector`] that opens [`MemorySocket`]s and remembers all of them.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    opened: Arc<Mutex<Opened>>,
}

impl MemoryConnector {
    /// Create an empty connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future connect to `key` fail.
    pub fn refuse(&self, key: &str) {
        self.lock().refused.insert(key.to_owned());
    }

    /// How many connections have been opened for `key`.
    pub fn connects(&self, key: &str) -> usize {
        self.lock().sockets.get(key).map_or(0, Vec::len)
    }

    /// The most recently opened socket for `key`.
    pub fn socket(&self, key: &str) -> Option<Arc<MemorySocket>> {
        self.lock()
            .sockets
            .get(key)
            .and_then(|sockets| sockets.last().cloned())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Opened> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, key: &str) -> Result<Arc<dyn Socket>, PoolError> {
        let mut opened = self.lock();
        if opened.refused.contains(key) {
            return Err(PoolError::Connect {
                key: key.to_owned(),
                reason: "refused by test connector".into(),
            });
        }
        let socket = Arc::new(MemorySocket::new(key));
        opened
            .sockets
            .entry(key.to_owned())
            .or_default()
            .push(socket.clone());
        Ok(socket)
    }
}

/// Records a projection of the model at every subscriber notification.
pub struct Notifications<T> {
    seen: Arc<Mutex<Vec<T>>>,
}

impl<T: Send + 'static> Notifications<T> {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A subscriber callback that records `project(model)`.
    pub fn recorder<M: 'static>(
        &self,
        project: impl Fn(&M) -> T + Send + 'static,
    ) -> impl FnMut(&M) + Send + 'static {
        let seen = self.seen.clone();
        move |model: &M| {
            seen.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(project(model));
        }
    }

    /// Number of notifications recorded so far.
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.seen.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<T: Send + 'static> Default for Notifications<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Notifications<T> {
    fn clone(&self) -> Self {
        Self {
            seen: self.seen.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_socket_records_and_fans_out() {
        let connector = MemoryConnector::new();
        let socket = connector.connect("ws://x").unwrap();
        let mut a = socket.frames();
        let mut b = socket.frames();

        socket.send("hello".into()).unwrap();
        let memory = connector.socket("ws://x").unwrap();
        assert_eq!(memory.sent(), vec!["hello"]);
        assert_eq!(memory.listeners(), 2);
        assert_eq!(memory.push("in"), 2);
        assert_eq!(a.try_recv().unwrap(), "in");
        assert_eq!(b.try_recv().unwrap(), "in");
    }

    #[test]
    fn send_after_close_fails() {
        let connector = MemoryConnector::new();
        let socket = connector.connect("ws://x").unwrap();
        socket.close();
        assert_eq!(
            socket.send("late".into()).unwrap_err(),
            PoolError::Closed("ws://x".into())
        );
    }

    #[test]
    fn failed_socket_ends_listeners_and_rejects_sends() {
        let connector = MemoryConnector::new();
        let socket = connector.connect("ws://x").unwrap();
        let mut listener = socket.frames();

        connector.socket("ws://x").unwrap().fail("reset by peer");
        assert!(!socket.is_open());
        assert_eq!(
            listener.try_recv().unwrap_err(),
            broadcast::error::TryRecvError::Closed
        );
        assert_eq!(
            socket.send("late".into()).unwrap_err(),
            PoolError::Send {
                key: "ws://x".into(),
                reason: "reset by peer".into()
            }
        );
        assert_eq!(
            socket.frames().try_recv().unwrap_err(),
            broadcast::error::TryRecvError::Closed
        );
    }

    #[test]
    fn push_without_listeners_reaches_nobody() {
        let connector = MemoryConnector::new();
        connector.connect("ws://x").unwrap();
        assert_eq!(connector.socket("ws://x").unwrap().push("lost"), 0);
    }

    #[test]
    fn notifications_record_projection() {
        let seen = Notifications::new();
        let mut record = seen.recorder(|n: &i32| n * 10);
        record(&1);
        record(&2);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.take(), vec![10, 20]);
        assert!(seen.is_empty());
    }
}
