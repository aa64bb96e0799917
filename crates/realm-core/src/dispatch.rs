use tokio::sync::mpsc;

/// The `dispatch` capability handed to effect handlers.
///
/// A `Dispatcher` enqueues messages on the owning runtime's channel; it never
/// runs `update` itself. Messages sent from inside a command handler are
/// therefore processed by the runtime's trampoline after the current
/// transition instead of recursing into it.
///
/// Cheap to clone and safe to move into spawned tasks.
pub struct Dispatcher<Msg> {
    tx: mpsc::UnboundedSender<Msg>,
}

impl<Msg: Send + 'static> Dispatcher<Msg> {
    /// Create a dispatcher paired with the receiver it feeds.
    ///
    /// Useful for driving handlers directly in tests.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Msg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<Msg>) -> Self {
        Self { tx }
    }

    /// Submit a message to the runtime.
    ///
    /// Returns `false` if the runtime has been dropped and the message was
    /// discarded.
    pub fn dispatch(&self, msg: Msg) -> bool {
        self.tx.send(msg).is_ok()
    }

    /// Whether the receiving runtime has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<Msg> Clone for Dispatcher<Msg> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
