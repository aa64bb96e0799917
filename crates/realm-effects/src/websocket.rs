//! WebSocket listen subscriptions and send commands over pooled connections.
//!
//! Every listener and every send for the same URL shares one physical
//! connection through a [`ConnectionPool`]. A listener holds its interest
//! from `setup()` to `cleanup()`; a send holds it only while queuing its
//! frame. The connection closes when the last interest is released.

use futures::{SinkExt, StreamExt};
use realm_core::{
    downcast_payload, Command, CommandHandler, CommandPayload, CommandTag, Completion,
    ConnectionPool, Connector, Dispatcher, EffectError, Gate, Lease, Payload, PoolError, Socket,
    Subscription, SubscriptionFactory, SubscriptionHandler, SubscriptionPayload, SubscriptionTag,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;

/// Tag of the listen subscription.
pub const LISTEN: SubscriptionTag = SubscriptionTag::new("websocket.listen");

/// Tag of the send command.
pub const SEND: CommandTag = CommandTag::new("websocket.send");

// ---------------------------------------------------------------------------
// Listen
// ---------------------------------------------------------------------------

/// Payload of [`LISTEN`].
pub struct Listen<Msg> {
    /// Socket URL, also the pool key.
    pub url: String,
    to_msg: Arc<dyn Fn(String) -> Msg + Send + Sync>,
}

impl<Msg: Send + 'static> SubscriptionPayload<Msg> for Listen<Msg> {
    const TAG: SubscriptionTag = LISTEN;
}

/// Dispatch `to_msg(frame)` for every text frame received on `url`.
pub fn listen<Msg: Send + 'static>(
    url: impl Into<String>,
    to_msg: impl Fn(String) -> Msg + Send + Sync + 'static,
) -> Subscription<Msg> {
    Subscription::effect(Listen {
        url: url.into(),
        to_msg: Arc::new(to_msg),
    })
}

/// Factory for [`LISTEN`] subscriptions.
#[derive(Debug, Clone)]
pub struct ListenFactory {
    pool: Arc<ConnectionPool>,
}

impl ListenFactory {
    /// Listeners built by this factory share connections through `pool`.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

impl<Msg: Send + 'static> SubscriptionFactory<Msg> for ListenFactory {
    fn create(
        &self,
        payload: Payload,
        dispatch: &Dispatcher<Msg>,
    ) -> Result<Box<dyn SubscriptionHandler>, EffectError> {
        let Listen { url, to_msg } = downcast_payload::<Listen<Msg>>(LISTEN, payload)?;
        Ok(Box::new(ListenHandler {
            url,
            to_msg,
            dispatch: dispatch.clone(),
            pool: self.pool.clone(),
            listening: None,
        }))
    }
}

struct Listening {
    lease: Lease,
    gate: Gate,
    task: AbortHandle,
}

impl Listening {
    fn stop(self) {
        self.gate.close();
        self.task.abort();
        self.lease.release();
    }
}

struct ListenHandler<Msg> {
    url: String,
    to_msg: Arc<dyn Fn(String) -> Msg + Send + Sync>,
    dispatch: Dispatcher<Msg>,
    pool: Arc<ConnectionPool>,
    listening: Option<Listening>,
}

impl<Msg: Send + 'static> SubscriptionHandler for ListenHandler<Msg> {
    fn setup(&mut self) -> Result<(), EffectError> {
        if self.listening.is_some() {
            return Err(EffectError::AlreadyActive {
                tag: LISTEN.to_string(),
            });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EffectError::NoExecutor {
            tag: LISTEN.to_string(),
        })?;

        let lease = self.pool.acquire(&self.url)?;
        let mut frames = lease.socket().frames();
        let gate = Gate::new();
        let task = {
            let gate = gate.clone();
            let url = self.url.clone();
            let to_msg = self.to_msg.clone();
            let dispatch = self.dispatch.clone();
            runtime.spawn(async move {
                loop {
                    match frames.recv().await {
                        Ok(frame) => {
                            if gate.pass(|| dispatch.dispatch(to_msg(frame))) != Some(true) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(url = %url, skipped, "listener lagged, frames dropped");
                        }
                        Err(RecvError::Closed) => {
                            tracing::warn!(url = %url, "connection lost, listener stopped");
                            break;
                        }
                    }
                }
            })
        };

        tracing::debug!(url = %self.url, "listening");
        self.listening = Some(Listening {
            lease,
            gate,
            task: task.abort_handle(),
        });
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), EffectError> {
        if let Some(listening) = self.listening.take() {
            listening.stop();
            tracing::debug!(url = %self.url, "stopped listening");
        }
        Ok(())
    }
}

impl<Msg> Drop for ListenHandler<Msg> {
    fn drop(&mut self) {
        if let Some(listening) = self.listening.take() {
            listening.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

/// Payload of [`SEND`].
pub struct WebSocketSend<Msg> {
    /// Socket URL, also the pool key.
    pub url: String,
    /// Text frame to send.
    pub data: String,
    then: Option<Msg>,
}

impl<Msg: Send + 'static> CommandPayload<Msg> for WebSocketSend<Msg> {
    const TAG: CommandTag = SEND;
}

/// Send a text frame to `url`, opening the connection if needed.
pub fn send<Msg: Send + 'static>(url: impl Into<String>, data: impl Into<String>) -> Command<Msg> {
    Command::effect(WebSocketSend {
        url: url.into(),
        data: data.into(),
        then: None,
    })
}

/// Like [`send`], then dispatch `msg` once the frame is queued.
pub fn send_then<Msg: Send + 'static>(
    url: impl Into<String>,
    data: impl Into<String>,
    msg: Msg,
) -> Command<Msg> {
    Command::effect(WebSocketSend {
        url: url.into(),
        data: data.into(),
        then: Some(msg),
    })
}

/// Handler for [`SEND`].
#[derive(Debug, Clone)]
pub struct SendHandler {
    pool: Arc<ConnectionPool>,
}

impl SendHandler {
    /// Sends go through connections shared via `pool`.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

impl<Msg: Send + 'static> CommandHandler<Msg> for SendHandler {
    fn handle(&self, payload: Payload, dispatch: &Dispatcher<Msg>) -> Result<Completion, EffectError> {
        let WebSocketSend { url, data, then } =
            downcast_payload::<WebSocketSend<Msg>>(SEND, payload)?;
        let lease = self.pool.acquire(&url)?;
        let sent = lease.socket().send(data);
        lease.release();
        if let Err(e) = sent {
            tracing::warn!(url = %url, error = %e, "websocket send failed");
            return Err(e.into());
        }
        if let Some(msg) = then {
            dispatch.dispatch(msg);
        }
        Ok(Completion::Ready)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

const DEFAULT_CAPACITY: usize = 256;

/// A [`Connector`] that opens real WebSocket connections with
/// `tokio-tungstenite`.
///
/// `connect` returns at once. The handshake runs on a background task;
/// frames sent before it completes are queued, and a close waits for every
/// queued frame to be flushed. When the handshake or the transport fails,
/// listeners see their frame stream end, sends fail with
/// [`PoolError::Send`], and the pool opens a fresh connection on the next
/// acquire.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    capacity: usize,
}

impl TungsteniteConnector {
    /// A connector buffering up to 256 inbound frames per slow listener.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A connector buffering up to `capacity` inbound frames per listener
    /// before the listener starts skipping frames.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TungsteniteConnector {
    fn connect(&self, key: &str) -> Result<Arc<dyn Socket>, PoolError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PoolError::Connect {
            key: key.to_owned(),
            reason: "no tokio runtime is running".into(),
        })?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(self.capacity);
        let link = Arc::new(Link {
            state: Mutex::new(LinkState {
                inbound: Some(inbound),
                failure: None,
            }),
        });
        runtime.spawn(drive(key.to_owned(), outbound_rx, link.clone()));
        Ok(Arc::new(TungsteniteSocket {
            url: key.to_owned(),
            outbound,
            link,
        }))
    }
}

enum Outbound {
    Frame(String),
    Close,
}

/// State shared between a socket and the task driving it.
struct Link {
    state: Mutex<LinkState>,
}

struct LinkState {
    /// Dropped when the connection ends, which ends every listener's stream.
    inbound: Option<broadcast::Sender<String>>,
    failure: Option<String>,
}

impl Link {
    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, frame: String) {
        if let Some(inbound) = &self.lock().inbound {
            // No listeners is fine: the frame is simply dropped.
            let _ = inbound.send(frame);
        }
    }

    fn shut(&self, failure: Option<String>) {
        let mut state = self.lock();
        state.inbound = None;
        state.failure = failure;
    }
}

struct TungsteniteSocket {
    url: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    link: Arc<Link>,
}

impl Socket for TungsteniteSocket {
    fn send(&self, frame: String) -> Result<(), PoolError> {
        if let Some(reason) = self.link.lock().failure.clone() {
            return Err(PoolError::Send {
                key: self.url.clone(),
                reason,
            });
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| PoolError::Closed(self.url.clone()))
    }

    fn frames(&self) -> broadcast::Receiver<String> {
        match &self.link.lock().inbound {
            Some(inbound) => inbound.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    fn is_open(&self) -> bool {
        self.link.lock().inbound.is_some()
    }
}

/// Own one connection: connect, then pump frames both ways until closed.
async fn drive(url: String, outbound: mpsc::UnboundedReceiver<Outbound>, link: Arc<Link>) {
    let failure = pump(&url, outbound, &link).await;
    match &failure {
        Some(reason) => tracing::warn!(url = %url, error = %reason, "websocket failed"),
        None => tracing::debug!(url = %url, "websocket closed"),
    }
    link.shut(failure);
}

/// Returns why the connection ended, or `None` after a requested close.
async fn pump(
    url: &str,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    link: &Link,
) -> Option<String> {
    let stream = match tokio_tungstenite::connect_async(url).await {
        Ok((stream, _)) => stream,
        Err(e) => return Some(format!("connect failed: {e}")),
    };
    tracing::debug!(url, "websocket connected");
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return Some(format!("write failed: {e}"));
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    return None;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => link.deliver(text.to_string()),
                Some(Ok(Message::Close(_))) | None => return Some("closed by peer".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(format!("read failed: {e}")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realm_core::testing::MemoryConnector;
    use realm_core::{interpret, CommandRegistry, SubscriptionManager, SubscriptionRegistry};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    const URL: &str = "ws://chat.test/room";

    #[derive(Debug, PartialEq)]
    enum Msg {
        Frame(String),
        Sent,
    }

    struct Fixture {
        connector: MemoryConnector,
        pool: Arc<ConnectionPool>,
        dispatch: Dispatcher<Msg>,
        rx: UnboundedReceiver<Msg>,
    }

    impl Fixture {
        fn new() -> Self {
            let connector = MemoryConnector::new();
            let pool = ConnectionPool::new(connector.clone());
            let (dispatch, rx) = Dispatcher::channel();
            Self {
                connector,
                pool,
                dispatch,
                rx,
            }
        }

        fn manager(&self, sub: Subscription<Msg>) -> SubscriptionManager {
            let registry = SubscriptionRegistry::new()
                .with(LISTEN, Box::new(ListenFactory::new(self.pool.clone())))
                .unwrap();
            SubscriptionManager::new(sub, &registry, &self.dispatch)
        }

        fn run(&self, cmd: Command<Msg>) -> Vec<EffectError> {
            let registry: CommandRegistry<Msg> = CommandRegistry::new()
                .with(SEND, Box::new(SendHandler::new(self.pool.clone())))
                .unwrap();
            interpret(cmd, &registry, &self.dispatch).spawn()
        }

        async fn next(&mut self) -> Msg {
            tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .unwrap()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn listeners_on_one_url_share_a_connection() {
        let mut fx = Fixture::new();
        let mut manager = fx.manager(Subscription::batch([
            listen(URL, Msg::Frame),
            listen(URL, Msg::Frame),
        ]));
        manager.setup().unwrap();

        assert_eq!(fx.connector.connects(URL), 1);
        assert_eq!(fx.pool.holders(URL), 2);

        let socket = fx.connector.socket(URL).unwrap();
        assert_eq!(socket.push("hello"), 2);
        assert_eq!(fx.next().await, Msg::Frame("hello".into()));
        assert_eq!(fx.next().await, Msg::Frame("hello".into()));

        manager.cleanup().unwrap();
        assert_eq!(fx.pool.holders(URL), 0);
        assert_eq!(socket.close_calls(), 1);
    }

    #[tokio::test]
    async fn connection_closes_only_after_last_listener() {
        let mut fx = Fixture::new();
        let mut first = fx.manager(listen(URL, Msg::Frame));
        let mut second = fx.manager(listen(URL, Msg::Frame));
        first.setup().unwrap();
        second.setup().unwrap();
        let socket = fx.connector.socket(URL).unwrap();

        first.cleanup().unwrap();
        assert!(!socket.is_closed());
        assert_eq!(fx.pool.holders(URL), 1);

        socket.push("still here");
        assert_eq!(fx.next().await, Msg::Frame("still here".into()));

        second.cleanup().unwrap();
        assert_eq!(socket.close_calls(), 1);
        assert_eq!(fx.pool.open_connections(), 0);
    }

    #[tokio::test]
    async fn no_frames_are_dispatched_after_cleanup() {
        let mut fx = Fixture::new();
        let mut manager = fx.manager(listen(URL, Msg::Frame));
        manager.setup().unwrap();
        let socket = fx.connector.socket(URL).unwrap();

        manager.cleanup().unwrap();
        socket.push("late");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn refused_connection_fails_setup() {
        let fx = Fixture::new();
        fx.connector.refuse(URL);
        let mut manager = fx.manager(listen(URL, Msg::Frame));
        assert!(matches!(
            manager.setup(),
            Err(EffectError::Pool(PoolError::Connect { .. }))
        ));
        assert_eq!(fx.pool.holders(URL), 0);
    }

    #[test]
    fn send_opens_writes_and_releases() {
        let fx = Fixture::new();
        assert!(fx.run(send(URL, "ping")).is_empty());

        let socket = fx.connector.socket(URL).unwrap();
        assert_eq!(socket.sent(), vec!["ping"]);
        assert!(socket.is_closed());
        assert_eq!(fx.pool.holders(URL), 0);
    }

    #[tokio::test]
    async fn send_reuses_a_listened_connection() {
        let fx = Fixture::new();
        let mut manager = fx.manager(listen(URL, Msg::Frame));
        manager.setup().unwrap();

        assert!(fx.run(send(URL, "ping")).is_empty());
        assert_eq!(fx.connector.connects(URL), 1);
        assert_eq!(fx.pool.holders(URL), 1);
        assert!(!fx.connector.socket(URL).unwrap().is_closed());
    }

    #[test]
    fn send_then_dispatches_the_follow_up() {
        let mut fx = Fixture::new();
        assert!(fx.run(send_then(URL, "ping", Msg::Sent)).is_empty());
        assert_eq!(fx.rx.try_recv().unwrap(), Msg::Sent);
    }

    #[test]
    fn refused_send_is_reported_without_follow_up() {
        let mut fx = Fixture::new();
        fx.connector.refuse(URL);
        let errors = fx.run(send_then(URL, "ping", Msg::Sent));
        assert!(matches!(
            errors.as_slice(),
            [EffectError::Pool(PoolError::Connect { .. })]
        ));
        assert!(fx.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_after_connection_loss_reconnects() {
        let fx = Fixture::new();
        let mut manager = fx.manager(listen(URL, Msg::Frame));
        manager.setup().unwrap();
        let lost = fx.connector.socket(URL).unwrap();
        lost.fail("reset by peer");

        assert!(fx.run(send(URL, "again")).is_empty());
        assert_eq!(fx.connector.connects(URL), 2);
        assert_eq!(fx.connector.socket(URL).unwrap().sent(), vec!["again"]);
        assert!(lost.sent().is_empty());

        manager.cleanup().unwrap();
        assert_eq!(fx.pool.open_connections(), 0);
        assert!(fx.connector.socket(URL).unwrap().is_closed());
    }

    #[tokio::test]
    async fn listener_stops_when_its_connection_fails() {
        let mut fx = Fixture::new();
        let mut manager = fx.manager(listen(URL, Msg::Frame));
        manager.setup().unwrap();
        let socket = fx.connector.socket(URL).unwrap();
        assert_eq!(socket.listeners(), 1);

        socket.fail("reset by peer");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(socket.push("after"), 0);
        assert!(fx.rx.try_recv().is_err());
        manager.cleanup().unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_fails_the_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        drop(listener);

        let socket = TungsteniteConnector::new().connect(&url).unwrap();
        let mut frames = socket.frames();
        let ended = tokio::time::timeout(Duration::from_secs(5), frames.recv()).await;
        assert_eq!(ended.unwrap(), Err(RecvError::Closed));

        assert!(!socket.is_open());
        assert!(matches!(
            socket.send("hello".into()),
            Err(PoolError::Send { key, .. }) if key == url
        ));
        assert_eq!(socket.frames().try_recv(), Err(broadcast::error::TryRecvError::Closed));
    }

    #[test]
    fn tungstenite_connect_needs_a_runtime() {
        let connector = TungsteniteConnector::new();
        assert!(matches!(
            connector.connect(URL),
            Err(PoolError::Connect { .. })
        ));
    }
}
