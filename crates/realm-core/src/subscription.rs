use crate::command::Payload;
use crate::dispatch::Dispatcher;
use crate::error::EffectError;
use crate::registry::{Registry, SubscriptionTag};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

/// Registry of subscription factories, one per [`SubscriptionTag`].
pub type SubscriptionRegistry<Msg> = Registry<SubscriptionTag, Box<dyn SubscriptionFactory<Msg>>>;

/// A leaf subscription payload and the tag that routes it to its factory.
pub trait SubscriptionPayload<Msg>: Send + 'static {
    /// Tag of the factory that builds a handler for this payload.
    const TAG: SubscriptionTag;
}

/// A long-lived event source declared by [`Model::subscriptions`](crate::Model::subscriptions).
///
/// Like [`Command`](crate::Command), a subscription is data. The runtime
/// turns it into a tree of [`SubscriptionHandler`]s once, sets the tree up on
/// `start()` and tears it down on `stop()`.
pub struct Subscription<Msg> {
    inner: SubscriptionInner<Msg>,
    _msg: PhantomData<fn() -> Msg>,
}

enum SubscriptionInner<Msg> {
    None,
    Batch(Vec<Subscription<Msg>>),
    Leaf { tag: SubscriptionTag, payload: Payload },
}

impl<Msg: Send + 'static> Subscription<Msg> {
    fn from_inner(inner: SubscriptionInner<Msg>) -> Self {
        Subscription {
            inner,
            _msg: PhantomData,
        }
    }

    /// No subscription.
    pub fn none() -> Self {
        Self::from_inner(SubscriptionInner::None)
    }

    /// Several independent subscriptions, set up and torn down together.
    pub fn batch(subs: impl IntoIterator<Item = Subscription<Msg>>) -> Self {
        let mut subs: Vec<_> = subs.into_iter().collect();
        match subs.len() {
            0 => Subscription::none(),
            1 => subs.pop().unwrap_or_else(Subscription::none),
            _ => Self::from_inner(SubscriptionInner::Batch(subs)),
        }
    }

    /// A leaf subscription built by the factory registered for `P::TAG`.
    pub fn effect<P: SubscriptionPayload<Msg>>(payload: P) -> Self {
        Self::from_inner(SubscriptionInner::Leaf {
            tag: P::TAG,
            payload: Box::new(payload),
        })
    }

    /// Returns `true` if this is the empty subscription.
    pub fn is_none(&self) -> bool {
        matches!(self.inner, SubscriptionInner::None)
    }

    /// Tags of every leaf in this subscription tree, depth first.
    pub fn leaf_tags(&self) -> Vec<SubscriptionTag> {
        let mut tags = Vec::new();
        self.collect_tags(&mut tags);
        tags
    }

    fn collect_tags(&self, tags: &mut Vec<SubscriptionTag>) {
        match &self.inner {
            SubscriptionInner::None => {}
            SubscriptionInner::Batch(subs) => subs.iter().for_each(|sub| sub.collect_tags(tags)),
            SubscriptionInner::Leaf { tag, .. } => tags.push(*tag),
        }
    }
}

impl<Msg> fmt::Debug for Subscription<Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            SubscriptionInner::None => f.write_str("Subscription::None"),
            SubscriptionInner::Batch(subs) => {
                f.debug_tuple("Subscription::Batch").field(subs).finish()
            }
            SubscriptionInner::Leaf { tag, .. } => write!(f, "Subscription::Leaf({tag})"),
        }
    }
}

/// The live half of a subscription: a symmetric `setup`/`cleanup` pair.
///
/// `cleanup` must exactly reverse what `setup` created and must be safe to
/// call when nothing is active. Calling `setup` while already active should
/// fail with [`EffectError::AlreadyActive`] rather than registering twice.
pub trait SubscriptionHandler: Send {
    /// Acquire the external resource and start forwarding messages.
    fn setup(&mut self) -> Result<(), EffectError>;

    /// Stop forwarding messages and release what `setup` acquired.
    fn cleanup(&mut self) -> Result<(), EffectError>;
}

/// Builds a [`SubscriptionHandler`] for one leaf subscription tag.
pub trait SubscriptionFactory<Msg: Send + 'static>: Send + Sync + 'static {
    /// Create an inactive handler for `payload`. Must not start anything.
    fn create(
        &self,
        payload: Payload,
        dispatch: &Dispatcher<Msg>,
    ) -> Result<Box<dyn SubscriptionHandler>, EffectError>;
}

/// A [`SubscriptionFactory`] backed by a closure. See [`factory_fn`].
pub struct FactoryFn<F>(F);

/// Build a [`SubscriptionFactory`] from a closure.
pub fn factory_fn<Msg, F>(f: F) -> FactoryFn<F>
where
    Msg: Send + 'static,
    F: Fn(Payload, &Dispatcher<Msg>) -> Result<Box<dyn SubscriptionHandler>, EffectError>
        + Send
        + Sync
        + 'static,
{
    FactoryFn(f)
}

impl<Msg, F> SubscriptionFactory<Msg> for FactoryFn<F>
where
    Msg: Send + 'static,
    F: Fn(Payload, &Dispatcher<Msg>) -> Result<Box<dyn SubscriptionHandler>, EffectError>
        + Send
        + Sync
        + 'static,
{
    fn create(
        &self,
        payload: Payload,
        dispatch: &Dispatcher<Msg>,
    ) -> Result<Box<dyn SubscriptionHandler>, EffectError> {
        (self.0)(payload, dispatch)
    }
}

/// Build the handler tree for `sub`.
///
/// Batch members get one child handler each. A leaf whose tag is unknown (or
/// whose factory rejects its payload) becomes a handler that reports that
/// failure from `setup()`, so its siblings are still set up.
pub fn create_handler<Msg: Send + 'static>(
    sub: Subscription<Msg>,
    registry: &SubscriptionRegistry<Msg>,
    dispatch: &Dispatcher<Msg>,
) -> Box<dyn SubscriptionHandler> {
    match sub.inner {
        SubscriptionInner::None => Box::new(NoneHandler),
        SubscriptionInner::Batch(subs) => Box::new(BatchHandler {
            children: subs
                .into_iter()
                .map(|sub| create_handler(sub, registry, dispatch))
                .collect(),
        }),
        SubscriptionInner::Leaf { tag, payload } => {
            let created = registry
                .lookup(&tag)
                .map_err(EffectError::from)
                .and_then(|factory| factory.create(payload, dispatch));
            match created {
                Ok(handler) => handler,
                Err(error) => {
                    tracing::error!(tag = %tag, error = %error, "subscription cannot be built");
                    Box::new(UnresolvedHandler { error })
                }
            }
        }
    }
}

struct NoneHandler;

impl SubscriptionHandler for NoneHandler {
    fn setup(&mut self) -> Result<(), EffectError> {
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), EffectError> {
        Ok(())
    }
}

struct BatchHandler {
    children: Vec<Box<dyn SubscriptionHandler>>,
}

impl BatchHandler {
    fn each(
        &mut self,
        mut step: impl FnMut(&mut Box<dyn SubscriptionHandler>) -> Result<(), EffectError>,
    ) -> Result<(), EffectError> {
        // Every child runs; failures are collected, never short-circuited.
        let errors = self
            .children
            .iter_mut()
            .filter_map(|child| step(child).err())
            .flat_map(EffectError::flatten)
            .collect();
        EffectError::collect(errors)
    }
}

impl SubscriptionHandler for BatchHandler {
    fn setup(&mut self) -> Result<(), EffectError> {
        self.each(|child| child.setup())
    }

    fn cleanup(&mut self) -> Result<(), EffectError> {
        self.each(|child| child.cleanup())
    }
}

struct UnresolvedHandler {
    error: EffectError,
}

impl SubscriptionHandler for UnresolvedHandler {
    fn setup(&mut self) -> Result<(), EffectError> {
        Err(self.error.clone())
    }

    fn cleanup(&mut self) -> Result<(), EffectError> {
        Ok(())
    }
}

/// Lifecycle of a [`SubscriptionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Built but never set up.
    Uninitialized,
    /// `setup()` has run.
    Active,
    /// `cleanup()` has run.
    Inactive,
}

/// Owns the root handler tree and guards its lifecycle.
///
/// `uninitialized -> active -> inactive`. `cleanup()` outside the active
/// state is a no-op, and `setup()` while active fails with
/// [`EffectError::AlreadyActive`] instead of double-registering timers or
/// listeners. Setting up again after `cleanup()` is allowed.
pub struct SubscriptionManager {
    root: Box<dyn SubscriptionHandler>,
    state: SubscriptionState,
}

impl SubscriptionManager {
    /// Build the handler tree for `sub` without starting anything.
    pub fn new<Msg: Send + 'static>(
        sub: Subscription<Msg>,
        registry: &SubscriptionRegistry<Msg>,
        dispatch: &Dispatcher<Msg>,
    ) -> Self {
        Self {
            root: create_handler(sub, registry, dispatch),
            state: SubscriptionState::Uninitialized,
        }
    }

    /// Set up every subscription in the tree.
    ///
    /// On partial failure the manager is still active: members that did set
    /// up keep running until [`cleanup`](SubscriptionManager::cleanup).
    pub fn setup(&mut self) -> Result<(), EffectError> {
        if self.state == SubscriptionState::Active {
            return Err(EffectError::AlreadyActive { tag: "root".into() });
        }
        self.state = SubscriptionState::Active;
        tracing::debug!("setting up subscriptions");
        self.root.setup()
    }

    /// Tear down every subscription in the tree.
    pub fn cleanup(&mut self) -> Result<(), EffectError> {
        if self.state != SubscriptionState::Active {
            return Ok(());
        }
        self.state = SubscriptionState::Inactive;
        tracing::debug!("cleaning up subscriptions");
        self.root.cleanup()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "subscription cleanup failed on drop");
        }
    }
}

/// A switch shared between a subscription's background task and its
/// `cleanup()`.
///
/// The task delivers each message through [`pass`](Gate::pass) while holding
/// the gate's lock, and `cleanup()` [`close`](Gate::close)s it under the same
/// lock. Once `close` returns, no further message from that task can be
/// dispatched.
#[derive(Clone, Debug)]
pub struct Gate {
    open: Arc<Mutex<bool>>,
}

impl Gate {
    /// A new, open gate.
    pub fn new() -> Self {
        Self {
            open: Arc::new(Mutex::new(true)),
        }
    }

    /// Run `f` if the gate is still open.
    pub fn pass<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if *open {
            Some(f())
        } else {
            None
        }
    }

    /// Close the gate. Blocks until any in-flight [`pass`](Gate::pass) ends.
    pub fn close(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Whether the gate is still open.
    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
