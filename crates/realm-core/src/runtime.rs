use crate::command::{interpret, Command, CommandHandler, CommandRegistry};
use crate::dispatch::Dispatcher;
use crate::error::{EffectError, RegistryError, RuntimeError};
use crate::model::Model;
use crate::registry::{CommandTag, SubscriptionTag};
use crate::subscription::{SubscriptionFactory, SubscriptionManager, SubscriptionRegistry, SubscriptionState};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// The pair of effect registries a [`Runtime`] interprets against.
///
/// Both are built per runtime instance. Command tags and subscription tags
/// live in separate namespaces.
///
/// # Example
///
/// ```rust,ignore
/// let effects = Effects::new()
///     .command(random::GENERATE, RandomHandler::new())?
///     .subscription(time::EVERY, TimeFactory)?;
/// ```
pub struct Effects<Msg: Send + 'static> {
    /// Handlers for leaf commands.
    pub commands: CommandRegistry<Msg>,
    /// Factories for leaf subscriptions.
    pub subscriptions: SubscriptionRegistry<Msg>,
}

impl<Msg: Send + 'static> Effects<Msg> {
    /// Empty registries.
    pub fn new() -> Self {
        Self {
            commands: CommandRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
        }
    }

    /// Register a command handler for `tag`.
    pub fn command(
        mut self,
        tag: CommandTag,
        handler: impl CommandHandler<Msg>,
    ) -> Result<Self, RegistryError> {
        self.commands.register(tag, Box::new(handler))?;
        Ok(self)
    }

    /// Register a subscription factory for `tag`.
    pub fn subscription(
        mut self,
        tag: SubscriptionTag,
        factory: impl SubscriptionFactory<Msg>,
    ) -> Result<Self, RegistryError> {
        self.subscriptions.register(tag, Box::new(factory))?;
        Ok(self)
    }
}

impl<Msg: Send + 'static> Default for Effects<Msg> {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration options for a [`Runtime`].
///
/// All fields have sensible defaults (see [`Default`] impl). Use struct
/// update syntax to override only the options you need:
///
/// ```rust,ignore
/// let opts = RuntimeOptions {
///     drain_limit: 64,
///     ..RuntimeOptions::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Maximum number of queued messages one `dispatch` call processes after
    /// its own transition (default: 1024). Anything beyond stays queued for
    /// the run loop, which bounds chains of synchronously dispatching
    /// commands.
    pub drain_limit: usize,
    /// Whether [`Runtime::run`] exits with the error when an effect tag has no
    /// handler (default: true). Other effect failures are logged and the loop
    /// continues.
    pub halt_on_unknown_effect: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            drain_limit: 1024,
            halt_on_unknown_effect: true,
        }
    }
}

/// A cloneable handle to a [`Runtime`] for external control.
///
/// `RuntimeHandle` can be sent across threads or into async tasks. It can
/// inject messages and ask a running [`Runtime::run`] loop to stop.
pub struct RuntimeHandle<Msg: Send + 'static> {
    dispatch: Dispatcher<Msg>,
    stop: Arc<Notify>,
}

impl<Msg: Send + 'static> RuntimeHandle<Msg> {
    /// Send a message to the runtime. It is processed by the next
    /// `dispatch` drain or run-loop iteration. Returns silently if the
    /// runtime is gone.
    pub fn send(&self, msg: Msg) {
        let _ = self.dispatch.dispatch(msg);
    }

    /// Ask the run loop to exit. Subscriptions are cleaned up on the way out.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// The underlying dispatcher.
    pub fn dispatcher(&self) -> Dispatcher<Msg> {
        self.dispatch.clone()
    }
}

impl<Msg: Send + 'static> Clone for RuntimeHandle<Msg> {
    fn clone(&self) -> Self {
        Self {
            dispatch: self.dispatch.clone(),
            stop: self.stop.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

type Subscriber<M> = Box<dyn FnMut(&M) + Send>;

/// The message loop. Owns the model, interprets commands and manages the
/// subscription lifecycle.
///
/// Every transition happens synchronously inside [`dispatch`](Runtime::dispatch):
/// `update` consumes the current model, the result is adopted, its command is
/// started, and the subscriber is notified once. Effect handlers never touch
/// the runtime directly; they hold a [`Dispatcher`] that enqueues messages,
/// which `dispatch` then drains as a trampoline. Asynchronous completions
/// arrive on the same queue and are processed by [`run`](Runtime::run) or
/// [`process_next`](Runtime::process_next).
///
/// # Example
///
/// ```rust,ignore
/// use realm_core::{Effects, Runtime};
///
/// let mut runtime = Runtime::<Counter>::new((), Effects::new());
/// runtime.subscribe(|model| println!("count = {}", model.count));
/// runtime.start()?;
/// runtime.dispatch(Msg::Increment)?;
/// runtime.stop()?;
/// ```
pub struct Runtime<M: Model> {
    model: Option<M>,
    init_cmd: Option<Command<M::Message>>,
    commands: CommandRegistry<M::Message>,
    subscriptions: SubscriptionManager,
    subscriber: Option<Subscriber<M>>,
    msg_tx: Dispatcher<M::Message>,
    msg_rx: mpsc::UnboundedReceiver<M::Message>,
    stop: Arc<Notify>,
    options: RuntimeOptions,
    lifecycle: Lifecycle,
}

impl<M: Model> Runtime<M> {
    /// Create a runtime with default options.
    pub fn new(flags: M::Flags, effects: Effects<M::Message>) -> Self {
        Self::with_options(flags, effects, RuntimeOptions::default())
    }

    /// Create a runtime with custom options.
    ///
    /// Calls [`Model::init`] and builds (without starting) the handler tree
    /// for the initial model's subscriptions.
    pub fn with_options(
        flags: M::Flags,
        effects: Effects<M::Message>,
        options: RuntimeOptions,
    ) -> Self {
        let (tx, msg_rx) = mpsc::unbounded_channel();
        let msg_tx = Dispatcher::from_sender(tx);

        let (model, init_cmd) = M::init(flags).into_parts();
        let Effects {
            commands,
            subscriptions,
        } = effects;
        let subscriptions =
            SubscriptionManager::new(model.subscriptions(), &subscriptions, &msg_tx);

        Self {
            model: Some(model),
            init_cmd: (!init_cmd.is_none()).then_some(init_cmd),
            commands,
            subscriptions,
            subscriber: None,
            msg_tx,
            msg_rx,
            stop: Arc::new(Notify::new()),
            options,
            lifecycle: Lifecycle::Created,
        }
    }

    /// Set the change-notification callback, replacing any previous one.
    ///
    /// It is invoked once per processed message, after the model for that
    /// transition has been adopted and its command started.
    pub fn subscribe(&mut self, subscriber: impl FnMut(&M) + Send + 'static) {
        self.subscriber = Some(Box::new(subscriber));
    }

    /// The current model. `None` only if a previous `update` panicked.
    pub fn model(&self) -> Option<&M> {
        self.model.as_ref()
    }

    /// A dispatcher feeding this runtime's message queue.
    pub fn dispatcher(&self) -> Dispatcher<M::Message> {
        self.msg_tx.clone()
    }

    /// Get a handle for external control (send messages, stop the run loop).
    pub fn handle(&self) -> RuntimeHandle<M::Message> {
        RuntimeHandle {
            dispatch: self.msg_tx.clone(),
            stop: self.stop.clone(),
        }
    }

    /// Lifecycle state of the root subscription.
    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscriptions.state()
    }

    /// Interpret the initial command (if `init` returned one) and set up the
    /// root subscription. Allowed exactly once per runtime.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        if self.lifecycle != Lifecycle::Created {
            return Err(RuntimeError::AlreadyStarted);
        }
        self.lifecycle = Lifecycle::Running;
        tracing::debug!("starting runtime");

        let mut errors = match self.init_cmd.take() {
            Some(cmd) => self.execute(cmd),
            None => Vec::new(),
        };
        let subscribed = self.subscriptions.setup();
        self.drain(&mut errors)?;

        match subscribed {
            Ok(()) if errors.is_empty() => Ok(()),
            Ok(()) => Err(RuntimeError::Effects(errors)),
            Err(e) if errors.is_empty() => {
                tracing::error!(error = %e, "subscription setup failed");
                Err(RuntimeError::Subscriptions(e))
            }
            Err(e) => {
                tracing::error!(error = %e, failed = errors.len(), "init command and subscription setup failed");
                Err(RuntimeError::Start {
                    effects: errors,
                    subscriptions: e,
                })
            }
        }
    }

    /// Apply `msg` to the current model.
    ///
    /// The transition is always applied. If commands started by it (or by
    /// the messages drained after it) fail, they are returned as
    /// [`RuntimeError::Effects`]; failures of one command never prevent
    /// others from running.
    pub fn dispatch(&mut self, msg: M::Message) -> Result<(), RuntimeError> {
        let mut errors = Vec::new();
        self.transition(msg, &mut errors)?;
        self.drain(&mut errors)?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::Effects(errors))
        }
    }

    /// Wait for the next queued message (e.g. an async command completion or
    /// a subscription event) and dispatch it.
    pub async fn process_next(&mut self) -> Result<(), RuntimeError> {
        match self.msg_rx.recv().await {
            Some(msg) => self.dispatch(msg),
            None => Ok(()),
        }
    }

    /// Clean up the root subscription.
    ///
    /// A no-op if the runtime was never started or is already stopped.
    pub fn stop(&mut self) -> Result<(), RuntimeError> {
        if self.lifecycle != Lifecycle::Running {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Stopped;
        tracing::debug!("stopping runtime");
        self.subscriptions.cleanup().map_err(|e| {
            tracing::error!(error = %e, "subscription cleanup failed");
            RuntimeError::Subscriptions(e)
        })
    }

    /// Run the message loop until [`RuntimeHandle::stop`] is called.
    ///
    /// Starts the runtime if needed, then dispatches every queued message.
    /// Effect failures are logged and the loop continues, except unknown
    /// effect tags when [`RuntimeOptions::halt_on_unknown_effect`] is set.
    /// Returns the final model after cleaning up subscriptions.
    pub async fn run(mut self) -> Result<M, RuntimeError> {
        let result = self.event_loop().await;

        tracing::debug!("shutting down");
        let stopped = self.stop();
        result?;
        stopped?;
        self.model.take().ok_or(RuntimeError::Poisoned)
    }

    async fn event_loop(&mut self) -> Result<(), RuntimeError> {
        if self.lifecycle == Lifecycle::Created {
            if let Err(e) = self.start() {
                self.report(e)?;
            }
        }

        let stop = self.stop.clone();
        loop {
            tokio::select! {
                biased;

                _ = stop.notified() => {
                    tracing::debug!("stop requested");
                    return Ok(());
                }

                Some(msg) = self.msg_rx.recv() => {
                    if let Err(e) = self.dispatch(msg) {
                        self.report(e)?;
                    }
                }
            }
        }
    }

    /// Decide whether a failure ends the run loop.
    fn report(&self, e: RuntimeError) -> Result<(), RuntimeError> {
        let halt = match &e {
            RuntimeError::Effects(errors) => {
                self.options.halt_on_unknown_effect
                    && errors.iter().any(EffectError::is_unknown_effect)
            }
            RuntimeError::Subscriptions(error) => {
                self.options.halt_on_unknown_effect && error.is_unknown_effect()
            }
            RuntimeError::Start {
                effects,
                subscriptions,
            } => {
                self.options.halt_on_unknown_effect
                    && (subscriptions.is_unknown_effect()
                        || effects.iter().any(EffectError::is_unknown_effect))
            }
            RuntimeError::AlreadyStarted | RuntimeError::Poisoned | RuntimeError::Registry(_) => true,
        };
        if halt {
            tracing::error!(error = %e, "halting runtime");
            Err(e)
        } else {
            tracing::warn!(error = %e, "effect failed, continuing");
            Ok(())
        }
    }

    fn transition(
        &mut self,
        msg: M::Message,
        errors: &mut Vec<EffectError>,
    ) -> Result<(), RuntimeError> {
        let model = self.model.take().ok_or(RuntimeError::Poisoned)?;
        let (model, cmd) = model.update(msg).into_parts();
        self.model = Some(model);
        if !cmd.is_none() {
            errors.extend(self.execute(cmd));
        }
        self.notify();
        Ok(())
    }

    /// Process messages already waiting in the queue, up to the drain limit.
    fn drain(&mut self, errors: &mut Vec<EffectError>) -> Result<(), RuntimeError> {
        for _ in 0..self.options.drain_limit {
            match self.msg_rx.try_recv() {
                Ok(msg) => self.transition(msg, errors)?,
                Err(_) => return Ok(()),
            }
        }
        tracing::warn!(
            limit = self.options.drain_limit,
            "drain limit reached, deferring remaining messages"
        );
        Ok(())
    }

    fn execute(&self, cmd: Command<M::Message>) -> Vec<EffectError> {
        interpret(cmd, &self.commands, &self.msg_tx).spawn()
    }

    fn notify(&mut self) {
        if let (Some(subscriber), Some(model)) = (self.subscriber.as_mut(), self.model.as_ref()) {
            subscriber(model);
        }
    }
}
