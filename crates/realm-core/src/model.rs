use crate::command::Command;
use crate::subscription::Subscription;

/// The application trait, following the [Elm Architecture].
///
/// A `Model` is the complete application state. The runtime owns it and
/// replaces it wholesale on every transition:
///
/// 1. [`init`](Model::init) creates the initial state, optionally paired with
///    a [`Command`] for early side effects (e.g. fetching data).
/// 2. [`subscriptions`](Model::subscriptions) declares long-lived event
///    sources. It is consulted once, on the initial model.
/// 3. Every message is passed to [`update`](Model::update), which consumes
///    the current model and yields the next one, optionally with a command.
///
/// `update` must be pure: no I/O, total, and terminating. All side effects
/// go through commands and subscriptions.
///
/// # Example
///
/// ```rust,ignore
/// use realm_core::{Model, Next, Command};
///
/// struct Counter {
///     count: i32,
/// }
///
/// enum Msg {
///     Increment,
///     Decrement,
/// }
///
/// impl Model for Counter {
///     type Message = Msg;
///     type Flags = ();
///
///     fn init(_flags: ()) -> Next<Self> {
///         Next::Bare(Counter { count: 0 })
///     }
///
///     fn update(self, msg: Msg) -> Next<Self> {
///         match msg {
///             Msg::Increment => Next::Bare(Counter { count: self.count + 1 }),
///             Msg::Decrement => Next::Bare(Counter { count: self.count - 1 }),
///         }
///     }
/// }
/// ```
///
/// [Elm Architecture]: https://guide.elm-lang.org/architecture/
pub trait Model: Sized + Send + 'static {
    /// The application's message type.
    ///
    /// Messages arrive from the embedding layer through
    /// [`Runtime::dispatch`](crate::Runtime::dispatch), from command
    /// completions, and from subscriptions.
    type Message: Send + 'static;

    /// Initialization data passed to [`Model::init`].
    ///
    /// Use `()` when no startup data is needed.
    type Flags: Send + 'static;

    /// Create the initial model, bare or paired with a startup command.
    fn init(flags: Self::Flags) -> Next<Self>;

    /// Consume the current model and produce the next one.
    fn update(self, msg: Self::Message) -> Next<Self>;

    /// Declare the subscriptions that run while the runtime is started.
    ///
    /// The default implementation subscribes to nothing.
    fn subscriptions(&self) -> Subscription<Self::Message> {
        Subscription::none()
    }
}

/// Result of [`Model::init`] and [`Model::update`]: either a bare model, or a
/// model paired with a command for the runtime to interpret.
///
/// `Pair(model, Command::none())` behaves exactly like `Bare(model)`.
pub enum Next<M: Model> {
    /// A new model with no side effect.
    Bare(M),
    /// A new model and the command to run after adopting it.
    Pair(M, Command<M::Message>),
}

impl<M: Model> Next<M> {
    /// Pair `model` with `cmd`.
    pub fn with(model: M, cmd: Command<M::Message>) -> Self {
        Next::Pair(model, cmd)
    }

    /// The model half.
    pub fn model(&self) -> &M {
        match self {
            Next::Bare(model) | Next::Pair(model, _) => model,
        }
    }

    /// Split into model and command; a bare model yields [`Command::none`].
    pub fn into_parts(self) -> (M, Command<M::Message>) {
        match self {
            Next::Bare(model) => (model, Command::none()),
            Next::Pair(model, cmd) => (model, cmd),
        }
    }
}

impl<M: Model> From<(M, Command<M::Message>)> for Next<M> {
    fn from((model, cmd): (M, Command<M::Message>)) -> Self {
        Next::Pair(model, cmd)
    }
}
