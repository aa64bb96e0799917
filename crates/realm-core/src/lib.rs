//! Core runtime for the **realm** effect engine.
//!
//! `realm-core` provides the traits, types and runtime that drive a realm
//! application. The design follows the [Elm Architecture]: the program is a
//! pure **init -> update** cycle over an immutable model, with every side
//! effect described as data through [`Command`]s and [`Subscription`]s and
//! carried out by handlers registered per runtime.
//!
//! # Key types
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Model`] | Top-level application trait (init / update / subscriptions) |
//! | [`Command`] | Describes a one-shot side effect: none, batch or a tagged leaf |
//! | [`Subscription`] | Describes a long-lived event source with setup / cleanup |
//! | [`Effects`] | The command and subscription registries for one runtime |
//! | [`Runtime`] | Owns the model, dispatches messages, interprets effects |
//! | [`Dispatcher`] | Cloneable sender handlers use to feed messages back |
//! | [`ConnectionPool`] | Reference-counted sharing of external connections |
//!
//! # Architecture
//!
//! 1. **init** -- [`Model::init`] creates the initial state and may pair it
//!    with a [`Command`].
//! 2. **start** -- [`Runtime::start`] interprets that command and sets up the
//!    initial model's [`Subscription`] tree.
//! 3. **dispatch** -- every message is passed to [`Model::update`]; the new
//!    model is adopted, its command interpreted, and the subscriber notified
//!    exactly once.
//! 4. **drain** -- messages that handlers dispatched while the transition ran
//!    are processed in FIFO order before `dispatch` returns.
//! 5. **stop** -- [`Runtime::stop`] cleans up the subscription tree.
//!
//! # Quick example
//!
//! ```ignore
//! use realm_core::{Effects, Model, Next, Runtime};
//!
//! struct Counter { count: i32 }
//!
//! enum Msg { Increment }
//!
//! impl Model for Counter {
//!     type Message = Msg;
//!     type Flags = ();
//!
//!     fn init(_flags: ()) -> Next<Self> {
//!         Next::Bare(Counter { count: 0 })
//!     }
//!
//!     fn update(self, msg: Msg) -> Next<Self> {
//!         match msg {
//!             Msg::Increment => Next::Bare(Counter { count: self.count + 1 }),
//!         }
//!     }
//! }
//!
//! let mut runtime = Runtime::<Counter>::new((), Effects::new());
//! runtime.subscribe(|model| println!("count = {}", model.count));
//! runtime.start()?;
//! runtime.dispatch(Msg::Increment)?;
//! ```
//!
//! [Elm Architecture]: https://guide.elm-lang.org/architecture/

pub mod command;
pub mod dispatch;
pub mod error;
pub mod fp;
pub mod model;
pub mod pool;
pub mod registry;
pub mod runtime;
pub mod subscription;
pub mod testing;

pub use command::{
    downcast_payload, handler_fn, interpret, Command, CommandHandler, CommandPayload,
    CommandRegistry, Completion, Interpretation, Payload,
};
pub use dispatch::Dispatcher;
pub use error::{EffectError, PoolError, RegistryError, RuntimeError};
pub use fp::Cata;
pub use model::{Model, Next};
pub use pool::{ConnectionPool, Connector, Lease, Socket};
pub use registry::{CommandTag, Registry, SubscriptionTag};
pub use runtime::{Effects, Runtime, RuntimeHandle, RuntimeOptions};
pub use subscription::{
    factory_fn, Gate, Subscription, SubscriptionFactory, SubscriptionHandler,
    SubscriptionManager, SubscriptionPayload, SubscriptionRegistry, SubscriptionState,
};
