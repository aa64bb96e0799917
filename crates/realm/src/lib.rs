//! **realm** -- an Elm Architecture runtime with declarative effects.
//!
//! This is the umbrella crate that re-exports everything you need to build a
//! realm application from a single dependency:
//!
//! ```toml
//! [dependencies]
//! realm = "0.1"
//! ```
//!
//! # Re-exports
//!
//! * All public items from [`realm_core`] are available at the crate root
//!   ([`Model`], [`Next`], [`Command`], [`Subscription`], [`Runtime`], etc.).
//! * The standard effect modules from [`realm_effects`] ([`http`],
//!   [`random`], [`time`], [`websocket`]) and [`standard_effects`].
//! * [`tokio`] is re-exported so downstream crates do not need to depend on
//!   it directly.
//!
//! # Quick start
//!
//! ```ignore
//! use realm::{random, Model, Next};
//!
//! struct Dice { face: i64 }
//!
//! enum Msg { Roll, Face(i64) }
//!
//! impl Model for Dice {
//!     type Message = Msg;
//!     type Flags = ();
//!
//!     fn init(_: ()) -> Next<Self> {
//!         Next::with(Dice { face: 1 }, random::generate(random::int(1, 6), Msg::Face))
//!     }
//!
//!     fn update(self, msg: Msg) -> Next<Self> {
//!         match msg {
//!             Msg::Roll => Next::with(self, random::generate(random::int(1, 6), Msg::Face)),
//!             Msg::Face(face) => Next::Bare(Dice { face }),
//!         }
//!     }
//! }
//!
//! #[realm::tokio::main]
//! async fn main() {
//!     let mut runtime = realm::standard_runtime::<Dice>((), Default::default()).unwrap();
//!     runtime.subscribe(|dice| println!("rolled {}", dice.face));
//!     runtime.start().unwrap();
//! }
//! ```

pub use realm_core::*;
pub use realm_effects::{
    http, random, standard_effects, time, websocket, HttpError, TungsteniteConnector,
};

// Re-export dependencies for use in demos and downstream crates
pub use tokio;

/// Build a runtime with every standard effect registered. WebSocket effects
/// share connections opened with [`TungsteniteConnector`].
pub fn standard_runtime<M: Model>(
    flags: M::Flags,
    options: RuntimeOptions,
) -> Result<Runtime<M>, RuntimeError> {
    let pool = ConnectionPool::new(TungsteniteConnector::new());
    let effects = standard_effects(pool)?;
    Ok(Runtime::with_options(flags, effects, options))
}

/// Run a realm application with default options.
///
/// The loop only ends when an effect failure halts it. To stop it from the
/// outside, build the runtime with [`standard_runtime`] and keep a
/// [`RuntimeHandle`].
pub async fn run<M: Model>(flags: M::Flags) -> Result<M, RuntimeError> {
    run_with(flags, RuntimeOptions::default()).await
}

/// Run with custom options.
pub async fn run_with<M: Model>(flags: M::Flags, options: RuntimeOptions) -> Result<M, RuntimeError> {
    tracing::debug!(?options, "running with standard effects");
    standard_runtime::<M>(flags, options)?.run().await
}
