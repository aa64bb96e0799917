//! Standard effects for realm applications.
//!
//! | Module | Tag | Kind |
//! |--------|-----|------|
//! | [`http`] | `http.send` | command: GET a URL, decode JSON, transform |
//! | [`random`] | `random.generate` | command: uniform integer in `[min, max]` |
//! | [`websocket`] | `websocket.send` | command: send a text frame |
//! | [`time`] | `time.every` | subscription: recurring tick |
//! | [`websocket`] | `websocket.listen` | subscription: inbound text frames |
//!
//! [`standard_effects`] registers all of them for one runtime.

pub mod http;
pub mod random;
pub mod time;
pub mod websocket;

use realm_core::{ConnectionPool, Effects, RegistryError};
use std::sync::Arc;

pub use http::{HttpError, HttpHandler};
pub use random::RandomHandler;
pub use time::TimeFactory;
pub use websocket::{ListenFactory, SendHandler, TungsteniteConnector};

/// Registries holding every standard handler. WebSocket sends and listeners
/// share connections through `pool`.
pub fn standard_effects<Msg: Send + 'static>(
    pool: Arc<ConnectionPool>,
) -> Result<Effects<Msg>, RegistryError> {
    Effects::new()
        .command(http::SEND, HttpHandler::new())?
        .command(random::GENERATE, RandomHandler::new())?
        .command(websocket::SEND, SendHandler::new(pool.clone()))?
        .subscription(time::EVERY, TimeFactory)?
        .subscription(websocket::LISTEN, ListenFactory::new(pool))
}
