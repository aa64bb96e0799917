//! Error types for the registry, effects, the connection pool and the runtime.

use thiserror::Error;

/// Errors raised by a [`Registry`](crate::registry::Registry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A handler is already registered for this tag in this registry.
    #[error("a handler for `{0}` is already registered")]
    DuplicateTag(String),

    /// No handler is registered for this tag.
    #[error("unknown effect `{0}`")]
    UnknownTag(String),
}

/// Errors raised by the shared [`ConnectionPool`](crate::pool::ConnectionPool)
/// and the sockets it hands out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The connector refused to open a connection for this key.
    #[error("failed to connect to {key}: {reason}")]
    Connect {
        /// Resource key (usually a URL).
        key: String,
        /// Connector-provided cause.
        reason: String,
    },

    /// Writing a frame to the connection failed.
    #[error("failed to send on {key}: {reason}")]
    Send {
        /// Resource key (usually a URL).
        key: String,
        /// Transport-provided cause.
        reason: String,
    },

    /// The connection has already been closed.
    #[error("connection to {0} is closed")]
    Closed(String),
}

/// A failure to run a single command or subscription effect.
///
/// These never escape as panics: the interpreter collects them per leaf and
/// the runtime surfaces them through [`RuntimeError::Effects`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    /// The effect tag has no handler, or a tag was registered twice.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The payload attached to a tag is not the type its handler expects.
    #[error("payload for `{tag}` does not match its handler")]
    PayloadMismatch {
        /// Effect tag.
        tag: String,
    },

    /// The payload violates the contract of its handler.
    #[error("invalid payload for `{tag}`: {reason}")]
    InvalidPayload {
        /// Effect tag.
        tag: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The effect needs an async executor but no tokio runtime is current.
    #[error("`{tag}` needs a tokio runtime but none is running")]
    NoExecutor {
        /// Effect tag.
        tag: String,
    },

    /// The task running an asynchronous effect panicked. Sibling effects
    /// were unaffected.
    #[error("`{tag}` panicked while running")]
    Panicked {
        /// Effect tag.
        tag: String,
    },

    /// `setup()` was called on a subscription that is already active.
    #[error("subscription `{tag}` is already active")]
    AlreadyActive {
        /// Subscription tag, or `root` for the manager itself.
        tag: String,
    },

    /// The shared connection pool failed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// One or more members of a batch failed. Siblings still ran.
    #[error("{} batch member(s) failed", .0.len())]
    Batch(Vec<EffectError>),
}

impl EffectError {
    /// Flatten nested [`EffectError::Batch`] failures into a single list.
    pub fn flatten(self) -> Vec<EffectError> {
        match self {
            EffectError::Batch(errors) => errors.into_iter().flat_map(Self::flatten).collect(),
            other => vec![other],
        }
    }

    /// Returns `true` if this error (or any batch member) is an unknown tag.
    pub fn is_unknown_effect(&self) -> bool {
        match self {
            EffectError::Registry(RegistryError::UnknownTag(_)) => true,
            EffectError::Batch(errors) => errors.iter().any(Self::is_unknown_effect),
            _ => false,
        }
    }

    /// Collapse a list of failures into `Ok(())`, a single error, or a batch.
    pub(crate) fn collect(mut errors: Vec<EffectError>) -> Result<(), EffectError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(EffectError::Batch(errors)),
        }
    }
}

/// Errors returned by [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// `start()` was called more than once.
    #[error("runtime already started")]
    AlreadyStarted,

    /// A previous `update` panicked and the model was lost.
    #[error("runtime model was lost by a panicking update")]
    Poisoned,

    /// Commands started by this dispatch failed. The transition itself
    /// was applied.
    #[error("{} effect(s) failed: {}", .0.len(), summarize(.0))]
    Effects(Vec<EffectError>),

    /// Subscription setup or cleanup failed.
    #[error("subscription lifecycle failed: {0}")]
    Subscriptions(EffectError),

    /// On start, both the initial command and subscription setup failed.
    #[error(
        "{} effect(s) failed: {}; subscription lifecycle failed: {subscriptions}",
        .effects.len(),
        summarize(.effects)
    )]
    Start {
        /// Failures of the initial command and the messages it drained.
        effects: Vec<EffectError>,
        /// Failure of subscription setup.
        subscriptions: EffectError,
    },

    /// Building the effect registries failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn summarize(errors: &[EffectError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
