use crate::dispatch::Dispatcher;
use crate::error::EffectError;
use crate::registry::{CommandTag, Registry};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;

/// Type-erased leaf payload. Each handler downcasts it to the schema it
/// declared for its tag.
pub type Payload = Box<dyn Any + Send>;

/// Registry of command handlers, one per [`CommandTag`].
pub type CommandRegistry<Msg> = Registry<CommandTag, Box<dyn CommandHandler<Msg>>>;

/// A leaf command payload and the tag that routes it to its handler.
///
/// Implemented by the parameter structs of leaf commands, e.g. an HTTP
/// request carrying its URL and response mapper.
pub trait CommandPayload<Msg>: Send + 'static {
    /// Tag of the handler that interprets this payload.
    const TAG: CommandTag;
}

/// A side effect returned alongside a new model from
/// [`Model::update`](crate::Model::update) or [`Model::init`](crate::Model::init).
///
/// Commands are data: they describe work and are interpreted by the
/// runtime against its [`CommandRegistry`]. A command is one of
///
/// * [`none`](Command::none) -- no effect,
/// * [`batch`](Command::batch) -- members run concurrently and independently,
/// * a leaf [`effect`](Command::effect) -- routed to the handler for its tag.
///
/// # Examples
///
/// ```rust,ignore
/// // Do nothing:
/// let cmd = Command::none();
///
/// // Roll a die and fetch a gif at the same time:
/// let cmd = Command::batch([
///     random::generate(random::int(1, 6), Msg::NewFace),
///     http::send(http::get(url, decode_gif), Msg::NewGif),
/// ]);
/// ```
pub struct Command<Msg> {
    pub(crate) inner: CommandInner<Msg>,
    _msg: PhantomData<fn() -> Msg>,
}

pub(crate) enum CommandInner<Msg> {
    None,
    Batch(Vec<Command<Msg>>),
    Effect { tag: CommandTag, payload: Payload },
}

impl<Msg: Send + 'static> Command<Msg> {
    fn from_inner(inner: CommandInner<Msg>) -> Self {
        Command {
            inner,
            _msg: PhantomData,
        }
    }

    /// No-op command.
    pub fn none() -> Self {
        Self::from_inner(CommandInner::None)
    }

    /// Run multiple commands concurrently.
    ///
    /// An empty batch is [`none`](Command::none) and a single-member batch
    /// is that member.
    pub fn batch(cmds: impl IntoIterator<Item = Command<Msg>>) -> Self {
        let mut cmds: Vec<_> = cmds.into_iter().collect();
        match cmds.len() {
            0 => Command::none(),
            1 => cmds.pop().unwrap_or_else(Command::none),
            _ => Self::from_inner(CommandInner::Batch(cmds)),
        }
    }

    /// A leaf command interpreted by the handler registered for `P::TAG`.
    pub fn effect<P: CommandPayload<Msg>>(payload: P) -> Self {
        Self::from_inner(CommandInner::Effect {
            tag: P::TAG,
            payload: Box::new(payload),
        })
    }

    // --- Inspection methods (useful for testing) ---

    /// Returns `true` if this is a no-op command.
    pub fn is_none(&self) -> bool {
        matches!(self.inner, CommandInner::None)
    }

    /// The tag of a leaf command.
    pub fn tag(&self) -> Option<CommandTag> {
        match self.inner {
            CommandInner::Effect { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// Tags of every leaf in this command tree, depth first.
    pub fn leaf_tags(&self) -> Vec<CommandTag> {
        let mut tags = Vec::new();
        self.collect_tags(&mut tags);
        tags
    }

    fn collect_tags(&self, tags: &mut Vec<CommandTag>) {
        match &self.inner {
            CommandInner::None => {}
            CommandInner::Batch(cmds) => cmds.iter().for_each(|cmd| cmd.collect_tags(tags)),
            CommandInner::Effect { tag, .. } => tags.push(*tag),
        }
    }

    /// If this command is a batch, return the inner commands.
    pub fn into_batch(self) -> Option<Vec<Command<Msg>>> {
        match self.inner {
            CommandInner::Batch(cmds) => Some(cmds),
            _ => None,
        }
    }
}

impl<Msg> fmt::Debug for Command<Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            CommandInner::None => f.write_str("Command::None"),
            CommandInner::Batch(cmds) => f.debug_tuple("Command::Batch").field(cmds).finish(),
            CommandInner::Effect { tag, .. } => write!(f, "Command::Effect({tag})"),
        }
    }
}

/// How a leaf handler finished starting its effect.
pub enum Completion {
    /// The effect ran to completion inside the handler call.
    Ready,
    /// The effect continues asynchronously; the runtime spawns the future.
    Pending(BoxFuture<'static, ()>),
}

impl Completion {
    /// Wrap a future as a pending completion.
    pub fn pending(future: impl std::future::Future<Output = ()> + Send + 'static) -> Self {
        Completion::Pending(Box::pin(future))
    }
}

/// Interprets one leaf command tag.
///
/// `handle` is called synchronously by the interpreter with the payload that
/// was attached to the command and the runtime's [`Dispatcher`]. Work that
/// finishes immediately (e.g. a random draw) dispatches and returns
/// [`Completion::Ready`]; asynchronous work returns its future as
/// [`Completion::Pending`]. Recoverable failures of the effect itself must be
/// turned into messages; `Err` is reserved for contract violations such as a
/// payload of the wrong type.
pub trait CommandHandler<Msg: Send + 'static>: Send + Sync + 'static {
    /// Start the effect described by `payload`.
    fn handle(&self, payload: Payload, dispatch: &Dispatcher<Msg>) -> Result<Completion, EffectError>;
}

/// A [`CommandHandler`] backed by a closure. See [`handler_fn`].
pub struct HandlerFn<F>(F);

/// Build a [`CommandHandler`] from a closure.
pub fn handler_fn<Msg, F>(f: F) -> HandlerFn<F>
where
    Msg: Send + 'static,
    F: Fn(Payload, &Dispatcher<Msg>) -> Result<Completion, EffectError> + Send + Sync + 'static,
{
    HandlerFn(f)
}

impl<Msg, F> CommandHandler<Msg> for HandlerFn<F>
where
    Msg: Send + 'static,
    F: Fn(Payload, &Dispatcher<Msg>) -> Result<Completion, EffectError> + Send + Sync + 'static,
{
    fn handle(&self, payload: Payload, dispatch: &Dispatcher<Msg>) -> Result<Completion, EffectError> {
        (self.0)(payload, dispatch)
    }
}

/// Recover the concrete payload a handler registered for `tag` expects.
pub fn downcast_payload<P: 'static>(tag: impl fmt::Display, payload: Payload) -> Result<P, EffectError> {
    payload
        .downcast::<P>()
        .map(|payload| *payload)
        .map_err(|_| EffectError::PayloadMismatch {
            tag: tag.to_string(),
        })
}

/// An asynchronous leaf effect that has been started but not yet settled.
pub struct PendingEffect {
    /// Tag of the leaf that produced it.
    pub tag: CommandTag,
    /// The remaining work.
    pub future: BoxFuture<'static, ()>,
}

/// Result of interpreting a command tree.
///
/// Every leaf handler has already been invoked. Synchronous failures are in
/// [`errors`](Interpretation::errors); asynchronous work is in the pending
/// list and must be [`spawn`](Interpretation::spawn)ed or
/// [`settle`](Interpretation::settle)d to run.
#[derive(Default)]
pub struct Interpretation {
    pending: Vec<PendingEffect>,
    errors: Vec<EffectError>,
}

impl Interpretation {
    /// Whether nothing remains to run.
    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of asynchronous leaves still to run.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Failures raised while invoking leaf handlers.
    pub fn errors(&self) -> &[EffectError] {
        &self.errors
    }

    /// Spawn every pending leaf as an independent task on the current tokio
    /// runtime (fire-and-forget) and return the collected failures.
    ///
    /// A leaf that panics later is logged as [`EffectError::Panicked`]. With
    /// no runtime available each pending leaf fails with
    /// [`EffectError::NoExecutor`].
    pub fn spawn(self) -> Vec<EffectError> {
        let Interpretation { pending, mut errors } = self;
        if pending.is_empty() {
            return errors;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for effect in pending {
                    tracing::trace!(tag = %effect.tag, "spawning command");
                    handle.spawn(async move {
                        let _ = guarded(effect.tag, effect.future).await;
                    });
                }
            }
            Err(_) => errors.extend(pending.into_iter().map(|effect| EffectError::NoExecutor {
                tag: effect.tag.to_string(),
            })),
        }
        errors
    }

    /// Run every pending leaf concurrently and wait until all of them have
    /// completed. A panicking leaf is reported as
    /// [`EffectError::Panicked`] without affecting its siblings.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn settle(self) -> Vec<EffectError> {
        let Interpretation { pending, mut errors } = self;
        let tasks: Vec<_> = pending
            .into_iter()
            .map(|effect| (effect.tag, tokio::spawn(guarded(effect.tag, effect.future))))
            .collect();
        for (tag, task) in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => {
                    tracing::error!(tag = %tag, error = %e, "command task failed");
                    errors.push(EffectError::Panicked {
                        tag: tag.to_string(),
                    });
                }
            }
        }
        errors
    }
}

/// Run one leaf, turning a panic into [`EffectError::Panicked`].
async fn guarded(tag: CommandTag, future: BoxFuture<'static, ()>) -> Result<(), EffectError> {
    AssertUnwindSafe(future).catch_unwind().await.map_err(|panic| {
        tracing::error!(tag = %tag, panic = panic_message(panic.as_ref()), "command panicked");
        EffectError::Panicked {
            tag: tag.to_string(),
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Interpret `cmd` against `registry`.
///
/// * `none` completes immediately and dispatches nothing.
/// * `batch` interprets every member; a failing member never prevents its
///   siblings from running.
/// * a leaf is routed to the handler for its tag. An unknown tag is reported
///   as [`RegistryError::UnknownTag`](crate::RegistryError::UnknownTag), never
///   dropped.
pub fn interpret<Msg: Send + 'static>(
    cmd: Command<Msg>,
    registry: &CommandRegistry<Msg>,
    dispatch: &Dispatcher<Msg>,
) -> Interpretation {
    let mut interpretation = Interpretation::default();
    interpret_into(cmd, registry, dispatch, &mut interpretation);
    interpretation
}

fn interpret_into<Msg: Send + 'static>(
    cmd: Command<Msg>,
    registry: &CommandRegistry<Msg>,
    dispatch: &Dispatcher<Msg>,
    out: &mut Interpretation,
) {
    match cmd.inner {
        CommandInner::None => {}
        CommandInner::Batch(cmds) => {
            for cmd in cmds {
                interpret_into(cmd, registry, dispatch, out);
            }
        }
        CommandInner::Effect { tag, payload } => {
            let started = registry
                .lookup(&tag)
                .map_err(EffectError::from)
                .and_then(|handler| handler.handle(payload, dispatch));
            match started {
                Ok(Completion::Ready) => {}
                Ok(Completion::Pending(future)) => out.pending.push(PendingEffect { tag, future }),
                Err(e) => {
                    tracing::error!(tag = %tag, error = %e, "command failed to start");
                    out.errors.push(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const ECHO: CommandTag = CommandTag::new("test.echo");
    const LATER: CommandTag = CommandTag::new("test.later");

    struct Echo(i32);

    impl CommandPayload<i32> for Echo {
        const TAG: CommandTag = ECHO;
    }

    struct Later {
        delay: Duration,
        value: i32,
    }

    impl CommandPayload<i32> for Later {
        const TAG: CommandTag = LATER;
    }

    fn registry(calls: Arc<AtomicUsize>) -> CommandRegistry<i32> {
        let echo_calls = calls.clone();
        let mut registry = CommandRegistry::new();
        registry
            .register(
                ECHO,
                Box::new(handler_fn(move |payload, dispatch: &Dispatcher<i32>| {
                    echo_calls.fetch_add(1, Ordering::SeqCst);
                    let Echo(value) = downcast_payload::<Echo>(ECHO, payload)?;
                    dispatch.dispatch(value);
                    Ok(Completion::Ready)
                })),
            )
            .unwrap();
        registry
            .register(
                LATER,
                Box::new(handler_fn(move |payload, dispatch: &Dispatcher<i32>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let later: Later = downcast_payload(LATER, payload)?;
                    let dispatch = dispatch.clone();
                    Ok(Completion::pending(async move {
                        tokio::time::sleep(later.delay).await;
                        dispatch.dispatch(later.value);
                    }))
                })),
            )
            .unwrap();
        registry
    }

    #[test]
    fn command_none_is_none() {
        let cmd: Command<()> = Command::none();
        assert!(cmd.is_none());
        assert!(cmd.tag().is_none());
    }

    #[test]
    fn command_batch_empty_returns_none() {
        let cmd: Command<i32> = Command::batch(vec![]);
        assert!(cmd.is_none());
    }

    #[test]
    fn command_batch_single_unwraps() {
        let cmd: Command<i32> = Command::batch(vec![Command::effect(Echo(1))]);
        assert_eq!(cmd.tag(), Some(ECHO));
    }

    #[test]
    fn command_batch_multiple() {
        let cmd: Command<i32> = Command::batch(vec![
            Command::effect(Echo(1)),
            Command::batch([Command::effect(Echo(2)), Command::effect(Later { delay: Duration::ZERO, value: 3 })]),
        ]);
        assert_eq!(cmd.leaf_tags(), vec![ECHO, ECHO, LATER]);
        assert_eq!(cmd.into_batch().map(|cmds| cmds.len()), Some(2));
    }

    #[test]
    fn interpret_none_dispatches_nothing() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let result = interpret(Command::none(), &registry(calls.clone()), &dispatch);
        assert!(result.is_settled());
        assert!(result.errors().is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn interpret_leaf_invokes_handler() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let result = interpret(Command::effect(Echo(7)), &registry(calls.clone()), &dispatch);
        assert!(result.is_settled());
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_tag_is_reported_and_siblings_still_run() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let mut registry = CommandRegistry::new();
        registry
            .register(
                ECHO,
                Box::new(handler_fn(|payload, dispatch: &Dispatcher<i32>| {
                    let Echo(value) = downcast_payload::<Echo>(ECHO, payload)?;
                    dispatch.dispatch(value);
                    Ok(Completion::Ready)
                })),
            )
            .unwrap();

        let cmd = Command::batch([
            Command::effect(Later { delay: Duration::ZERO, value: 1 }),
            Command::effect(Echo(2)),
        ]);
        let result = interpret(cmd, &registry, &dispatch);
        assert_eq!(
            result.errors(),
            &[EffectError::Registry(RegistryError::UnknownTag("test.later".into()))]
        );
        assert_eq!(rx.try_recv().unwrap(), 2);
    }

    #[test]
    fn payload_mismatch_is_reported() {
        const WRONG: CommandTag = CommandTag::new("test.wrong");
        struct Wrong;
        impl CommandPayload<i32> for Wrong {
            const TAG: CommandTag = WRONG;
        }

        let (dispatch, _rx) = Dispatcher::channel();
        let mut registry = CommandRegistry::new();
        registry
            .register(
                WRONG,
                Box::new(handler_fn(|payload, _: &Dispatcher<i32>| {
                    let Echo(_) = downcast_payload::<Echo>(WRONG, payload)?;
                    Ok(Completion::Ready)
                })),
            )
            .unwrap();
        let result = interpret(Command::effect(Wrong), &registry, &dispatch);
        assert_eq!(
            result.errors(),
            &[EffectError::PayloadMismatch { tag: "test.wrong".into() }]
        );
    }

    #[test]
    fn spawn_without_runtime_reports_no_executor() {
        let (dispatch, _rx) = Dispatcher::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let cmd = Command::effect(Later { delay: Duration::ZERO, value: 1 });
        let errors = interpret(cmd, &registry(calls), &dispatch).spawn();
        assert_eq!(errors, vec![EffectError::NoExecutor { tag: "test.later".into() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_members_each_run_once_regardless_of_completion_order() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let cmd = Command::batch([
            Command::effect(Later { delay: Duration::from_millis(50), value: 1 }),
            Command::effect(Later { delay: Duration::from_millis(10), value: 2 }),
        ]);

        let result = interpret(cmd, &registry(calls.clone()), &dispatch);
        assert_eq!(result.pending_count(), 2);
        assert!(result.settle().await.is_empty());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let mut got = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        got.sort();
        assert_eq!(got, vec![1, 2]);
        assert!(rx.try_recv().is_err());
    }

    const BOOM: CommandTag = CommandTag::new("test.boom");

    struct Boom;

    impl CommandPayload<i32> for Boom {
        const TAG: CommandTag = BOOM;
    }

    fn registry_with_boom() -> CommandRegistry<i32> {
        let mut registry = registry(Arc::new(AtomicUsize::new(0)));
        registry
            .register(
                BOOM,
                Box::new(handler_fn(|_, _: &Dispatcher<i32>| {
                    Ok(Completion::pending(async { panic!("boom") }))
                })),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn panicking_member_does_not_block_siblings() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let cmd = Command::batch([
            Command::effect(Boom),
            Command::effect(Later { delay: Duration::ZERO, value: 5 }),
        ]);
        let errors = interpret(cmd, &registry_with_boom(), &dispatch).settle().await;
        assert_eq!(errors, vec![EffectError::Panicked { tag: "test.boom".into() }]);
        assert_eq!(rx.try_recv().unwrap(), 5);
    }

    #[tokio::test]
    async fn spawned_panic_is_contained_and_siblings_complete() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let cmd = Command::batch([
            Command::effect(Boom),
            Command::effect(Later { delay: Duration::ZERO, value: 6 }),
        ]);
        let errors = interpret(cmd, &registry_with_boom(), &dispatch).spawn();
        assert!(errors.is_empty());

        let value = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(value, Some(6));
    }

    #[tokio::test]
    async fn guarded_leaf_reports_its_panic() {
        let result = guarded(BOOM, Box::pin(async { panic!("kaboom") })).await;
        assert_eq!(result, Err(EffectError::Panicked { tag: "test.boom".into() }));
        assert_eq!(guarded(BOOM, Box::pin(async {})).await, Ok(()));
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let literal: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(literal.as_ref()), "static");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
