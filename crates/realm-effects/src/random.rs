//! Uniform random integers.
//!
//! ```rust,ignore
//! Msg::Roll => Next::with(self, random::generate(random::int(1, 6), Msg::NewFace)),
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use realm_core::{
    downcast_payload, Command, CommandHandler, CommandPayload, CommandTag, Completion, Dispatcher,
    EffectError, Payload,
};
use std::sync::{Mutex, PoisonError};

/// Tag of the random generation command.
pub const GENERATE: CommandTag = CommandTag::new("random.generate");

/// An inclusive integer range to draw from. Build one with [`int`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generator {
    min: i64,
    max: i64,
}

/// Integers in `[min, max]`, both ends included.
pub fn int(min: i64, max: i64) -> Generator {
    Generator { min, max }
}

/// Payload of [`GENERATE`]: the range and the message constructor.
pub struct RandomGenerate<Msg> {
    /// Lower bound, inclusive.
    pub min: i64,
    /// Upper bound, inclusive.
    pub max: i64,
    to_msg: Box<dyn FnOnce(i64) -> Msg + Send>,
}

impl<Msg: Send + 'static> CommandPayload<Msg> for RandomGenerate<Msg> {
    const TAG: CommandTag = GENERATE;
}

/// Draw one value from `generator` and dispatch `to_msg(value)`.
///
/// The draw happens synchronously while the command is interpreted, so the
/// resulting message is processed within the same `dispatch` call.
pub fn generate<Msg: Send + 'static>(
    generator: Generator,
    to_msg: impl FnOnce(i64) -> Msg + Send + 'static,
) -> Command<Msg> {
    Command::effect(RandomGenerate {
        min: generator.min,
        max: generator.max,
        to_msg: Box::new(to_msg),
    })
}

/// Handler for [`GENERATE`].
///
/// Draws from the thread-local generator unless built with
/// [`seeded`](RandomHandler::seeded).
#[derive(Debug, Default)]
pub struct RandomHandler {
    seeded: Option<Mutex<StdRng>>,
}

impl RandomHandler {
    /// A handler backed by the thread-local generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler with a reproducible sequence.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seeded: Some(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    fn draw(&self, min: i64, max: i64) -> i64 {
        match &self.seeded {
            Some(rng) => rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .random_range(min..=max),
            None => rand::rng().random_range(min..=max),
        }
    }
}

impl<Msg: Send + 'static> CommandHandler<Msg> for RandomHandler {
    fn handle(&self, payload: Payload, dispatch: &Dispatcher<Msg>) -> Result<Completion, EffectError> {
        let RandomGenerate { min, max, to_msg } =
            downcast_payload::<RandomGenerate<Msg>>(GENERATE, payload)?;
        if max < min {
            return Err(EffectError::InvalidPayload {
                tag: GENERATE.to_string(),
                reason: format!("max {max} is below min {min}"),
            });
        }
        let value = self.draw(min, max);
        tracing::trace!(min, max, value, "random draw");
        dispatch.dispatch(to_msg(value));
        Ok(Completion::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realm_core::{interpret, CommandRegistry, RegistryError};

    fn registry(handler: RandomHandler) -> CommandRegistry<i64> {
        CommandRegistry::new().with(GENERATE, Box::new(handler)).unwrap()
    }

    fn roll(registry: &CommandRegistry<i64>, generator: Generator) -> Result<Vec<i64>, Vec<EffectError>> {
        let (dispatch, mut rx) = Dispatcher::channel();
        let errors = interpret(generate(generator, |n| n), registry, &dispatch).spawn();
        if !errors.is_empty() {
            return Err(errors);
        }
        let mut seen = Vec::new();
        while let Ok(value) = rx.try_recv() {
            seen.push(value);
        }
        Ok(seen)
    }

    #[test]
    fn equal_bounds_always_yield_that_value() {
        let registry = registry(RandomHandler::new());
        for _ in 0..50 {
            assert_eq!(roll(&registry, int(3, 3)).unwrap(), vec![3]);
        }
    }

    #[test]
    fn inverted_bounds_are_rejected_without_dispatch() {
        let registry = registry(RandomHandler::new());
        let errors = roll(&registry, int(6, 1)).unwrap_err();
        assert!(matches!(
            errors.as_slice(),
            [EffectError::InvalidPayload { tag, .. }] if tag == "random.generate"
        ));
    }

    #[test]
    fn dice_rolls_are_roughly_uniform() {
        let registry = registry(RandomHandler::seeded(7));
        let mut faces = [0usize; 6];
        for _ in 0..6000 {
            let value = roll(&registry, int(1, 6)).unwrap()[0];
            assert!((1..=6).contains(&value), "out of range: {value}");
            faces[(value - 1) as usize] += 1;
        }
        for (face, count) in faces.iter().enumerate() {
            assert!(
                (800..=1200).contains(count),
                "face {} drawn {count} times",
                face + 1
            );
        }
    }

    #[test]
    fn seeded_handlers_repeat_their_sequence() {
        let a = registry(RandomHandler::seeded(42));
        let b = registry(RandomHandler::seeded(42));
        let draws = |registry: &CommandRegistry<i64>| -> Vec<i64> {
            (0..20).flat_map(|_| roll(registry, int(0, 1000)).unwrap()).collect()
        };
        assert_eq!(draws(&a), draws(&b));
    }

    #[test]
    fn unregistered_generate_is_an_unknown_tag() {
        let registry = CommandRegistry::new();
        let errors = roll(&registry, int(1, 6)).unwrap_err();
        assert_eq!(
            errors,
            vec![EffectError::Registry(RegistryError::UnknownTag("random.generate".into()))]
        );
    }
}
