use crate::error::RegistryError;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Discriminant of a leaf [`Command`](crate::Command).
///
/// Command tags and [`SubscriptionTag`]s are distinct types, so the two
/// registries can never be confused with each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandTag(&'static str);

impl CommandTag {
    /// Create a tag from a static name such as `"http.send"`.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The tag's name.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Discriminant of a leaf [`Subscription`](crate::Subscription).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionTag(&'static str);

impl SubscriptionTag {
    /// Create a tag from a static name such as `"time.every"`.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The tag's name.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for SubscriptionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A mapping from effect tag to handler.
///
/// Registration is explicit and one-time per tag: registering a tag that is
/// already present fails with [`RegistryError::DuplicateTag`] and leaves the
/// existing handler in place. Looking up a tag with no handler fails with
/// [`RegistryError::UnknownTag`] so that no effect is ever dropped silently.
///
/// Registries are built per [`Runtime`](crate::Runtime), never shared
/// process-wide.
pub struct Registry<K, H> {
    handlers: HashMap<K, H>,
}

impl<K, H> Registry<K, H>
where
    K: Copy + Eq + Hash + fmt::Display,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `tag`.
    pub fn register(&mut self, tag: K, handler: H) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&tag) {
            return Err(RegistryError::DuplicateTag(tag.to_string()));
        }
        self.handlers.insert(tag, handler);
        Ok(())
    }

    /// Builder-style [`register`](Registry::register).
    pub fn with(mut self, tag: K, handler: H) -> Result<Self, RegistryError> {
        self.register(tag, handler)?;
        Ok(self)
    }

    /// Look up the handler for `tag`.
    pub fn lookup(&self, tag: &K) -> Result<&H, RegistryError> {
        self.handlers
            .get(tag)
            .ok_or_else(|| RegistryError::UnknownTag(tag.to_string()))
    }

    /// Whether a handler is registered for `tag`.
    pub fn contains(&self, tag: &K) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Registered tags, in no particular order.
    pub fn tags(&self) -> impl Iterator<Item = K> + '_ {
        self.handlers.keys().copied()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<K, H> Default for Registry<K, H>
where
    K: Copy + Eq + Hash + fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FETCH: CommandTag = CommandTag::new("fetch");
    const ROLL: CommandTag = CommandTag::new("roll");

    #[test]
    fn register_then_lookup() {
        let mut registry: Registry<CommandTag, u8> = Registry::new();
        registry.register(FETCH, 1).unwrap();
        registry.register(ROLL, 2).unwrap();
        assert_eq!(*registry.lookup(&FETCH).unwrap(), 1);
        assert_eq!(*registry.lookup(&ROLL).unwrap(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_registration_fails_and_keeps_first() {
        let mut registry: Registry<CommandTag, u8> = Registry::new();
        registry.register(FETCH, 1).unwrap();
        let err = registry.register(FETCH, 9).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTag("fetch".into()));
        assert_eq!(*registry.lookup(&FETCH).unwrap(), 1);
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let registry: Registry<SubscriptionTag, u8> = Registry::default();
        let err = registry.lookup(&SubscriptionTag::new("time.every")).unwrap_err();
        assert_eq!(err, RegistryError::UnknownTag("time.every".into()));
        assert_eq!(err.to_string(), "unknown effect `time.every`");
    }

    #[test]
    fn builder_chain() {
        let registry = Registry::<CommandTag, u8>::new()
            .with(FETCH, 1)
            .and_then(|r| r.with(ROLL, 2))
            .unwrap();
        assert!(registry.contains(&ROLL));
        assert!(registry.with(ROLL, 3).is_err());
    }
}
