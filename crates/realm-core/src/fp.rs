//! Small combinators for turning effect outcomes into messages.

/// Fold a [`Result`] into a single value by handling both cases.
///
/// Effect handlers use this to map an outcome into the application's message
/// type without a `match` at every call site:
///
/// ```rust,ignore
/// use realm_core::fp::Cata;
///
/// let msg = response.cata(Msg::Loaded, |e| Msg::Failed(e.to_string()));
/// ```
pub trait Cata<T, E> {
    /// Apply `on_ok` to a success or `on_err` to a failure.
    fn cata<R>(self, on_ok: impl FnOnce(T) -> R, on_err: impl FnOnce(E) -> R) -> R;
}

impl<T, E> Cata<T, E> for Result<T, E> {
    fn cata<R>(self, on_ok: impl FnOnce(T) -> R, on_err: impl FnOnce(E) -> R) -> R {
        match self {
            Ok(value) => on_ok(value),
            Err(error) => on_err(error),
        }
    }
}
