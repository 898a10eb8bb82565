//! Failure classification for error filtering
//!
//! The circuit breaker asks a classifier whether an error should be recorded
//! as a failure; the retry engine asks whether an error is worth another
//! attempt. Both see the same [`FailureContext`].

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Context provided to failure classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Name of the primitive asking
    pub name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Duration of the failed call
    pub duration: Duration,
    /// Attempt number, starting at 1 (always 1 outside the retry engine)
    pub attempt: u32,
}

/// Decides whether an error counts
///
/// # Examples
///
/// ```rust
/// use resilience_machines::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct ServerErrorClassifier;
///
/// impl FailureClassifier for ServerErrorClassifier {
///     fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.error
///             .downcast_ref::<u16>()
///             .map(|status| *status >= 500)
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` if the error should be counted, `false` to ignore it.
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default classifier that counts every error
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

/// Classifier that only counts errors of type `T`; anything else is ignored
pub struct TypeClassifier<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> TypeClassifier<T> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Default for TypeClassifier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for TypeClassifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeClassifier")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: 'static> FailureClassifier for TypeClassifier<T> {
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        ctx.error.is::<T>()
    }
}

/// Classify with an optional classifier; `None` counts every error
pub(crate) fn classify(
    classifier: Option<&Arc<dyn FailureClassifier>>,
    ctx: &FailureContext<'_>,
) -> bool {
    classifier.map(|c| c.should_trip(ctx)).unwrap_or(true)
}
