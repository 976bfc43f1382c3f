//! Ordered stack of retryable operation interceptors.
//!
//! Each layer recognizes a finite set of transient [`StoreError`] classes and
//! retries the wrapped call up to a bounded attempt count. Installation order
//! is load-bearing: installing layer A then layer B puts B's wrapper
//! outermost, so B observes A's failures only after A has exhausted its own
//! budget for errors A recognizes, and every one of B's attempts re-enters A.
//! General layers (background operations, drop-pending) therefore go in
//! first, nearest the wire, so that later, more specific overrides are
//! themselves retried by them.

use std::sync::Arc;

use crate::store::StoreError;

/// Default attempt budget per layer. Tunable per layer; the exact count is
/// not part of the contract.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Whether a call is safe to repeat after an error that may have taken effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// The call carries a client-assigned identity (retryable write) or is
    /// otherwise documented safe to repeat.
    Idempotent,
    /// Repeating the call after a possible side effect could double-apply it.
    NonIdempotent,
}

/// One interceptor in the stack.
pub trait RetryLayer: Send + Sync {
    /// Short name used in logging.
    fn name(&self) -> &'static str;

    /// Returns true if this layer recognizes (and may retry) the error.
    fn matches(&self, err: &StoreError) -> bool;

    /// Attempt budget for errors this layer recognizes.
    fn max_attempts(&self) -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }
}

/// Retries conflicts with in-progress background operations.
///
/// Installed first: every later layer's attempts pass back through it.
#[derive(Debug, Default)]
pub struct BackgroundOpRetry;

impl RetryLayer for BackgroundOpRetry {
    fn name(&self) -> &'static str {
        "background-op"
    }

    fn matches(&self, err: &StoreError) -> bool {
        matches!(err, StoreError::BackgroundOperationInProgress(_))
    }
}

/// Retries writes rejected while a replicated database drop is pending.
#[derive(Debug, Default)]
pub struct DropPendingRetry;

impl RetryLayer for DropPendingRetry {
    fn name(&self) -> &'static str {
        "drop-pending"
    }

    fn matches(&self, err: &StoreError) -> bool {
        matches!(err, StoreError::DropPending(_))
    }
}

/// Retries legacy hashed-shard-key routing rejections.
#[derive(Debug, Default)]
pub struct HashedShardKeyRetry;

impl RetryLayer for HashedShardKeyRetry {
    fn name(&self) -> &'static str {
        "hashed-shard-key"
    }

    fn matches(&self, err: &StoreError) -> bool {
        matches!(err, StoreError::HashedShardKey(_))
    }
}

/// Retries "not primary" errors while an induced stepdown settles.
///
/// Only installed when the run injects stepdowns, and installed before any
/// narrower override that assumes a stable primary.
#[derive(Debug)]
pub struct StepdownRetry {
    max_attempts: u32,
}

impl StepdownRetry {
    /// Creates a stepdown retry layer with the given attempt budget.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl Default for StepdownRetry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryLayer for StepdownRetry {
    fn name(&self) -> &'static str {
        "stepdown"
    }

    fn matches(&self, err: &StoreError) -> bool {
        matches!(err, StoreError::NotPrimary(_))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Retries network failures.
#[derive(Debug, Default)]
pub struct NetworkRetry;

impl RetryLayer for NetworkRetry {
    fn name(&self) -> &'static str {
        "network"
    }

    fn matches(&self, err: &StoreError) -> bool {
        matches!(err, StoreError::Network { .. })
    }
}

/// An ordered chain of [`RetryLayer`]s wrapping a fallible operation.
#[derive(Clone, Default)]
pub struct RetryStack {
    layers: Vec<Arc<dyn RetryLayer>>,
}

impl RetryStack {
    /// Creates an empty stack. Operations run through an empty stack execute
    /// exactly once.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a layer. The most recently installed layer wraps outermost.
    pub fn install(&mut self, layer: Arc<dyn RetryLayer>) {
        self.layers.push(layer);
    }

    /// Returns the installed layer names, innermost first.
    #[must_use]
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }

    /// Runs the operation through the full stack.
    ///
    /// A layer retries only errors it recognizes, and never retries an error
    /// whose side effect may already have been applied unless the call is
    /// declared [`Idempotency::Idempotent`].
    ///
    /// # Errors
    ///
    /// Returns the final error once every recognizing layer has exhausted
    /// its budget, or immediately for unrecognized errors.
    pub fn run<T>(
        &self,
        idempotency: Idempotency,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.run_at(self.layers.len(), idempotency, &mut op)
    }

    fn run_at<T>(
        &self,
        depth: usize,
        idempotency: Idempotency,
        op: &mut impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let Some(layer) = depth.checked_sub(1).map(|i| &self.layers[i]) else {
            return op();
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_at(depth - 1, idempotency, op) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !layer.matches(&err) {
                        return Err(err);
                    }
                    if err.side_effect_possible() && idempotency == Idempotency::NonIdempotent {
                        tracing::debug!(
                            layer = layer.name(),
                            error = %err,
                            "not retrying: side effect possible on non-idempotent call"
                        );
                        return Err(err);
                    }
                    if attempt >= layer.max_attempts() {
                        tracing::debug!(
                            layer = layer.name(),
                            attempts = attempt,
                            error = %err,
                            "retry budget exhausted"
                        );
                        return Err(err);
                    }
                    tracing::trace!(
                        layer = layer.name(),
                        attempt,
                        error = %err,
                        "retrying transient error"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for RetryStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryStack")
            .field("layers", &self.layer_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn network_err(side_effect: bool) -> StoreError {
        StoreError::Network {
            message: "reset".into(),
            side_effect_possible: side_effect,
        }
    }

    #[test]
    fn test_empty_stack_runs_once() {
        let stack = RetryStack::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = stack.run(Idempotency::Idempotent, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(network_err(false))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_matching_layer_retries_until_success() {
        let mut stack = RetryStack::new();
        stack.install(Arc::new(NetworkRetry));

        let calls = AtomicU32::new(0);
        let result = stack.run(Idempotency::Idempotent, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(network_err(false))
            } else {
                Ok(n)
            }
        });
        assert_eq!(result.expect("should succeed"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unrecognized_error_propagates_unchanged() {
        let mut stack = RetryStack::new();
        stack.install(Arc::new(NetworkRetry));

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = stack.run(Idempotency::Idempotent, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Command("bad argument".into()))
        });
        assert!(matches!(result, Err(StoreError::Command(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_side_effect_blocks_non_idempotent_retry() {
        let mut stack = RetryStack::new();
        stack.install(Arc::new(NetworkRetry));

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = stack.run(Idempotency::NonIdempotent, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(network_err(true))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The same error is retried when the call is idempotent.
        let calls = AtomicU32::new(0);
        let result = stack.run(Idempotency::Idempotent, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(network_err(true))
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_inner_budget_covers_repeated_failures() {
        // Stepdown installed first (inner), network second (outer). Two
        // consecutive stepdown failures stay within the inner budget of
        // three, so the outer layer never sees them.
        let mut stack = RetryStack::new();
        stack.install(Arc::new(StepdownRetry::new(3)));
        stack.install(Arc::new(NetworkRetry));

        let calls = AtomicU32::new(0);
        let result = stack.run(Idempotency::Idempotent, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            match n {
                0 | 1 => Err(StoreError::NotPrimary("election".into())),
                _ => Ok(n),
            }
        });
        assert_eq!(result.expect("should succeed"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_inner_error_propagates_to_outer() {
        let mut stack = RetryStack::new();
        stack.install(Arc::new(StepdownRetry::new(2)));
        stack.install(Arc::new(NetworkRetry));

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = stack.run(Idempotency::Idempotent, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotPrimary("election".into()))
        });
        // Inner budget is 2; the outer layer does not match NotPrimary, so
        // the error surfaces after exactly two attempts.
        assert!(matches!(result, Err(StoreError::NotPrimary(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_general_inner_layer_retries_for_outer_attempts() {
        // Background-op retry installed first sits nearest the wire; each
        // network-layer attempt re-enters it.
        let mut stack = RetryStack::new();
        stack.install(Arc::new(BackgroundOpRetry));
        stack.install(Arc::new(NetworkRetry));

        let calls = AtomicU32::new(0);
        let result = stack.run(Idempotency::Idempotent, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => Err(StoreError::BackgroundOperationInProgress("index".into())),
                1 => Err(network_err(false)),
                2 => Err(StoreError::BackgroundOperationInProgress("index".into())),
                _ => Ok(n),
            }
        });
        assert_eq!(result.expect("should succeed"), 3);
    }
}
