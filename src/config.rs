//! Workload declaration and composition.
//!
//! A workload is declared as named state functions plus a weighted transition
//! table. A base declaration can be merged with derived overlays: base-first,
//! later keys win, everything copied by value into the merged
//! [`WorkloadConfig`] after the base setup has executed, so that worker
//! threads receive independent clones rather than live references across the
//! isolation boundary.
//!
//! After composition, `iterations` and `thread_count` are write-once: a state
//! function that attempts to mutate them gets an explicit error, never a
//! silent no-op.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::context::{ClusterDescriptor, ExecutionContext};
use crate::store::DocumentStore;

/// Tolerance when checking that a state's transition weights sum to one.
const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// A state function: mutates the worker's context and performs operations
/// through the retry stack.
pub type StateFn =
    Arc<dyn Fn(&mut ExecutionContext, &dyn DocumentStore) -> crate::Result<()> + Send + Sync>;

/// A setup/teardown hook, called once each by the launcher outside the
/// per-worker loop. May insert runtime-computed values into the workload
/// data; those values are then copied into every worker's merged config.
pub type HookFn = Arc<
    dyn Fn(
            &mut BTreeMap<String, Value>,
            &dyn DocumentStore,
            &ClusterDescriptor,
        ) -> crate::Result<()>
        + Send
        + Sync,
>;

/// One outgoing edge of a state, with its selection weight.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Next state name.
    pub target: String,
    /// Probability weight; weights for a given state sum to one.
    pub weight: f64,
}

impl Transition {
    /// Creates a transition edge.
    #[must_use]
    pub fn new(target: impl Into<String>, weight: f64) -> Self {
        Self {
            target: target.into(),
            weight,
        }
    }
}

/// Errors from workload composition or frozen-field mutation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A transition references a state that was never declared.
    #[error("transition from '{from}' targets unknown state '{target}'")]
    UnknownState {
        /// Source state of the bad edge.
        from: String,
        /// The missing target state.
        target: String,
    },

    /// The start state was never declared.
    #[error("start state '{0}' is not a declared state")]
    UnknownStartState(String),

    /// A state's outgoing weights do not sum to one.
    #[error("transition weights for '{state}' sum to {sum}, expected 1.0")]
    BadWeights {
        /// The offending state.
        state: String,
        /// The actual sum.
        sum: f64,
    },

    /// A required field had an unusable value.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },

    /// A write-once field was mutated after composition.
    #[error("'{0}' is frozen after composition")]
    Frozen(&'static str),
}

/// A workload declaration: the input shape accepted from workload authors.
#[derive(Clone, Default)]
pub struct WorkloadDecl {
    /// Workload name, used in logs and reports.
    pub name: String,
    /// Named values available to state functions; mutable during setup.
    pub data: BTreeMap<String, Value>,
    /// State name to state function.
    pub states: BTreeMap<String, StateFn>,
    /// State name to declaration-ordered outgoing edges.
    pub transitions: BTreeMap<String, Vec<Transition>>,
    /// Initial state for every worker.
    pub start_state: String,
    /// FSM steps per worker.
    pub iterations: u64,
    /// Number of workers to launch.
    pub thread_count: u32,
    /// Whether state functions receive the shared connection cache.
    pub pass_connection_cache: bool,
    /// Called once before spawn.
    pub setup: Option<HookFn>,
    /// Called once after all workers return, regardless of terminal states.
    pub teardown: Option<HookFn>,
}

impl WorkloadDecl {
    /// Creates an empty declaration with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a named state function.
    #[must_use]
    pub fn state(mut self, name: impl Into<String>, f: StateFn) -> Self {
        self.states.insert(name.into(), f);
        self
    }

    /// Sets the outgoing edges for a state, in declaration order.
    #[must_use]
    pub fn transitions(mut self, from: impl Into<String>, edges: Vec<Transition>) -> Self {
        self.transitions.insert(from.into(), edges);
        self
    }

    /// Sets the start state.
    #[must_use]
    pub fn start_state(mut self, name: impl Into<String>) -> Self {
        self.start_state = name.into();
        self
    }

    /// Sets the per-worker iteration budget.
    #[must_use]
    pub const fn iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub const fn thread_count(mut self, threads: u32) -> Self {
        self.thread_count = threads;
        self
    }

    /// Inserts a data value.
    #[must_use]
    pub fn data_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Sets the setup hook.
    #[must_use]
    pub fn setup(mut self, hook: HookFn) -> Self {
        self.setup = Some(hook);
        self
    }

    /// Sets the teardown hook.
    #[must_use]
    pub fn teardown(mut self, hook: HookFn) -> Self {
        self.teardown = Some(hook);
        self
    }
}

impl std::fmt::Debug for WorkloadDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadDecl")
            .field("name", &self.name)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .field("start_state", &self.start_state)
            .field("iterations", &self.iterations)
            .field("thread_count", &self.thread_count)
            .finish_non_exhaustive()
    }
}

/// A derived workload layered over a base declaration.
///
/// Replaces `$super`-style closure inheritance: an overlay is plain data that
/// overrides its base key-by-key, merged by [`compose`].
#[derive(Clone, Default)]
pub struct WorkloadOverlay {
    /// Overlay name; the last overlay's name wins for the merged config.
    pub name: Option<String>,
    /// Data overrides; a key present here wins over the base.
    pub data: BTreeMap<String, Value>,
    /// State overrides.
    pub states: BTreeMap<String, StateFn>,
    /// Transition-table overrides, whole edge lists per state.
    pub transitions: BTreeMap<String, Vec<Transition>>,
    /// Start-state override.
    pub start_state: Option<String>,
    /// Iteration-budget override.
    pub iterations: Option<u64>,
    /// Worker-count override.
    pub thread_count: Option<u32>,
}

impl std::fmt::Debug for WorkloadOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadOverlay")
            .field("name", &self.name)
            .field("data", &self.data.keys().collect::<Vec<_>>())
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// The merged, validated workload configuration handed to workers.
///
/// `iterations` and `thread_count` are write-once from the moment this struct
/// exists.
#[derive(Clone)]
pub struct WorkloadConfig {
    /// Workload name.
    pub name: String,
    /// Merged data values.
    pub data: BTreeMap<String, Value>,
    states: BTreeMap<String, StateFn>,
    transitions: BTreeMap<String, Vec<Transition>>,
    start_state: String,
    iterations: u64,
    thread_count: u32,
    /// Whether state functions receive the shared connection cache.
    pub pass_connection_cache: bool,
}

impl WorkloadConfig {
    /// Returns the state function for a name.
    #[must_use]
    pub fn state_fn(&self, name: &str) -> Option<&StateFn> {
        self.states.get(name)
    }

    /// Returns the declaration-ordered outgoing edges of a state.
    #[must_use]
    pub fn transitions_for(&self, state: &str) -> &[Transition] {
        self.transitions.get(state).map_or(&[], Vec::as_slice)
    }

    /// Returns the start state.
    #[must_use]
    pub fn start_state(&self) -> &str {
        &self.start_state
    }

    /// Returns the frozen iteration budget.
    #[must_use]
    pub const fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Returns the frozen worker count.
    #[must_use]
    pub const fn thread_count(&self) -> u32 {
        self.thread_count
    }

    /// Rejects any post-composition write to `iterations`.
    ///
    /// # Errors
    ///
    /// Always returns [`ConfigError::Frozen`]; the field is write-once and
    /// the rejection is explicit for test diagnosability.
    pub fn try_set_iterations(&mut self, _iterations: u64) -> Result<(), ConfigError> {
        Err(ConfigError::Frozen("iterations"))
    }

    /// Rejects any post-composition write to `thread_count`.
    ///
    /// # Errors
    ///
    /// Always returns [`ConfigError::Frozen`].
    pub fn try_set_thread_count(&mut self, _threads: u32) -> Result<(), ConfigError> {
        Err(ConfigError::Frozen("thread_count"))
    }
}

impl std::fmt::Debug for WorkloadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadConfig")
            .field("name", &self.name)
            .field("states", &self.states.keys().collect::<Vec<_>>())
            .field("start_state", &self.start_state)
            .field("iterations", &self.iterations)
            .field("thread_count", &self.thread_count)
            .finish_non_exhaustive()
    }
}

/// Merges a base declaration with derived overlays into one frozen config.
///
/// Merge order is base-first, then each overlay's overrides in declaration
/// order; a key present in an overlay always wins over the same key in its
/// base, and base-only keys are preserved. The caller runs the base setup
/// hook before composing so that runtime-computed data values are captured by
/// value in the merge.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the merged config references unknown states,
/// has transition weights that do not sum to one, or has a zero iteration or
/// thread budget.
pub fn compose(
    base: &WorkloadDecl,
    overlays: &[WorkloadOverlay],
) -> Result<WorkloadConfig, ConfigError> {
    let mut name = base.name.clone();
    let mut data = base.data.clone();
    let mut states = base.states.clone();
    let mut transitions = base.transitions.clone();
    let mut start_state = base.start_state.clone();
    let mut iterations = base.iterations;
    let mut thread_count = base.thread_count;

    for overlay in overlays {
        if let Some(overlay_name) = &overlay.name {
            name.clone_from(overlay_name);
        }
        for (key, value) in &overlay.data {
            data.insert(key.clone(), value.clone());
        }
        for (key, state_fn) in &overlay.states {
            states.insert(key.clone(), Arc::clone(state_fn));
        }
        for (key, edges) in &overlay.transitions {
            transitions.insert(key.clone(), edges.clone());
        }
        if let Some(start) = &overlay.start_state {
            start_state.clone_from(start);
        }
        if let Some(n) = overlay.iterations {
            iterations = n;
        }
        if let Some(n) = overlay.thread_count {
            thread_count = n;
        }
    }

    if states.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "states",
            reason: "at least one state is required",
        });
    }
    if !states.contains_key(&start_state) {
        return Err(ConfigError::UnknownStartState(start_state));
    }
    if iterations == 0 {
        return Err(ConfigError::InvalidValue {
            field: "iterations",
            reason: "must be at least one",
        });
    }
    if thread_count == 0 {
        return Err(ConfigError::InvalidValue {
            field: "thread_count",
            reason: "must be at least one",
        });
    }

    for (from, edges) in &transitions {
        if !states.contains_key(from) {
            return Err(ConfigError::UnknownState {
                from: from.clone(),
                target: from.clone(),
            });
        }
        for edge in edges {
            if !states.contains_key(&edge.target) {
                return Err(ConfigError::UnknownState {
                    from: from.clone(),
                    target: edge.target.clone(),
                });
            }
        }
        let sum: f64 = edges.iter().map(|e| e.weight).sum();
        if !edges.is_empty() && (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(ConfigError::BadWeights {
                state: from.clone(),
                sum,
            });
        }
    }

    Ok(WorkloadConfig {
        name,
        data,
        states,
        transitions,
        start_state,
        iterations,
        thread_count,
        pass_connection_cache: base.pass_connection_cache,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn noop_state() -> StateFn {
        Arc::new(|_cx, _store| Ok(()))
    }

    fn base_decl() -> WorkloadDecl {
        WorkloadDecl::new("base")
            .state("a", noop_state())
            .state("b", noop_state())
            .transitions("a", vec![Transition::new("b", 1.0)])
            .transitions("b", vec![Transition::new("a", 1.0)])
            .start_state("a")
            .iterations(10)
            .thread_count(2)
            .data_value("x", json!(1))
            .data_value("y", json!(1))
    }

    #[test]
    fn test_overlay_key_wins_base_key_preserved() {
        let overlay = WorkloadOverlay {
            data: [("x".to_string(), json!(2))].into(),
            ..WorkloadOverlay::default()
        };
        let config = compose(&base_decl(), &[overlay]).expect("compose");
        assert_eq!(config.data["x"], json!(2));
        assert_eq!(config.data["y"], json!(1));
    }

    #[test]
    fn test_later_overlay_wins() {
        let first = WorkloadOverlay {
            data: [("x".to_string(), json!(2))].into(),
            ..WorkloadOverlay::default()
        };
        let second = WorkloadOverlay {
            data: [("x".to_string(), json!(3))].into(),
            ..WorkloadOverlay::default()
        };
        let config = compose(&base_decl(), &[first, second]).expect("compose");
        assert_eq!(config.data["x"], json!(3));
    }

    #[test]
    fn test_frozen_fields_reject_writes() {
        let mut config = compose(&base_decl(), &[]).expect("compose");
        assert_eq!(config.iterations(), 10);
        assert!(matches!(
            config.try_set_iterations(99),
            Err(ConfigError::Frozen("iterations"))
        ));
        assert!(matches!(
            config.try_set_thread_count(99),
            Err(ConfigError::Frozen("thread_count"))
        ));
        // The rejected write left the values untouched.
        assert_eq!(config.iterations(), 10);
        assert_eq!(config.thread_count(), 2);
    }

    #[test]
    fn test_unknown_start_state_rejected() {
        let decl = base_decl().start_state("missing");
        assert!(matches!(
            compose(&decl, &[]),
            Err(ConfigError::UnknownStartState(_))
        ));
    }

    #[test]
    fn test_unknown_transition_target_rejected() {
        let decl = base_decl().transitions("a", vec![Transition::new("ghost", 1.0)]);
        assert!(matches!(
            compose(&decl, &[]),
            Err(ConfigError::UnknownState { .. })
        ));
    }

    #[test]
    fn test_bad_weight_sum_rejected() {
        let decl = base_decl().transitions(
            "a",
            vec![Transition::new("a", 0.5), Transition::new("b", 0.2)],
        );
        assert!(matches!(
            compose(&decl, &[]),
            Err(ConfigError::BadWeights { .. })
        ));
    }

    #[test]
    fn test_overlay_can_raise_iterations() {
        let overlay = WorkloadOverlay {
            iterations: Some(50),
            ..WorkloadOverlay::default()
        };
        let config = compose(&base_decl(), &[overlay]).expect("compose");
        assert_eq!(config.iterations(), 50);
    }
}
