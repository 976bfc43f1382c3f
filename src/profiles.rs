//! Run profiles for the stress harness.
//!
//! Provides predefined configurations with sensible defaults for different
//! testing scenarios, plus TOML loading for custom runs.
//!
//! # Example
//!
//! ```ignore
//! use fsm_workload::profiles::{HarnessProfile, load_profile};
//!
//! // Load a named profile
//! let profile = load_profile("smoke").unwrap();
//!
//! // Or load from a TOML file
//! let profile = HarnessProfile::from_file("custom.toml").unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::config::WorkloadOverlay;
use crate::context::{ClusterDescriptor, StepdownConfig};
use crate::sim::FaultPlan;

/// Workload sizing for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadParams {
    /// Number of worker threads.
    pub threads: u32,
    /// FSM steps per worker.
    pub iterations: u64,
    /// Documents owned by each worker.
    pub docs_per_thread: u64,
    /// Base RNG seed; worker `tid` draws from `base_seed + tid`.
    pub base_seed: u64,
}

impl Default for WorkloadParams {
    fn default() -> Self {
        Self {
            threads: 5,
            iterations: 100,
            docs_per_thread: 100,
            base_seed: 0,
        }
    }
}

/// Simulated cluster shape for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    /// Number of shards.
    pub shard_count: u32,
    /// Whether multi-writes apply exactly once under migration.
    pub exactly_once: bool,
    /// Whether stepdowns are injected (installs the stepdown retry layer).
    pub stepdowns: bool,
    /// Interval between induced stepdowns, in milliseconds.
    pub stepdown_interval_ms: u64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            shard_count: 2,
            exactly_once: true,
            stepdowns: false,
            stepdown_interval_ms: 5_000,
        }
    }
}

/// Fault injection rates for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultParams {
    /// Pre-apply transient error rate on mutating commands.
    pub transient_error_rate: f64,
    /// Post-apply network error rate on deletes.
    pub post_apply_error_rate: f64,
    /// Duplicate change-event rate; only effective when `exactly_once` is
    /// false and a migration has happened.
    pub duplicate_event_rate: f64,
}

impl Default for FaultParams {
    fn default() -> Self {
        Self {
            transient_error_rate: 0.0,
            post_apply_error_rate: 0.0,
            duplicate_event_rate: 0.0,
        }
    }
}

/// A complete harness profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessProfile {
    /// Profile name.
    pub name: String,
    /// Description of what this profile tests.
    pub description: String,
    /// Workload sizing.
    pub workload: WorkloadParams,
    /// Cluster shape.
    pub cluster: ClusterParams,
    /// Fault injection rates.
    pub faults: FaultParams,
}

impl Default for HarnessProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            description: "Default harness profile".to_string(),
            workload: WorkloadParams::default(),
            cluster: ClusterParams::default(),
            faults: FaultParams::default(),
        }
    }
}

impl HarnessProfile {
    /// Load a profile from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ProfileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse a profile from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML cannot be parsed.
    pub fn from_toml(toml: &str) -> Result<Self, ProfileError> {
        toml::from_str(toml).map_err(|e| ProfileError::Parse {
            message: e.to_string(),
        })
    }

    /// Serialize the profile to a TOML string.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Returns the workload overlay carrying this profile's sizing.
    #[must_use]
    pub fn overlay(&self) -> WorkloadOverlay {
        WorkloadOverlay {
            iterations: Some(self.workload.iterations),
            thread_count: Some(self.workload.threads),
            ..WorkloadOverlay::default()
        }
    }

    /// Returns the fault plan for a simulated store built from this profile.
    #[must_use]
    pub const fn fault_plan(&self) -> FaultPlan {
        FaultPlan {
            transient_error_rate: self.faults.transient_error_rate,
            post_apply_error_rate: self.faults.post_apply_error_rate,
            duplicate_event_rate: self.faults.duplicate_event_rate,
            exactly_once: self.cluster.exactly_once,
        }
    }

    /// Overrides a descriptor with this profile's cluster shape.
    #[must_use]
    pub fn apply_to_descriptor(&self, mut descriptor: ClusterDescriptor) -> ClusterDescriptor {
        descriptor.shard_count = self.cluster.shard_count;
        descriptor.exactly_once_multi_writes = self.cluster.exactly_once;
        descriptor.stepdown = self.cluster.stepdowns.then(|| StepdownConfig {
            interval_ms: self.cluster.stepdown_interval_ms,
            ..StepdownConfig::default()
        });
        descriptor
    }
}

/// Error type for profile operations.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// I/O error reading profile file.
    #[error("failed to read profile from {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Parse error in TOML.
    #[error("failed to parse profile: {message}")]
    Parse {
        /// Error message.
        message: String,
    },
    /// Profile not found.
    #[error("profile not found: {name}")]
    NotFound {
        /// Profile name.
        name: String,
    },
}

fn profile(
    name: &str,
    desc: &str,
    workload: WorkloadParams,
    cluster: ClusterParams,
    faults: FaultParams,
) -> HarnessProfile {
    HarnessProfile {
        name: name.to_string(),
        description: desc.to_string(),
        workload,
        cluster,
        faults,
    }
}

/// Built-in profiles for common testing scenarios.
#[must_use]
pub fn builtin_profiles() -> HashMap<&'static str, HarnessProfile> {
    HashMap::from([
        (
            "smoke",
            profile(
                "smoke",
                "Quick sanity check with minimal load",
                WorkloadParams {
                    threads: 2,
                    iterations: 20,
                    docs_per_thread: 10,
                    base_seed: 0,
                },
                ClusterParams::default(),
                FaultParams::default(),
            ),
        ),
        (
            "stress",
            profile(
                "stress",
                "High thread count with transient faults and stepdowns",
                WorkloadParams {
                    threads: 16,
                    iterations: 500,
                    docs_per_thread: 200,
                    base_seed: 0,
                },
                ClusterParams {
                    shard_count: 4,
                    stepdowns: true,
                    ..ClusterParams::default()
                },
                FaultParams {
                    transient_error_rate: 0.05,
                    post_apply_error_rate: 0.02,
                    ..FaultParams::default()
                },
            ),
        ),
        (
            "migration",
            profile(
                "migration",
                "Chunk migration with exactly-once stream verification",
                WorkloadParams {
                    threads: 5,
                    iterations: 200,
                    docs_per_thread: 100,
                    base_seed: 0,
                },
                ClusterParams {
                    shard_count: 3,
                    ..ClusterParams::default()
                },
                FaultParams {
                    transient_error_rate: 0.02,
                    ..FaultParams::default()
                },
            ),
        ),
        (
            "best-effort",
            profile(
                "best-effort",
                "Duplicate-detection-only verification on a legacy cluster",
                WorkloadParams::default(),
                ClusterParams {
                    exactly_once: false,
                    ..ClusterParams::default()
                },
                FaultParams::default(),
            ),
        ),
    ])
}

/// Load a built-in profile by name.
///
/// # Errors
///
/// Returns an error if the profile name is not found.
pub fn load_profile(name: &str) -> Result<HarnessProfile, ProfileError> {
    builtin_profiles()
        .remove(name)
        .ok_or_else(|| ProfileError::NotFound {
            name: name.to_string(),
        })
}

/// List all available built-in profile names.
#[must_use]
pub fn list_profiles() -> Vec<&'static str> {
    let mut names: Vec<_> = builtin_profiles().keys().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_round_trips_through_toml() {
        let profile = HarnessProfile::default();
        let parsed = HarnessProfile::from_toml(&profile.to_toml()).expect("parse");
        assert_eq!(parsed.workload.threads, profile.workload.threads);
        assert_eq!(parsed.cluster.shard_count, profile.cluster.shard_count);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let profile = HarnessProfile::from_toml(
            r#"
            name = "custom"

            [workload]
            threads = 9
            "#,
        )
        .expect("parse");
        assert_eq!(profile.name, "custom");
        assert_eq!(profile.workload.threads, 9);
        assert_eq!(profile.workload.iterations, 100);
        assert!(profile.cluster.exactly_once);
    }

    #[test]
    fn test_every_builtin_is_loadable() {
        for name in list_profiles() {
            let profile = load_profile(name).expect("builtin loads");
            assert_eq!(profile.name, name);
        }
    }

    #[test]
    fn test_unknown_profile_is_an_error() {
        assert!(matches!(
            load_profile("nope"),
            Err(ProfileError::NotFound { .. })
        ));
    }

    #[test]
    fn test_overlay_carries_sizing() {
        let profile = load_profile("stress").expect("builtin");
        let overlay = profile.overlay();
        assert_eq!(overlay.thread_count, Some(16));
        assert_eq!(overlay.iterations, Some(500));
    }

    #[test]
    fn test_descriptor_override() {
        let profile = load_profile("stress").expect("builtin");
        let descriptor = profile.apply_to_descriptor(ClusterDescriptor::default());
        assert_eq!(descriptor.shard_count, 4);
        assert!(descriptor.stepdown.is_some());
    }
}
