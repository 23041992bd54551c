//! Profiler session configuration.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Collection mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilerState {
    #[default]
    Disabled,
    Cpu,
    Kineto,
    /// Like `Kineto`, but device timings are taken with per-op device events
    /// instead of the external activity collector.
    KinetoGpuFallback,
}

/// Activity families a session asks the external collector for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Cpu,
    Cuda,
}

/// Per-session feature switches. Immutable once a `RecordQueue` is built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub state: ProfilerState,
    pub report_input_shapes: bool,
    pub profile_memory: bool,
    pub with_stack: bool,
    pub with_flops: bool,
    pub with_modules: bool,
    /// On-demand mode: the external collector is driven by other machinery,
    /// so its trace is not merged into this session.
    pub global: bool,
}

impl ProfilerConfig {
    pub fn new(state: ProfilerState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn with_input_shapes(mut self, enabled: bool) -> Self {
        self.report_input_shapes = enabled;
        self
    }

    pub fn with_memory(mut self, enabled: bool) -> Self {
        self.profile_memory = enabled;
        self
    }

    pub fn with_stack(mut self, enabled: bool) -> Self {
        self.with_stack = enabled;
        self
    }

    pub fn with_flops(mut self, enabled: bool) -> Self {
        self.with_flops = enabled;
        self
    }

    pub fn with_modules(mut self, enabled: bool) -> Self {
        self.with_modules = enabled;
        self
    }

    pub fn with_global(mut self, enabled: bool) -> Self {
        self.global = enabled;
        self
    }

    /// Storage identities are only resolved when both shapes and memory
    /// events are recorded.
    pub fn resolves_storage_ids(&self) -> bool {
        self.report_input_shapes && self.profile_memory
    }
}

static ALLOW_TF32_CUBLAS: AtomicBool = AtomicBool::new(false);

/// Process-wide reduced precision flag, snapshotted into every op record.
pub fn allow_tf32_cublas() -> bool {
    ALLOW_TF32_CUBLAS.load(Ordering::Relaxed)
}

pub fn set_allow_tf32_cublas(enabled: bool) {
    ALLOW_TF32_CUBLAS.store(enabled, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_disabled() {
        let config = ProfilerConfig::default();
        assert_eq!(config.state, ProfilerState::Disabled);
        assert!(!config.report_input_shapes);
        assert!(!config.resolves_storage_ids());
    }

    #[test]
    fn test_builder_methods() {
        let config = ProfilerConfig::new(ProfilerState::Kineto)
            .with_input_shapes(true)
            .with_memory(true)
            .with_stack(true);
        assert!(config.resolves_storage_ids());
        assert!(config.with_stack);
        assert!(!config.with_flops);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: ProfilerConfig =
            serde_json::from_str(r#"{"state": "kineto_gpu_fallback", "with_modules": true}"#)
                .unwrap();
        assert_eq!(config.state, ProfilerState::KinetoGpuFallback);
        assert!(config.with_modules);
        assert!(!config.profile_memory);
    }
}
