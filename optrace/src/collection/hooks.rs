//! Collaborators consulted on the `begin_op` path.
//!
//! Everything here is best effort: a failure downgrades to
//! [`Capture::Unavailable`] and collection carries on.

use crate::collection::encoder::Scalar;
use crate::collection::error::Result;
use crate::collection::events::OpCall;
use crate::collection::external::{ActivityCollector, NoopCollector};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Extra numeric arguments saved for flop estimation.
pub type ExtraArgs = BTreeMap<String, Scalar>;

/// Outcome of a best-effort capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Capture<T> {
    Captured(T),
    Unavailable,
}

impl<T> Default for Capture<T> {
    fn default() -> Self {
        Capture::Unavailable
    }
}

impl<T> Capture<T> {
    pub fn captured(&self) -> Option<&T> {
        match self {
            Capture::Captured(v) => Some(v),
            Capture::Unavailable => None,
        }
    }

    pub fn is_captured(&self) -> bool {
        matches!(self, Capture::Captured(_))
    }
}

impl<T> From<Result<T>> for Capture<T> {
    fn from(r: Result<T>) -> Self {
        r.map_or(Capture::Unavailable, Capture::Captured)
    }
}

/// Opaque handle to a timing event recorded on a device stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceEvent(pub u64);

/// Device timing pair used when the activity collector cannot time ops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackTiming {
    pub start: Capture<DeviceEvent>,
    pub end: Capture<DeviceEvent>,
}

impl FallbackTiming {
    /// Elapsed device time, when both ends were captured.
    pub fn elapsed_us(&self, timer: &dyn DeviceTimer) -> Option<f64> {
        match (self.start, self.end) {
            (Capture::Captured(start), Capture::Captured(end)) => {
                timer.elapsed_us(start, end).ok()
            }
            _ => None,
        }
    }
}

/// Records device-side timing events.
pub trait DeviceTimer: Send + Sync {
    fn record(&self) -> Result<DeviceEvent>;
    fn elapsed_us(&self, start: DeviceEvent, end: DeviceEvent) -> Result<f64>;
}

/// Supplies call-site metadata for an op that is beginning.
pub trait OpMetadataSource: Send + Sync {
    /// Interpreter call stack, innermost frame last.
    fn call_stack(&self) -> Result<Vec<String>>;
    fn module_hierarchy(&self) -> Vec<String>;
    fn extra_args(&self, call: &OpCall<'_>) -> ExtraArgs;
}

/// The collaborators a session was built with, shared by every subqueue.
#[derive(Clone)]
pub struct CollectionHooks {
    pub collector: Arc<dyn ActivityCollector>,
    pub metadata: Option<Arc<dyn OpMetadataSource>>,
    pub device_timer: Option<Arc<dyn DeviceTimer>>,
}

impl Default for CollectionHooks {
    fn default() -> Self {
        Self {
            collector: Arc::new(NoopCollector),
            metadata: None,
            device_timer: None,
        }
    }
}

impl std::fmt::Debug for CollectionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionHooks")
            .field("metadata", &self.metadata.is_some())
            .field("device_timer", &self.device_timer.is_some())
            .finish_non_exhaustive()
    }
}
