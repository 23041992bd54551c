//! Boundary with an optional interpreter-level call sampler.

use crate::collection::clock::{ApproxTime, TimeNs};
use crate::collection::events::{DeviceAndResource, ProfiledEvent};
use crate::collection::queue::RecordQueue;

/// A call entered through [`RecordQueue::record_py_call`] before the session
/// stopped, with its start time already converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEnter {
    /// Sampler-defined key identifying the call site.
    pub key: u64,
    pub tid: u64,
    pub device_resource: DeviceAndResource,
    pub enter_time_ns: TimeNs,
}

/// Produces `PyCall` / `PyCCall` events for a session.
pub trait CallSampler: Send {
    /// Stop sampling. Called once from [`RecordQueue::stop`].
    fn stop(&mut self);

    /// Turn everything sampled into events. Calls still open at the end of
    /// the session end at `end_time_ns`.
    fn get_events(
        &mut self,
        converter: &dyn Fn(ApproxTime) -> TimeNs,
        enters: Vec<PendingEnter>,
        end_time_ns: TimeNs,
    ) -> Vec<ProfiledEvent>;
}

/// Builds the sampler for a queue. Only invoked when the session traces calls.
pub type CallSamplerFactory = Box<dyn FnOnce(&RecordQueue) -> Box<dyn CallSampler>>;
