use crate::collection::arena::{CorrelationId, EventArena};
use crate::collection::clock::{ApproxTime, approx_now, current_tid};
use crate::collection::config::{ProfilerConfig, ProfilerState, allow_tf32_cublas};
use crate::collection::encoder::InputOutputEncoder;
use crate::collection::events::{
    AllocationEvent, BackendEvent, DeviceAndResource, MemoryUsage, OpCall, OpEvent, OutOfMemoryEvent,
    RecordScope,
};
use crate::collection::hooks::{Capture, CollectionHooks, DeviceEvent, ExtraArgs, FallbackTiming};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Everything one thread recorded during a session.
///
/// Each enabled side channel holds exactly one entry per op record, in record
/// order.
#[derive(Default)]
pub(crate) struct SubqueueStorage {
    pub(crate) op_events: EventArena<OpEvent>,
    pub(crate) inputs_outputs: InputOutputEncoder,
    pub(crate) jit_stack: Vec<Vec<String>>,
    pub(crate) jit_modules: Vec<Vec<String>>,
    pub(crate) extra_args: Vec<ExtraArgs>,
    pub(crate) gpu_fallback: Vec<FallbackTiming>,
    pub(crate) backend_events: Vec<BackendEvent>,
    pub(crate) allocations: Vec<AllocationEvent>,
    pub(crate) ooms: Vec<OutOfMemoryEvent>,
    /// Pending interpreter call enters, keyed by the sampler's call-site key.
    pub(crate) py_calls: Vec<(u64, ApproxTime)>,
}

/// Per-thread event storage for one session.
///
/// Only the owning thread appends. The mutex is uncontended except when an
/// async op is ended from another thread through its [`ObserverHandle`], and
/// it is only held for the buffer writes themselves, never across a hook.
pub struct ThreadLocalSubqueue {
    tid: u64,
    device_resource: DeviceAndResource,
    config: Arc<ProfilerConfig>,
    hooks: Arc<CollectionHooks>,
    storage: Mutex<SubqueueStorage>,
}

impl ThreadLocalSubqueue {
    pub(crate) fn new(tid: u64, config: Arc<ProfilerConfig>, hooks: Arc<CollectionHooks>) -> Self {
        hooks.collector.record_thread_info(tid);
        Self {
            tid,
            device_resource: DeviceAndResource::current(tid),
            config,
            hooks,
            storage: Mutex::new(SubqueueStorage::default()),
        }
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn device_resource(&self) -> DeviceAndResource {
        self.device_resource
    }

    /// Number of op records currently buffered.
    pub fn op_count(&self) -> usize {
        self.lock().op_events.len()
    }

    fn lock(&self) -> MutexGuard<'_, SubqueueStorage> {
        self.storage.lock().unwrap()
    }

    /// Record the start of an op. The start time is stamped last so the
    /// bookkeeping above is not attributed to the op.
    ///
    /// The storage lock is never held while a hook runs, so hooks may record
    /// back into this subqueue. Side-channel slots are reserved together with
    /// the record and filled in afterwards, which keeps every channel aligned
    /// with the records even when a hook begins a nested op.
    pub fn begin_op(self: &Arc<Self>, call: &OpCall<'_>) -> ObserverHandle {
        let config = &self.config;
        let fallback_enabled = config.state == ProfilerState::KinetoGpuFallback;
        let (correlation_id, slot) = {
            let mut storage = self.lock();
            let correlation_id = storage.op_events.push(OpEvent::new(call.into()));
            let slot = storage.op_events.len() - 1;
            if config.report_input_shapes {
                storage.inputs_outputs.push(call.inputs);
            }
            if config.with_stack {
                storage.jit_stack.push(Vec::new());
            }
            if config.with_modules {
                storage.jit_modules.push(Vec::new());
            }
            if config.with_flops {
                storage.extra_args.push(ExtraArgs::default());
            }
            if fallback_enabled {
                storage.gpu_fallback.push(FallbackTiming::default());
            }
            (correlation_id, slot)
        };

        if call.scope == RecordScope::UserScope {
            self.hooks.collector.push_user_correlation_id(correlation_id);
        } else {
            self.hooks.collector.push_correlation_id(correlation_id);
        }

        // Backward ops carry the call site of their forward op, so their own
        // stack and module entries stay empty.
        let capture_site = call.scope != RecordScope::BackwardFunction;
        let frames = (config.with_stack && capture_site).then(|| self.call_stack());
        let modules = match &self.hooks.metadata {
            Some(metadata) if config.with_modules && capture_site => {
                Some(metadata.module_hierarchy())
            }
            _ => None,
        };
        let args = match &self.hooks.metadata {
            Some(metadata) if config.with_flops => Some(metadata.extra_args(call)),
            _ => None,
        };
        let device_start = fallback_enabled.then(|| self.record_device_event());

        let mut storage = self.lock();
        if let Some(frames) = frames
            && let Some(entry) = storage.jit_stack.get_mut(slot)
        {
            *entry = frames;
        }
        if let Some(modules) = modules
            && let Some(entry) = storage.jit_modules.get_mut(slot)
        {
            *entry = modules;
        }
        if let Some(args) = args
            && let Some(entry) = storage.extra_args.get_mut(slot)
        {
            *entry = args;
        }
        if let Some(start) = device_start
            && let Some(timing) = storage.gpu_fallback.get_mut(slot)
        {
            timing.start = start;
        }
        if let Some(event) = storage.op_events.get_mut(correlation_id) {
            event.start_time = approx_now();
            event.allow_tf32_cublas = allow_tf32_cublas();
        }
        drop(storage);

        ObserverHandle {
            subqueue: Arc::clone(self),
            correlation_id,
            scope: call.scope,
            fallback: fallback_enabled.then_some(slot),
        }
    }

    fn call_stack(&self) -> Vec<String> {
        let Some(metadata) = &self.hooks.metadata else {
            return Vec::new();
        };
        match metadata.call_stack() {
            Ok(frames) => frames,
            Err(err) => {
                warn!(%err, tid = self.tid, "failed to capture call stack");
                Vec::new()
            }
        }
    }

    fn record_device_event(&self) -> Capture<DeviceEvent> {
        let Some(timer) = &self.hooks.device_timer else {
            return Capture::Unavailable;
        };
        match timer.record() {
            Ok(event) => Capture::Captured(event),
            Err(err) => {
                warn!(%err, "failed to record device event");
                Capture::Unavailable
            }
        }
    }

    fn end_op(&self, handle: &ObserverHandle, end_time: ApproxTime) {
        let end_event = handle.fallback.map(|_| self.record_device_event());
        {
            let mut storage = self.lock();
            // The record is gone if the session was drained before the op ended.
            if let Some(event) = storage.op_events.get_mut(handle.correlation_id) {
                event.end_time = end_time;
                event.end_tid = current_tid();
            }
            if let (Some(index), Some(end)) = (handle.fallback, end_event)
                && let Some(timing) = storage.gpu_fallback.get_mut(index)
            {
                timing.end = end;
            }
        }

        if handle.scope == RecordScope::UserScope {
            self.hooks.collector.pop_user_correlation_id();
        } else {
            self.hooks.collector.pop_correlation_id();
        }
    }

    pub fn record_backend_event(&self, event: BackendEvent) {
        self.lock().backend_events.push(event);
    }

    pub fn record_allocation(&self, ptr: u64, usage: MemoryUsage) {
        let event = AllocationEvent {
            start_time: approx_now(),
            ptr,
            alloc_size: usage.alloc_size,
            total_allocated: usage.total_allocated,
            total_reserved: usage.total_reserved,
            device_type: usage.device.device_type,
            device_index: usage.device.index,
            id: None,
        };
        self.lock().allocations.push(event);
    }

    pub fn record_out_of_memory(&self, usage: MemoryUsage) {
        let event = OutOfMemoryEvent {
            start_time: approx_now(),
            alloc_size: usage.alloc_size,
            total_allocated: usage.total_allocated,
            total_reserved: usage.total_reserved,
            device_type: usage.device.device_type,
            device_index: usage.device.index,
        };
        self.lock().ooms.push(event);
    }

    pub fn record_py_call(&self, key: u64) {
        self.lock().py_calls.push((key, approx_now()));
    }

    /// Move everything recorded so far out of the subqueue.
    pub(crate) fn take_storage(&self) -> SubqueueStorage {
        std::mem::take(&mut *self.lock())
    }
}

/// Returned by `begin_op`. Ending it stamps the op's end time; dropping it
/// without ending leaves the op unterminated.
#[must_use = "an op that is never ended is reported as unterminated"]
pub struct ObserverHandle {
    subqueue: Arc<ThreadLocalSubqueue>,
    correlation_id: CorrelationId,
    scope: RecordScope,
    fallback: Option<usize>,
}

impl ObserverHandle {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn end(self) {
        self.end_at(approx_now());
    }

    pub fn end_at(self, end_time: ApproxTime) {
        self.subqueue.end_op(&self, end_time);
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("tid", &self.subqueue.tid)
            .field("correlation_id", &self.correlation_id)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::encoder::{OpInput, Scalar};
    use crate::collection::error::{CollectionError, Result};
    use crate::collection::external::{ActivityCollector, ActivityTrace, CpuActivity};
    use crate::collection::hooks::{DeviceTimer, OpMetadataSource};

    #[derive(Default)]
    struct StackRecorder(Mutex<Vec<String>>);

    impl ActivityCollector for StackRecorder {
        fn push_correlation_id(&self, id: u64) {
            self.0.lock().unwrap().push(format!("push {id}"));
        }
        fn push_user_correlation_id(&self, id: u64) {
            self.0.lock().unwrap().push(format!("push_user {id}"));
        }
        fn pop_correlation_id(&self) {
            self.0.lock().unwrap().push("pop".into());
        }
        fn pop_user_correlation_id(&self) {
            self.0.lock().unwrap().push("pop_user".into());
        }
        fn transfer_cpu_trace(&self, _s: i64, _a: Vec<CpuActivity>, _e: i64) {}
        fn stop_trace(&self) -> Option<ActivityTrace> {
            None
        }
    }

    struct Metadata;

    impl OpMetadataSource for Metadata {
        fn call_stack(&self) -> Result<Vec<String>> {
            Ok(vec!["train.py(10): step".into()])
        }
        fn module_hierarchy(&self) -> Vec<String> {
            vec!["top".into()]
        }
        fn extra_args(&self, call: &OpCall<'_>) -> ExtraArgs {
            ExtraArgs::from([(call.name.to_string(), Scalar::Int(2))])
        }
    }

    struct BrokenTimer;

    impl DeviceTimer for BrokenTimer {
        fn record(&self) -> Result<DeviceEvent> {
            Err(CollectionError::DeviceTiming("no device".into()))
        }
        fn elapsed_us(&self, _: DeviceEvent, _: DeviceEvent) -> Result<f64> {
            Err(CollectionError::DeviceTiming("no device".into()))
        }
    }

    fn subqueue(config: ProfilerConfig, hooks: CollectionHooks) -> Arc<ThreadLocalSubqueue> {
        Arc::new(ThreadLocalSubqueue::new(
            current_tid(),
            Arc::new(config),
            Arc::new(hooks),
        ))
    }

    #[test]
    fn test_begin_and_end_stamp_times() {
        let sq = subqueue(ProfilerConfig::new(ProfilerState::Kineto), CollectionHooks::default());
        let handle = sq.begin_op(&OpCall::new("aten::mul"));
        let id = handle.correlation_id();
        handle.end_at(ApproxTime(i64::MAX - 1));

        let mut storage = sq.take_storage();
        let event = storage.op_events.get_mut(id).unwrap();
        assert_eq!(event.fields.name, "aten::mul");
        assert!(!event.start_time.is_unset());
        assert_eq!(event.end_time, ApproxTime(i64::MAX - 1));
        assert_eq!(event.end_tid, current_tid());
        assert_eq!(sq.op_count(), 0);
    }

    #[test]
    fn test_dropped_handle_leaves_op_unterminated() {
        let sq = subqueue(ProfilerConfig::default(), CollectionHooks::default());
        let _ = sq.begin_op(&OpCall::new("leaky"));
        let storage = sq.take_storage();
        let (_, event) = storage.op_events.iter().next().unwrap();
        assert!(event.end_time.is_unset());
    }

    #[test]
    fn test_collector_push_pop_variants() {
        let collector = Arc::new(StackRecorder::default());
        let hooks = CollectionHooks {
            collector: collector.clone(),
            ..CollectionHooks::default()
        };
        let sq = subqueue(ProfilerConfig::default(), hooks);
        let outer = sq.begin_op(&OpCall::new("outer").scope(RecordScope::UserScope));
        let inner = sq.begin_op(&OpCall::new("inner"));
        let (o, i) = (outer.correlation_id(), inner.correlation_id());
        inner.end();
        outer.end();
        assert_eq!(
            *collector.0.lock().unwrap(),
            vec![format!("push_user {o}"), format!("push {i}"), "pop".into(), "pop_user".into()]
        );
    }

    #[test]
    fn test_side_channels_stay_aligned() {
        let config = ProfilerConfig::new(ProfilerState::Kineto)
            .with_stack(true)
            .with_modules(true)
            .with_flops(true)
            .with_input_shapes(true);
        let hooks = CollectionHooks {
            metadata: Some(Arc::new(Metadata)),
            ..CollectionHooks::default()
        };
        let sq = subqueue(config, hooks);
        let inputs = [OpInput::Scalar(Scalar::Int(1))];
        sq.begin_op(&OpCall::new("fwd").inputs(&inputs)).end();
        sq.begin_op(&OpCall::new("bwd").scope(RecordScope::BackwardFunction)).end();

        let storage = sq.take_storage();
        assert_eq!(storage.op_events.len(), 2);
        assert_eq!(storage.jit_stack, vec![vec!["train.py(10): step".to_string()], vec![]]);
        assert_eq!(storage.jit_modules, vec![vec!["top".to_string()], vec![]]);
        assert_eq!(storage.extra_args.len(), 2);
        assert_eq!(storage.inputs_outputs.op_count(), 2);
    }

    #[test]
    fn test_device_timing_failure_is_not_fatal() {
        let hooks = CollectionHooks {
            device_timer: Some(Arc::new(BrokenTimer)),
            ..CollectionHooks::default()
        };
        let sq = subqueue(ProfilerConfig::new(ProfilerState::KinetoGpuFallback), hooks);
        sq.begin_op(&OpCall::new("matmul")).end();
        let storage = sq.take_storage();
        assert_eq!(storage.gpu_fallback, vec![FallbackTiming::default()]);
        assert_eq!(storage.op_events.len(), 1);
    }

    #[test]
    fn test_end_from_another_thread() {
        let sq = subqueue(ProfilerConfig::default(), CollectionHooks::default());
        let handle = sq.begin_op(&OpCall::new("async").is_async(true));
        let id = handle.correlation_id();
        let other = std::thread::spawn(move || {
            handle.end();
            current_tid()
        })
        .join()
        .unwrap();
        let mut storage = sq.take_storage();
        assert_eq!(storage.op_events.get_mut(id).unwrap().end_tid, other);
    }
}
