use crate::collection::arena::CorrelationId;
use crate::collection::clock::{ApproxTime, TimeNs, UNTERMINATED};
use crate::collection::encoder::{Device, DeviceType, OpInput, OpInputs, TensorId};
use crate::collection::hooks::{ExtraArgs, FallbackTiming};
use serde::Serialize;

/// Thread id placeholder for events reported by the activity collector until
/// their owning thread is inferred from their parent.
pub const NO_TID: u64 = u64::MAX;

/// Flow type linking a host-side launch to the device work it enqueued.
pub const FLOW_LINK_ASYNC_CPU_GPU: u32 = 2;

/// Name prefix of the autograd wrapper op that precedes each backward op.
pub(crate) const EVALUATE_FUNCTION_PREFIX: &str = "autograd::engine::evaluate_function: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordScope {
    #[default]
    Function,
    /// Autograd backward work. Exempt from stack and module capture.
    BackwardFunction,
    TorchscriptFunction,
    /// User annotation; pushed to the collector as a user correlation id.
    UserScope,
}

/// Device/resource pair reported alongside every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct DeviceAndResource {
    pub device: i32,
    pub resource: i32,
}

impl DeviceAndResource {
    /// Host events use the process id as device and the thread id as resource.
    pub fn current(tid: u64) -> Self {
        Self {
            device: std::process::id() as i32,
            resource: tid as i32,
        }
    }
}

/// What the instrumentation knows about an op when it begins.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpCall<'a> {
    pub name: &'a str,
    pub scope: RecordScope,
    pub is_async: bool,
    pub sequence_number: i64,
    /// Thread that ran the forward op this backward op belongs to, 0 if none.
    pub forward_tid: u64,
    pub debug_handle: i64,
    pub inputs: &'a [OpInput],
}

impl<'a> OpCall<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn scope(mut self, scope: RecordScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn inputs(mut self, inputs: &'a [OpInput]) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn forward_tid(mut self, forward_tid: u64) -> Self {
        self.forward_tid = forward_tid;
        self
    }

    pub fn is_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }
}

/// Fields copied out of an [`OpCall`] into the op record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OpFields {
    pub name: String,
    pub scope: RecordScope,
    pub is_async: bool,
    pub sequence_number: i64,
    pub forward_tid: u64,
    pub debug_handle: i64,
}

impl From<&OpCall<'_>> for OpFields {
    fn from(call: &OpCall<'_>) -> Self {
        Self {
            name: call.name.to_string(),
            scope: call.scope,
            is_async: call.is_async,
            sequence_number: call.sequence_number,
            forward_tid: call.forward_tid,
            debug_handle: call.debug_handle,
        }
    }
}

/// Raw op record as it sits in a subqueue arena.
#[derive(Debug, Clone)]
pub(crate) struct OpEvent {
    pub(crate) fields: OpFields,
    pub(crate) start_time: ApproxTime,
    pub(crate) end_time: ApproxTime,
    pub(crate) end_tid: u64,
    pub(crate) allow_tf32_cublas: bool,
}

impl OpEvent {
    pub(crate) fn new(fields: OpFields) -> Self {
        Self {
            fields,
            start_time: ApproxTime::UNSET,
            end_time: ApproxTime::UNSET,
            end_tid: 0,
            allow_tf32_cublas: false,
        }
    }
}

/// An op executed by a delegate backend, timed by the backend itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendEvent {
    pub start_time_us: i64,
    pub end_time_us: i64,
    pub debug_handle: i64,
    pub scope: RecordScope,
    pub name: String,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationEvent {
    pub start_time: ApproxTime,
    pub ptr: u64,
    /// Negative sizes are frees.
    pub alloc_size: i64,
    pub total_allocated: i64,
    pub total_reserved: i64,
    pub device_type: DeviceType,
    pub device_index: i8,
    /// Filled in by storage identity resolution.
    pub id: Option<TensorId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutOfMemoryEvent {
    pub start_time: ApproxTime,
    pub alloc_size: i64,
    pub total_allocated: i64,
    pub total_reserved: i64,
    pub device_type: DeviceType,
    pub device_index: i8,
}

/// Allocator counters reported with allocation and OOM events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub alloc_size: i64,
    pub total_allocated: i64,
    pub total_reserved: i64,
    pub device: Device,
}

/// Activity categories understood by the external collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    CpuOp,
    UserAnnotation,
    GpuUserAnnotation,
    GpuMemcpy,
    GpuMemset,
    ConcurrentKernel,
    ExternalCorrelation,
    CudaRuntime,
    CudaDriver,
    CpuInstantEvent,
    PythonFunction,
    Overhead,
}

impl ActivityKind {
    /// Activity kinds that only this crate hands to the collector. A trace
    /// activity of one of these kinds that cannot be matched back is suspect.
    pub fn is_host_profiler_kind(self) -> bool {
        matches!(
            self,
            ActivityKind::CpuOp
                | ActivityKind::CpuInstantEvent
                | ActivityKind::UserAnnotation
                | ActivityKind::PythonFunction
        )
    }

    pub fn device_type(self) -> DeviceType {
        match self {
            ActivityKind::GpuMemcpy
            | ActivityKind::GpuMemset
            | ActivityKind::ConcurrentKernel
            | ActivityKind::GpuUserAnnotation => DeviceType::Cuda,
            ActivityKind::CpuOp
            | ActivityKind::UserAnnotation
            | ActivityKind::ExternalCorrelation
            | ActivityKind::CudaRuntime
            | ActivityKind::CudaDriver
            | ActivityKind::CpuInstantEvent
            | ActivityKind::PythonFunction
            | ActivityKind::Overhead => DeviceType::Cpu,
        }
    }
}

impl From<RecordScope> for ActivityKind {
    fn from(scope: RecordScope) -> Self {
        match scope {
            RecordScope::UserScope => ActivityKind::UserAnnotation,
            _ => ActivityKind::CpuOp,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Flow {
    pub id: u32,
    pub kind: u32,
    pub start: bool,
}

/// Index of an event inside an `EventForest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpResult {
    pub fields: OpFields,
    pub correlation_id: CorrelationId,
    /// `UNTERMINATED` when the op never received its end stamp.
    pub end_time_ns: TimeNs,
    pub inputs: OpInputs,
    pub stack: Vec<String>,
    pub modules: Vec<String>,
    pub extra_args: ExtraArgs,
    pub fallback: FallbackTiming,
    pub allow_tf32_cublas: bool,
    pub end_tid: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExternalEvent {
    pub name: String,
    pub duration_us: i64,
    /// 0 when the collector did not correlate the activity.
    pub correlation_id: u64,
    pub activity_type: ActivityKind,
    pub flow: Flow,
    pub linked_activity: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NnModuleInfo {
    pub cls_name: String,
    pub id: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyCallEvent {
    pub callsite: PyFrame,
    pub module: Option<NnModuleInfo>,
    pub end_time_ns: TimeNs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyCCallEvent {
    pub function_name: String,
    pub end_time_ns: TimeNs,
}

/// Kind-specific payload of a [`ProfiledEvent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum EventKind {
    Op(OpResult),
    Backend(BackendEvent),
    Allocation(AllocationEvent),
    OutOfMemory(OutOfMemoryEvent),
    External(ExternalEvent),
    PyCall(PyCallEvent),
    PyCCall(PyCCallEvent),
}

/// A normalized event, the unit of the output forest.
///
/// Tree links are indices into the owning `EventForest`; use the forest's
/// accessors for queries that depend on the parent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfiledEvent {
    pub start_time_ns: TimeNs,
    pub start_tid: u64,
    pub device_resource: DeviceAndResource,
    pub kind: EventKind,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) finished: bool,
    /// Index of the matching activity in the collector's trace, if any.
    pub(crate) external_activity: Option<usize>,
}

impl ProfiledEvent {
    pub fn new(
        start_time_ns: TimeNs,
        start_tid: u64,
        device_resource: DeviceAndResource,
        kind: EventKind,
    ) -> Self {
        Self {
            start_time_ns,
            start_tid,
            device_resource,
            kind,
            parent: None,
            children: Vec::new(),
            finished: false,
            external_activity: None,
        }
    }

    pub fn name(&self) -> String {
        match &self.kind {
            EventKind::Op(e) => e.fields.name.clone(),
            EventKind::Backend(e) => e.name.clone(),
            EventKind::Allocation(_) => "[memory]".to_string(),
            EventKind::OutOfMemory(_) => "[OutOfMemory]".to_string(),
            EventKind::External(e) => e.name.clone(),
            EventKind::PyCall(e) => match &e.module {
                Some(m) => format!("nn.Module: {}_{}", m.cls_name, m.id),
                None => format!(
                    "{}({}): {}",
                    e.callsite.file, e.callsite.line, e.callsite.function
                ),
            },
            EventKind::PyCCall(e) => e.function_name.clone(),
        }
    }

    pub fn activity_type(&self) -> ActivityKind {
        match &self.kind {
            EventKind::Op(e) => e.fields.scope.into(),
            EventKind::Backend(e) => e.scope.into(),
            EventKind::Allocation(_) | EventKind::OutOfMemory(_) => ActivityKind::CpuInstantEvent,
            EventKind::PyCall(_) | EventKind::PyCCall(_) => ActivityKind::PythonFunction,
            EventKind::External(e) => e.activity_type,
        }
    }

    /// End time as recorded by the event itself, before any parent fallback.
    pub fn recorded_end_time_ns(&self) -> TimeNs {
        match &self.kind {
            EventKind::Op(e) => e.end_time_ns,
            EventKind::Backend(e) => e.end_time_us * 1000,
            EventKind::Allocation(_) | EventKind::OutOfMemory(_) => self.start_time_ns,
            EventKind::External(e) => self.start_time_ns + e.duration_us * 1000,
            EventKind::PyCall(e) => e.end_time_ns,
            EventKind::PyCCall(e) => e.end_time_ns,
        }
    }

    pub fn is_unterminated(&self) -> bool {
        self.recorded_end_time_ns() == UNTERMINATED
    }

    pub fn end_tid(&self) -> u64 {
        match &self.kind {
            EventKind::Op(e) => e.end_tid,
            EventKind::Backend(_)
            | EventKind::Allocation(_)
            | EventKind::OutOfMemory(_)
            | EventKind::External(_)
            | EventKind::PyCall(_)
            | EventKind::PyCCall(_) => self.start_tid,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        match &self.kind {
            EventKind::Allocation(e) => e.device_type,
            EventKind::OutOfMemory(e) => e.device_type,
            EventKind::External(e) => e.activity_type.device_type(),
            EventKind::Op(_) | EventKind::Backend(_) | EventKind::PyCall(_) | EventKind::PyCCall(_) => {
                DeviceType::Cpu
            }
        }
    }

    /// Forward thread of a backward op, 0 for everything else.
    pub fn forward_tid(&self) -> u64 {
        match &self.kind {
            EventKind::Op(e) => e.fields.forward_tid,
            _ => 0,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.kind, EventKind::External(_))
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind) -> ProfiledEvent {
        ProfiledEvent::new(1_000, 7, DeviceAndResource::default(), kind)
    }

    fn allocation(alloc_size: i64) -> EventKind {
        EventKind::Allocation(AllocationEvent {
            start_time: ApproxTime(0),
            ptr: 0x1000,
            alloc_size,
            total_allocated: 0,
            total_reserved: 0,
            device_type: DeviceType::Cuda,
            device_index: 0,
            id: None,
        })
    }

    #[test]
    fn test_names() {
        assert_eq!(event(allocation(8)).name(), "[memory]");
        let module = event(EventKind::PyCall(PyCallEvent {
            callsite: PyFrame {
                file: "model.py".into(),
                line: 12,
                function: "forward".into(),
            },
            module: Some(NnModuleInfo {
                cls_name: "Linear".into(),
                id: 3,
            }),
            end_time_ns: 2_000,
        }));
        assert_eq!(module.name(), "nn.Module: Linear_3");
        let plain = event(EventKind::PyCall(PyCallEvent {
            callsite: PyFrame {
                file: "model.py".into(),
                line: 12,
                function: "forward".into(),
            },
            module: None,
            end_time_ns: 2_000,
        }));
        assert_eq!(plain.name(), "model.py(12): forward");
    }

    #[test]
    fn test_activity_types() {
        let user = event(EventKind::Op(OpResult {
            fields: OpFields {
                name: "step".into(),
                scope: RecordScope::UserScope,
                ..OpFields::default()
            },
            ..OpResult::default()
        }));
        assert_eq!(user.activity_type(), ActivityKind::UserAnnotation);
        assert_eq!(event(allocation(8)).activity_type(), ActivityKind::CpuInstantEvent);
        assert_eq!(event(allocation(8)).device_type(), DeviceType::Cuda);
    }

    #[test]
    fn test_recorded_end_times() {
        assert_eq!(event(allocation(-8)).recorded_end_time_ns(), 1_000);
        let backend = event(EventKind::Backend(BackendEvent {
            start_time_us: 1,
            end_time_us: 5,
            ..BackendEvent::default()
        }));
        assert_eq!(backend.recorded_end_time_ns(), 5_000);
        let external = event(EventKind::External(ExternalEvent {
            name: "kernel".into(),
            duration_us: 3,
            correlation_id: 0,
            activity_type: ActivityKind::ConcurrentKernel,
            flow: Flow::default(),
            linked_activity: None,
        }));
        assert_eq!(external.recorded_end_time_ns(), 4_000);
        assert_eq!(external.device_type(), DeviceType::Cuda);
        let unterminated = event(EventKind::Op(OpResult {
            end_time_ns: UNTERMINATED,
            ..OpResult::default()
        }));
        assert!(unterminated.is_unterminated());
    }
}
