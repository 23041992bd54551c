//! Conversion of drained subqueue storage into forest events.

use crate::collection::clock::{ApproxTime, TimeNs};
use crate::collection::events::{
    DeviceAndResource, EVALUATE_FUNCTION_PREFIX, EventKind, OpEvent, OpResult, ProfiledEvent,
    RecordScope,
};
use crate::collection::sampler::PendingEnter;
use crate::collection::subqueue::SubqueueStorage;
use crate::collection::tree::EventForest;

/// One-shot cursor over a side channel. Yields the default value once the
/// channel runs dry, so a disabled feature reads as empty for every op.
struct StealOrDefault<I> {
    inner: I,
}

impl<I> StealOrDefault<I>
where
    I: Iterator,
    I::Item: Default,
{
    fn new(inner: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            inner: inner.into_iter(),
        }
    }

    fn steal(&mut self) -> I::Item {
        self.inner.next().unwrap_or_default()
    }
}

/// Copy the sequence number and forward thread of each backward op onto the
/// autograd wrapper op recorded right before it.
fn link_evaluate_functions(ops: &mut [(u64, OpEvent)]) {
    for i in 1..ops.len() {
        let (head, tail) = ops.split_at_mut(i);
        let first = &mut head[i - 1].1.fields;
        let second = &tail[0].1.fields;
        if first.scope == RecordScope::Function
            && second.scope == RecordScope::BackwardFunction
            && first.name.starts_with(EVALUATE_FUNCTION_PREFIX)
        {
            first.sequence_number = second.sequence_number;
            first.forward_tid = second.forward_tid;
        }
    }
}

/// Append one event per record in `storage` to `out`.
///
/// Interpreter call enters are not events yet; they are converted and pushed
/// to `enters` for the call sampler.
pub(crate) fn materialize(
    storage: SubqueueStorage,
    tid: u64,
    device_resource: DeviceAndResource,
    converter: &dyn Fn(ApproxTime) -> TimeNs,
    out: &mut EventForest,
    enters: &mut Vec<PendingEnter>,
) {
    let SubqueueStorage {
        op_events,
        mut inputs_outputs,
        jit_stack,
        jit_modules,
        extra_args,
        gpu_fallback,
        backend_events,
        allocations,
        ooms,
        py_calls,
    } = storage;

    let mut ops: Vec<(u64, OpEvent)> = op_events.into_iter().collect();
    link_evaluate_functions(&mut ops);

    let mut inputs = StealOrDefault::new(inputs_outputs.drain());
    let mut stacks = StealOrDefault::new(jit_stack);
    let mut modules = StealOrDefault::new(jit_modules);
    let mut extra = StealOrDefault::new(extra_args);
    let mut fallback = StealOrDefault::new(gpu_fallback);

    for (correlation_id, event) in ops {
        let op = OpResult {
            fields: event.fields,
            correlation_id,
            end_time_ns: converter(event.end_time),
            inputs: inputs.steal(),
            stack: stacks.steal(),
            modules: modules.steal(),
            extra_args: extra.steal(),
            fallback: fallback.steal(),
            allow_tf32_cublas: event.allow_tf32_cublas,
            end_tid: event.end_tid,
        };
        out.push(ProfiledEvent::new(
            converter(event.start_time),
            tid,
            device_resource,
            EventKind::Op(op),
        ));
    }

    for backend in backend_events {
        out.push(ProfiledEvent::new(
            backend.start_time_us * 1000,
            tid,
            device_resource,
            EventKind::Backend(backend),
        ));
    }

    for alloc in allocations {
        out.push(ProfiledEvent::new(
            converter(alloc.start_time),
            tid,
            device_resource,
            EventKind::Allocation(alloc),
        ));
    }

    for oom in ooms {
        out.push(ProfiledEvent::new(
            converter(oom.start_time),
            tid,
            device_resource,
            EventKind::OutOfMemory(oom),
        ));
    }

    enters.extend(py_calls.into_iter().map(|(key, t)| PendingEnter {
        key,
        tid,
        device_resource,
        enter_time_ns: converter(t),
    }));
}
