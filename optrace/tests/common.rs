use optrace::collection::{
    Activity, ActivityCollector, ActivityKind, ActivityTrace, ApproxTime, CallSampler,
    CollectionError, CpuActivity, DeviceAndResource, DeviceEvent, DeviceTimer, EventForest,
    EventKind, ExtraArgs, Flow, NodeId, OpCall, OpFields, OpMetadataSource, OpResult,
    PendingEnter, ProfiledEvent, PyCallEvent, PyFrame, Result, TimeNs, approx_now,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Busy-wait until the approximate clock has advanced, so consecutive
/// records get distinct timestamps.
#[allow(dead_code)]
pub fn tick() {
    let t = approx_now();
    while approx_now() <= t {
        std::hint::spin_loop();
    }
}

/// An activity the collector "discovered" on its own.
#[allow(dead_code)]
#[derive(Clone)]
pub struct ExtraActivity {
    pub activity: Activity,
    /// Link to the host activity carrying this correlation id.
    pub link_correlation: Option<u64>,
    /// Link to another extra activity, by position in the extras list.
    pub link_extra: Option<usize>,
}

#[allow(dead_code)]
pub fn device_activity(name: &str, kind: ActivityKind, flow: Flow, timestamp_us: i64) -> Activity {
    Activity {
        name: name.to_string(),
        duration_us: 1,
        correlation_id: 0,
        activity_type: kind,
        flow,
        linked_activity: None,
        device_id: 0,
        resource_id: 7,
        timestamp_us,
        metadata: String::new(),
    }
}

/// A collector double that records what it is told and returns the host
/// activities it was given, followed by scripted extras, as its trace.
#[derive(Default)]
pub struct ScriptedCollector {
    pub calls: Mutex<Vec<String>>,
    pub passed: Mutex<Vec<CpuActivity>>,
    pub extras: Mutex<Vec<ExtraActivity>>,
    pub threads: Mutex<HashSet<u64>>,
    pub stopped: AtomicBool,
}

#[allow(dead_code)]
impl ScriptedCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_extra(&self, extra: ExtraActivity) {
        self.extras.lock().unwrap().push(extra);
    }
}

impl ActivityCollector for ScriptedCollector {
    fn push_correlation_id(&self, id: u64) {
        self.calls.lock().unwrap().push(format!("push {id}"));
    }

    fn push_user_correlation_id(&self, id: u64) {
        self.calls.lock().unwrap().push(format!("push_user {id}"));
    }

    fn pop_correlation_id(&self) {
        self.calls.lock().unwrap().push("pop".to_string());
    }

    fn pop_user_correlation_id(&self) {
        self.calls.lock().unwrap().push("pop_user".to_string());
    }

    fn record_thread_info(&self, tid: u64) {
        self.threads.lock().unwrap().insert(tid);
    }

    fn transfer_cpu_trace(&self, _start_time_us: i64, activities: Vec<CpuActivity>, _end_time_us: i64) {
        self.passed.lock().unwrap().extend(activities);
    }

    fn stop_trace(&self) -> Option<ActivityTrace> {
        self.stopped.store(true, Ordering::Relaxed);
        let passed = self.passed.lock().unwrap();
        let mut activities: Vec<Activity> = passed
            .iter()
            .map(|a| Activity {
                name: a.name.clone(),
                duration_us: a.end_time_us - a.start_time_us,
                correlation_id: a.correlation_id,
                activity_type: a.activity_type,
                flow: Flow::default(),
                linked_activity: None,
                device_id: a.device_resource.device as i64,
                resource_id: a.device_resource.resource as i64,
                timestamp_us: a.start_time_us,
                metadata: a.metadata.clone(),
            })
            .collect();

        let host_count = activities.len();
        for extra in self.extras.lock().unwrap().iter() {
            let mut activity = extra.activity.clone();
            activity.linked_activity = extra
                .link_correlation
                .and_then(|c| passed.iter().position(|p| p.correlation_id == c))
                .or(extra.link_extra.map(|i| host_count + i));
            activities.push(activity);
        }
        Some(ActivityTrace { activities })
    }
}

/// Device timer whose every call fails.
#[allow(dead_code)]
pub struct FailingTimer;

impl DeviceTimer for FailingTimer {
    fn record(&self) -> Result<DeviceEvent> {
        Err(CollectionError::DeviceTiming("device lost".to_string()))
    }

    fn elapsed_us(&self, _start: DeviceEvent, _end: DeviceEvent) -> Result<f64> {
        Err(CollectionError::DeviceTiming("device lost".to_string()))
    }
}

/// Device timer handing out increasing event handles.
#[allow(dead_code)]
#[derive(Default)]
pub struct CountingTimer(AtomicUsize);

impl DeviceTimer for CountingTimer {
    fn record(&self) -> Result<DeviceEvent> {
        Ok(DeviceEvent(self.0.fetch_add(1, Ordering::Relaxed) as u64))
    }

    fn elapsed_us(&self, start: DeviceEvent, end: DeviceEvent) -> Result<f64> {
        Ok((end.0 - start.0) as f64)
    }
}

/// Metadata source with a fixed stack whose stack capture can be made to fail.
#[allow(dead_code)]
pub struct StaticMetadata {
    pub fail_stack: bool,
}

impl OpMetadataSource for StaticMetadata {
    fn call_stack(&self) -> Result<Vec<String>> {
        if self.fail_stack {
            Err(CollectionError::CallStack("interpreter unavailable".to_string()))
        } else {
            Ok(vec!["train.py(3): main".to_string(), "model.py(8): forward".to_string()])
        }
    }

    fn module_hierarchy(&self) -> Vec<String> {
        vec!["Net".to_string(), "Net.fc1".to_string()]
    }

    fn extra_args(&self, call: &OpCall<'_>) -> ExtraArgs {
        ExtraArgs::from([(
            "inputs".to_string(),
            optrace::collection::Scalar::Int(call.inputs.len() as i64),
        )])
    }
}

/// Sampler that turns every pending enter into a call ending at session end.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedSampler {
    pub stopped: Arc<AtomicBool>,
}

impl CallSampler for ScriptedSampler {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn get_events(
        &mut self,
        _converter: &dyn Fn(ApproxTime) -> TimeNs,
        enters: Vec<PendingEnter>,
        end_time_ns: TimeNs,
    ) -> Vec<ProfiledEvent> {
        enters
            .into_iter()
            .map(|e| {
                ProfiledEvent::new(
                    e.enter_time_ns,
                    e.tid,
                    e.device_resource,
                    EventKind::PyCall(PyCallEvent {
                        callsite: PyFrame {
                            file: "train.py".to_string(),
                            line: e.key as u32,
                            function: "step".to_string(),
                        },
                        module: None,
                        end_time_ns,
                    }),
                )
            })
            .collect()
    }
}

#[allow(dead_code)]
pub fn op(name: &str, tid: u64, start: TimeNs, end: TimeNs) -> ProfiledEvent {
    ProfiledEvent::new(
        start,
        tid,
        DeviceAndResource::default(),
        EventKind::Op(OpResult {
            fields: OpFields {
                name: name.to_string(),
                ..OpFields::default()
            },
            end_time_ns: end,
            ..OpResult::default()
        }),
    )
}

#[allow(dead_code)]
pub fn find(forest: &EventForest, name: &str) -> NodeId {
    forest
        .iter()
        .find(|(_, e)| e.name() == name)
        .map(|(id, _)| id)
        .unwrap_or_else(|| panic!("no event named {name}"))
}

/// Check the structural invariants of a finished forest.
#[allow(dead_code)]
pub fn assert_well_formed(forest: &EventForest) {
    let mut seen_as_child = HashSet::new();
    for (id, event) in forest.iter() {
        assert!(event.is_finished(), "{} was never finished", event.name());
        for &child in event.children() {
            assert!(seen_as_child.insert(child), "{:?} has two parents", child);
            assert_eq!(forest.parent(child), Some(id));
            assert!(
                forest.end_time_ns(id) >= forest.end_time_ns(child),
                "{} ends before its child {}",
                event.name(),
                forest[child].name()
            );
        }
        if let Some(parent) = event.parent() {
            assert!(forest.children(parent).contains(&id));
        }

        // Walking up must terminate without revisiting a node.
        let mut visited = HashSet::from([id]);
        let mut cursor = event.parent();
        while let Some(p) = cursor {
            assert!(visited.insert(p), "cycle through {}", event.name());
            cursor = forest.parent(p);
        }
    }
    let roots: HashSet<NodeId> = forest.roots().collect();
    assert_eq!(roots.len() + seen_as_child.len(), forest.len());
}
