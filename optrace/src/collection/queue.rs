use crate::collection::clock::{ApproxTime, TimeNs, current_tid, preserve_unset};
use crate::collection::config::{ActivityType, ProfilerConfig};
use crate::collection::events::{BackendEvent, MemoryUsage, OpCall};
use crate::collection::external::{ActivityCollector, ActivityTrace, add_collector_events};
use crate::collection::hooks::{CollectionHooks, DeviceTimer, OpMetadataSource};
use crate::collection::materialize::materialize;
use crate::collection::sampler::{CallSampler, CallSamplerFactory};
use crate::collection::storage_ids::calculate_unique_tensor_ids;
use crate::collection::subqueue::{ObserverHandle, ThreadLocalSubqueue};
use crate::collection::tree::{EventForest, build_tree};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

static QUEUE_ID: AtomicU32 = AtomicU32::new(0);

/// The subqueue this thread wrote to last, tagged with the id of the queue
/// that owns it.
struct SubqueueCache {
    key: u32,
    subqueue: Weak<ThreadLocalSubqueue>,
}

thread_local! {
    static SUBQUEUE_CACHE: RefCell<Option<SubqueueCache>> = const { RefCell::new(None) };
}

/// Registry of per-thread subqueues for one profiling session.
///
/// Lifecycle: build, call [`begin_op`](Self::begin_op) from any number of
/// threads, [`stop`](Self::stop), then consume with
/// [`get_records`](Self::get_records).
pub struct RecordQueue {
    id: u32,
    config: Arc<ProfilerConfig>,
    activities: BTreeSet<ActivityType>,
    hooks: Arc<CollectionHooks>,
    sub_queues: Mutex<HashMap<u64, Arc<ThreadLocalSubqueue>>>,
    call_sampler: Mutex<Option<Box<dyn CallSampler>>>,
}

/// Builder for [`RecordQueue`].
pub struct RecordQueueBuilder {
    config: ProfilerConfig,
    activities: BTreeSet<ActivityType>,
    hooks: CollectionHooks,
    call_sampler: Option<CallSamplerFactory>,
}

impl RecordQueueBuilder {
    pub fn collector(mut self, collector: Arc<dyn ActivityCollector>) -> Self {
        self.hooks.collector = collector;
        self
    }

    pub fn metadata_source(mut self, metadata: Arc<dyn OpMetadataSource>) -> Self {
        self.hooks.metadata = Some(metadata);
        self
    }

    pub fn device_timer(mut self, timer: Arc<dyn DeviceTimer>) -> Self {
        self.hooks.device_timer = Some(timer);
        self
    }

    /// Sampler factory, invoked only when the session traces interpreter
    /// calls (stack capture with CPU activities).
    pub fn call_sampler(mut self, factory: CallSamplerFactory) -> Self {
        self.call_sampler = Some(factory);
        self
    }

    pub fn build(self) -> RecordQueue {
        let queue = RecordQueue {
            id: QUEUE_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            config: Arc::new(self.config),
            activities: self.activities,
            hooks: Arc::new(self.hooks),
            sub_queues: Mutex::new(HashMap::new()),
            call_sampler: Mutex::new(None),
        };
        if queue.trace_python()
            && let Some(factory) = self.call_sampler
        {
            let sampler = factory(&queue);
            *queue.call_sampler.lock().unwrap() = Some(sampler);
        }
        debug!(
            queue_id = queue.id,
            state = ?queue.config.state,
            trace_python = queue.trace_python(),
            "record queue created"
        );
        queue
    }
}

impl RecordQueue {
    pub fn builder(config: ProfilerConfig, activities: BTreeSet<ActivityType>) -> RecordQueueBuilder {
        RecordQueueBuilder {
            config,
            activities,
            hooks: CollectionHooks::default(),
            call_sampler: None,
        }
    }

    pub fn new(config: ProfilerConfig, activities: BTreeSet<ActivityType>) -> Self {
        Self::builder(config, activities).build()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn activities(&self) -> &BTreeSet<ActivityType> {
        &self.activities
    }

    pub fn trace_python(&self) -> bool {
        self.config.with_stack && self.activities.contains(&ActivityType::Cpu)
    }

    /// The calling thread's subqueue, created on first use.
    ///
    /// The thread-local cache is only trusted when its key matches this
    /// queue's id; anything else goes through the locked map.
    pub fn get_subqueue(&self) -> Arc<ThreadLocalSubqueue> {
        let cached = SUBQUEUE_CACHE.with(|cache| match &*cache.borrow() {
            Some(c) if c.key == self.id => c.subqueue.upgrade(),
            _ => None,
        });
        if let Some(subqueue) = cached {
            return subqueue;
        }

        let tid = current_tid();
        let subqueue = {
            let mut sub_queues = self.sub_queues.lock().unwrap();
            Arc::clone(sub_queues.entry(tid).or_insert_with(|| {
                debug!(queue_id = self.id, tid, "creating subqueue");
                Arc::new(ThreadLocalSubqueue::new(
                    tid,
                    Arc::clone(&self.config),
                    Arc::clone(&self.hooks),
                ))
            }))
        };
        SUBQUEUE_CACHE.with(|cache| {
            *cache.borrow_mut() = Some(SubqueueCache {
                key: self.id,
                subqueue: Arc::downgrade(&subqueue),
            });
        });
        subqueue
    }

    pub fn begin_op(&self, call: &OpCall<'_>) -> ObserverHandle {
        self.get_subqueue().begin_op(call)
    }

    pub fn record_backend_event(&self, event: BackendEvent) {
        self.get_subqueue().record_backend_event(event);
    }

    pub fn record_allocation(&self, ptr: u64, usage: MemoryUsage) {
        self.get_subqueue().record_allocation(ptr, usage);
    }

    pub fn record_out_of_memory(&self, usage: MemoryUsage) {
        self.get_subqueue().record_out_of_memory(usage);
    }

    /// Record that the calling thread entered the interpreter call `key`.
    pub fn record_py_call(&self, key: u64) {
        self.get_subqueue().record_py_call(key);
    }

    pub fn subqueue_count(&self) -> usize {
        self.sub_queues.lock().unwrap().len()
    }

    /// Halt the call sampler, if any.
    pub fn stop(&self) {
        if let Some(sampler) = self.call_sampler.lock().unwrap().as_mut() {
            sampler.stop();
        }
    }

    /// Drain every subqueue and build the session's event forest.
    ///
    /// `converter` maps approximate clock readings to nanoseconds; the
    /// unterminated sentinel is preserved regardless of what it does.
    pub fn get_records(
        self,
        converter: impl Fn(ApproxTime) -> TimeNs,
        start_time_us: i64,
        end_time_us: i64,
    ) -> (EventForest, Option<ActivityTrace>) {
        let converter = preserve_unset(converter);
        let mut forest = EventForest::new();
        let mut enters = Vec::new();

        let mut sub_queues: Vec<_> = std::mem::take(&mut *self.sub_queues.lock().unwrap())
            .into_values()
            .collect();
        sub_queues.sort_by_key(|sq| sq.tid());
        for sq in &sub_queues {
            materialize(
                sq.take_storage(),
                sq.tid(),
                sq.device_resource(),
                &converter,
                &mut forest,
                &mut enters,
            );
        }

        if let Some(mut sampler) = self.call_sampler.lock().unwrap().take() {
            for event in sampler.get_events(&converter, enters, end_time_us * 1000) {
                forest.push(event);
            }
        }

        let trace = add_collector_events(
            &mut forest,
            self.hooks.collector.as_ref(),
            &self.config,
            start_time_us,
            end_time_us,
        );

        forest.sort_by_start_time();
        if self.config.resolves_storage_ids() {
            calculate_unique_tensor_ids(&mut forest);
        }
        build_tree(&mut forest);

        debug!(
            queue_id = self.id,
            subqueues = sub_queues.len(),
            events = forest.len(),
            merged_trace = trace.is_some(),
            "collected records"
        );
        (forest, trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::clock::ClockConverter;
    use crate::collection::config::ProfilerState;

    fn cpu() -> BTreeSet<ActivityType> {
        BTreeSet::from([ActivityType::Cpu])
    }

    #[test]
    fn test_queue_ids_are_unique() {
        let a = RecordQueue::new(ProfilerConfig::default(), cpu());
        let b = RecordQueue::new(ProfilerConfig::default(), cpu());
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), 0);
    }

    #[test]
    fn test_cache_reuses_subqueue() {
        let queue = RecordQueue::new(ProfilerConfig::default(), cpu());
        let first = queue.get_subqueue();
        let second = queue.get_subqueue();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(queue.subqueue_count(), 1);
    }

    #[test]
    fn test_cache_is_not_shared_between_queues() {
        let a = RecordQueue::new(ProfilerConfig::default(), cpu());
        let b = RecordQueue::new(ProfilerConfig::default(), cpu());
        let sa = a.get_subqueue();
        let sb = b.get_subqueue();
        assert!(!Arc::ptr_eq(&sa, &sb));
        // Alternating between sessions refreshes the cache each time.
        assert!(Arc::ptr_eq(&a.get_subqueue(), &sa));
        assert!(Arc::ptr_eq(&b.get_subqueue(), &sb));
    }

    #[test]
    fn test_stale_cache_after_drop() {
        let old = RecordQueue::new(ProfilerConfig::default(), cpu());
        old.begin_op(&OpCall::new("old")).end();
        drop(old);

        let queue = RecordQueue::new(ProfilerConfig::default(), cpu());
        queue.begin_op(&OpCall::new("new")).end();
        let (forest, _) = queue.get_records(|t| t.0, 0, 0);
        let names: Vec<_> = forest.iter().map(|(_, e)| e.name()).collect();
        assert_eq!(names, vec!["new"]);
    }

    #[test]
    fn test_trace_python_requires_stack_and_cpu() {
        let config = ProfilerConfig::new(ProfilerState::Kineto).with_stack(true);
        assert!(RecordQueue::new(config.clone(), cpu()).trace_python());
        assert!(!RecordQueue::new(config, BTreeSet::from([ActivityType::Cuda])).trace_python());
        assert!(!RecordQueue::new(ProfilerConfig::default(), cpu()).trace_python());
    }

    #[test]
    fn test_get_records_nests_ops() {
        let queue = RecordQueue::new(ProfilerConfig::new(ProfilerState::Cpu), cpu());
        let outer = queue.begin_op(&OpCall::new("outer"));
        queue.begin_op(&OpCall::new("inner")).end();
        outer.end();

        let (forest, trace) = queue.get_records(
            {
                let converter = ClockConverter::new();
                move |t| converter.convert(t)
            },
            0,
            0,
        );
        assert!(trace.is_none());
        assert_eq!(forest.len(), 2);
        let roots: Vec<_> = forest.roots().collect();
        assert_eq!(roots.len(), 1);
        let children = forest.children(roots[0]);
        assert_eq!(children.len(), 1);
        assert_eq!(forest[children[0]].name(), "inner");
    }
}
