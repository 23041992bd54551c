//! Boundary with the external activity collector and the merge of its trace
//! into the event forest.
//!
//! Two mechanisms connect collector activities to our events. Correlation ids
//! pushed at op start let the collector set an activity's linked activity to
//! the op that launched it. Flows go further: a launch is the start of a flow
//! and the device work it enqueued carries the same flow id, so the chain
//! `op -> launch -> kernel` is preserved instead of hanging both activities
//! directly off the op. Flow links win over linked activities.

use crate::collection::clock::current_tid;
use crate::collection::config::ProfilerConfig;
use crate::collection::error::Result;
use crate::collection::events::{
    ActivityKind, DeviceAndResource, EventKind, ExternalEvent, FLOW_LINK_ASYNC_CPU_GPU, Flow,
    NO_TID, NodeId, ProfiledEvent,
};
use crate::collection::tree::EventForest;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::{debug, warn};

/// Metadata key under which each host activity records its forest index.
pub const INDEX_KEY: &str = "Profiler Event Index";

/// Host-side activity handed to the collector once the session stops.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuActivity {
    pub name: String,
    pub activity_type: ActivityKind,
    pub device_resource: DeviceAndResource,
    pub correlation_id: u64,
    pub start_time_us: i64,
    pub end_time_us: i64,
    /// JSON object body (without braces) carried through the collector.
    pub metadata: String,
}

/// An activity in the trace returned by the collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Activity {
    pub name: String,
    pub duration_us: i64,
    pub correlation_id: u64,
    pub activity_type: ActivityKind,
    pub flow: Flow,
    /// Index of the linked activity within the same trace.
    pub linked_activity: Option<usize>,
    pub device_id: i64,
    pub resource_id: i64,
    pub timestamp_us: i64,
    pub metadata: String,
}

/// Trace handed back by the collector after it stops.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivityTrace {
    pub activities: Vec<Activity>,
}

/// An external hardware/activity trace collector.
///
/// The correlation id calls are made on the thread running the op and must
/// nest per thread.
pub trait ActivityCollector: Send + Sync {
    fn push_correlation_id(&self, id: u64);
    fn push_user_correlation_id(&self, id: u64);
    fn pop_correlation_id(&self);
    fn pop_user_correlation_id(&self);

    /// Called once for each thread that records its first op in a session.
    fn record_thread_info(&self, _tid: u64) {}

    fn transfer_cpu_trace(&self, start_time_us: i64, activities: Vec<CpuActivity>, end_time_us: i64);

    /// Stop collecting and hand over the trace, if one was collected.
    fn stop_trace(&self) -> Option<ActivityTrace>;
}

/// Collector used when no external collector is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl ActivityCollector for NoopCollector {
    fn push_correlation_id(&self, _id: u64) {}
    fn push_user_correlation_id(&self, _id: u64) {}
    fn pop_correlation_id(&self) {}
    fn pop_user_correlation_id(&self) {}
    fn transfer_cpu_trace(&self, _start: i64, _activities: Vec<CpuActivity>, _end: i64) {}

    fn stop_trace(&self) -> Option<ActivityTrace> {
        None
    }
}

/// Recover the forest index embedded by [`pass_events_to_collector`].
pub fn extract_index(metadata: &str) -> Result<Option<usize>> {
    if metadata.trim().is_empty() {
        return Ok(None);
    }
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&format!("{{{metadata}}}"))?;
    Ok(match object.get(INDEX_KEY) {
        Some(serde_json::Value::Number(n)) => n.as_u64().map(|i| i as usize),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Hand every event to the collector, tagged with its forest index.
pub fn pass_events_to_collector(
    forest: &EventForest,
    collector: &dyn ActivityCollector,
    start_time_us: i64,
    end_time_us: i64,
) {
    let activities = forest
        .iter()
        .map(|(id, e)| CpuActivity {
            name: e.name(),
            activity_type: e.activity_type(),
            device_resource: e.device_resource,
            correlation_id: forest.correlation_id(id),
            start_time_us: e.start_time_ns / 1000,
            end_time_us: forest.end_time_ns(id) / 1000,
            metadata: format!("\"{INDEX_KEY}\": {}", id.0),
        })
        .collect();
    collector.transfer_cpu_trace(start_time_us, activities, end_time_us);
}

/// Pass events to the collector and, unless the collector is driven
/// globally, merge its trace back into the forest.
pub fn add_collector_events(
    forest: &mut EventForest,
    collector: &dyn ActivityCollector,
    config: &ProfilerConfig,
    start_time_us: i64,
    end_time_us: i64,
) -> Option<ActivityTrace> {
    pass_events_to_collector(forest, collector, start_time_us, end_time_us);

    // On-demand sessions leave the collector to other machinery.
    if config.global {
        return None;
    }

    let trace = collector.stop_trace()?;
    TransferEvents::new(forest, &trace).run();
    Some(trace)
}

/// Merges a collector trace into the forest.
pub struct TransferEvents<'a> {
    forest: &'a mut EventForest,
    trace: &'a ActivityTrace,
    /// Resolved node for each trace activity, filled lazily.
    resolved: Vec<Option<NodeId>>,
    matched: usize,
    /// Activities whose metadata could not be parsed.
    malformed: usize,
    warned_unknown: bool,
}

impl<'a> TransferEvents<'a> {
    pub fn new(forest: &'a mut EventForest, trace: &'a ActivityTrace) -> Self {
        Self {
            resolved: vec![None; trace.activities.len()],
            forest,
            trace,
            matched: 0,
            malformed: 0,
            warned_unknown: false,
        }
    }

    pub fn run(mut self) {
        let known = self.forest.len();
        self.reassociate(known);
        self.extract_events_from_trace();
        self.set_parents();
    }

    /// Match activities carrying a forest index back to their event.
    fn reassociate(&mut self, known: usize) {
        for (idx, activity) in self.trace.activities.iter().enumerate() {
            let index = match extract_index(&activity.metadata) {
                Ok(index) => index,
                Err(err) => {
                    if self.malformed == 0 {
                        warn!(name = %activity.name, %err, "ignoring malformed activity metadata");
                    }
                    self.malformed += 1;
                    None
                }
            };
            let Some(index) = index.filter(|i| *i < known) else {
                continue;
            };
            let node = NodeId(index);
            if self.forest[node].external_activity.is_some() {
                warn!(
                    name = %activity.name,
                    index,
                    "multiple activities claim the same event"
                );
                continue;
            }
            self.forest[node].external_activity = Some(idx);
            self.resolved[idx] = Some(node);
            self.matched += 1;
        }

        if self.malformed > 1 {
            debug!(count = self.malformed, "activities with malformed metadata");
        }
        if self.matched != known {
            warn!(
                events = known,
                reassociated = self.matched,
                "failed to recover relationship between all profiler and collector events"
            );
        }
    }

    fn node_for(&mut self, idx: usize) -> Option<NodeId> {
        if let Some(node) = self.resolved[idx] {
            return Some(node);
        }

        let activity = &self.trace.activities[idx];
        if activity.activity_type.is_host_profiler_kind() {
            // Our own activity without a usable index; cannot place it.
            if !self.warned_unknown {
                self.warned_unknown = true;
                warn!(
                    name = %activity.name,
                    "collector returned a host activity that matches no recorded event"
                );
            }
            return None;
        }

        let node = self.forest.push(ProfiledEvent::new(
            activity.timestamp_us * 1000,
            NO_TID,
            DeviceAndResource {
                device: activity.device_id as i32,
                resource: activity.resource_id as i32,
            },
            EventKind::External(ExternalEvent {
                name: activity.name.clone(),
                duration_us: activity.duration_us,
                correlation_id: activity.correlation_id,
                activity_type: activity.activity_type,
                flow: activity.flow,
                linked_activity: None,
            }),
        ));
        self.forest[node].external_activity = Some(idx);
        self.resolved[idx] = Some(node);
        Some(node)
    }

    fn extract_events_from_trace(&mut self) {
        for idx in 0..self.trace.activities.len() {
            let node = self.node_for(idx);
            let linked = self.trace.activities[idx]
                .linked_activity
                .filter(|l| *l < self.trace.activities.len());
            if let (Some(node), Some(linked)) = (node, linked) {
                let linked_node = self.node_for(linked);
                if let EventKind::External(ext) = &mut self.forest[node].kind {
                    ext.linked_activity = linked_node;
                }
            }
        }
    }

    fn set_parents(&mut self) {
        // First flow start seen for an id wins; later ones are reported.
        let mut flow_starts: HashMap<u32, NodeId> = HashMap::new();
        let mut duplicate_starts = 0usize;
        let mut parents: Vec<(NodeId, NodeId)> = Vec::new();

        for id in self.forest.node_ids() {
            let EventKind::External(ext) = &self.forest[id].kind else {
                continue;
            };
            if ext.flow.kind == FLOW_LINK_ASYNC_CPU_GPU && ext.flow.start {
                match flow_starts.entry(ext.flow.id) {
                    Entry::Vacant(slot) => {
                        slot.insert(id);
                    }
                    Entry::Occupied(_) => duplicate_starts += 1,
                }
            }
        }
        if duplicate_starts > 0 {
            warn!(
                duplicate_starts,
                "collector produced duplicate flow starts, keeping the first of each"
            );
        }

        for id in self.forest.node_ids() {
            let EventKind::External(ext) = &self.forest[id].kind else {
                continue;
            };
            let flow_parent = (ext.flow.kind == FLOW_LINK_ASYNC_CPU_GPU && !ext.flow.start)
                .then(|| flow_starts.get(&ext.flow.id).copied())
                .flatten();
            if let Some(parent) = flow_parent.or(ext.linked_activity)
                && parent != id
            {
                parents.push((id, parent));
            }
        }

        for &(child, parent) in &parents {
            self.forest.attach(child, parent);
            self.forest.mark_finished(child);
        }
        debug!(linked = parents.len(), "attached collector events");

        let roots: Vec<NodeId> = self.forest.roots().collect();
        for root in roots {
            self.set_tids(root);
        }
    }

    /// Collector events inherit the thread of their parent; roots take the
    /// thread doing the merge.
    fn set_tids(&mut self, root: NodeId) {
        let mut pending = vec![(root, None::<u64>)];
        while let Some((id, parent_tid)) = pending.pop() {
            if self.forest[id].is_external() && self.forest[id].start_tid == NO_TID {
                self.forest[id].start_tid = parent_tid.unwrap_or_else(current_tid);
            }
            let tid = self.forest[id].start_tid;
            pending.extend(self.forest.children(id).iter().map(|c| (*c, Some(tid))));
        }
    }
}
