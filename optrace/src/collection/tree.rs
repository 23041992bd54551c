//! Output forest and the replay that reconstructs parent/child structure.

use crate::collection::clock::{TimeNs, UNTERMINATED};
use crate::collection::events::{EventKind, NodeId, ProfiledEvent};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::ops::{Index, IndexMut};
use tracing::warn;

/// Arena holding every event of a session. Parent and child links are
/// [`NodeId`]s into the same arena.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventForest {
    events: Vec<ProfiledEvent>,
}

impl EventForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: ProfiledEvent) -> NodeId {
        self.events.push(event);
        NodeId(self.events.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&ProfiledEvent> {
        self.events.get(id.0)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut ProfiledEvent> {
        self.events.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ProfiledEvent)> {
        self.events.iter().enumerate().map(|(i, e)| (NodeId(i), e))
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + use<> {
        (0..self.events.len()).map(NodeId)
    }

    pub fn roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.iter()
            .filter(|(_, e)| e.parent.is_none())
            .map(|(id, _)| id)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self[id].children
    }

    /// Link `child` under `parent`, keeping both directions in sync.
    pub fn attach(&mut self, child: NodeId, parent: NodeId) {
        assert!(
            self[child].parent.is_none(),
            "{} already has a parent",
            self[child].name()
        );
        self[child].parent = Some(parent);
        self[parent].children.push(child);
    }

    /// End time of an event, borrowing the parent's end for finished ops that
    /// never got their own.
    ///
    /// Finished events whose end precedes their start report their start.
    pub fn end_time_ns(&self, id: NodeId) -> TimeNs {
        let event = &self[id];
        let mut end = event.recorded_end_time_ns();
        if event.finished
            && end == UNTERMINATED
            && matches!(event.kind, EventKind::Op(_))
            && let Some(parent) = event.parent
        {
            end = self.end_time_ns(parent);
        }

        if event.finished && end < event.start_time_ns {
            if !event.is_unterminated() {
                warn!(
                    name = %event.name(),
                    start = event.start_time_ns,
                    end,
                    "event ends before it starts"
                );
            }
            return event.start_time_ns;
        }
        end
    }

    /// Correlation id used to match an event with collector activities.
    /// Collector events without one inherit their parent's.
    pub fn correlation_id(&self, id: NodeId) -> u64 {
        let event = &self[id];
        match &event.kind {
            EventKind::Op(op) => op.correlation_id,
            EventKind::External(ext) if ext.correlation_id != 0 => ext.correlation_id,
            EventKind::External(_) => event.parent.map_or(0, |p| self.correlation_id(p)),
            EventKind::Backend(_)
            | EventKind::Allocation(_)
            | EventKind::OutOfMemory(_)
            | EventKind::PyCall(_)
            | EventKind::PyCCall(_) => 0,
        }
    }

    /// Freeze an event's end time. Finishing twice is a logic error.
    pub(crate) fn mark_finished(&mut self, id: NodeId) {
        assert!(!self[id].finished, "{} finished twice", self[id].name());
        self[id].finished = true;
        debug_assert!(self.end_time_ns(id) >= self[id].start_time_ns);
    }

    /// Stable sort by start time, remapping every link to the new positions.
    pub fn sort_by_start_time(&mut self) {
        let mut order: Vec<usize> = (0..self.events.len()).collect();
        order.sort_by_key(|&i| self.events[i].start_time_ns);

        let mut new_index = vec![0; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_index[old] = new;
        }
        let remap = |id: NodeId| NodeId(new_index[id.0]);

        let mut slots: Vec<Option<ProfiledEvent>> =
            std::mem::take(&mut self.events).into_iter().map(Some).collect();
        self.events = order
            .iter()
            .filter_map(|&old| slots[old].take())
            .map(|mut e| {
                e.parent = e.parent.map(remap);
                for child in &mut e.children {
                    *child = remap(*child);
                }
                if let EventKind::External(ext) = &mut e.kind {
                    ext.linked_activity = ext.linked_activity.map(remap);
                }
                e
            })
            .collect();
    }

    pub fn into_events(self) -> Vec<ProfiledEvent> {
        self.events
    }
}

impl From<Vec<ProfiledEvent>> for EventForest {
    fn from(events: Vec<ProfiledEvent>) -> Self {
        Self { events }
    }
}

impl Index<NodeId> for EventForest {
    type Output = ProfiledEvent;

    fn index(&self, id: NodeId) -> &ProfiledEvent {
        &self.events[id.0]
    }
}

impl IndexMut<NodeId> for EventForest {
    fn index_mut(&mut self, id: NodeId) -> &mut ProfiledEvent {
        &mut self.events[id.0]
    }
}

/// Replays a start-sorted forest, attaching each event to the innermost open
/// event of its thread.
struct TreeBuilder<'a> {
    forest: &'a mut EventForest,
    /// Innermost open event per thread.
    stacks: HashMap<u64, NodeId>,
    /// Scheduled closures, earliest end first.
    end_events: BinaryHeap<Reverse<(TimeNs, NodeId)>>,
}

impl<'a> TreeBuilder<'a> {
    fn new(forest: &'a mut EventForest) -> Self {
        Self {
            forest,
            stacks: HashMap::new(),
            end_events: BinaryHeap::new(),
        }
    }

    fn push(&mut self, id: NodeId) {
        let event = &self.forest[id];
        // Collector subtrees are already placed by the trace merge.
        if event.is_external() && event.finished {
            return;
        }

        assert!(
            event.parent.is_none(),
            "{} has a parent before tree building",
            event.name()
        );
        assert!(!event.finished, "{} is already finished", event.name());
        debug_assert!(event.children.iter().all(|c| self.forest[*c].finished));

        let start_tid = event.start_tid;
        let forward_tid = event.forward_tid();
        let start = event.start_time_ns;
        let parent = self
            .open_frame(start_tid)
            .or_else(|| (forward_tid != 0).then(|| self.open_frame(forward_tid)).flatten());
        if let Some(parent) = parent {
            self.forest.attach(id, parent);
        }

        let end = self.forest.end_time_ns(id);
        if end > start {
            self.stacks.insert(start_tid, id);
            self.end_events.push(Reverse((end, id)));
        } else if end == UNTERMINATED {
            // Never scheduled; closes with its parent or at the final sweep.
            self.stacks.insert(start_tid, id);
        } else {
            self.forest.mark_finished(id);
        }
    }

    fn open_frame(&self, tid: u64) -> Option<NodeId> {
        self.stacks
            .get(&tid)
            .copied()
            .filter(|frame| !self.forest[*frame].finished)
    }

    fn pop(&mut self, id: NodeId) {
        if self.forest[id].finished {
            return;
        }

        let start_tid = self.forest[id].start_tid;
        let Some(mut frame) = self.stacks.get(&start_tid).copied() else {
            panic!(
                "no open frame on thread {start_tid} while closing {}",
                self.forest[id].name()
            );
        };
        while frame != id {
            self.forest.mark_finished(frame);
            frame = self.forest[frame].parent.unwrap_or_else(|| {
                panic!(
                    "{} is not an ancestor of the open frame on thread {start_tid}",
                    self.forest[id].name()
                )
            });
        }

        self.forest.mark_finished(id);
        self.stacks.remove(&start_tid);
        if let Some(parent) = self.forest[id].parent
            && !self.forest[parent].finished
        {
            self.stacks.insert(start_tid, parent);
        }
    }

    fn pop_until(&mut self, start: TimeNs) {
        while let Some(Reverse((end, id))) = self.end_events.peek().copied()
            && end < start
        {
            self.end_events.pop();
            self.pop(id);
        }
    }

    fn drain(&mut self) {
        while let Some(Reverse((_, id))) = self.end_events.pop() {
            self.pop(id);
        }
    }

    /// Finish the unterminated frames still open once everything else closed.
    fn close_unterminated(&mut self) {
        let mut tids: Vec<u64> = self.stacks.keys().copied().collect();
        tids.sort_unstable();
        for tid in tids {
            let mut frame = self.stacks.remove(&tid);
            while let Some(id) = frame {
                if !self.forest[id].finished {
                    self.forest.mark_finished(id);
                }
                frame = self.forest[id].parent;
            }
        }
    }
}

/// Build the call forest from events sorted by start time.
pub fn build_tree(forest: &mut EventForest) {
    let mut builder = TreeBuilder::new(forest);
    for id in builder.forest.node_ids() {
        let start = builder.forest[id].start_time_ns;
        builder.pop_until(start);
        builder.push(id);
    }
    builder.drain();
    builder.close_unterminated();
}
