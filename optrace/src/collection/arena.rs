//! Append-only chunked storage for op records.
//!
//! Each chunk is allocated with a fixed capacity and never grows, so records
//! never move once pushed. Every chunk reserves a block of correlation ids
//! from a process-wide counter; a record's id is `chunk.id_start + offset`.

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const CHUNK_CAPACITY: usize = 1024;

/// Process-unique identifier of an op record.
pub type CorrelationId = u64;

static CHUNK_COUNTER: AtomicU64 = AtomicU64::new(0);

struct Chunk<T> {
    id_start: CorrelationId,
    items: Vec<T>,
}

impl<T> Chunk<T> {
    fn new() -> Self {
        let n = CHUNK_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            id_start: 1 + CHUNK_CAPACITY as u64 * n,
            items: Vec::with_capacity(CHUNK_CAPACITY),
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= CHUNK_CAPACITY
    }

    fn correlation_id(&self, offset: usize) -> CorrelationId {
        debug_assert!(
            offset < CHUNK_CAPACITY && offset < self.items.len(),
            "offset {offset} outside of chunk starting at {}",
            self.id_start
        );
        self.id_start + offset as u64
    }
}

pub struct EventArena<T> {
    chunks: Vec<Chunk<T>>,
    len: usize,
}

impl<T> Default for EventArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventArena<T> {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
        }
    }

    /// Append a record and return its correlation id.
    pub fn push(&mut self, item: T) -> CorrelationId {
        if self.chunks.last().is_none_or(Chunk::is_full) {
            self.chunks.push(Chunk::new());
        }
        let last = self.chunks.len() - 1;
        let chunk = &mut self.chunks[last];
        chunk.items.push(item);
        self.len += 1;
        chunk.correlation_id(chunk.items.len() - 1)
    }

    /// Look a record up by the id returned from [`push`](Self::push).
    ///
    /// Chunk starts are strictly increasing within one arena, so this is a
    /// binary search over chunks followed by an offset.
    pub fn get_mut(&mut self, id: CorrelationId) -> Option<&mut T> {
        let idx = self.chunks.partition_point(|c| c.id_start <= id);
        let chunk = self.chunks.get_mut(idx.checked_sub(1)?)?;
        let offset = usize::try_from(id - chunk.id_start).ok()?;
        chunk.items.get_mut(offset)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (CorrelationId, &T)> {
        self.chunks.iter().flat_map(|c| {
            c.items
                .iter()
                .enumerate()
                .map(|(offset, item)| (c.correlation_id(offset), item))
        })
    }
}

impl<T: 'static> IntoIterator for EventArena<T> {
    type Item = (CorrelationId, T);
    type IntoIter = Box<dyn Iterator<Item = (CorrelationId, T)>>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.chunks.into_iter().flat_map(|c| {
            let id_start = c.id_start;
            c.items
                .into_iter()
                .enumerate()
                .map(move |(offset, item)| (id_start + offset as u64, item))
        }))
    }
}
