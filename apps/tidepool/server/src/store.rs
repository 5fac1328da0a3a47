//! The single authoritative copy of the grid.
//!
//! Every mutation and every snapshot runs under one mutex together with its
//! publication, so observers see changes in exactly the order they were
//! applied and a snapshot is never queued behind a newer change event.

use parking_lot::Mutex;
use tidepool_core::{
    CheckboxChunk, ChunkPartitioner, Domain, DomainError, InitialState, ToggleOutcome,
    ToggleSet,
};

pub struct GridStore {
    partitioner: ChunkPartitioner,
    inline_snapshot: bool,
    cells: Mutex<ToggleSet>,
}

impl GridStore {
    pub fn new(partitioner: ChunkPartitioner, inline_snapshot: bool) -> Self {
        Self {
            partitioner,
            inline_snapshot,
            cells: Mutex::new(ToggleSet::new(partitioner.domain())),
        }
    }

    pub fn domain(&self) -> Domain {
        self.partitioner.domain()
    }

    pub fn partitioner(&self) -> ChunkPartitioner {
        self.partitioner
    }

    pub fn count_true(&self) -> u64 {
        self.cells.lock().count_true()
    }

    /// Validates and applies a toggle. On acceptance `publish` runs before
    /// the lock is released; rejected toggles never reach it.
    pub fn toggle_with<F, R>(&self, raw_index: i64, checked: bool, publish: F) -> Result<R, DomainError>
    where
        F: FnOnce(&ToggleOutcome) -> R,
    {
        let index = self.domain().check(raw_index)?;
        let mut cells = self.cells.lock();
        let outcome = cells.set(index, checked)?;
        Ok(publish(&outcome))
    }

    pub fn toggle(&self, raw_index: i64, checked: bool) -> Result<ToggleOutcome, DomainError> {
        self.toggle_with(raw_index, checked, |outcome| *outcome)
    }

    /// True indices of one chunk, relative to its start. Chunks outside the
    /// domain (negative or past the end) answer with an empty list.
    pub fn chunk(&self, raw_chunk: i64) -> CheckboxChunk {
        self.chunk_with(raw_chunk, |chunk| chunk)
    }

    /// Reads a chunk and hands it to `publish` before the lock is released,
    /// so the reply is queued behind every echo of an earlier toggle and
    /// ahead of every later one.
    pub fn chunk_with<F, R>(&self, raw_chunk: i64, publish: F) -> R
    where
        F: FnOnce(CheckboxChunk) -> R,
    {
        let range = self.partitioner.range_of_raw(raw_chunk);
        let start = range.start;
        let cells = self.cells.lock();
        let checked_boxes = cells
            .list_true_in_range(range)
            .into_iter()
            .map(|index| index - start)
            .collect();
        publish(CheckboxChunk {
            chunk_index: raw_chunk,
            checked_boxes,
        })
    }

    /// Snapshot counterpart of [`GridStore::chunk_with`].
    pub fn initial_state_with<F, R>(&self, publish: F) -> R
    where
        F: FnOnce(InitialState) -> R,
    {
        let cells = self.cells.lock();
        publish(InitialState {
            count_true: cells.count_true(),
            domain_size: self.domain().size(),
            checked_boxes: self
                .inline_snapshot
                .then(|| cells.iter_true().collect()),
        })
    }
}
