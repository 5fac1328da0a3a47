//! Keeps only the cells of the current render range materialized.
//!
//! Changing the range destroys every widget that fell out of it at once (cheap)
//! and queues a creation pass for the new range. Creation is done in bounded
//! batches, one per frame. A pass queued for an older range may still be in
//! the queue when the range changes again; it is drained against the latest
//! range, so it never creates a widget outside it or recreates one that exists.

use std::{
    collections::{BTreeSet, VecDeque},
    ops::Range,
};

use tidepool_core::CellIndex;

/// Whatever actually displays cells (terminal buffer, DOM, test recorder).
pub trait CellHost {
    fn create(&mut self, index: CellIndex, checked: bool);
    fn destroy(&mut self, index: CellIndex);
    fn update(&mut self, index: CellIndex, checked: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderProgress {
    /// Creation passes are still queued.
    Pending,
    Idle,
}

#[derive(Debug)]
struct CreationPass {
    next: CellIndex,
    end: CellIndex,
}

pub struct IncrementalRenderer<H> {
    host: H,
    range: Range<CellIndex>,
    materialized: BTreeSet<CellIndex>,
    passes: VecDeque<CreationPass>,
    batch_size: usize,
}

impl<H: CellHost> IncrementalRenderer<H> {
    pub fn new(host: H, batch_size: usize) -> Self {
        Self {
            host,
            range: 0..0,
            materialized: BTreeSet::new(),
            passes: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn range(&self) -> Range<CellIndex> {
        self.range.clone()
    }

    pub fn is_materialized(&self, index: CellIndex) -> bool {
        self.materialized.contains(&index)
    }

    pub fn materialized_count(&self) -> usize {
        self.materialized.len()
    }

    pub fn is_idle(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn set_range(&mut self, range: Range<CellIndex>) {
        if range == self.range {
            return;
        }
        let keep = self.materialized.split_off(&range.start);
        let mut keep_tail = keep;
        let beyond = keep_tail.split_off(&range.end.max(range.start));
        for index in self.materialized.iter().chain(beyond.iter()) {
            self.host.destroy(*index);
        }
        self.materialized = keep_tail;

        self.range = range.clone();
        if !range.is_empty() {
            self.passes.push_back(CreationPass {
                next: range.start,
                end: range.end,
            });
        }
    }

    /// Creates at most `batch_size` widgets, oldest pass first.
    pub fn run_batch(&mut self, is_checked: impl Fn(CellIndex) -> bool) -> RenderProgress {
        let mut budget = self.batch_size;
        while budget > 0 {
            let Some(pass) = self.passes.front_mut() else {
                break;
            };
            // Clamp against the latest range, not the one the pass was queued for.
            let end = pass.end.min(self.range.end);
            pass.next = pass.next.max(self.range.start);
            while budget > 0 && pass.next < end {
                let index = pass.next;
                pass.next += 1;
                if self.materialized.insert(index) {
                    self.host.create(index, is_checked(index));
                    budget -= 1;
                }
            }
            if pass.next >= end {
                self.passes.pop_front();
            }
        }
        if self.passes.is_empty() {
            RenderProgress::Idle
        } else {
            RenderProgress::Pending
        }
    }

    /// Pushes an authoritative state into a live widget, if there is one.
    pub fn reconcile(&mut self, index: CellIndex, checked: bool) {
        if self.materialized.contains(&index) {
            self.host.update(index, checked);
        }
    }

    pub fn reconcile_range(&mut self, range: Range<CellIndex>, is_checked: impl Fn(CellIndex) -> bool) {
        for index in self.materialized.range(range) {
            self.host.update(*index, is_checked(*index));
        }
    }

    /// Destroys every widget and forgets queued passes.
    pub fn clear(&mut self) {
        for index in std::mem::take(&mut self.materialized) {
            self.host.destroy(index);
        }
        self.passes.clear();
        self.range = 0..0;
    }
}
