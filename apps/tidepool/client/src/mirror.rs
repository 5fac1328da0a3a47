use std::{collections::HashSet, ops::Range};

use tidepool_core::{CellIndex, Domain, DomainError, ToggleSet};

/// The client's partial copy of the grid: whatever chunks and broadcasts it
/// has seen, plus the authoritative count reported by the server.
pub struct LocalMirror {
    cells: ToggleSet,
    total_checked: u64,
    own_checked: HashSet<CellIndex>,
    completion_armed: bool,
}

impl LocalMirror {
    pub fn new(domain: Domain) -> Self {
        Self {
            cells: ToggleSet::new(domain),
            total_checked: 0,
            own_checked: HashSet::new(),
            completion_armed: true,
        }
    }

    pub fn domain(&self) -> Domain {
        self.cells.domain()
    }

    /// Starts over with a different domain size; everything known is dropped.
    pub fn reset_domain(&mut self, domain: Domain) {
        *self = Self::new(domain);
    }

    pub fn is_checked(&self, index: CellIndex) -> bool {
        self.cells.contains(index)
    }

    pub fn total_checked(&self) -> u64 {
        self.total_checked
    }

    pub fn set_total_checked(&mut self, total: u64) {
        self.total_checked = total;
    }

    /// Cells this client turned on during the session and has not turned off.
    pub fn own_checked(&self) -> usize {
        self.own_checked.len()
    }

    pub fn progress_percent(&self) -> f64 {
        let size = self.domain().size();
        if size == 0 {
            return 0.0;
        }
        self.total_checked.min(size) as f64 / size as f64 * 100.0
    }

    /// Optimistic local toggle, applied before the server has answered.
    pub fn apply_local(&mut self, index: CellIndex, checked: bool) -> Result<(), DomainError> {
        let outcome = self.cells.set(index, checked)?;
        if checked {
            self.own_checked.insert(index);
        } else {
            self.own_checked.remove(&index);
        }
        if outcome.changed {
            self.total_checked = if checked {
                self.total_checked.saturating_add(1)
            } else {
                self.total_checked.saturating_sub(1)
            };
        }
        Ok(())
    }

    /// Authoritative broadcast. Returns `true` when the cell's state changed.
    pub fn apply_remote(&mut self, index: CellIndex, checked: bool, total: Option<u64>) -> bool {
        let changed = self
            .cells
            .set(index, checked)
            .map(|outcome| outcome.changed)
            .unwrap_or(false);
        if let Some(total) = total {
            self.total_checked = total;
        }
        changed
    }

    /// Makes `range` hold exactly the chunk's true indices (given relative to
    /// `range.start`).
    pub fn apply_chunk(&mut self, range: Range<CellIndex>, relative: &[u64]) -> usize {
        let start = range.start;
        self.cells
            .replace_range(range, relative.iter().map(|offset| start.saturating_add(*offset)))
    }

    /// Fires once each time the whole grid becomes checked.
    pub fn take_completion(&mut self) -> bool {
        let complete = self.total_checked >= self.domain().size();
        if !complete {
            self.completion_armed = true;
            return false;
        }
        std::mem::replace(&mut self.completion_armed, false)
    }
}
