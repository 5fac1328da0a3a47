//! Grid geometry: how the flat index domain folds into rows and columns for a
//! container of a given width.

use tidepool_core::CellIndex;

/// Pixel (or character) dimensions of one grid cell and its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridMetrics {
    pub cell_width: u32,
    pub row_height: u32,
    pub horizontal_padding: u32,
}

impl GridMetrics {
    /// `[x] ` per cell, one text line per row, inside a bordered block.
    pub const fn terminal() -> Self {
        Self {
            cell_width: 4,
            row_height: 1,
            horizontal_padding: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridLayout {
    metrics: GridMetrics,
    domain_size: u64,
    columns: u64,
}

impl GridLayout {
    pub fn new(metrics: GridMetrics, domain_size: u64, container_width: u32) -> Self {
        Self {
            metrics,
            domain_size,
            columns: columns_for(metrics, container_width),
        }
    }

    /// Returns `true` when the column count changed.
    pub fn resize(&mut self, container_width: u32) -> bool {
        let columns = columns_for(self.metrics, container_width);
        let changed = columns != self.columns;
        self.columns = columns;
        changed
    }

    pub fn set_domain_size(&mut self, domain_size: u64) {
        self.domain_size = domain_size;
    }

    pub fn metrics(&self) -> GridMetrics {
        self.metrics
    }

    pub fn domain_size(&self) -> u64 {
        self.domain_size
    }

    pub fn columns(&self) -> u64 {
        self.columns
    }

    pub fn total_rows(&self) -> u64 {
        self.domain_size.div_ceil(self.columns)
    }

    pub fn row_of(&self, index: CellIndex) -> u64 {
        index / self.columns
    }

    pub fn col_of(&self, index: CellIndex) -> u64 {
        index % self.columns
    }

    /// Top-left corner of a cell as `(x, y)` in container units.
    pub fn position_of(&self, index: CellIndex) -> (u64, u64) {
        (
            self.col_of(index) * u64::from(self.metrics.cell_width),
            self.row_of(index) * u64::from(self.metrics.row_height),
        )
    }

    pub fn index_at(&self, row: u64, col: u64) -> Option<CellIndex> {
        if col >= self.columns {
            return None;
        }
        let index = row.checked_mul(self.columns)?.checked_add(col)?;
        (index < self.domain_size).then_some(index)
    }

    /// Scroll offset placing `row` at the top of the viewport.
    pub fn offset_of_row(&self, row: u64) -> u64 {
        row.saturating_mul(u64::from(self.metrics.row_height))
    }
}

fn columns_for(metrics: GridMetrics, container_width: u32) -> u64 {
    let usable = container_width.saturating_sub(metrics.horizontal_padding);
    u64::from(usable / metrics.cell_width.max(1)).max(1)
}
