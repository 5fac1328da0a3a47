//! Which rows are on screen, recomputed at most once per frame.
//!
//! Scroll and resize events only record the latest geometry; [`ViewportTracker::on_frame`]
//! folds everything that arrived since the previous frame into one window
//! computation.

use std::ops::Range;

use tidepool_core::CellIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportConfig {
    pub row_height: u32,
    /// Extra rows kept materialized above and below the visible area.
    pub buffer_rows: u64,
}

/// Inclusive row bounds of the render window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportWindow {
    pub start_row: u64,
    pub end_row: u64,
}

impl ViewportWindow {
    /// `[start_row * columns, (end_row + 1) * columns)` clipped to the domain.
    pub fn index_range(&self, columns: u64, domain_size: u64) -> Range<CellIndex> {
        let start = self.start_row.saturating_mul(columns).min(domain_size);
        let end = self
            .end_row
            .saturating_add(1)
            .saturating_mul(columns)
            .min(domain_size);
        start..end
    }
}

/// `None` when there are no rows at all.
pub fn compute_window(
    scroll_offset: u64,
    viewport_height: u32,
    total_rows: u64,
    config: ViewportConfig,
) -> Option<ViewportWindow> {
    let last_row = total_rows.checked_sub(1)?;
    let row_height = u64::from(config.row_height.max(1));
    let visible_rows = u64::from(viewport_height).div_ceil(row_height);

    let start_row = (scroll_offset / row_height)
        .saturating_sub(config.buffer_rows)
        .min(last_row);
    let end_row = start_row
        .saturating_add(visible_rows)
        .saturating_add(config.buffer_rows.saturating_mul(2))
        .min(last_row);
    Some(ViewportWindow { start_row, end_row })
}

#[derive(Debug, Clone)]
pub struct ViewportTracker {
    config: ViewportConfig,
    scroll_offset: u64,
    viewport_height: u32,
    total_rows: u64,
    dirty: bool,
    current: Option<ViewportWindow>,
}

impl ViewportTracker {
    pub fn new(config: ViewportConfig) -> Self {
        Self {
            config,
            scroll_offset: 0,
            viewport_height: 0,
            total_rows: 0,
            dirty: true,
            current: None,
        }
    }

    pub fn config(&self) -> ViewportConfig {
        self.config
    }

    pub fn scroll_offset(&self) -> u64 {
        self.scroll_offset
    }

    pub fn viewport_height(&self) -> u32 {
        self.viewport_height
    }

    pub fn current(&self) -> Option<ViewportWindow> {
        self.current
    }

    pub fn first_visible_row(&self) -> u64 {
        self.scroll_offset / u64::from(self.config.row_height.max(1))
    }

    pub fn visible_rows(&self) -> u64 {
        u64::from(self.viewport_height).div_ceil(u64::from(self.config.row_height.max(1)))
    }

    pub fn max_scroll_offset(&self) -> u64 {
        self.total_rows
            .saturating_mul(u64::from(self.config.row_height))
            .saturating_sub(u64::from(self.viewport_height))
    }

    pub fn on_scroll(&mut self, scroll_offset: u64) {
        let clamped = scroll_offset.min(self.max_scroll_offset());
        if clamped != self.scroll_offset {
            self.scroll_offset = clamped;
            self.dirty = true;
        }
    }

    pub fn scroll_rows(&mut self, delta: i64) {
        let step = delta.unsigned_abs().saturating_mul(u64::from(self.config.row_height));
        let target = if delta < 0 {
            self.scroll_offset.saturating_sub(step)
        } else {
            self.scroll_offset.saturating_add(step)
        };
        self.on_scroll(target);
    }

    pub fn on_resize(&mut self, viewport_height: u32, total_rows: u64) {
        self.viewport_height = viewport_height;
        self.total_rows = total_rows;
        self.scroll_offset = self.scroll_offset.min(self.max_scroll_offset());
        self.dirty = true;
    }

    /// Forces the next frame to report a window even if its rows are unchanged.
    pub fn invalidate(&mut self) {
        self.current = None;
        self.dirty = true;
    }

    /// Recomputes the window if anything changed since the last frame.
    /// Returns the new window only when it differs from the previous one.
    pub fn on_frame(&mut self) -> Option<ViewportWindow> {
        if !std::mem::take(&mut self.dirty) {
            return None;
        }
        let window = compute_window(
            self.scroll_offset,
            self.viewport_height,
            self.total_rows,
            self.config,
        );
        if window == self.current {
            return None;
        }
        self.current = window;
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: ViewportConfig = ViewportConfig {
        row_height: 24,
        buffer_rows: 2,
    };

    #[test_timeout::timeout]
    fn window_at_top_of_large_grid() {
        let window = compute_window(0, 480, 1_000, CONFIG).unwrap();
        assert_eq!(window, ViewportWindow { start_row: 0, end_row: 24 });
    }

    #[test_timeout::timeout]
    fn window_is_clipped_at_the_bottom() {
        let window = compute_window(24 * 995, 480, 1_000, CONFIG).unwrap();
        assert_eq!(window.start_row, 993);
        assert_eq!(window.end_row, 999);
        assert!(compute_window(0, 480, 0, CONFIG).is_none());
    }

    #[test_timeout::timeout]
    fn index_range_clips_to_domain() {
        let window = ViewportWindow { start_row: 8, end_row: 12 };
        assert_eq!(window.index_range(10, 1_000), 80..130);
        assert_eq!(window.index_range(10, 95), 80..95);
    }

    #[test_timeout::timeout]
    fn scroll_bursts_coalesce_into_one_frame() {
        let mut tracker = ViewportTracker::new(CONFIG);
        tracker.on_resize(480, 1_000);
        assert_eq!(tracker.on_frame(), Some(ViewportWindow { start_row: 0, end_row: 24 }));
        assert_eq!(tracker.on_frame(), None);

        for offset in [24, 240, 2_400, 24 * 50] {
            tracker.on_scroll(offset);
        }
        assert_eq!(tracker.on_frame(), Some(ViewportWindow { start_row: 48, end_row: 72 }));
        assert_eq!(tracker.on_frame(), None);
    }

    #[test_timeout::timeout]
    fn scroll_is_clamped_to_content() {
        let mut tracker = ViewportTracker::new(CONFIG);
        tracker.on_resize(480, 100);
        tracker.on_scroll(u64::MAX);
        assert_eq!(tracker.scroll_offset(), 24 * 100 - 480);
        tracker.scroll_rows(-1_000);
        assert_eq!(tracker.scroll_offset(), 0);
    }
}
