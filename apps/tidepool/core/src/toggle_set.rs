//! Sparse set of `true` cells backed by a bit-chunked bitmap.
//!
//! The domain is split into fixed blocks of [`BLOCK_BITS`] bits. A block is
//! only allocated once one of its cells turns true and is released again when
//! its last cell turns false, so memory stays proportional to the occupied
//! blocks and never exceeds roughly `N / 8` bytes.
//!
//! ```rust
//! # use tidepool_core::{Domain, ToggleSet};
//! let mut cells = ToggleSet::new(Domain::new(1_000).unwrap());
//! cells.set(42, true).unwrap();
//! cells.set(900, true).unwrap();
//! assert_eq!(cells.count_true(), 2);
//! assert_eq!(cells.list_true_in_range(0..500), vec![42]);
//! ```

use std::ops::Range;

use crate::domain::{CellIndex, Domain, DomainError};

/// Cells per allocated block (8 KiB of bitmap).
pub const BLOCK_BITS: u64 = 1 << 16;
const WORD_BITS: u64 = u64::BITS as u64;
const WORDS_PER_BLOCK: usize = (BLOCK_BITS / WORD_BITS) as usize;

#[derive(Debug, Clone)]
struct Block {
    words: Box<[u64]>,
    ones: u32,
}

impl Block {
    fn new() -> Self {
        Self {
            words: vec![0u64; WORDS_PER_BLOCK].into_boxed_slice(),
            ones: 0,
        }
    }
}

/// Result of an accepted [`ToggleSet::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub index: CellIndex,
    pub checked: bool,
    /// `false` when the cell already held `checked`.
    pub changed: bool,
    pub count_true: u64,
}

#[derive(Debug, Clone)]
pub struct ToggleSet {
    domain: Domain,
    blocks: Vec<Option<Block>>,
    count: u64,
}

impl ToggleSet {
    pub fn new(domain: Domain) -> Self {
        let block_count = domain.size().div_ceil(BLOCK_BITS) as usize;
        let mut blocks = Vec::with_capacity(block_count);
        blocks.resize_with(block_count, || None);
        Self {
            domain,
            blocks,
            count: 0,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn count_true(&self) -> u64 {
        self.count
    }

    pub fn contains(&self, index: CellIndex) -> bool {
        if !self.domain.contains(index) {
            return false;
        }
        let (block, word, mask) = locate(index);
        self.blocks[block]
            .as_ref()
            .is_some_and(|b| b.words[word] & mask != 0)
    }

    /// Sets `index` to `checked`. Out-of-domain indices are rejected without
    /// touching the set; repeating the current state is accepted as a no-op.
    pub fn set(&mut self, index: CellIndex, checked: bool) -> Result<ToggleOutcome, DomainError> {
        if !self.domain.contains(index) {
            return Err(DomainError::IndexOutOfDomain {
                index: i64::try_from(index).unwrap_or(i64::MAX),
                size: self.domain.size(),
            });
        }
        let (block_idx, word, mask) = locate(index);
        let slot = &mut self.blocks[block_idx];

        let changed = if checked {
            let block = slot.get_or_insert_with(Block::new);
            if block.words[word] & mask == 0 {
                block.words[word] |= mask;
                block.ones += 1;
                self.count += 1;
                true
            } else {
                false
            }
        } else {
            let emptied = match slot.as_mut() {
                Some(block) if block.words[word] & mask != 0 => {
                    block.words[word] &= !mask;
                    block.ones -= 1;
                    Some(block.ones == 0)
                }
                _ => None,
            };
            match emptied {
                Some(empty) => {
                    self.count -= 1;
                    if empty {
                        *slot = None;
                    }
                    true
                }
                None => false,
            }
        };

        Ok(ToggleOutcome {
            index,
            checked,
            changed,
            count_true: self.count,
        })
    }

    /// Ascending true indices within `range`, clipped to the domain. Cost is
    /// proportional to the allocated blocks the range touches.
    pub fn list_true_in_range(&self, range: Range<CellIndex>) -> Vec<CellIndex> {
        let end = range.end.min(self.domain.size());
        let mut out = Vec::new();
        if range.start >= end {
            return out;
        }

        let first_block = (range.start / BLOCK_BITS) as usize;
        let last_block = ((end - 1) / BLOCK_BITS) as usize;
        for (block_idx, block) in self.blocks[first_block..=last_block]
            .iter()
            .enumerate()
            .filter_map(|(offset, b)| b.as_ref().map(|b| (first_block + offset, b)))
        {
            let base = block_idx as u64 * BLOCK_BITS;
            let lo = range.start.max(base) - base;
            let hi = end.min(base + BLOCK_BITS) - base;
            let first_word = (lo / WORD_BITS) as usize;
            let last_word = ((hi - 1) / WORD_BITS) as usize;
            for (word_idx, &word) in block.words[first_word..=last_word].iter().enumerate() {
                let mut bits = word;
                let word_base = base + (first_word + word_idx) as u64 * WORD_BITS;
                while bits != 0 {
                    let index = word_base + u64::from(bits.trailing_zeros());
                    bits &= bits - 1;
                    if index >= range.start && index < end {
                        out.push(index);
                    }
                }
            }
        }
        out
    }

    /// All true indices in ascending order.
    pub fn iter_true(&self) -> impl Iterator<Item = CellIndex> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(idx, b)| b.as_ref().map(|b| (idx, b)))
            .flat_map(|(block_idx, block)| {
                let base = block_idx as u64 * BLOCK_BITS;
                block.words.iter().enumerate().flat_map(move |(w, &word)| {
                    let word_base = base + w as u64 * WORD_BITS;
                    BitIter(word).map(move |bit| word_base + bit)
                })
            })
    }

    /// Makes `range` hold exactly `trues` (indices outside the range are
    /// ignored). Returns the number of cells whose state changed.
    pub fn replace_range<I>(&mut self, range: Range<CellIndex>, trues: I) -> usize
    where
        I: IntoIterator<Item = CellIndex>,
    {
        let mut wanted: Vec<CellIndex> = trues.into_iter().filter(|i| range.contains(i)).collect();
        wanted.sort_unstable();
        wanted.dedup();

        let mut changed = 0;
        for index in self.list_true_in_range(range.clone()) {
            if wanted.binary_search(&index).is_err() && self.set(index, false).is_ok() {
                changed += 1;
            }
        }
        for index in wanted {
            if matches!(self.set(index, true), Ok(outcome) if outcome.changed) {
                changed += 1;
            }
        }
        changed
    }

    pub fn clear(&mut self) {
        self.blocks.iter_mut().for_each(|b| *b = None);
        self.count = 0;
    }

    /// Bitmap blocks currently allocated.
    pub fn allocated_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }
}

#[inline]
fn locate(index: CellIndex) -> (usize, usize, u64) {
    let block = (index / BLOCK_BITS) as usize;
    let offset = index % BLOCK_BITS;
    let word = (offset / WORD_BITS) as usize;
    (block, word, 1u64 << (offset % WORD_BITS))
}

struct BitIter(u64);

impl Iterator for BitIter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.0 == 0 {
            return None;
        }
        let bit = u64::from(self.0.trailing_zeros());
        self.0 &= self.0 - 1;
        Some(bit)
    }
}
