//! Free-space index over the 2^32 block address space.
//!
//! An ordered map from range start to range length. The default (empty)
//! state means the entire address space is free: the first allocation seeds
//! the map and the `[0, 0)` sentinel keeps an exhausted map distinguishable
//! from the bootstrap state.

use std::collections::BTreeMap;

use crate::error::{CofferError, Result};

/// Ordered interval map with best-fit allocation.
#[derive(Debug, Default)]
pub struct FreeSpace {
    free: BTreeMap<u32, u32>,
}

impl FreeSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all ranges, returning to the bootstrap state.
    pub fn clear(&mut self) {
        self.free.clear();
    }

    /// Insert `[block, block + count)` as free, merging with adjacent or
    /// overlapping neighbours and clamping at the top of the address space.
    pub fn add(&mut self, block: u32, count: u32) {
        if count == 0 {
            return;
        }

        let entry = self.free.entry(block).or_insert(0);
        if *entry < count {
            *entry = count;
        }

        // Clamp a range that would wrap past 2^32
        if entry.checked_add(block).is_none() {
            *entry = u32::MAX - block;
        }

        let mut start = block;
        let mut len = self.free[&block];

        // Merge with the previous range when it reaches this one
        if let Some((&prev_start, &prev_len)) = self.free.range(..block).next_back() {
            if prev_start as u64 + prev_len as u64 >= block as u64 {
                let end = (block as u64 + len as u64).max(prev_start as u64 + prev_len as u64);
                self.free.remove(&block);
                start = prev_start;
                len = (end - prev_start as u64) as u32;
                self.free.insert(start, len);
            }
        }

        // Merge with the next range when this one reaches it
        if let Some((&next_start, &next_len)) = self
            .free
            .range((
                std::ops::Bound::Excluded(start),
                std::ops::Bound::Unbounded,
            ))
            .next()
        {
            if start as u64 + len as u64 >= next_start as u64 {
                let end = (start as u64 + len as u64).max(next_start as u64 + next_len as u64);
                self.free.remove(&next_start);
                len = (end - start as u64) as u32;
                self.free.insert(start, len);
            }
        }
    }

    /// Allocate `count` contiguous blocks, best-fit with ties broken by the
    /// lowest address. Allocation failure is a distinct error.
    ///
    /// An empty map is the bootstrap state: the whole space is free, so the
    /// allocation is served from address 0 and the remainder
    /// `[count, 2^32 - count)` is recorded.
    pub fn take(&mut self, count: u32) -> Result<u32> {
        let mut best: Option<(u32, u32)> = None;

        for (&start, &len) in &self.free {
            if len >= count {
                match best {
                    Some((_, best_len)) if best_len <= len => {}
                    _ => best = Some((start, len)),
                }
                if len == count {
                    break;
                }
            }
        }

        let Some((start, len)) = best else {
            if self.free.is_empty() {
                // Bootstrap: the entire space was free
                if count > 0 {
                    self.free.insert(count, 0u32.wrapping_sub(count));
                }
                return Ok(0);
            }
            return Err(CofferError::OutOfSpace(count));
        };

        self.free.remove(&start);

        if len > count {
            self.free.insert(start + count, len - count);
        } else if self.free.is_empty() {
            // Keep a sentinel so an exhausted map is not mistaken for the
            // bootstrap state
            self.free.insert(0, 0);
        }

        Ok(start)
    }

    /// Enumerate free ranges as `(start, length)` pairs.
    pub fn ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.free.iter().map(|(&s, &l)| (s, l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(fs: &FreeSpace) -> Vec<(u32, u32)> {
        fs.ranges().collect()
    }

    #[test]
    fn bootstrap_allocates_from_zero() {
        let mut fs = FreeSpace::new();
        assert_eq!(fs.take(10).unwrap(), 0);
        assert_eq!(ranges(&fs), vec![(10, 0u32.wrapping_sub(10))]);
    }

    #[test]
    fn merges_adjacent_ranges() {
        let mut fs = FreeSpace::new();
        fs.add(10, 5);
        fs.add(20, 5);
        fs.add(15, 5); // bridges the gap
        assert_eq!(ranges(&fs), vec![(10, 15)]);
    }

    #[test]
    fn merges_overlapping_ranges() {
        let mut fs = FreeSpace::new();
        fs.add(10, 10);
        fs.add(15, 10);
        assert_eq!(ranges(&fs), vec![(10, 15)]);

        fs.add(5, 100);
        assert_eq!(ranges(&fs), vec![(5, 100)]);
    }

    #[test]
    fn best_fit_prefers_smallest_then_lowest() {
        let mut fs = FreeSpace::new();
        fs.add(0, 8);
        fs.add(100, 4);
        fs.add(200, 4);

        // Smallest fitting range wins; the tie between 100 and 200 goes to
        // the lower address
        assert_eq!(fs.take(3).unwrap(), 100);
        assert_eq!(fs.take(3).unwrap(), 200);
        assert_eq!(fs.take(3).unwrap(), 0);
    }

    #[test]
    fn exhaustion_is_not_bootstrap() {
        let mut fs = FreeSpace::new();
        fs.add(5, 3);
        assert_eq!(fs.take(3).unwrap(), 5);
        // Fully consumed: the sentinel must prevent a bootstrap reseed
        assert_eq!(ranges(&fs), vec![(0, 0)]);
        assert!(matches!(fs.take(1), Err(CofferError::OutOfSpace(1))));
    }

    #[test]
    fn take_and_put_back_restores_state() {
        let mut fs = FreeSpace::new();
        fs.add(10, 20);
        fs.add(50, 5);
        let before = ranges(&fs);

        let pos = fs.take(7).unwrap();
        fs.add(pos, 7);
        assert_eq!(ranges(&fs), before);
    }

    #[test]
    fn clamps_at_address_space_top() {
        let mut fs = FreeSpace::new();
        fs.add(u32::MAX - 2, 100);
        assert_eq!(ranges(&fs), vec![(u32::MAX - 2, 2)]);
    }

    #[test]
    fn zero_count_is_ignored() {
        let mut fs = FreeSpace::new();
        fs.add(10, 0);
        assert!(ranges(&fs).is_empty());
    }

    #[test]
    fn reload_seed_matches_file_tail() {
        // The store seeds [count, 2^32 - count) before scanning a file of
        // `count` blocks, exactly like the bootstrap remainder
        let mut fs = FreeSpace::new();
        fs.add(16, 0u32.wrapping_sub(16));
        assert_eq!(fs.take(4).unwrap(), 16);
        assert_eq!(ranges(&fs), vec![(20, 0u32.wrapping_sub(20))]);
    }
}
