//! Hotness counter for the warm-up state machine.
//!
//! Counts loop-header visits keyed by the hash of the specialization key,
//! and owns the hash-bucket chains of dispatch cells. Cells are only
//! created once a counter fires, so cold sites cost one map entry and
//! nothing else.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};

use crate::cell::{CellKey, DispatchCell};
use crate::ir::SpecKey;
use crate::tokens::TokenArena;

/// Hash of a specialization key, used both for counting and as the cell
/// chain bucket.
pub fn spec_hash(func: u16, head: u16, greens: &SpecKey) -> u64 {
    let mut h = FxHasher::default();
    func.hash(&mut h);
    head.hash(&mut h);
    greens.hash(&mut h);
    h.finish()
}

/// Visit counters plus dispatch cell chains.
#[derive(Debug, Default)]
pub struct HotCounter {
    counts: FxHashMap<u64, u32>,
    cells: FxHashMap<u64, Vec<DispatchCell>>,
}

impl HotCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one visit. Returns true when the count reaches `threshold`.
    pub fn tick(&mut self, hash: u64, threshold: u32) -> bool {
        let count = self.counts.entry(hash).or_insert(0);
        *count = count.saturating_add(1);
        *count >= threshold
    }

    pub fn count(&self, hash: u64) -> u32 {
        self.counts.get(&hash).copied().unwrap_or(0)
    }

    /// Restart counting for this site (after a successful compile).
    pub fn reset(&mut self, hash: u64) {
        self.counts.remove(&hash);
    }

    /// Leave the site just under the threshold (after an aborted trace),
    /// so it retries soon without re-firing on the very next visit.
    pub fn set_near_threshold(&mut self, hash: u64, threshold: u32) {
        let near = threshold.saturating_mul(98) / 100;
        self.counts.insert(hash, near.min(threshold.saturating_sub(1)));
    }

    /// Decay every counter, keeping `keep_percent` of each count. Called
    /// when a new trace starts, so long-dead sites drift back toward cold.
    pub fn decay_all(&mut self, keep_percent: u32) {
        let keep = keep_percent.min(100);
        self.counts.retain(|_, count| {
            *count = (u64::from(*count) * u64::from(keep) / 100) as u32;
            *count > 0
        });
    }

    /// Find the cell with this exact key in the hash chain, comparing keys
    /// structurally.
    pub fn find_cell(&self, hash: u64, key: &CellKey) -> Option<usize> {
        self.cells
            .get(&hash)?
            .iter()
            .position(|cell| cell.key == *key)
    }

    pub fn cell(&self, hash: u64, idx: usize) -> &DispatchCell {
        &self.cells[&hash][idx]
    }

    pub fn cell_mut(&mut self, hash: u64, idx: usize) -> &mut DispatchCell {
        let chain = self.cells.get_mut(&hash).expect("cell chain exists");
        &mut chain[idx]
    }

    pub fn install_cell(&mut self, hash: u64, cell: DispatchCell) -> usize {
        let chain = self.cells.entry(hash).or_default();
        chain.push(cell);
        chain.len() - 1
    }

    /// Drop every cell in this chain that the lazy-removal policy allows.
    pub fn cleanup_chain(&mut self, hash: u64, arena: &TokenArena) {
        if let Some(chain) = self.cells.get_mut(&hash) {
            chain.retain(|cell| !cell.should_remove(arena));
            if chain.is_empty() {
                self.cells.remove(&hash);
            }
        }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn clear(&mut self) {
        self.counts.clear();
        self.cells.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_tick_fires_at_threshold() {
        let mut counter = HotCounter::new();
        let hash = spec_hash(0, 0, &vec![Value::Int(1)]);
        for i in 1..10 {
            assert!(!counter.tick(hash, 10), "fired early at tick {i}");
        }
        assert!(counter.tick(hash, 10));
    }

    #[test]
    fn test_reset_and_near_threshold() {
        let mut counter = HotCounter::new();
        let hash = 42;
        for _ in 0..10 {
            counter.tick(hash, 10);
        }
        counter.reset(hash);
        assert_eq!(counter.count(hash), 0);

        counter.set_near_threshold(hash, 100);
        assert_eq!(counter.count(hash), 98);
        assert!(!counter.tick(hash, 100));
        assert!(counter.tick(hash, 100));
    }

    #[test]
    fn test_decay() {
        let mut counter = HotCounter::new();
        for _ in 0..100 {
            counter.tick(1, u32::MAX);
        }
        for _ in 0..2 {
            counter.tick(2, u32::MAX);
        }
        counter.decay_all(40);
        assert_eq!(counter.count(1), 40);
        // Rounded down to zero: entry dropped entirely.
        assert_eq!(counter.count(2), 0);
    }

    #[test]
    fn test_distinct_keys_distinct_cells() {
        let mut counter = HotCounter::new();
        let k1 = CellKey {
            func: 0,
            head: 0,
            greens: vec![Value::Int(0), Value::Int(1)],
        };
        let k2 = CellKey {
            func: 0,
            head: 0,
            greens: vec![Value::Int(0), Value::Int(2)],
        };
        let h1 = spec_hash(k1.func, k1.head, &k1.greens);
        let h2 = spec_hash(k2.func, k2.head, &k2.greens);

        counter.install_cell(h1, DispatchCell::new(k1.clone()));
        counter.install_cell(h2, DispatchCell::new(k2.clone()));

        let i1 = counter.find_cell(h1, &k1).unwrap();
        assert_eq!(counter.cell(h1, i1).key, k1);
        // Looking up k2 under its own hash never returns k1's cell.
        let i2 = counter.find_cell(h2, &k2).unwrap();
        assert_eq!(counter.cell(h2, i2).key, k2);
        assert_eq!(counter.cell_count(), 2);

        // Identical key finds the same entry again.
        let again = CellKey {
            func: 0,
            head: 0,
            greens: vec![Value::Int(0), Value::Int(1)],
        };
        assert_eq!(counter.find_cell(h1, &again), Some(i1));
    }

    #[test]
    fn test_chain_collision_walk() {
        // Two different keys forced into the same bucket: the chain is
        // walked comparing keys structurally.
        let mut counter = HotCounter::new();
        let k1 = CellKey {
            func: 0,
            head: 0,
            greens: vec![Value::Int(1)],
        };
        let k2 = CellKey {
            func: 0,
            head: 0,
            greens: vec![Value::Int(2)],
        };
        let hash = 7;
        counter.install_cell(hash, DispatchCell::new(k1.clone()));
        counter.install_cell(hash, DispatchCell::new(k2.clone()));
        assert_eq!(counter.find_cell(hash, &k1), Some(0));
        assert_eq!(counter.find_cell(hash, &k2), Some(1));
    }

    #[test]
    fn test_cleanup_chain() {
        let mut counter = HotCounter::new();
        let arena = TokenArena::new();
        let k1 = CellKey {
            func: 0,
            head: 0,
            greens: vec![],
        };
        counter.install_cell(3, DispatchCell::new(k1.clone()));
        {
            let idx = counter.find_cell(3, &k1).unwrap();
            counter.cell_mut(3, idx).set_flag(crate::cell::CELL_TRACING);
        }
        counter.cleanup_chain(3, &arena);
        assert_eq!(counter.cell_count(), 1, "tracing cell survives cleanup");

        let idx = counter.find_cell(3, &k1).unwrap();
        counter
            .cell_mut(3, idx)
            .clear_flag(crate::cell::CELL_TRACING);
        counter.cleanup_chain(3, &arena);
        assert_eq!(counter.cell_count(), 0);
    }
}
