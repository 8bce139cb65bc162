//! Guard snapshots: per-frame program counter + live-operand lists, chained
//! caller-ward and interned so that guards sharing a tail share it
//! physically.
//!
//! Interning keys on the node's own fields plus the *identity* of the
//! parent node, so two chains are shared exactly as far as their tails are
//! structurally identical.

use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHasher};

use crate::ir::Operand;

/// One frame of a resume snapshot. `regs` holds the operand (variable or
/// constant) of every register at the resume point; `pc` is where the slow
/// interpreter resumes in this frame.
#[derive(Debug, PartialEq, Eq)]
pub struct SnapshotNode {
    pub func: u16,
    pub pc: usize,
    pub regs: Vec<Operand>,
    pub parent: Option<Rc<SnapshotNode>>,
}

impl SnapshotNode {
    /// Number of frames in this chain, innermost included.
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }
}

/// Structural-hash interner for snapshot nodes.
#[derive(Debug, Default)]
pub struct SnapshotInterner {
    table: FxHashMap<u64, Vec<Rc<SnapshotNode>>>,
}

fn node_hash(func: u16, pc: usize, regs: &[Operand], parent: Option<&Rc<SnapshotNode>>) -> u64 {
    let mut h = FxHasher::default();
    func.hash(&mut h);
    pc.hash(&mut h);
    regs.hash(&mut h);
    match parent {
        Some(p) => (Rc::as_ptr(p) as usize).hash(&mut h),
        None => 0usize.hash(&mut h),
    }
    h.finish()
}

impl SnapshotInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared node for this frame state, creating it if no
    /// structurally identical node (with the identical parent) exists.
    pub fn intern(
        &mut self,
        func: u16,
        pc: usize,
        regs: Vec<Operand>,
        parent: Option<Rc<SnapshotNode>>,
    ) -> Rc<SnapshotNode> {
        let hash = node_hash(func, pc, &regs, parent.as_ref());
        let bucket = self.table.entry(hash).or_default();
        for node in bucket.iter() {
            let parent_matches = match (&node.parent, &parent) {
                (None, None) => true,
                (Some(a), Some(b)) => Rc::ptr_eq(a, b),
                _ => false,
            };
            if parent_matches && node.func == func && node.pc == pc && node.regs == regs {
                return Rc::clone(node);
            }
        }
        let node = Rc::new(SnapshotNode {
            func,
            pc,
            regs,
            parent,
        });
        bucket.push(Rc::clone(&node));
        node
    }

    /// Number of distinct interned nodes.
    pub fn node_count(&self) -> usize {
        self.table.values().map(Vec::len).sum()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn clear(&mut self) {
        self.table.clear();
    }
}
