//! Resume descriptors: per-guard snapshot plus the counter state that
//! decides when a failing guard is hot enough to deserve a bridge.
//!
//! A guard's descriptor starts with a flat eagerness counter. When the
//! guard is a value promotion, the counter switches on first failure to up
//! to five `(observed value, hit count)` slots, so eagerness accumulates
//! per distinct runtime value rather than across all of them. Slot
//! eviction keeps the two highest-count slots and overwrites the
//! third-highest, which tends to retain hot values without always
//! discarding the most recently added one.

use std::rc::Rc;

use crate::ir::{GuardKind, Operand, VarId};
use crate::snapshot::SnapshotNode;
use crate::tokens::TokenHandle;
use crate::value::Value;

/// Index of a descriptor in the dispatch state's descriptor arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResumeId(pub u32);

const NUM_SLOTS: usize = 5;

/// Bounded per-value hit counters for a value-promoting guard.
#[derive(Debug, Clone, Default)]
pub struct ValueCounters {
    slots: Vec<(Value, u32)>,
}

impl ValueCounters {
    /// Record one observation of `value` and return its updated count.
    pub fn see(&mut self, value: &Value) -> u32 {
        for (v, count) in self.slots.iter_mut() {
            if v == value {
                *count += 1;
                return *count;
            }
        }
        if self.slots.len() < NUM_SLOTS {
            self.slots.push((value.clone(), 1));
            return 1;
        }
        // All slots taken: overwrite the one with the third-highest count.
        let mut a = 0usize;
        let mut b: Option<usize> = None;
        let mut c: Option<usize> = None;
        for i in 1..NUM_SLOTS {
            if self.slots[i].1 > self.slots[a].1 {
                c = b;
                b = Some(a);
                a = i;
            } else if b.is_none_or(|b| self.slots[i].1 > self.slots[b].1) {
                c = b;
                b = Some(i);
            } else if c.is_none_or(|c| self.slots[i].1 > self.slots[c].1) {
                c = Some(i);
            }
        }
        let victim = c.unwrap_or(a);
        self.slots[victim] = (value.clone(), 1);
        1
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn count_for(&self, value: &Value) -> u32 {
        self.slots
            .iter()
            .find(|(v, _)| v == value)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    /// Hit counts of all occupied slots, in slot order.
    pub fn counts(&self) -> Vec<u32> {
        self.slots.iter().map(|(_, c)| *c).collect()
    }
}

/// Counter state of one descriptor.
#[derive(Debug, Clone)]
enum CounterState {
    Flat(u32),
    PerValue(ValueCounters),
}

/// Virtualizable state at a guard point: the object operand and the
/// current operands of its flat fields, used to synchronize the heap
/// object when compiled code exits through this guard.
#[derive(Debug, Clone, PartialEq)]
pub struct VtResume {
    pub obj: Operand,
    pub fields: Vec<Operand>,
}

/// Snapshot + counter state for one guard.
#[derive(Debug, Clone)]
pub struct ResumeDescr {
    pub guard: GuardKind,
    pub snapshot: Rc<SnapshotNode>,
    /// Distinct variables a failing guard must report, in deadframe order.
    pub fail_args: Vec<VarId>,
    /// For a value-promoting guard: index into `fail_args` of the promoted
    /// operand, switching eagerness counting to per-value slots.
    pub promoted_index: Option<usize>,
    pub vt: Option<VtResume>,
    counter: CounterState,
    busy: bool,
    /// Weak reference to the bridge attached to this guard, once compiled.
    pub bridge: Option<TokenHandle>,
    /// Weak reference to the procedure this guard was compiled into.
    pub owner: Option<TokenHandle>,
}

impl ResumeDescr {
    pub fn new(guard: GuardKind, snapshot: Rc<SnapshotNode>, fail_args: Vec<VarId>) -> Self {
        Self {
            guard,
            snapshot,
            fail_args,
            promoted_index: None,
            vt: None,
            counter: CounterState::Flat(0),
            busy: false,
            bridge: None,
            owner: None,
        }
    }

    /// Position of `var` in the deadframe value list, if it is reported.
    pub fn fail_arg_index(&self, var: VarId) -> Option<usize> {
        self.fail_args.iter().position(|&v| v == var)
    }

    /// Count one runtime failure and report whether the guard has become
    /// eager enough to compile a bridge. Skipped entirely while a compile
    /// attempt for this descriptor is in flight.
    ///
    /// `observed` is the runtime value of the promoted operand, when this
    /// guard promotes by value.
    pub fn must_compile(&mut self, eagerness: u32, observed: Option<&Value>) -> bool {
        if self.busy {
            return false;
        }
        match (self.promoted_index, observed) {
            (Some(_), Some(value)) => {
                let counters = match &mut self.counter {
                    CounterState::PerValue(c) => c,
                    CounterState::Flat(_) => {
                        self.counter = CounterState::PerValue(ValueCounters::default());
                        match &mut self.counter {
                            CounterState::PerValue(c) => c,
                            CounterState::Flat(_) => unreachable!(),
                        }
                    }
                };
                counters.see(value) >= eagerness
            }
            _ => {
                let count = match &mut self.counter {
                    CounterState::Flat(c) => {
                        *c += 1;
                        *c
                    }
                    // A per-value counter with no observed value this time:
                    // count it as a miss, not progress.
                    CounterState::PerValue(_) => return false,
                };
                count >= eagerness
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Mark a compile attempt in flight. Re-entrant compilation for the
    /// same descriptor is an engine bug.
    pub fn start_compiling(&mut self) {
        assert!(!self.busy, "re-entrant compile on a busy resume descriptor");
        self.busy = true;
    }

    /// End the compile attempt. The counter restarts from zero whether or
    /// not a bridge was produced, so a failed attempt is retried only
    /// after accumulating eagerness again.
    pub fn done_compiling(&mut self) {
        self.busy = false;
        self.counter = CounterState::Flat(0);
    }

    /// Fresh copy describing the same guard for a retraced loop; the
    /// original keeps describing the old loop. Counter state and the
    /// attached bridge are not carried over.
    pub fn clone_for_retrace(&self) -> Self {
        Self {
            guard: self.guard,
            snapshot: Rc::clone(&self.snapshot),
            fail_args: self.fail_args.clone(),
            promoted_index: self.promoted_index,
            vt: self.vt.clone(),
            counter: CounterState::Flat(0),
            busy: false,
            bridge: None,
            owner: None,
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn flat_count(&self) -> Option<u32> {
        match &self.counter {
            CounterState::Flat(c) => Some(*c),
            CounterState::PerValue(_) => None,
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn value_counters(&self) -> Option<&ValueCounters> {
        match &self.counter {
            CounterState::PerValue(c) => Some(c),
            CounterState::Flat(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descr() -> ResumeDescr {
        let snapshot = Rc::new(SnapshotNode {
            func: 0,
            pc: 0,
            regs: vec![],
            parent: None,
        });
        ResumeDescr::new(GuardKind::True, snapshot, vec![])
    }

    #[test]
    fn test_flat_counter_monotonic() {
        let mut d = descr();
        for i in 1..5 {
            assert!(!d.must_compile(5, None), "fired early at call {i}");
        }
        assert!(d.must_compile(5, None), "must fire on the 5th call");
    }

    #[test]
    fn test_busy_blocks_counting() {
        let mut d = descr();
        d.start_compiling();
        for _ in 0..100 {
            assert!(!d.must_compile(5, None));
        }
        d.done_compiling();
        // Counter restarted at zero: takes eagerness fresh failures again.
        for _ in 0..4 {
            assert!(!d.must_compile(5, None));
        }
        assert!(d.must_compile(5, None));
    }

    #[test]
    #[should_panic(expected = "re-entrant compile")]
    fn test_reentrant_start_compiling_asserts() {
        let mut d = descr();
        d.start_compiling();
        d.start_compiling();
    }

    #[test]
    fn test_done_compiling_resets_after_success_or_failure() {
        let mut d = descr();
        for _ in 0..5 {
            d.must_compile(5, None);
        }
        d.start_compiling();
        d.done_compiling();
        assert_eq!(d.flat_count(), Some(0));
    }

    #[test]
    fn test_per_value_counting() {
        let mut d = descr();
        d.promoted_index = Some(0);
        let a = Value::Int(10);
        let b = Value::Int(20);
        // Interleaved values accumulate separately.
        assert!(!d.must_compile(3, Some(&a)));
        assert!(!d.must_compile(3, Some(&b)));
        assert!(!d.must_compile(3, Some(&a)));
        assert!(!d.must_compile(3, Some(&b)));
        assert!(d.must_compile(3, Some(&a)), "third hit of `a` fires");
    }

    #[test]
    fn test_five_slot_eviction_evicts_exactly_one() {
        let mut c = ValueCounters::default();
        // Build up distinct hit counts: value i seen i+1 times.
        for i in 0..5i64 {
            for _ in 0..=i {
                c.see(&Value::Int(i));
            }
        }
        assert_eq!(c.slot_count(), 5);

        // A sixth distinct value evicts exactly one slot.
        c.see(&Value::Int(99));
        assert_eq!(c.slot_count(), 5);
        assert_eq!(c.count_for(&Value::Int(99)), 1);

        // The two highest-count slots survive.
        assert_eq!(c.count_for(&Value::Int(4)), 5);
        assert_eq!(c.count_for(&Value::Int(3)), 4);
        // The third-highest was the victim.
        assert_eq!(c.count_for(&Value::Int(2)), 0);
        assert_eq!(c.count_for(&Value::Int(1)), 2);
        assert_eq!(c.count_for(&Value::Int(0)), 1);
    }

    proptest! {
        /// Whatever the observation sequence, there are never more than
        /// five slots, and inserting a fresh value evicts exactly one slot
        /// whose hit count is never among the two highest.
        #[test]
        fn prop_eviction_preserves_top_two(hits in proptest::collection::vec(0i64..8, 1..200)) {
            let mut c = ValueCounters::default();
            for v in &hits {
                c.see(&Value::Int(*v));
            }
            prop_assert!(c.slot_count() <= 5);

            if c.slot_count() == 5 {
                let mut before = c.counts();
                before.sort_unstable_by(|x, y| y.cmp(x));
                let (top1, top2) = (before[0], before[1]);

                c.see(&Value::Int(1000));
                prop_assert_eq!(c.slot_count(), 5);

                // The surviving counts still contain one occurrence each of
                // the two highest pre-eviction counts (tie-safe check).
                let mut after = c.counts();
                let i = after.iter().position(|&n| n == top1);
                prop_assert!(i.is_some());
                after.swap_remove(i.unwrap());
                prop_assert!(after.contains(&top2));
            }
        }
    }
}
