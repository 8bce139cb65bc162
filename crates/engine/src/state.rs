//! The dispatch state: every piece of per-process warm-up and compilation
//! bookkeeping, gathered into one explicitly injected value.
//!
//! There are no process globals; the embedding owns a `DispatchState` and
//! passes it `&mut` into every entry point. Reentrancy (nested loop
//! headers, recursive portal calls) travels down the host call stack with
//! the borrow, and the `tracing_active` flag is what refuses re-entrant
//! tracing.

use crate::config::EngineConfig;
use crate::counter::HotCounter;
use crate::errors::AbortReason;
use crate::metrics::EngineMetrics;
use crate::resume::{ResumeDescr, ResumeId};
use crate::snapshot::SnapshotInterner;
use crate::tokens::TokenArena;

/// Aggregated warm-up, resume and token state.
#[derive(Debug)]
pub struct DispatchState {
    pub config: EngineConfig,
    pub metrics: EngineMetrics,
    pub counter: HotCounter,
    pub tokens: TokenArena,
    pub snapshots: SnapshotInterner,
    descrs: Vec<ResumeDescr>,
    /// A tracing session is in flight somewhere up the call stack.
    pub(crate) tracing_active: bool,
    /// Set when code running on behalf of the recorder hits a condition
    /// that must abort the trace once control returns to it.
    pub(crate) abort_requested: Option<AbortReason>,
}

impl DispatchState {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            metrics: EngineMetrics::new(),
            counter: HotCounter::new(),
            tokens: TokenArena::new(),
            snapshots: SnapshotInterner::new(),
            descrs: Vec::new(),
            tracing_active: false,
            abort_requested: None,
        }
    }

    pub fn alloc_descr(&mut self, descr: ResumeDescr) -> ResumeId {
        let id = ResumeId(self.descrs.len() as u32);
        self.descrs.push(descr);
        id
    }

    pub fn descr(&self, id: ResumeId) -> &ResumeDescr {
        &self.descrs[id.0 as usize]
    }

    pub fn descr_mut(&mut self, id: ResumeId) -> &mut ResumeDescr {
        &mut self.descrs[id.0 as usize]
    }

    pub fn descr_count(&self) -> usize {
        self.descrs.len()
    }

    pub fn is_tracing(&self) -> bool {
        self.tracing_active
    }

    /// Reset every runtime accumulator for test isolation. Configuration
    /// is kept. Not available in production builds.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset_for_testing(&mut self) {
        self.metrics.reset();
        self.counter.clear();
        self.tokens.clear();
        self.snapshots.clear();
        self.descrs.clear();
        self.tracing_active = false;
        self.abort_requested = None;
    }
}

impl Default for DispatchState {
    fn default() -> Self {
        Self::new()
    }
}
