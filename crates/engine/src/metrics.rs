//! Counters for monitoring warm-up and compilation activity.
//!
//! Plain integers: the engine runs on a single thread of control and the
//! owning [`DispatchState`](crate::state::DispatchState) is passed `&mut`
//! everywhere.

/// Event counters. All monotonically increasing until reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineMetrics {
    /// Tracing sessions started.
    pub traces_started: u64,
    /// Tracing sessions that aborted back to the interpreter.
    pub traces_aborted: u64,
    /// Loops successfully compiled (including finish-shaped traces).
    pub loops_compiled: u64,
    /// Bridges successfully attached to guards.
    pub bridges_compiled: u64,
    /// Candidate loops/bridges the backend rejected.
    pub compile_failures: u64,
    /// Retrace attempts after an invalid-loop rejection.
    pub retraces: u64,
    /// Entries into compiled code from the interpreter.
    pub compiled_entries: u64,
    /// Guard exits taken at runtime.
    pub guard_failures: u64,
    /// Guard exits finished by the fallback interpreter.
    pub fallback_resumes: u64,
    /// Old-to-new procedure token redirects installed.
    pub redirects: u64,
    /// Placeholder (temporary) procedure tokens installed.
    pub placeholders_installed: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
