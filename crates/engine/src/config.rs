//! Engine configuration.

use crate::ir::SpecKey;
use crate::value::Value;

/// Hook consulted before entering compiled code or starting a trace at a
/// fired threshold. Receives the specialization key and the red values.
pub type ConfirmEnterFn = fn(&SpecKey, &[Value]) -> bool;

/// Tunables of the warm-up and tracing machinery.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Loop-header visits before a site is traced.
    pub compile_threshold: u32,
    /// Guard failures before a bridge is compiled from that guard.
    pub trace_eagerness: u32,
    /// Maximum recorded operations before a trace aborts.
    pub trace_limit: usize,
    /// Extra compile attempts against the preamble after the backend
    /// rejects a loop as invalid.
    pub max_retrace: u32,
    /// Percentage of every hot counter retained when a new trace starts.
    pub decay_keep_percent: u32,
    /// Optional guard on entering compiled code / starting to trace.
    pub confirm_enter: Option<ConfirmEnterFn>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compile_threshold: 10,
            trace_eagerness: 5,
            trace_limit: 2000,
            max_retrace: 2,
            decay_keep_percent: 40,
            confirm_enter: None,
        }
    }
}

impl EngineConfig {
    pub fn confirm_enter(&self, key: &SpecKey, reds: &[Value]) -> bool {
        match self.confirm_enter {
            Some(hook) => hook(key, reds),
            None => true,
        }
    }
}
