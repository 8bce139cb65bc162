//! Error and control-flow signal types.
//!
//! Three channels are kept strictly apart:
//!
//! - [`VmError`]: the embedding handed the engine something malformed
//!   (bad bytecode, out-of-range indices, an int op on a ref). Propagates
//!   with `?` all the way out.
//! - [`AbortReason`] inside [`TraceError::Abort`]: the controlled unwind
//!   from trace recording back to the slow interpreter. Always caught at
//!   the start-tracing boundary, never observable to the portal program.
//! - Guard failures and compile rejections are ordinary values
//!   ([`CompileError`], the deadframe exit descriptor), not errors.
//!
//! Engine-internal invariant violations (double force of a virtualizable,
//! re-entrant compile on a busy descriptor) are asserts, not variants here.

use strum::Display;

/// Host-level misuse of the engine by the embedding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("invalid opcode 0x{0:02x} at pc {1}")]
    InvalidOpcode(u8, usize),

    #[error("truncated instruction at pc {0}")]
    TruncatedInstruction(usize),

    #[error("jump target {0} out of range")]
    PcOutOfRange(usize),

    #[error("register r{0} out of range")]
    RegisterOutOfRange(u8),

    #[error("constant index {0} out of range")]
    ConstOutOfRange(u16),

    #[error("function index {0} out of range")]
    FunctionOutOfRange(u16),

    #[error("host function index {0} out of range")]
    HostFnOutOfRange(u16),

    #[error("loop head {0} out of range")]
    LoopHeadOutOfRange(u16),

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("function {0} declares no virtualizable")]
    NoVirtualizable(u16),

    #[error("virtualizable field {0} out of range")]
    VtFieldOutOfRange(u8),

    #[error("virtualizable array index {0} out of bounds")]
    VtIndexOutOfBounds(i64),

    #[error("virtualizable shape does not match declaration")]
    VtShapeMismatch,

    #[error("dead procedure token executed")]
    DeadToken,

    #[error("deadframe value index {0} out of range")]
    DeadFrameIndex(usize),

    #[error("deadframe carries no exception for an exception resume")]
    MissingDeadFrameException,
}

/// Why trace recording gave up. Carried by [`TraceError::Abort`] and logged;
/// every abort ends in the fallback interpreter reproducing interpreter
/// semantics exactly, only slower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AbortReason {
    /// The recorded operation count exceeded `trace_limit`.
    TraceTooLong,
    /// A residual call ran code the recorder cannot represent.
    UntraceableCall,
    /// Code executed on behalf of the recorder tried to start a second
    /// tracing session.
    TracingReentered,
    /// A residual call forced the virtualizable out of its unboxed state.
    VirtualizableForced,
    /// The backend rejected the candidate loop and no retrace succeeded.
    BadLoop,
}

/// Error channel of everything that runs under the recorder: either a real
/// host-level error, or the abort signal that unwinds to the nearest
/// start-tracing boundary as a value (never a host panic or unwind).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TraceError {
    #[error("trace aborted: {0}")]
    Abort(AbortReason),

    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Rejection reported by the execution backend for a candidate loop or
/// bridge. Never fatal: the caller resumes via the slow interpreter and the
/// hotness counters are left alone so compilation is retried later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// The loop is not valid under the current initial assumptions;
    /// `compile_retrace` may still succeed against the preamble.
    #[error("invalid loop under current assumptions")]
    InvalidLoop,

    /// The candidate is provably unreachable or contradictory.
    #[error("candidate trace is unreachable")]
    Unreachable,
}
