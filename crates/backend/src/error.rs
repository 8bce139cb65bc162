//! Error types for the reference backend.

/// Structural problems found while validating a trace for compilation.
/// These indicate an engine bug, not a portal-program bug; the backend
/// reports the trace as rejected rather than installing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("variable v{0} used before definition")]
    UndefinedVar(u32),

    #[error("variable v{0} defined twice")]
    Redefined(u32),

    #[error("guard operation without a resume descriptor")]
    GuardWithoutDescr,

    #[error("label not at the start of the trace")]
    MisplacedLabel,

    #[error("terminator in the middle of the trace")]
    EarlyTerminator,

    #[error("trace does not end in a jump or finish")]
    MissingTerminator,
}
