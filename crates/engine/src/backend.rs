//! The execution backend interface.
//!
//! The engine never generates native code itself; it hands finished traces
//! to an [`ExecutionBackend`] and runs compiled procedures through it. The
//! backend reports every exit from compiled code as a [`DeadFrame`]: the
//! exit descriptor (frame finished, or a specific guard failed) plus the
//! values the resume machinery needs.

use crate::bytecode::Program;
use crate::errors::{CompileError, VmError};
use crate::ir::{FinishMode, Trace};
use crate::resume::ResumeId;
use crate::state::DispatchState;
use crate::tokens::TokenHandle;
use crate::value::{ObjRef, Value};

/// How compiled code exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDescr {
    /// The frame ran to completion: a return value or a raised exception.
    Finish(FinishMode),
    /// The guard owning this resume descriptor failed.
    Guard(ResumeId),
}

/// Everything the backend reports when compiled code stops executing.
#[derive(Debug, Clone)]
pub struct DeadFrame {
    descr: ExitDescr,
    /// For a guard exit: the descriptor's fail args, in order. For a
    /// normal finish: the single return value.
    values: Vec<Value>,
    exception: Option<Value>,
}

impl DeadFrame {
    pub fn finish_return(value: Value) -> Self {
        Self {
            descr: ExitDescr::Finish(FinishMode::Return),
            values: vec![value],
            exception: None,
        }
    }

    pub fn finish_raise(exception: Value) -> Self {
        Self {
            descr: ExitDescr::Finish(FinishMode::Raise),
            values: vec![],
            exception: Some(exception),
        }
    }

    pub fn guard_exit(descr: ResumeId, values: Vec<Value>, exception: Option<Value>) -> Self {
        Self {
            descr: ExitDescr::Guard(descr),
            values,
            exception,
        }
    }

    pub fn latest_descr(&self) -> ExitDescr {
        self.descr
    }

    pub fn value(&self, index: usize) -> Result<&Value, VmError> {
        self.values.get(index).ok_or(VmError::DeadFrameIndex(index))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get_int_value(&self, index: usize) -> Result<i64, VmError> {
        let v = self.value(index)?;
        v.as_int().ok_or(VmError::TypeMismatch {
            expected: "int",
            got: v.kind_name(),
        })
    }

    pub fn get_float_value(&self, index: usize) -> Result<f64, VmError> {
        let v = self.value(index)?;
        v.as_float().ok_or(VmError::TypeMismatch {
            expected: "float",
            got: v.kind_name(),
        })
    }

    pub fn get_ref_value(&self, index: usize) -> Result<Option<ObjRef>, VmError> {
        let v = self.value(index)?;
        v.as_ref_value()
            .map(|r| r.cloned())
            .ok_or(VmError::TypeMismatch {
                expected: "ref",
                got: v.kind_name(),
            })
    }

    /// Take the pending interpreted-language exception out of the frame.
    pub fn grab_exception(&mut self) -> Option<Value> {
        self.exception.take()
    }

    pub fn exception(&self) -> Option<&Value> {
        self.exception.as_ref()
    }
}

/// Compiles traces into callable procedures and executes them.
///
/// The engine defines this interface; a backend crate implements it. The
/// dependency points only one way: backends may call back into the
/// engine's interpreter (for placeholder tokens and residual portal
/// calls), which is why `execute` receives the dispatch state.
pub trait ExecutionBackend {
    /// Install the compiled form of a closed loop under `token`. The trace
    /// starts with a `Label` and ends with a `Jump` back to it (or with a
    /// `Finish` for a trace that left through the frame end).
    fn compile_loop(
        &mut self,
        state: &mut DispatchState,
        program: &Program,
        token: TokenHandle,
        trace: &Trace,
    ) -> Result<(), CompileError>;

    /// Retry a rejected loop against its already-compiled preamble.
    /// Backends without a looser compilation mode just compile normally.
    fn compile_retrace(
        &mut self,
        state: &mut DispatchState,
        program: &Program,
        token: TokenHandle,
        trace: &Trace,
        _preamble: TokenHandle,
    ) -> Result<(), CompileError> {
        self.compile_loop(state, program, token, trace)
    }

    /// Attach a bridge to the guard owning `descr`. Subsequent failures of
    /// that guard continue in the bridge instead of exiting. `original` is
    /// the procedure the guard was compiled into, when known.
    fn compile_bridge(
        &mut self,
        state: &mut DispatchState,
        program: &Program,
        descr: ResumeId,
        trace: &Trace,
        original: Option<TokenHandle>,
    ) -> Result<(), CompileError>;

    /// Run a compiled procedure until the frame finishes or a guard with
    /// no attached bridge fails.
    fn execute(
        &mut self,
        state: &mut DispatchState,
        program: &Program,
        token: TokenHandle,
        args: Vec<Value>,
    ) -> Result<DeadFrame, VmError>;

    /// Forward executions of `old` to `new` without recompiling callers.
    fn redirect(&mut self, old: TokenHandle, new: TokenHandle);

    /// Release the compiled form of `token`. Backends that cannot free
    /// individual procedures may ignore this.
    fn free(&mut self, _token: TokenHandle) {}
}
