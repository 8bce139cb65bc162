//! The compilation pipeline: turns finished traces into procedure tokens,
//! decides loop-vs-bridge shape, wires redirects, and retries invalid
//! loops against their preamble.
//!
//! Compile rejections are never fatal. The caller falls back to the slow
//! interpreter and the site's hotness brings it back here later.

use crate::backend::ExecutionBackend;
use crate::bytecode::Program;
use crate::errors::CompileError;
use crate::ir::{IrOp, OpKind, Operand, Trace};
use crate::resume::ResumeId;
use crate::state::DispatchState;
use crate::tokens::TokenHandle;

/// How a trace leaves compiled code.
#[derive(Debug)]
pub enum Closing {
    /// Loop closed on itself: append the label up front and the back-edge
    /// jump at the end.
    BackEdge { args: Vec<Operand> },
    /// Bridge closed at an existing procedure's label.
    JumpTo {
        target: TokenHandle,
        args: Vec<Operand>,
    },
    /// The trace already ends in a `Finish` operation.
    Finished,
}

fn apply_closing(trace: &mut Trace, token: TokenHandle, closing: Closing) {
    match closing {
        Closing::BackEdge { args } => {
            trace.ops.insert(
                0,
                IrOp {
                    kind: OpKind::Label,
                    args: Default::default(),
                    result: None,
                    descr: None,
                },
            );
            trace.push(IrOp {
                kind: OpKind::Jump { target: token },
                args: args.into_iter().collect(),
                result: None,
                descr: None,
            });
        }
        Closing::JumpTo { target, args } => {
            trace.push(IrOp {
                kind: OpKind::Jump { target },
                args: args.into_iter().collect(),
                result: None,
                descr: None,
            });
        }
        Closing::Finished => {}
    }
}

/// Stamp every guard in the compiled trace with its owning token, so a
/// later bridge compile can name the original procedure.
fn stamp_guard_owners(state: &mut DispatchState, trace: &Trace, token: TokenHandle) {
    for op in &trace.ops {
        if let Some(id) = op.descr {
            state.descr_mut(id).owner = Some(token);
        }
    }
}

/// Replace every guard descriptor with a fresh clone before a retrace, so
/// the originals keep describing the procedure they were first compiled
/// into and the retraced loop counts eagerness from zero.
fn clone_descrs_for_retrace(state: &mut DispatchState, trace: &mut Trace) {
    for op in &mut trace.ops {
        if let Some(id) = op.descr {
            let cloned = state.descr(id).clone_for_retrace();
            op.descr = Some(state.alloc_descr(cloned));
        }
    }
}

/// Compile a closed loop (or a finish-shaped trace) and return its token.
/// On an invalid-loop rejection, retries up to `max_retrace` times against
/// `preamble` (the key's previously compiled procedure), then gives up.
pub fn compile_loop(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    mut trace: Trace,
    closing: Closing,
    preamble: Option<TokenHandle>,
) -> Option<TokenHandle> {
    let token = state.tokens.allocate(false);
    apply_closing(&mut trace, token, closing);

    let mut result = backend.compile_loop(state, program, token, &trace);
    if matches!(result, Err(CompileError::InvalidLoop)) {
        if let Some(preamble) = preamble {
            clone_descrs_for_retrace(state, &mut trace);
            for _ in 0..state.config.max_retrace {
                state.metrics.retraces += 1;
                tracing::debug!("retracing invalid loop against preamble");
                result = backend.compile_retrace(state, program, token, &trace, preamble);
                if !matches!(result, Err(CompileError::InvalidLoop)) {
                    break;
                }
            }
        }
    }

    match result {
        Ok(()) => {
            stamp_guard_owners(state, &trace, token);
            state.metrics.loops_compiled += 1;
            tracing::info!(
                ops = trace.ops.len(),
                inputs = trace.inputs.len(),
                "compiled loop"
            );
            Some(token)
        }
        Err(err) => {
            state.metrics.compile_failures += 1;
            tracing::debug!(error = %err, "loop compilation rejected");
            state.tokens.free(token);
            backend.free(token);
            None
        }
    }
}

/// Compile a bridge from a failed guard and attach it to the descriptor.
/// The caller holds the descriptor's busy flag around this.
pub fn compile_trace(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    descr_id: ResumeId,
    mut trace: Trace,
    closing: Closing,
) -> Option<TokenHandle> {
    assert!(
        state.descr(descr_id).is_busy(),
        "bridge compile without the descriptor busy flag held"
    );
    let original = state.descr(descr_id).owner;
    let token = state.tokens.allocate(false);
    apply_closing(&mut trace, token, closing);

    match backend.compile_bridge(state, program, descr_id, &trace, original) {
        Ok(()) => {
            stamp_guard_owners(state, &trace, token);
            state.descr_mut(descr_id).bridge = Some(token);
            state.metrics.bridges_compiled += 1;
            tracing::info!(ops = trace.ops.len(), "compiled bridge");
            Some(token)
        }
        Err(err) => {
            state.metrics.compile_failures += 1;
            tracing::debug!(error = %err, "bridge compilation rejected");
            state.tokens.free(token);
            backend.free(token);
            None
        }
    }
}

/// Record an old-to-new procedure replacement: token-arena forwarding plus
/// the backend's own redirect, without touching already-running code.
pub fn install_redirect(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    old: TokenHandle,
    new: TokenHandle,
) {
    if state.tokens.set_redirect(old, new).is_ok() {
        backend.redirect(old, new);
        state.metrics.redirects += 1;
        tracing::debug!(
            old = old.index,
            new = new.index,
            "redirected procedure token"
        );
    }
}
