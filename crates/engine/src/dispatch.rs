//! The warm-up / dispatch state machine: the single entry point invoked at
//! every loop header, and the guard-failure handler invoked when compiled
//! code exits through a guard.
//!
//! `maybe_compile_and_run` is O(1) amortized and never blocks: it either
//! counts, refuses (already tracing), runs compiled code, or starts a
//! tracing session whose whole lifetime fits inside the call.

use crate::backend::{DeadFrame, ExecutionBackend, ExitDescr};
use crate::bytecode::{LoopHeadInfo, Program};
use crate::cell::{
    CELL_DONT_TRACE_HERE, CELL_TEMPORARY, CELL_TRACING, CELL_TRACING_OCCURRED, CellKey,
    DispatchCell,
};
use crate::compile::{self, Closing};
use crate::counter::spec_hash;
use crate::errors::{AbortReason, VmError};
use crate::interp::{self, Frame};
use crate::ir::{FinishMode, GuardKind, Operand};
use crate::recorder::{self, AbortResume, TraceResult};
use crate::resume::ResumeId;
use crate::state::DispatchState;
use crate::tokens::TokenHandle;
use crate::value::{ObjRef, Outcome, Value};

/// What the loop-header check did.
#[derive(Debug)]
pub enum EnterResult {
    /// Keep interpreting; nothing ran on the caller's behalf.
    NotEntered,
    /// Compiled code (or a freshly recorded trace) ran the current frame
    /// to completion.
    Finished(Outcome),
}

/// The loop-header entry point.
///
/// 1. Hash the specialization key and walk the cell chain structurally.
/// 2. No cell: count; at threshold, create one and trace.
/// 3. Cell marked `TRACING`: refuse re-entry, do nothing.
/// 4. Cell marked `TEMPORARY`: count normally; promote at threshold.
/// 5. Live procedure token: confirm entry, then run compiled code.
/// 6. Dead or absent token: `DONT_TRACE_HERE` retry rules, else lazy
///    chain cleanup.
pub fn maybe_compile_and_run(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    func: u16,
    head: u16,
    frame: &Frame,
) -> Result<EnterResult, VmError> {
    let function = program.function(func)?;
    let info = function.loop_head(head)?.clone();
    let greens: Vec<Value> = info
        .greens
        .iter()
        .map(|&r| frame.reg(r).cloned())
        .collect::<Result<_, _>>()?;
    let key = CellKey { func, head, greens };
    let hash = spec_hash(func, head, &key.greens);
    let threshold = state.config.compile_threshold;

    let Some(idx) = state.counter.find_cell(hash, &key) else {
        if state.counter.tick(hash, threshold) {
            return bound_reached(state, backend, program, key, hash, &info, frame);
        }
        return Ok(EnterResult::NotEntered);
    };

    let flags = state.counter.cell(hash, idx).flags;
    if flags & CELL_TRACING != 0 {
        // Tracing already happening in an outer invocation of this site.
        return Ok(EnterResult::NotEntered);
    }
    if flags & CELL_TEMPORARY != 0 {
        // Placeholder procedure: keep counting until a real compile.
        if state.counter.tick(hash, threshold) {
            return bound_reached(state, backend, program, key, hash, &info, frame);
        }
        return Ok(EnterResult::NotEntered);
    }

    let token = state.counter.cell(hash, idx).procedure_token(&state.tokens);
    match token {
        Some(token) => {
            let reds: Vec<Value> = info
                .reds
                .iter()
                .map(|&r| frame.reg(r).cloned())
                .collect::<Result<_, _>>()?;
            if !state.config.confirm_enter(&key.greens, &reds) {
                return Ok(EnterResult::NotEntered);
            }
            execute_compiled(state, backend, program, func, &info, token, reds)
                .map(EnterResult::Finished)
        }
        None => {
            let cell = state.counter.cell(hash, idx);
            if flags & CELL_DONT_TRACE_HERE != 0 && !cell.has_seen_token() {
                // A non-inlinable site we never managed to compile: trace
                // immediately the first time, then count normally.
                let fire = if flags & CELL_TRACING_OCCURRED != 0 {
                    state.counter.tick(hash, threshold)
                } else {
                    true
                };
                if fire {
                    return bound_reached(state, backend, program, key, hash, &info, frame);
                }
                return Ok(EnterResult::NotEntered);
            }
            // Aborted compilation or a token that has since died.
            state.counter.cleanup_chain(hash, &state.tokens);
            Ok(EnterResult::NotEntered)
        }
    }
}

/// The compile threshold fired: trace this site, compile the result, and
/// run the rest of the frame.
fn bound_reached(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    key: CellKey,
    hash: u64,
    info: &LoopHeadInfo,
    frame: &Frame,
) -> Result<EnterResult, VmError> {
    if state.tracing_active {
        // Code running on behalf of the recorder wants to start a second
        // tracing session: flag the outer trace for abort and keep
        // interpreting so the in-flight residual call completes.
        if state.abort_requested.is_none() {
            state.abort_requested = Some(AbortReason::TracingReentered);
        }
        return Ok(EnterResult::NotEntered);
    }

    let reds: Vec<Value> = info
        .reds
        .iter()
        .map(|&r| frame.reg(r).cloned())
        .collect::<Result<_, _>>()?;
    if !state.config.confirm_enter(&key.greens, &reds) {
        return Ok(EnterResult::NotEntered);
    }

    state.counter.decay_all(state.config.decay_keep_percent);

    let idx = match state.counter.find_cell(hash, &key) {
        Some(idx) => idx,
        None => state.counter.install_cell(hash, DispatchCell::new(key.clone())),
    };
    state
        .counter
        .cell_mut(hash, idx)
        .set_flag(CELL_TRACING | CELL_TRACING_OCCURRED);
    state.tracing_active = true;
    state.metrics.traces_started += 1;
    tracing::debug!(func = key.func, head = key.head, "start tracing");

    let result = recorder::trace_loop(state, backend, program, key.clone(), frame);

    state.tracing_active = false;
    state.abort_requested = None;
    if let Some(idx) = state.counter.find_cell(hash, &key) {
        state.counter.cell_mut(hash, idx).clear_flag(CELL_TRACING);
    }
    let result = result?;

    match result {
        TraceResult::ClosedLoop {
            trace,
            back_args,
            live,
            frames,
        } => {
            // The previously attached procedure (a real one acts as the
            // retrace preamble; a placeholder only needs redirecting).
            let old_token = state
                .counter
                .find_cell(hash, &key)
                .and_then(|i| state.counter.cell(hash, i).procedure_token(&state.tokens));
            let preamble = old_token.filter(|&t| {
                state.tokens.info(t).map(|i| !i.temporary).unwrap_or(false)
            });

            match compile::compile_loop(
                state,
                backend,
                program,
                trace,
                Closing::BackEdge { args: back_args },
                preamble,
            ) {
                Some(token) => {
                    if let Some(idx) = state.counter.find_cell(hash, &key) {
                        state.counter.cell_mut(hash, idx).set_token(token, false);
                    }
                    if let Some(old) = old_token {
                        compile::install_redirect(state, backend, old, token);
                    }
                    state.counter.reset(hash);
                    execute_compiled(state, backend, program, key.func, info, token, live)
                        .map(EnterResult::Finished)
                }
                None => {
                    // No token: resume the concretely-executed state in
                    // the slow interpreter; hotness brings us back.
                    state.counter.set_near_threshold(hash, state.config.compile_threshold);
                    state.metrics.fallback_resumes += 1;
                    interp::run_frames(state, backend, program, frames, None)
                        .map(EnterResult::Finished)
                }
            }
        }
        TraceResult::Finished { trace, outcome } => {
            // The frame left through its end while tracing: compile the
            // finish-shaped procedure for future visits; the outcome
            // itself already happened.
            let old_token = state
                .counter
                .find_cell(hash, &key)
                .and_then(|i| state.counter.cell(hash, i).procedure_token(&state.tokens));
            if let Some(token) =
                compile::compile_loop(state, backend, program, trace, Closing::Finished, None)
            {
                if let Some(idx) = state.counter.find_cell(hash, &key) {
                    state.counter.cell_mut(hash, idx).set_token(token, false);
                }
                if let Some(old) = old_token {
                    compile::install_redirect(state, backend, old, token);
                }
                state.counter.reset(hash);
            }
            Ok(EnterResult::Finished(outcome))
        }
        TraceResult::Aborted { reason, resume } => {
            state.metrics.traces_aborted += 1;
            if reason == AbortReason::TraceTooLong {
                if let Some(idx) = state.counter.find_cell(hash, &key) {
                    state
                        .counter
                        .cell_mut(hash, idx)
                        .set_flag(CELL_DONT_TRACE_HERE);
                }
            }
            state
                .counter
                .set_near_threshold(hash, state.config.compile_threshold);
            match resume {
                AbortResume::Finished(outcome) => Ok(EnterResult::Finished(outcome)),
                AbortResume::Frames(frames) => {
                    state.metrics.fallback_resumes += 1;
                    interp::run_frames(state, backend, program, frames, None)
                        .map(EnterResult::Finished)
                }
            }
        }
        TraceResult::ReachedLoop { .. } => {
            unreachable!("loop recording never closes at a foreign label")
        }
    }
}

/// Enter a compiled procedure with the given red values, running the
/// virtualizable entry/exit protocol around it, and dispatch on how the
/// deadframe says it ended.
fn execute_compiled(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    func: u16,
    info: &LoopHeadInfo,
    token: TokenHandle,
    mut args: Vec<Value>,
) -> Result<Outcome, VmError> {
    let function = program.function(func)?;
    let vt_obj: Option<ObjRef> = match function.virtualizable {
        Some(decl) => {
            let pos = info
                .reds
                .iter()
                .position(|&r| r == decl.reg)
                .ok_or(VmError::VtShapeMismatch)?;
            match &args[pos] {
                Value::Ref(Some(obj)) => {
                    if !obj.borrow().matches_layout(&decl.layout) {
                        return Err(VmError::VtShapeMismatch);
                    }
                    Some(obj.clone())
                }
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "ref",
                        got: other.kind_name(),
                    });
                }
            }
        }
        None => None,
    };

    // Unbox once per compiled invocation; the fields travel as extra args.
    if let Some(obj) = &vt_obj {
        args.extend(obj.borrow().read_fields());
        obj.borrow_mut().enter_backend_frame(token.index);
    }

    state.metrics.compiled_entries += 1;
    tracing::debug!(token = token.index, "entering compiled code");
    let result = backend.execute(state, program, token, args);
    // The backend synchronized the fields on its exit path; here we only
    // release ownership.
    if let Some(obj) = &vt_obj {
        obj.borrow_mut().leave_backend_frame();
    }
    let mut deadframe = result?;

    match deadframe.latest_descr() {
        ExitDescr::Finish(FinishMode::Return) => Ok(Outcome::Return(deadframe.value(0)?.clone())),
        ExitDescr::Finish(FinishMode::Raise) => {
            let exc = deadframe
                .grab_exception()
                .ok_or(VmError::MissingDeadFrameException)?;
            Ok(Outcome::Raise(exc))
        }
        ExitDescr::Guard(id) => handle_guard_failure(state, backend, program, id, deadframe),
    }
}

/// Entry point for guard exits from compiled code: count the failure,
/// compile a bridge once the guard is eager enough, otherwise reconstruct
/// the interpreter frames from the snapshot and finish in the fallback
/// interpreter.
pub fn handle_guard_failure(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    id: ResumeId,
    mut deadframe: DeadFrame,
) -> Result<Outcome, VmError> {
    state.metrics.guard_failures += 1;
    let guard = state.descr(id).guard;
    let observed: Option<Value> = state
        .descr(id)
        .promoted_index
        .and_then(|i| deadframe.value(i).ok().cloned());

    // Forced-virtualizable exits are never compiled, only finished in the
    // fallback; and no bridge recording starts inside another trace.
    let hot = if guard == GuardKind::NotForced {
        false
    } else {
        let eagerness = state.config.trace_eagerness;
        let fired = state.descr_mut(id).must_compile(eagerness, observed.as_ref());
        fired && !state.tracing_active
    };

    if !hot {
        state.metrics.fallback_resumes += 1;
        tracing::debug!(guard = ?guard, "guard failure resumes in the fallback interpreter");
        let (frames, pending) = reconstruct_frames(state, program, id, &mut deadframe)?;
        return interp::run_frames(state, backend, program, frames, pending);
    }

    state.descr_mut(id).start_compiling();
    state.tracing_active = true;
    state.metrics.traces_started += 1;
    tracing::debug!("start tracing bridge from failing guard");

    let result = recorder::trace_bridge(state, backend, program, id, &deadframe);

    state.tracing_active = false;
    state.abort_requested = None;
    state.descr_mut(id).done_compiling();
    let result = result?;

    match result {
        TraceResult::ReachedLoop {
            trace,
            key,
            target,
            back_args,
            live,
            ..
        } => {
            compile::compile_trace(
                state,
                backend,
                program,
                id,
                trace,
                Closing::JumpTo {
                    target,
                    args: back_args,
                },
            );
            // Whether or not the bridge was accepted, the recording
            // already brought execution to the target's header: continue
            // in its compiled code.
            let function = program.function(key.func)?;
            let info = function.loop_head(key.head)?.clone();
            execute_compiled(state, backend, program, key.func, &info, target, live)
        }
        TraceResult::Finished { trace, outcome } => {
            compile::compile_trace(state, backend, program, id, trace, Closing::Finished);
            Ok(outcome)
        }
        TraceResult::Aborted { reason, resume } => {
            state.metrics.traces_aborted += 1;
            tracing::debug!(reason = %reason, "bridge trace aborted");
            match resume {
                AbortResume::Finished(outcome) => Ok(outcome),
                AbortResume::Frames(frames) => {
                    state.metrics.fallback_resumes += 1;
                    interp::run_frames(state, backend, program, frames, None)
                }
            }
        }
        TraceResult::ClosedLoop { .. } => {
            unreachable!("bridge recording never closes a fresh loop")
        }
    }
}

/// Rebuild the interpreter frame stack a guard snapshot describes, with
/// runtime values taken from the deadframe.
fn reconstruct_frames(
    state: &DispatchState,
    _program: &Program,
    id: ResumeId,
    deadframe: &mut DeadFrame,
) -> Result<(Vec<Frame>, Option<Value>), VmError> {
    let descr = state.descr(id);

    let mut chain = Vec::new();
    let mut node = Some(&descr.snapshot);
    while let Some(n) = node {
        chain.push(n);
        node = n.parent.as_ref();
    }

    let mut frames = Vec::with_capacity(chain.len());
    for n in chain.iter().rev() {
        let mut regs = Vec::with_capacity(n.regs.len());
        for op in &n.regs {
            let value = match op {
                Operand::Const(c) => c.clone(),
                Operand::Var(v) => {
                    let idx = descr
                        .fail_arg_index(*v)
                        .ok_or(VmError::DeadFrameIndex(v.0 as usize))?;
                    deadframe.value(idx)?.clone()
                }
            };
            regs.push(value);
        }
        frames.push(Frame {
            func: n.func,
            pc: n.pc,
            regs,
        });
    }

    // A failed no-exception guard resumes mid-raise.
    let pending = match descr.guard {
        GuardKind::NoException => Some(
            deadframe
                .grab_exception()
                .ok_or(VmError::MissingDeadFrameException)?,
        ),
        _ => None,
    };
    Ok((frames, pending))
}
