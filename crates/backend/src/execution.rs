//! The IR evaluator and the [`ExecutionBackend`] implementation.
//!
//! A compiled procedure runs until it leaves through a `Finish`, or
//! through a guard with no attached bridge (producing a deadframe for the
//! engine's guard-failure handler). A failing guard *with* a bridge
//! switches execution into the bridge without leaving compiled code; a
//! back-edge `Jump` re-binds the environment and starts the target
//! procedure's operations over, following token redirects through the
//! engine's arena.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use ember_engine::backend::{DeadFrame, ExecutionBackend, ExitDescr};
use ember_engine::bytecode::Program;
use ember_engine::dispatch;
use ember_engine::errors::{CompileError, VmError};
use ember_engine::eval;
use ember_engine::interp;
use ember_engine::ir::{FinishMode, GuardKind, Operand, OpKind, Trace, VarId};
use ember_engine::resume::ResumeId;
use ember_engine::state::DispatchState;
use ember_engine::tokens::TokenHandle;
use ember_engine::value::{Outcome, Value};
use ember_engine::virtualizable::EscapeMarker;

use crate::procedure::Procedure;
use crate::validation::validate_trace;

#[derive(Debug, Default)]
struct Inner {
    /// Compiled loops and finish procedures, keyed by token slot index.
    procedures: FxHashMap<u32, Procedure>,
    /// Bridges, keyed by the owning guard's resume descriptor.
    bridges: FxHashMap<u32, Procedure>,
    /// Backend-side old-to-new forwarding, mirroring the arena's.
    redirects: FxHashMap<u32, u32>,
    reject_loops: u32,
    reject_retraces: u32,
    reject_bridges: u32,
}

/// Reference trace-evaluating backend. Cheap to clone; clones share the
/// same procedure store, which is how the evaluator re-enters itself for
/// nested interpreter callbacks.
#[derive(Debug, Clone, Default)]
pub struct EvalBackend {
    inner: Rc<RefCell<Inner>>,
}

impl EvalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failure injection: report the next `n` loop compiles as invalid.
    pub fn reject_next_loops(&self, n: u32) {
        self.inner.borrow_mut().reject_loops = n;
    }

    /// Failure injection: reject the next `n` retrace attempts too.
    pub fn reject_next_retraces(&self, n: u32) {
        self.inner.borrow_mut().reject_retraces = n;
    }

    /// Failure injection: report the next `n` bridge compiles as invalid.
    pub fn reject_next_bridges(&self, n: u32) {
        self.inner.borrow_mut().reject_bridges = n;
    }

    pub fn procedure_count(&self) -> usize {
        self.inner.borrow().procedures.len()
    }

    pub fn bridge_count(&self) -> usize {
        self.inner.borrow().bridges.len()
    }

    fn lookup(&self, index: u32) -> Option<Procedure> {
        let inner = self.inner.borrow();
        let mut index = index;
        for _ in 0..inner.redirects.len() + 1 {
            if let Some(proc) = inner.procedures.get(&index) {
                return Some(proc.clone());
            }
            match inner.redirects.get(&index) {
                Some(next) => index = *next,
                None => return None,
            }
        }
        None
    }

    fn bridge(&self, id: ResumeId) -> Option<Procedure> {
        self.inner.borrow().bridges.get(&id.0).cloned()
    }

    /// Run the procedure behind `token` with the given input values.
    fn run(
        &self,
        state: &mut DispatchState,
        program: &Program,
        token: TokenHandle,
        args: Vec<Value>,
    ) -> Result<DeadFrame, VmError> {
        let resolved = state.tokens.resolve(token).ok_or(VmError::DeadToken)?;
        let proc = self.lookup(resolved.index).ok_or(VmError::DeadToken)?;
        let env = bind(&proc.inputs, args);
        self.run_ops(state, program, proc, env)
    }

    fn run_ops(
        &self,
        state: &mut DispatchState,
        program: &Program,
        mut proc: Procedure,
        mut env: FxHashMap<VarId, Value>,
    ) -> Result<DeadFrame, VmError> {
        let mut ovf = false;
        let mut last_exc: Option<Value> = None;
        let mut i = 0usize;

        loop {
            let op = proc
                .ops
                .get(i)
                .unwrap_or_else(|| unreachable!("validated trace fell off the end"))
                .clone();
            i += 1;

            match &op.kind {
                OpKind::Label => {}
                OpKind::IntBin(b) => {
                    let a0 = resolve(&env, &op.args[0])?;
                    let a1 = resolve(&env, &op.args[1])?;
                    bind_result(&mut env, &op, eval::int_bin(*b, &a0, &a1)?);
                }
                OpKind::IntIsZero => {
                    let a0 = resolve(&env, &op.args[0])?;
                    bind_result(&mut env, &op, eval::int_is_zero(&a0)?);
                }
                OpKind::FloatAdd => {
                    let a0 = resolve(&env, &op.args[0])?;
                    let a1 = resolve(&env, &op.args[1])?;
                    bind_result(&mut env, &op, eval::float_add(&a0, &a1)?);
                }
                OpKind::IntAddOvf => {
                    let a0 = resolve(&env, &op.args[0])?;
                    let a1 = resolve(&env, &op.args[1])?;
                    match eval::int_add_ovf(&a0, &a1)? {
                        Some(v) => {
                            ovf = false;
                            bind_result(&mut env, &op, v);
                        }
                        // Result stays unbound; the overflow guard decides.
                        None => ovf = true,
                    }
                }
                OpKind::ResidualCall { host } => {
                    let host_fn = program.host_fn(*host)?.clone();
                    let vals = resolve_all(&env, &op.args)?;
                    match (host_fn.run)(&vals) {
                        Ok(v) => {
                            last_exc = None;
                            bind_result(&mut env, &op, v);
                        }
                        Err(e) => last_exc = Some(e),
                    }
                }
                OpKind::CallPortal { func } => {
                    let vals = resolve_all(&env, &op.args)?;
                    let mut nested = self.clone();
                    match interp::run_call(state, &mut nested, program, *func, &vals)? {
                        Outcome::Return(v) => {
                            last_exc = None;
                            bind_result(&mut env, &op, v);
                        }
                        Outcome::Raise(e) => last_exc = Some(e),
                    }
                }
                OpKind::CallAssembler { func, token } => {
                    let vals = resolve_all(&env, &op.args)?;
                    let outcome = self.call_assembler(state, program, *func, *token, vals)?;
                    match outcome {
                        Outcome::Return(v) => {
                            last_exc = None;
                            bind_result(&mut env, &op, v);
                        }
                        Outcome::Raise(e) => last_exc = Some(e),
                    }
                }
                OpKind::VtSync => {
                    sync_virtualizable(&env, &op.args)?;
                }
                OpKind::Guard(kind) => {
                    let ok = match kind {
                        GuardKind::True => eval::truthy(&resolve(&env, &op.args[0])?)?,
                        GuardKind::False => !eval::truthy(&resolve(&env, &op.args[0])?)?,
                        GuardKind::Value => {
                            resolve(&env, &op.args[0])? == resolve(&env, &op.args[1])?
                        }
                        GuardKind::NoOverflow => !ovf,
                        GuardKind::Overflow => ovf,
                        GuardKind::NoException => last_exc.is_none(),
                        GuardKind::Exception => last_exc.is_some(),
                        GuardKind::NotForced => match resolve(&env, &op.args[0])? {
                            Value::Ref(Some(obj)) => {
                                matches!(obj.borrow().marker(), EscapeMarker::BackendFrame(_))
                            }
                            _ => false,
                        },
                    };
                    let id = op.descr.expect("validated: guard has a descriptor");
                    if ok {
                        if *kind == GuardKind::Exception {
                            let exc = last_exc.take().expect("exception guard passed");
                            bind_result(&mut env, &op, exc);
                        }
                        continue;
                    }

                    // Failing guard: collect the descriptor's fail args.
                    let fail_args = state.descr(id).fail_args.clone();
                    let mut values = Vec::with_capacity(fail_args.len());
                    for v in &fail_args {
                        values.push(
                            env.get(v)
                                .cloned()
                                .ok_or(VmError::DeadFrameIndex(v.0 as usize))?,
                        );
                    }

                    if let Some(bridge) = self.bridge(id) {
                        // Continue in the attached bridge, still inside
                        // compiled code: no heap synchronization needed.
                        let mut vals = values;
                        if bridge.inputs.len() == vals.len() + 1 {
                            vals.push(
                                last_exc
                                    .take()
                                    .ok_or(VmError::MissingDeadFrameException)?,
                            );
                        }
                        env = bind(&bridge.inputs, vals);
                        proc = bridge;
                        i = 0;
                        ovf = false;
                        last_exc = None;
                        continue;
                    }

                    // True exit: synchronize the virtualizable before the
                    // interpreter can observe the object.
                    if let Some(vtr) = state.descr(id).vt.clone() {
                        if let Value::Ref(Some(obj)) = resolve(&env, &vtr.obj)? {
                            let fields = resolve_all(&env, &vtr.fields)?;
                            obj.borrow_mut().write_fields(&fields);
                        }
                    }
                    return Ok(DeadFrame::guard_exit(id, values, last_exc.take()));
                }
                OpKind::Jump { target } => {
                    let vals = resolve_all(&env, &op.args)?;
                    let resolved = state.tokens.resolve(*target).ok_or(VmError::DeadToken)?;
                    let next_proc = self.lookup(resolved.index).ok_or(VmError::DeadToken)?;
                    env = bind(&next_proc.inputs, vals);
                    proc = next_proc;
                    i = 0;
                    ovf = false;
                    last_exc = None;
                }
                OpKind::Finish(FinishMode::Return) => {
                    let value = resolve(&env, &op.args[0])?;
                    return Ok(DeadFrame::finish_return(value));
                }
                OpKind::Finish(FinishMode::Raise) => {
                    let exc = resolve(&env, &op.args[0])?;
                    return Ok(DeadFrame::finish_raise(exc));
                }
            }
        }
    }

    /// A call through a (possibly placeholder) procedure token. Real
    /// procedures run compiled; placeholders and dead tokens call back
    /// into the interpreter.
    fn call_assembler(
        &self,
        state: &mut DispatchState,
        program: &Program,
        func: u16,
        token: TokenHandle,
        vals: Vec<Value>,
    ) -> Result<Outcome, VmError> {
        let compiled = state.tokens.resolve(token).filter(|&t| {
            let temporary = state.tokens.info(t).map(|i| i.temporary).unwrap_or(true);
            !temporary && self.lookup(t.index).is_some()
        });
        match compiled {
            Some(t) => {
                let mut df = self.run(state, program, t, vals)?;
                match df.latest_descr() {
                    ExitDescr::Finish(FinishMode::Return) => {
                        Ok(Outcome::Return(df.value(0)?.clone()))
                    }
                    ExitDescr::Finish(FinishMode::Raise) => Ok(Outcome::Raise(
                        df.grab_exception()
                            .ok_or(VmError::MissingDeadFrameException)?,
                    )),
                    ExitDescr::Guard(id) => {
                        let mut nested = self.clone();
                        dispatch::handle_guard_failure(state, &mut nested, program, id, df)
                    }
                }
            }
            None => {
                let mut nested = self.clone();
                interp::run_call(state, &mut nested, program, func, &vals)
            }
        }
    }
}

fn bind(inputs: &[VarId], values: Vec<Value>) -> FxHashMap<VarId, Value> {
    assert_eq!(
        inputs.len(),
        values.len(),
        "procedure input arity mismatch"
    );
    inputs.iter().copied().zip(values).collect()
}

fn bind_result(env: &mut FxHashMap<VarId, Value>, op: &ember_engine::ir::IrOp, value: Value) {
    if let Some(result) = op.result {
        env.insert(result, value);
    }
}

fn resolve(env: &FxHashMap<VarId, Value>, op: &Operand) -> Result<Value, VmError> {
    match op {
        Operand::Const(c) => Ok(c.clone()),
        Operand::Var(v) => env
            .get(v)
            .cloned()
            .ok_or(VmError::DeadFrameIndex(v.0 as usize)),
    }
}

fn resolve_all(env: &FxHashMap<VarId, Value>, ops: &[Operand]) -> Result<Vec<Value>, VmError> {
    ops.iter().map(|op| resolve(env, op)).collect()
}

/// `VtSync`: write the current field values back into the object. Data
/// only; the escape marker is the dispatcher's business.
fn sync_virtualizable(env: &FxHashMap<VarId, Value>, args: &[Operand]) -> Result<(), VmError> {
    let obj = resolve(env, &args[0])?;
    if let Value::Ref(Some(obj)) = obj {
        let fields = resolve_all(env, &args[1..])?;
        obj.borrow_mut().write_fields(&fields);
    }
    Ok(())
}

impl ExecutionBackend for EvalBackend {
    fn compile_loop(
        &mut self,
        _state: &mut DispatchState,
        _program: &Program,
        token: TokenHandle,
        trace: &Trace,
    ) -> Result<(), CompileError> {
        let mut inner = self.inner.borrow_mut();
        if inner.reject_loops > 0 {
            inner.reject_loops -= 1;
            return Err(CompileError::InvalidLoop);
        }
        if let Err(err) = validate_trace(trace) {
            tracing::warn!(error = %err, "rejecting malformed loop trace");
            return Err(CompileError::Unreachable);
        }
        inner
            .procedures
            .insert(token.index, Procedure::from_trace(trace));
        Ok(())
    }

    fn compile_retrace(
        &mut self,
        _state: &mut DispatchState,
        _program: &Program,
        token: TokenHandle,
        trace: &Trace,
        _preamble: TokenHandle,
    ) -> Result<(), CompileError> {
        let mut inner = self.inner.borrow_mut();
        if inner.reject_retraces > 0 {
            inner.reject_retraces -= 1;
            return Err(CompileError::InvalidLoop);
        }
        if let Err(err) = validate_trace(trace) {
            tracing::warn!(error = %err, "rejecting malformed retraced loop");
            return Err(CompileError::Unreachable);
        }
        inner
            .procedures
            .insert(token.index, Procedure::from_trace(trace));
        Ok(())
    }

    fn compile_bridge(
        &mut self,
        _state: &mut DispatchState,
        _program: &Program,
        descr: ResumeId,
        trace: &Trace,
        _original: Option<TokenHandle>,
    ) -> Result<(), CompileError> {
        let mut inner = self.inner.borrow_mut();
        if inner.reject_bridges > 0 {
            inner.reject_bridges -= 1;
            return Err(CompileError::InvalidLoop);
        }
        if let Err(err) = validate_trace(trace) {
            tracing::warn!(error = %err, "rejecting malformed bridge trace");
            return Err(CompileError::Unreachable);
        }
        inner
            .bridges
            .insert(descr.0, Procedure::from_trace(trace));
        Ok(())
    }

    fn execute(
        &mut self,
        state: &mut DispatchState,
        program: &Program,
        token: TokenHandle,
        args: Vec<Value>,
    ) -> Result<DeadFrame, VmError> {
        self.run(state, program, token, args)
    }

    fn redirect(&mut self, old: TokenHandle, new: TokenHandle) {
        self.inner
            .borrow_mut()
            .redirects
            .insert(old.index, new.index);
    }

    fn free(&mut self, token: TokenHandle) {
        let mut inner = self.inner.borrow_mut();
        inner.procedures.remove(&token.index);
    }
}
