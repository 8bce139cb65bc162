//! The slow-path portal interpreter.
//!
//! This single loop serves three roles: it is the embedding's normal
//! execution engine, the fallback that finishes reconstructed frame stacks
//! after aborts and guard failures, and the concrete executor for residual
//! portal calls made while the recorder is tracing. At every `LoopHead` it
//! re-enters the warm-up state machine.

use crate::backend::ExecutionBackend;
use crate::bytecode::{Insn, Program, decode};
use crate::dispatch::{self, EnterResult};
use crate::errors::VmError;
use crate::eval;
use crate::state::DispatchState;
use crate::value::{Outcome, Value};

/// One interpreter call frame. A frame suspended in a call keeps its pc at
/// the call instruction; return delivery re-decodes it to find the
/// destination register.
#[derive(Debug, Clone)]
pub struct Frame {
    pub func: u16,
    pub pc: usize,
    pub regs: Vec<Value>,
}

impl Frame {
    /// Fresh frame for `func` with `args` in the leading registers and
    /// every other register zeroed.
    pub fn enter(program: &Program, func: u16, args: &[Value]) -> Result<Self, VmError> {
        let f = program.function(func)?;
        if args.len() > f.num_regs as usize {
            return Err(VmError::RegisterOutOfRange(f.num_regs));
        }
        let mut regs = vec![Value::Int(0); f.num_regs as usize];
        regs[..args.len()].clone_from_slice(args);
        Ok(Self { func, pc: 0, regs })
    }

    pub fn reg(&self, r: u8) -> Result<&Value, VmError> {
        self.regs
            .get(r as usize)
            .ok_or(VmError::RegisterOutOfRange(r))
    }

    pub fn set_reg(&mut self, r: u8, value: Value) -> Result<(), VmError> {
        match self.regs.get_mut(r as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::RegisterOutOfRange(r)),
        }
    }
}

/// Run one portal call to completion.
pub fn run_call(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    func: u16,
    args: &[Value],
) -> Result<Outcome, VmError> {
    let frame = Frame::enter(program, func, args)?;
    run_frames(state, backend, program, vec![frame], None)
}

/// Drive a frame stack until the bottom frame finishes. `pending_exc`
/// starts exception delivery immediately, as when resuming from a failed
/// no-exception guard.
pub fn run_frames(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    mut frames: Vec<Frame>,
    pending_exc: Option<Value>,
) -> Result<Outcome, VmError> {
    let mut pending: Option<Value> = pending_exc;

    'dispatch: loop {
        // Exception delivery: find a handler covering the current pc,
        // popping frames as needed.
        if let Some(exc) = pending.take() {
            loop {
                let Some(frame) = frames.last_mut() else {
                    return Ok(Outcome::Raise(exc));
                };
                let function = program.function(frame.func)?;
                if let Some(h) = function.find_handler(frame.pc) {
                    let (target, exc_reg) = (h.target, h.exc_reg);
                    frame.set_reg(exc_reg, exc)?;
                    frame.pc = target as usize;
                    continue 'dispatch;
                }
                // No handler here: propagate to the caller, whose pc sits
                // at its call instruction.
                frames.pop();
            }
        }

        let Some(frame) = frames.last_mut() else {
            unreachable!("frame stack emptied without an outcome");
        };
        let function = program.function(frame.func)?;
        let (insn, next) = decode(&function.code, frame.pc)?;

        match insn {
            Insn::LoadConst { dst, cidx } => {
                let value = function.constant(cidx)?.clone();
                frame.set_reg(dst, value)?;
                frame.pc = next;
            }
            Insn::Mov { dst, src } => {
                let value = frame.reg(src)?.clone();
                frame.set_reg(dst, value)?;
                frame.pc = next;
            }
            Insn::IntBin { op, dst, a, b } => {
                let value = eval::int_bin(op, frame.reg(a)?, frame.reg(b)?)?;
                frame.set_reg(dst, value)?;
                frame.pc = next;
            }
            Insn::IntAddOvf { dst, a, b, on_ovf } => {
                match eval::int_add_ovf(frame.reg(a)?, frame.reg(b)?)? {
                    Some(value) => {
                        frame.set_reg(dst, value)?;
                        frame.pc = next;
                    }
                    None => frame.pc = on_ovf as usize,
                }
            }
            Insn::IntIsZero { dst, src } => {
                let value = eval::int_is_zero(frame.reg(src)?)?;
                frame.set_reg(dst, value)?;
                frame.pc = next;
            }
            Insn::FloatAdd { dst, a, b } => {
                let value = eval::float_add(frame.reg(a)?, frame.reg(b)?)?;
                frame.set_reg(dst, value)?;
                frame.pc = next;
            }
            Insn::Jump { target } => frame.pc = target as usize,
            Insn::JumpIf { cond, target, when } => {
                if eval::truthy(frame.reg(cond)?)? == when {
                    frame.pc = target as usize;
                } else {
                    frame.pc = next;
                }
            }
            Insn::LoopHead { head } => {
                frame.pc = next;
                let func = frame.func;
                match dispatch::maybe_compile_and_run(state, backend, program, func, head, frame)?
                {
                    EnterResult::NotEntered => {}
                    EnterResult::Finished(outcome) => {
                        // Compiled code (or the trace that was just
                        // recorded) completed this whole frame.
                        frames.pop();
                        match outcome {
                            Outcome::Return(value) => {
                                match deliver_return(program, &mut frames, value)? {
                                    Some(done) => return Ok(done),
                                    None => {}
                                }
                            }
                            Outcome::Raise(exc) => pending = Some(exc),
                        }
                    }
                }
            }
            Insn::Return { src } => {
                let value = frame.reg(src)?.clone();
                frames.pop();
                match deliver_return(program, &mut frames, value)? {
                    Some(done) => return Ok(done),
                    None => {}
                }
            }
            Insn::Promote { .. } => frame.pc = next,
            Insn::Call { func, args, .. } => {
                let arg_values: Vec<Value> = args
                    .iter()
                    .map(|&r| frame.reg(r).cloned())
                    .collect::<Result<_, _>>()?;
                // Leave pc at the call; return delivery advances it.
                let callee = Frame::enter(program, func, &arg_values)?;
                frames.push(callee);
            }
            Insn::ResidualCall { dst, host, args } => {
                let arg_values: Vec<Value> = args
                    .iter()
                    .map(|&r| frame.reg(r).cloned())
                    .collect::<Result<_, _>>()?;
                let host_fn = program.host_fn(host)?;
                match (host_fn.run)(&arg_values) {
                    Ok(value) => {
                        frame.set_reg(dst, value)?;
                        frame.pc = next;
                    }
                    // pc stays at the call for handler lookup.
                    Err(exc) => pending = Some(exc),
                }
            }
            Insn::Raise { src } => {
                let exc = frame.reg(src)?.clone();
                pending = Some(exc);
            }
            Insn::VtGet { dst, field } => {
                let value = {
                    let obj = vt_object(frame, program)?;
                    let obj = obj.borrow();
                    let slot = obj.scalar_slot(field)?;
                    obj.scalars[slot].clone()
                };
                frame.set_reg(dst, value)?;
                frame.pc = next;
            }
            Insn::VtSet { field, src } => {
                let value = frame.reg(src)?.clone();
                let obj = vt_object(frame, program)?;
                {
                    let mut obj = obj.borrow_mut();
                    let slot = obj.scalar_slot(field)?;
                    debug_assert!(slot < obj.scalars.len());
                    obj.scalars[slot] = value;
                }
                frame.pc = next;
            }
            Insn::VtArrGet { dst, field, index } => {
                let idx = frame.reg(index)?.as_int().ok_or(VmError::TypeMismatch {
                    expected: "int",
                    got: frame.reg(index)?.kind_name(),
                })?;
                let value = {
                    let obj = vt_object(frame, program)?;
                    let obj = obj.borrow();
                    obj.array_slot(field, idx)?;
                    obj.arrays[field as usize][idx as usize].clone()
                };
                frame.set_reg(dst, value)?;
                frame.pc = next;
            }
            Insn::VtArrSet { field, index, src } => {
                let idx = frame.reg(index)?.as_int().ok_or(VmError::TypeMismatch {
                    expected: "int",
                    got: frame.reg(index)?.kind_name(),
                })?;
                let value = frame.reg(src)?.clone();
                let obj = vt_object(frame, program)?;
                {
                    let mut obj = obj.borrow_mut();
                    obj.array_slot(field, idx)?;
                    obj.arrays[field as usize][idx as usize] = value;
                }
                frame.pc = next;
            }
        }
    }
}

/// Pop-side of a finished frame: write the value into the caller's call
/// destination and advance past the call, or report the final outcome.
fn deliver_return(
    program: &Program,
    frames: &mut Vec<Frame>,
    value: Value,
) -> Result<Option<Outcome>, VmError> {
    let Some(caller) = frames.last_mut() else {
        return Ok(Some(Outcome::Return(value)));
    };
    let function = program.function(caller.func)?;
    let (insn, next) = decode(&function.code, caller.pc)?;
    match insn {
        Insn::Call { dst, .. } => {
            caller.set_reg(dst, value)?;
            caller.pc = next;
            Ok(None)
        }
        other => unreachable!("suspended frame not at a call: {other:?}"),
    }
}

/// The current frame's declared virtualizable object.
fn vt_object(
    frame: &Frame,
    program: &Program,
) -> Result<crate::value::ObjRef, VmError> {
    let function = program.function(frame.func)?;
    let decl = function
        .virtualizable
        .ok_or(VmError::NoVirtualizable(frame.func))?;
    match frame.reg(decl.reg)? {
        Value::Ref(Some(obj)) => Ok(obj.clone()),
        other => Err(VmError::TypeMismatch {
            expected: "ref",
            got: other.kind_name(),
        }),
    }
}
