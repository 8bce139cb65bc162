//! The trace-recording interpreter.
//!
//! Executes portal instructions concretely, exactly like the slow
//! interpreter, while appending one IR operation per non-constant-folded
//! primitive to the current trace and materializing a guard at every point
//! where compiled code must later re-validate an assumption.
//!
//! Every register of a recording frame carries a pair: the concrete value
//! (what the program actually computes right now) and the operand (how
//! compiled code will recompute it). An all-constant operation folds: it
//! produces a constant operand and appends nothing.
//!
//! Aborts travel as `Err(TraceError::Abort(_))` and are caught at the
//! public entry points, which convert them into
//! [`TraceResult::Aborted`] carrying the concrete frame state so the
//! fallback interpreter can finish what the recorder started. Every
//! mutation the recorder makes (register writes, virtualizable syncs,
//! residual-call side effects) is completed before an abort is raised, so
//! nothing is ever half-updated.

use smallvec::{SmallVec, smallvec};

use crate::backend::{DeadFrame, ExecutionBackend};
use crate::bytecode::{Insn, Program, decode};
use crate::cell::{CELL_TEMPORARY, CellKey, DispatchCell};
use crate::counter::spec_hash;
use crate::errors::{AbortReason, TraceError, VmError};
use crate::eval;
use crate::interp::{self, Frame};
use crate::ir::{GuardKind, Operand, OpKind, Trace, TraceVt, VarId};
use crate::resume::{ResumeDescr, ResumeId, VtResume};
use crate::state::DispatchState;
use crate::tokens::TokenHandle;
use crate::value::{ObjRef, Outcome, Value};
use crate::virtualizable::VtLayout;

/// A recorded register: concrete value plus the operand that recomputes it.
#[derive(Debug, Clone)]
pub struct RVal {
    pub val: Value,
    pub op: Operand,
}

impl RVal {
    fn constant(val: Value) -> Self {
        Self {
            op: Operand::Const(val.clone()),
            val,
        }
    }

    fn is_const(&self) -> bool {
        self.op.is_const()
    }
}

#[derive(Debug)]
struct RecFrame {
    func: u16,
    pc: usize,
    regs: Vec<RVal>,
}

impl RecFrame {
    fn reg(&self, r: u8) -> Result<&RVal, VmError> {
        self.regs
            .get(r as usize)
            .ok_or(VmError::RegisterOutOfRange(r))
    }

    fn set_reg(&mut self, r: u8, value: RVal) -> Result<(), VmError> {
        match self.regs.get_mut(r as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::RegisterOutOfRange(r)),
        }
    }
}

/// Unboxed virtualizable state while recording.
#[derive(Debug)]
struct VtState {
    obj: ObjRef,
    obj_op: Operand,
    fields: Vec<RVal>,
    layout: VtLayout,
}

/// What a completed recording session produced.
#[derive(Debug)]
pub enum TraceResult {
    /// The trace revisited its own loop head with equal greens. `back_args`
    /// are the next-iteration operands (input order), `live` the concrete
    /// red values for entering the loop right after it compiles, and
    /// `frames` the concrete state for the fallback if compilation fails.
    ClosedLoop {
        trace: Trace,
        back_args: Vec<Operand>,
        live: Vec<Value>,
        frames: Vec<Frame>,
    },
    /// Bridge recording reached a loop head that already has a live
    /// compiled procedure.
    ReachedLoop {
        trace: Trace,
        key: CellKey,
        target: TokenHandle,
        back_args: Vec<Operand>,
        live: Vec<Value>,
        frames: Vec<Frame>,
    },
    /// The bottom frame finished; the trace exits through a `Finish`.
    /// `outcome` is what concretely happened while recording.
    Finished { trace: Trace, outcome: Outcome },
    /// Recording gave up. The trace is discarded; `resume` says how the
    /// concretely-executed work continues.
    Aborted {
        reason: AbortReason,
        resume: AbortResume,
    },
}

/// Where execution stands when a trace aborts.
#[derive(Debug)]
pub enum AbortResume {
    /// Hand these frames to the fallback interpreter.
    Frames(Vec<Frame>),
    /// The recorder already ran the frame to completion; nothing left to
    /// execute, only the trace is thrown away.
    Finished(Outcome),
}

enum Mode {
    /// Tracing a loop from its header; close when the origin key recurs.
    Loop,
    /// Tracing from a failed guard; close at any live compiled label.
    Bridge,
}

pub(crate) struct Recorder<'p> {
    program: &'p Program,
    mode: Mode,
    origin: CellKey,
    trace: Trace,
    frames: Vec<RecFrame>,
    vt: Option<VtState>,
}

/// Record a loop trace starting at `origin`'s header, seeded from the live
/// interpreter frame sitting at that header.
pub(crate) fn trace_loop(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    origin: CellKey,
    seed: &Frame,
) -> Result<TraceResult, VmError> {
    let function = program.function(origin.func)?;
    let head = function.loop_head(origin.head)?.clone();
    let head_pc = head.pc as usize;
    let (_, body_pc) = decode(&function.code, head_pc)?;

    let mut trace = Trace::new();
    trace.spec_key = Some(origin.greens.clone());

    let mut regs = Vec::with_capacity(function.num_regs as usize);
    for r in 0..function.num_regs {
        let val = seed.reg(r)?.clone();
        if head.reds.contains(&r) {
            let var = trace.new_input();
            regs.push(RVal {
                val,
                op: Operand::Var(var),
            });
        } else {
            // Greens and undeclared (dead-at-header) registers enter the
            // trace as constants.
            regs.push(RVal::constant(val));
        }
    }

    let mut recorder = Recorder {
        program,
        mode: Mode::Loop,
        origin,
        trace,
        frames: vec![RecFrame {
            func: seed.func,
            pc: body_pc,
            regs,
        }],
        vt: None,
    };
    recorder.init_vt(seed.func)?;

    finish_session(recorder.run(state, backend), &mut recorder)
}

/// Record a bridge trace from a failed guard, reconstructing the recording
/// frames from the guard's snapshot and the deadframe values.
pub(crate) fn trace_bridge(
    state: &mut DispatchState,
    backend: &mut dyn ExecutionBackend,
    program: &Program,
    descr_id: ResumeId,
    deadframe: &DeadFrame,
) -> Result<TraceResult, VmError> {
    let descr = state.descr(descr_id).clone();
    let mut trace = Trace::new();

    // One fresh input per reported fail arg, in deadframe order.
    let mut map: rustc_hash::FxHashMap<VarId, VarId> = rustc_hash::FxHashMap::default();
    for &var in &descr.fail_args {
        let input = trace.new_input();
        map.insert(var, input);
    }
    let resolve = |op: &Operand, df: &DeadFrame, descr: &ResumeDescr| -> Result<RVal, VmError> {
        match op {
            Operand::Const(c) => Ok(RVal::constant(c.clone())),
            Operand::Var(v) => {
                let idx = descr
                    .fail_arg_index(*v)
                    .ok_or(VmError::DeadFrameIndex(v.0 as usize))?;
                Ok(RVal {
                    val: df.value(idx)?.clone(),
                    op: Operand::Var(map[v]),
                })
            }
        }
    };

    // Rebuild the frame stack, outermost first.
    let mut chain = Vec::new();
    let mut node = Some(descr.snapshot.clone());
    while let Some(n) = node {
        node = n.parent.clone();
        chain.push(n);
    }
    let mut frames = Vec::with_capacity(chain.len());
    for n in chain.iter().rev() {
        let mut regs = Vec::with_capacity(n.regs.len());
        for op in &n.regs {
            regs.push(resolve(op, deadframe, &descr)?);
        }
        frames.push(RecFrame {
            func: n.func,
            pc: n.pc,
            regs,
        });
    }

    // Virtualizable state at the guard point.
    let vt = match &descr.vt {
        None => None,
        Some(vtr) => {
            let obj_rv = resolve(&vtr.obj, deadframe, &descr)?;
            let obj = match &obj_rv.val {
                Value::Ref(Some(o)) => o.clone(),
                other => {
                    return Err(VmError::TypeMismatch {
                        expected: "ref",
                        got: other.kind_name(),
                    });
                }
            };
            let mut fields = Vec::with_capacity(vtr.fields.len());
            for op in &vtr.fields {
                fields.push(resolve(op, deadframe, &descr)?);
            }
            let layout = {
                let o = obj.borrow();
                VtLayout {
                    scalars: o.scalars.len(),
                    arrays: o.arrays.len(),
                }
            };
            Some(VtState {
                obj_op: obj_rv.op,
                obj,
                fields,
                layout,
            })
        }
    };
    // Informational metadata; a promoted (constant) object operand just
    // leaves it unset.
    if let Some(vt) = &vt {
        let obj = vt.obj_op.as_var();
        let fields: Option<Vec<VarId>> = vt.fields.iter().map(|f| f.op.as_var()).collect();
        if let (Some(obj), Some(fields)) = (obj, fields) {
            trace.vt = Some(TraceVt { obj, fields });
        }
    }

    let mut recorder = Recorder {
        program,
        mode: Mode::Bridge,
        origin: CellKey {
            func: 0,
            head: 0,
            greens: vec![],
        },
        trace,
        frames,
        vt,
    };

    // A failed no-exception guard resumes mid-raise: the exception value
    // becomes an extra bridge input and delivery happens first.
    let result = match descr.guard {
        GuardKind::NoException => {
            let exc_val = deadframe
                .exception()
                .cloned()
                .ok_or(VmError::MissingDeadFrameException)?;
            let exc_var = recorder.trace.new_input();
            let exc = RVal {
                val: exc_val,
                op: Operand::Var(exc_var),
            };
            match recorder.deliver_exception(exc) {
                Ok(Some(done)) => Ok(done),
                Ok(None) => recorder.run(state, backend),
                Err(e) => Err(e),
            }
        }
        _ => recorder.run(state, backend),
    };
    finish_session(result, &mut recorder)
}

/// Convert an abort into a fallback-ready result; pass everything else
/// through. Concrete virtualizable state is synchronized on every exit
/// path before anyone else can look at the object.
fn finish_session(
    result: Result<TraceResult, TraceError>,
    recorder: &mut Recorder<'_>,
) -> Result<TraceResult, VmError> {
    recorder.sync_vt_concrete();
    match result {
        Ok(done) => Ok(done),
        Err(TraceError::Abort(reason)) => {
            tracing::debug!(reason = %reason, "trace aborted");
            Ok(TraceResult::Aborted {
                reason,
                resume: AbortResume::Frames(recorder.concrete_frames()),
            })
        }
        Err(TraceError::Vm(e)) => Err(e),
    }
}

impl<'p> Recorder<'p> {
    /// Unbox the virtualizable declared by the trace's bottom function, if
    /// any. Read once per trace; the unboxed values are authoritative
    /// until synchronized back.
    fn init_vt(&mut self, func: u16) -> Result<(), VmError> {
        let function = self.program.function(func)?;
        let Some(decl) = function.virtualizable else {
            return Ok(());
        };
        let frame = &self.frames[0];
        let rv = frame.reg(decl.reg)?.clone();
        let obj = match &rv.val {
            Value::Ref(Some(o)) => o.clone(),
            other => {
                return Err(VmError::TypeMismatch {
                    expected: "ref",
                    got: other.kind_name(),
                });
            }
        };
        if !obj.borrow().matches_layout(&decl.layout) {
            return Err(VmError::VtShapeMismatch);
        }
        let flat = obj.borrow().read_fields();
        let mut fields = Vec::with_capacity(flat.len());
        let mut field_vars = Vec::with_capacity(flat.len());
        for val in flat {
            let var = self.trace.new_input();
            field_vars.push(var);
            fields.push(RVal {
                val,
                op: Operand::Var(var),
            });
        }
        // The declared register must be a red of the traced head, so its
        // operand is an input variable.
        let obj_var = match rv.op.as_var() {
            Some(v) => v,
            None => return Err(VmError::VtShapeMismatch),
        };
        self.trace.vt = Some(TraceVt {
            obj: obj_var,
            fields: field_vars,
        });
        self.vt = Some(VtState {
            obj,
            obj_op: rv.op,
            fields,
            layout: decl.layout,
        });
        Ok(())
    }

    /// Write the current concrete field values back into the heap object.
    fn sync_vt_concrete(&self) {
        if let Some(vt) = &self.vt {
            let values: Vec<Value> = vt.fields.iter().map(|f| f.val.clone()).collect();
            vt.obj.borrow_mut().write_fields(&values);
        }
    }

    fn concrete_frames(&self) -> Vec<Frame> {
        self.frames
            .iter()
            .map(|fr| Frame {
                func: fr.func,
                pc: fr.pc,
                regs: fr.regs.iter().map(|r| r.val.clone()).collect(),
            })
            .collect()
    }

    fn top(&mut self) -> &mut RecFrame {
        self.frames.last_mut().expect("recording frame stack empty")
    }

    /// Main fetch-decode-record loop.
    fn run(
        &mut self,
        state: &mut DispatchState,
        backend: &mut dyn ExecutionBackend,
    ) -> Result<TraceResult, TraceError> {
        loop {
            if self.trace.op_count() > state.config.trace_limit {
                return Err(TraceError::Abort(AbortReason::TraceTooLong));
            }

            let frame = self.frames.last().expect("recording frame stack empty");
            let func_id = frame.func;
            let pc = frame.pc;
            let function = self.program.function(func_id)?;
            let (insn, next) = decode(&function.code, pc)?;

            match insn {
                Insn::LoadConst { dst, cidx } => {
                    let value = function.constant(cidx)?.clone();
                    let frame = self.top();
                    frame.set_reg(dst, RVal::constant(value))?;
                    frame.pc = next;
                }
                Insn::Mov { dst, src } => {
                    let frame = self.top();
                    let value = frame.reg(src)?.clone();
                    frame.set_reg(dst, value)?;
                    frame.pc = next;
                }
                Insn::IntBin { op, dst, a, b } => {
                    let frame = self.top();
                    let (ra, rb) = (frame.reg(a)?.clone(), frame.reg(b)?.clone());
                    let val = eval::int_bin(op, &ra.val, &rb.val)?;
                    let rv = self.execute_pure(OpKind::IntBin(op), &[ra, rb], val);
                    let frame = self.top();
                    frame.set_reg(dst, rv)?;
                    frame.pc = next;
                }
                Insn::IntIsZero { dst, src } => {
                    let frame = self.top();
                    let rs = frame.reg(src)?.clone();
                    let val = eval::int_is_zero(&rs.val)?;
                    let rv = self.execute_pure(OpKind::IntIsZero, &[rs], val);
                    let frame = self.top();
                    frame.set_reg(dst, rv)?;
                    frame.pc = next;
                }
                Insn::FloatAdd { dst, a, b } => {
                    let frame = self.top();
                    let (ra, rb) = (frame.reg(a)?.clone(), frame.reg(b)?.clone());
                    let val = eval::float_add(&ra.val, &rb.val)?;
                    let rv = self.execute_pure(OpKind::FloatAdd, &[ra, rb], val);
                    let frame = self.top();
                    frame.set_reg(dst, rv)?;
                    frame.pc = next;
                }
                Insn::IntAddOvf { dst, a, b, on_ovf } => {
                    self.record_add_ovf(state, dst, a, b, on_ovf as usize, next)?;
                }
                Insn::Jump { target } => self.top().pc = target as usize,
                Insn::JumpIf { cond, target, when } => {
                    self.record_branch(state, cond, target as usize, when, next)?;
                }
                Insn::Promote { src } => {
                    let rv = self.top().reg(src)?.clone();
                    if !rv.is_const() {
                        self.generate_guard(
                            state,
                            GuardKind::Value,
                            smallvec![rv.op.clone(), Operand::Const(rv.val.clone())],
                            next,
                            None,
                            false,
                        )?;
                        self.top().set_reg(src, RVal::constant(rv.val))?;
                    }
                    self.top().pc = next;
                }
                Insn::LoopHead { head } => {
                    if let Some(done) = self.record_loop_head(state, head, next)? {
                        return Ok(done);
                    }
                }
                Insn::Return { src } => {
                    let value = self.top().reg(src)?.clone();
                    self.frames.pop();
                    if let Some(done) = self.deliver_return(value)? {
                        return Ok(done);
                    }
                }
                Insn::Raise { src } => {
                    let exc = self.top().reg(src)?.clone();
                    if let Some(done) = self.deliver_exception(exc)? {
                        return Ok(done);
                    }
                }
                Insn::Call { func, args, .. } => {
                    if let Some(done) = self.record_call(state, backend, func, &args, next)? {
                        return Ok(done);
                    }
                }
                Insn::ResidualCall { dst, host, args } => {
                    if let Some(done) = self.record_residual_host(state, dst, host, &args, next)? {
                        return Ok(done);
                    }
                }
                Insn::VtGet { dst, field } => {
                    let value = self.vt_field(field)?.clone();
                    let frame = self.top();
                    frame.set_reg(dst, value)?;
                    frame.pc = next;
                }
                Insn::VtSet { field, src } => {
                    let value = self.top().reg(src)?.clone();
                    *self.vt_field_mut(field)? = value;
                    self.top().pc = next;
                }
                Insn::VtArrGet { dst, field, index } => {
                    // A failing index promotion re-executes this access.
                    let slot = self.vt_array_slot(state, field, index, pc)?;
                    let vt = self.vt.as_ref().expect("vt checked by vt_array_slot");
                    let value = vt.fields[slot].clone();
                    let frame = self.top();
                    frame.set_reg(dst, value)?;
                    frame.pc = next;
                }
                Insn::VtArrSet { field, index, src } => {
                    let value = self.top().reg(src)?.clone();
                    let slot = self.vt_array_slot(state, field, index, pc)?;
                    let vt = self.vt.as_mut().expect("vt checked by vt_array_slot");
                    vt.fields[slot] = value;
                    self.top().pc = next;
                }
            }
        }
    }

    /// Record a pure operation, folding it when every operand is constant.
    fn execute_pure(&mut self, kind: OpKind, args: &[RVal], val: Value) -> RVal {
        if args.iter().all(RVal::is_const) {
            return RVal::constant(val);
        }
        let var = self
            .trace
            .record(kind, args.iter().map(|a| a.op.clone()));
        RVal {
            val,
            op: Operand::Var(var),
        }
    }

    fn record_add_ovf(
        &mut self,
        state: &mut DispatchState,
        dst: u8,
        a: u8,
        b: u8,
        on_ovf: usize,
        next: usize,
    ) -> Result<(), TraceError> {
        let frame = self.top();
        let (ra, rb) = (frame.reg(a)?.clone(), frame.reg(b)?.clone());
        let folded = eval::int_add_ovf(&ra.val, &rb.val)?;

        if ra.is_const() && rb.is_const() {
            match folded {
                Some(val) => {
                    let frame = self.top();
                    frame.set_reg(dst, RVal::constant(val))?;
                    frame.pc = next;
                }
                None => self.top().pc = on_ovf,
            }
            return Ok(());
        }

        let result = self
            .trace
            .record(OpKind::IntAddOvf, [ra.op.clone(), rb.op.clone()]);
        match folded {
            Some(val) => {
                // Failure means overflow: resume on the overflow path,
                // before the destination is written.
                self.generate_guard(
                    state,
                    GuardKind::NoOverflow,
                    smallvec![],
                    on_ovf,
                    None,
                    false,
                )?;
                let frame = self.top();
                frame.set_reg(
                    dst,
                    RVal {
                        val,
                        op: Operand::Var(result),
                    },
                )?;
                frame.pc = next;
            }
            None => {
                // Failure means no overflow: resume after the add with the
                // destination holding the add's result.
                self.generate_guard(
                    state,
                    GuardKind::Overflow,
                    smallvec![],
                    next,
                    Some((dst, Operand::Var(result))),
                    false,
                )?;
                self.top().pc = on_ovf;
            }
        }
        Ok(())
    }

    fn record_branch(
        &mut self,
        state: &mut DispatchState,
        cond: u8,
        target: usize,
        when: bool,
        next: usize,
    ) -> Result<(), TraceError> {
        let rv = self.top().reg(cond)?.clone();
        let cond_true = eval::truthy(&rv.val)?;
        let path = |c: bool| if c == when { target } else { next };

        if !rv.is_const() {
            let kind = if cond_true {
                GuardKind::True
            } else {
                GuardKind::False
            };
            // Failure takes the branch the recording did not take.
            self.generate_guard(
                state,
                kind,
                smallvec![rv.op.clone()],
                path(!cond_true),
                None,
                false,
            )?;
            self.top()
                .set_reg(cond, RVal::constant(Value::Int(cond_true as i64)))?;
        }
        self.top().pc = path(cond_true);
        Ok(())
    }

    /// Append a guard and allocate its resume descriptor. No-op when the
    /// checked operand is already constant — callers skip recording in
    /// that case, so reaching here with only-constant args is the
    /// unconditional-guard case (overflow/exception guards).
    ///
    /// `reg_override` adjusts the top frame's snapshot for results that
    /// exist only on the failing path. Returns the guard's bound variable
    /// when `with_result` is set.
    fn generate_guard(
        &mut self,
        state: &mut DispatchState,
        kind: GuardKind,
        args: SmallVec<[Operand; 3]>,
        resume_pc: usize,
        reg_override: Option<(u8, Operand)>,
        with_result: bool,
    ) -> Result<Option<VarId>, TraceError> {
        let snapshot = {
            let mut parent = None;
            let last = self.frames.len() - 1;
            for (i, fr) in self.frames.iter().enumerate() {
                let pc = if i == last { resume_pc } else { fr.pc };
                let mut regs: Vec<Operand> = fr.regs.iter().map(|r| r.op.clone()).collect();
                if i == last {
                    if let Some((r, op)) = &reg_override {
                        regs[*r as usize] = op.clone();
                    }
                }
                parent = Some(state.snapshots.intern(fr.func, pc, regs, parent));
            }
            parent.expect("at least one recording frame")
        };

        // Distinct variables the deadframe must report: everything the
        // snapshot references, the virtualizable state, and the guarded
        // operands themselves.
        let mut fail_args: Vec<VarId> = Vec::new();
        let mut push_var = |fail_args: &mut Vec<VarId>, op: &Operand| {
            if let Operand::Var(v) = op {
                if !fail_args.contains(v) {
                    fail_args.push(*v);
                }
            }
        };
        {
            let mut node = Some(&snapshot);
            while let Some(n) = node {
                for op in &n.regs {
                    push_var(&mut fail_args, op);
                }
                node = n.parent.as_ref();
            }
        }
        let vt = self.vt.as_ref().map(|vt| VtResume {
            obj: vt.obj_op.clone(),
            fields: vt.fields.iter().map(|f| f.op.clone()).collect(),
        });
        if let Some(vtr) = &vt {
            push_var(&mut fail_args, &vtr.obj);
            for op in &vtr.fields {
                push_var(&mut fail_args, op);
            }
        }
        for op in &args {
            push_var(&mut fail_args, op);
        }

        let mut descr = ResumeDescr::new(kind, snapshot, fail_args);
        descr.vt = vt;
        if kind == GuardKind::Value {
            descr.promoted_index = args
                .first()
                .and_then(Operand::as_var)
                .and_then(|v| descr.fail_arg_index(v));
        }
        let id = state.alloc_descr(descr);
        Ok(self.trace.record_guard(kind, args, id, with_result))
    }

    fn record_loop_head(
        &mut self,
        state: &mut DispatchState,
        head: u16,
        next: usize,
    ) -> Result<Option<TraceResult>, TraceError> {
        let frame = self.frames.last().expect("recording frame stack empty");
        let func_id = frame.func;
        let function = self.program.function(func_id)?;
        let info = function.loop_head(head)?.clone();
        let greens: Vec<Value> = info
            .greens
            .iter()
            .map(|&r| frame.reg(r).map(|rv| rv.val.clone()))
            .collect::<Result<_, _>>()?;
        let key = CellKey {
            func: func_id,
            head,
            greens,
        };

        let at_bottom = self.frames.len() == 1;
        match self.mode {
            Mode::Loop => {
                if at_bottom && key == self.origin {
                    let (back_args, live) = self.loop_args(&info)?;
                    return Ok(Some(TraceResult::ClosedLoop {
                        trace: std::mem::take(&mut self.trace),
                        back_args,
                        live,
                        frames: self.concrete_frames(),
                    }));
                }
            }
            Mode::Bridge => {
                if at_bottom {
                    let hash = spec_hash(key.func, key.head, &key.greens);
                    let token = state
                        .counter
                        .find_cell(hash, &key)
                        .and_then(|idx| {
                            let cell = state.counter.cell(hash, idx);
                            if cell.has_flag(CELL_TEMPORARY) {
                                None
                            } else {
                                cell.procedure_token(&state.tokens)
                            }
                        });
                    if let Some(target) = token {
                        let (back_args, live) = self.loop_args(&info)?;
                        return Ok(Some(TraceResult::ReachedLoop {
                            trace: std::mem::take(&mut self.trace),
                            key,
                            target,
                            back_args,
                            live,
                            frames: self.concrete_frames(),
                        }));
                    }
                    // No compiled procedure to close against: give up and
                    // let this header warm up through the normal path.
                    return Err(TraceError::Abort(AbortReason::BadLoop));
                }
            }
        }
        // Inner loop head (or a different key): record straight through.
        self.top().pc = next;
        Ok(None)
    }

    /// Back-edge arguments for a loop head: the operands of the head's
    /// reds followed by the virtualizable fields (these are the loop's
    /// inputs, in order), plus the concrete red values alone — re-entry
    /// re-reads the virtualizable fields from the synchronized object.
    fn loop_args(
        &mut self,
        info: &crate::bytecode::LoopHeadInfo,
    ) -> Result<(Vec<Operand>, Vec<Value>), VmError> {
        let frame = self.frames.last().expect("recording frame stack empty");
        let mut back_args = Vec::new();
        let mut live = Vec::new();
        for &r in &info.reds {
            let rv = frame.reg(r)?;
            back_args.push(rv.op.clone());
            live.push(rv.val.clone());
        }
        if let Some(vt) = &self.vt {
            for f in &vt.fields {
                back_args.push(f.op.clone());
            }
        }
        Ok((back_args, live))
    }

    fn deliver_return(&mut self, value: RVal) -> Result<Option<TraceResult>, TraceError> {
        let Some(caller) = self.frames.last_mut() else {
            // Bottom frame finished: the trace exits through a finish.
            self.emit_vt_sync();
            self.trace
                .record_effect(OpKind::Finish(crate::ir::FinishMode::Return), [value.op]);
            return Ok(Some(TraceResult::Finished {
                trace: std::mem::take(&mut self.trace),
                outcome: Outcome::Return(value.val),
            }));
        };
        let function = self.program.function(caller.func)?;
        let (insn, next) = decode(&function.code, caller.pc)?;
        match insn {
            Insn::Call { dst, .. } => {
                caller.set_reg(dst, value)?;
                caller.pc = next;
                Ok(None)
            }
            other => unreachable!("suspended recording frame not at a call: {other:?}"),
        }
    }

    fn deliver_exception(&mut self, exc: RVal) -> Result<Option<TraceResult>, TraceError> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                self.emit_vt_sync();
                self.trace
                    .record_effect(OpKind::Finish(crate::ir::FinishMode::Raise), [exc.op]);
                return Ok(Some(TraceResult::Finished {
                    trace: std::mem::take(&mut self.trace),
                    outcome: Outcome::Raise(exc.val),
                }));
            };
            let function = self.program.function(frame.func)?;
            if let Some(h) = function.find_handler(frame.pc) {
                let (target, exc_reg) = (h.target, h.exc_reg);
                frame.set_reg(exc_reg, exc)?;
                frame.pc = target as usize;
                return Ok(None);
            }
            self.frames.pop();
        }
    }

    /// Emit a `VtSync` writing the current field operands back to the
    /// object, for exits and residual calls where non-trace code may look.
    fn emit_vt_sync(&mut self) {
        if let Some(vt) = &self.vt {
            let mut args: SmallVec<[Operand; 3]> = smallvec![vt.obj_op.clone()];
            args.extend(vt.fields.iter().map(|f| f.op.clone()));
            self.trace.record_effect(OpKind::VtSync, args);
        }
    }

    fn record_call(
        &mut self,
        state: &mut DispatchState,
        backend: &mut dyn ExecutionBackend,
        func: u16,
        arg_regs: &[u8],
        next: usize,
    ) -> Result<Option<TraceResult>, TraceError> {
        let frame = self.frames.last().expect("recording frame stack empty");
        let args: Vec<RVal> = arg_regs
            .iter()
            .map(|&r| frame.reg(r).cloned())
            .collect::<Result<_, _>>()?;
        let callee = self.program.function(func)?;
        let recursive = self.frames.iter().any(|fr| fr.func == func);

        if callee.inlinable && !recursive && callee.virtualizable.is_none() {
            let mut regs = vec![RVal::constant(Value::Int(0)); callee.num_regs as usize];
            if args.len() > callee.num_regs as usize {
                return Err(VmError::RegisterOutOfRange(callee.num_regs).into());
            }
            regs[..args.len()].clone_from_slice(&args);
            // Caller pc stays at the call; return delivery advances it.
            self.frames.push(RecFrame {
                func,
                pc: 0,
                regs,
            });
            return Ok(None);
        }

        // Residual portal call. If the callee has an entry loop head,
        // record a call through its (possibly placeholder) procedure
        // token; otherwise the backend re-enters the interpreter directly.
        let kind = match callee.entry_head() {
            Some(head) => {
                let info = callee.loop_head(head)?;
                let greens: Vec<Value> = info
                    .greens
                    .iter()
                    .map(|&r| {
                        args.get(r as usize)
                            .map(|rv| rv.val.clone())
                            .ok_or(VmError::RegisterOutOfRange(r))
                    })
                    .collect::<Result<_, _>>()?;
                let key = CellKey {
                    func,
                    head,
                    greens,
                };
                let token = self.assembler_token(state, key);
                OpKind::CallAssembler { func, token }
            }
            None => OpKind::CallPortal { func },
        };
        let concrete_args: Vec<Value> = args.iter().map(|a| a.val.clone()).collect();
        let arg_ops: Vec<Operand> = args.iter().map(|a| a.op.clone()).collect();
        self.residual_prologue();
        let result_var = self.trace.record(kind, arg_ops);
        let outcome = interp::run_call(state, backend, self.program, func, &concrete_args)?;
        self.residual_epilogue(false);
        let done = self.finish_residual(state, None, result_var, outcome, next)?;
        if let Some(reason) = state.abort_requested.take() {
            return match done {
                Some(TraceResult::Finished { outcome, .. }) => Ok(Some(TraceResult::Aborted {
                    reason,
                    resume: AbortResume::Finished(outcome),
                })),
                _ => Err(TraceError::Abort(reason)),
            };
        }
        Ok(done)
    }

    /// The (possibly placeholder) procedure token for a residual call
    /// target's entry head, installing a temporary cell if none exists.
    fn assembler_token(&mut self, state: &mut DispatchState, key: CellKey) -> TokenHandle {
        let hash = spec_hash(key.func, key.head, &key.greens);
        if let Some(idx) = state.counter.find_cell(hash, &key) {
            if let Some(token) = {
                let cell = state.counter.cell(hash, idx);
                cell.procedure_token(&state.tokens)
            } {
                return token;
            }
            // Cell exists but its token died: install a fresh placeholder.
            let token = state.tokens.allocate(true);
            state.counter.cell_mut(hash, idx).set_token(token, true);
            state.metrics.placeholders_installed += 1;
            return token;
        }
        let token = state.tokens.allocate(true);
        let mut cell = DispatchCell::new(key);
        cell.set_token(token, true);
        state.counter.install_cell(hash, cell);
        state.metrics.placeholders_installed += 1;
        tracing::debug!("installed placeholder procedure token");
        token
    }

    fn record_residual_host(
        &mut self,
        state: &mut DispatchState,
        dst: u8,
        host: u16,
        arg_regs: &[u8],
        next: usize,
    ) -> Result<Option<TraceResult>, TraceError> {
        let frame = self.frames.last().expect("recording frame stack empty");
        let args: Vec<RVal> = arg_regs
            .iter()
            .map(|&r| frame.reg(r).cloned())
            .collect::<Result<_, _>>()?;
        let host_fn = self.program.host_fn(host)?.clone();
        let concrete_args: Vec<Value> = args.iter().map(|a| a.val.clone()).collect();

        self.residual_prologue();
        let result_var = self
            .trace
            .record(OpKind::ResidualCall { host }, args.iter().map(|a| a.op.clone()));
        let result = (host_fn.run)(&concrete_args);
        let escaped = host_fn.escapes_virtualizable && self.vt.is_some();
        self.residual_epilogue(escaped);

        let outcome = match result {
            Ok(v) => Outcome::Return(v),
            Err(e) => Outcome::Raise(e),
        };
        let done = self.finish_residual(state, Some(dst), result_var, outcome, next)?;

        // The call and its bookkeeping are complete; decide whether the
        // trace survives it. Frames (or the finished outcome) are fully
        // updated, so nothing is re-executed after an abort.
        let abort = if escaped {
            // The callee observed the object: the fields were synchronized
            // and the unboxed copy is no longer authoritative.
            Some(AbortReason::VirtualizableForced)
        } else if host_fn.untraceable {
            Some(AbortReason::UntraceableCall)
        } else {
            state.abort_requested.take()
        };
        if let Some(reason) = abort {
            return match done {
                Some(TraceResult::Finished { outcome, .. }) => Ok(Some(TraceResult::Aborted {
                    reason,
                    resume: AbortResume::Finished(outcome),
                })),
                _ => Err(TraceError::Abort(reason)),
            };
        }
        Ok(done)
    }

    /// Escape protocol around every residual call: emit the sync, write
    /// the concrete fields, set the in-call marker.
    fn residual_prologue(&mut self) {
        self.emit_vt_sync();
        if let Some(vt) = &self.vt {
            let values: Vec<Value> = vt.fields.iter().map(|f| f.val.clone()).collect();
            let mut obj = vt.obj.borrow_mut();
            obj.write_fields(&values);
            obj.begin_residual_call();
        }
    }

    fn residual_epilogue(&mut self, escaped: bool) {
        if let Some(vt) = &self.vt {
            if escaped {
                let values: Vec<Value> = vt.fields.iter().map(|f| f.val.clone()).collect();
                vt.obj.borrow_mut().force_from_residual(&values);
            } else {
                vt.obj.borrow_mut().end_residual_call_untouched();
            }
        }
    }

    /// Common tail of every residual call: record the exception guard and
    /// either write the result or start exception delivery.
    ///
    /// `dst` is `None` for portal residual calls recorded through
    /// `CallAssembler`/`CallPortal`, whose destination register comes from
    /// re-decoding the call at resume time, same as the interpreter.
    fn finish_residual(
        &mut self,
        state: &mut DispatchState,
        dst: Option<u8>,
        result_var: VarId,
        outcome: Outcome,
        next: usize,
    ) -> Result<Option<TraceResult>, TraceError> {
        // The destination register of the call instruction we are sitting
        // on (portal calls re-decode; host calls pass it in).
        let dst = match dst {
            Some(d) => d,
            None => {
                let frame = self.frames.last().expect("recording frame stack empty");
                let function = self.program.function(frame.func)?;
                let (insn, _) = decode(&function.code, frame.pc)?;
                match insn {
                    Insn::Call { dst, .. } | Insn::ResidualCall { dst, .. } => dst,
                    other => unreachable!("residual recording not at a call: {other:?}"),
                }
            }
        };
        match outcome {
            Outcome::Return(value) => {
                // With a virtualizable live, compiled code re-checks that
                // the callee left it under our control. Failure resumes
                // after the call with the destination holding its result.
                if let Some(obj_op) = self.vt.as_ref().map(|vt| vt.obj_op.clone()) {
                    self.generate_guard(
                        state,
                        GuardKind::NotForced,
                        smallvec![obj_op],
                        next,
                        Some((dst, Operand::Var(result_var))),
                        false,
                    )?;
                }
                // Failure of the no-exception guard resumes mid-raise at
                // the call itself, before the destination is written.
                let call_pc = self.frames.last().expect("frame").pc;
                self.generate_guard(
                    state,
                    GuardKind::NoException,
                    smallvec![],
                    call_pc,
                    None,
                    false,
                )?;
                let frame = self.top();
                frame.set_reg(
                    dst,
                    RVal {
                        val: value,
                        op: Operand::Var(result_var),
                    },
                )?;
                frame.pc = next;
                Ok(None)
            }
            Outcome::Raise(exc) => {
                // Failure of the exception guard resumes after the call
                // with the destination holding the call's result.
                let exc_var = self.generate_guard(
                    state,
                    GuardKind::Exception,
                    smallvec![],
                    next,
                    Some((dst, Operand::Var(result_var))),
                    true,
                )?;
                let exc_rv = RVal {
                    val: exc,
                    op: Operand::Var(exc_var.expect("exception guard binds a result")),
                };
                // Delivery may land in a handler (recording continues) or
                // finish the whole trace through an uncaught raise.
                self.deliver_exception(exc_rv)
            }
        }
    }

    /// Virtualizable field ops are only legal in the frame of the
    /// declaring function, which (vt functions are never inlined) is
    /// always the bottom frame.
    fn check_vt_frame(&self) -> Result<(), VmError> {
        let frame = self.frames.last().expect("recording frame stack empty");
        let function = self.program.function(frame.func)?;
        if function.virtualizable.is_none() || self.vt.is_none() {
            return Err(VmError::NoVirtualizable(frame.func));
        }
        Ok(())
    }

    fn vt_field(&self, field: u8) -> Result<&RVal, VmError> {
        self.check_vt_frame()?;
        let vt = self.vt.as_ref().expect("checked above");
        if (field as usize) >= vt.layout.scalars {
            return Err(VmError::VtFieldOutOfRange(field));
        }
        Ok(&vt.fields[field as usize])
    }

    fn vt_field_mut(&mut self, field: u8) -> Result<&mut RVal, VmError> {
        self.check_vt_frame()?;
        let vt = self.vt.as_mut().expect("checked above");
        if (field as usize) >= vt.layout.scalars {
            return Err(VmError::VtFieldOutOfRange(field));
        }
        Ok(&mut vt.fields[field as usize])
    }

    /// Flat slot of an array element access. The index must be (or become)
    /// a compile-time constant: a variable index is promoted with a value
    /// guard first.
    fn vt_array_slot(
        &mut self,
        state: &mut DispatchState,
        field: u8,
        index_reg: u8,
        resume_pc: usize,
    ) -> Result<usize, TraceError> {
        self.check_vt_frame()?;
        let rv = self.top().reg(index_reg)?.clone();
        if !rv.is_const() {
            self.generate_guard(
                state,
                GuardKind::Value,
                smallvec![rv.op.clone(), Operand::Const(rv.val.clone())],
                resume_pc,
                None,
                false,
            )?;
            self.top()
                .set_reg(index_reg, RVal::constant(rv.val.clone()))?;
        }
        let idx = rv.val.as_int().ok_or(VmError::TypeMismatch {
            expected: "int",
            got: rv.val.kind_name(),
        })?;
        let vt = self.vt.as_ref().expect("checked above");
        let slot = vt.obj.borrow().array_slot(field, idx)?;
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeadFrame;
    use crate::bytecode::FunctionBuilder;
    use crate::errors::CompileError;
    use crate::ir::OpKind;

    /// Backend stub for recording-only tests: accepts every compile and
    /// refuses to execute anything.
    struct NullBackend;

    impl ExecutionBackend for NullBackend {
        fn compile_loop(
            &mut self,
            _state: &mut DispatchState,
            _program: &Program,
            _token: TokenHandle,
            _trace: &Trace,
        ) -> Result<(), CompileError> {
            Ok(())
        }

        fn compile_bridge(
            &mut self,
            _state: &mut DispatchState,
            _program: &Program,
            _descr: ResumeId,
            _trace: &Trace,
            _original: Option<TokenHandle>,
        ) -> Result<(), CompileError> {
            Ok(())
        }

        fn execute(
            &mut self,
            _state: &mut DispatchState,
            _program: &Program,
            _token: TokenHandle,
            _args: Vec<Value>,
        ) -> Result<DeadFrame, VmError> {
            Err(VmError::DeadToken)
        }

        fn redirect(&mut self, _old: TokenHandle, _new: TokenHandle) {}
    }

    /// Record one loop of `build`'s function and return the closed trace.
    ///
    /// `regs` seeds the leading registers; every other register (scratch
    /// space the loop body writes before reading) is zeroed. The register
    /// file spans the full u8 address space so a body may reference any
    /// register the builder can encode, mirroring `Frame::enter`.
    fn record(build: impl FnOnce(&mut FunctionBuilder) -> u16, regs: Vec<Value>) -> Trace {
        const REG_FILE: usize = u8::MAX as usize + 1;
        let mut b = FunctionBuilder::new("f", u8::MAX);
        let head = build(&mut b);
        let function = b.build();
        let info = function.loop_head(head).unwrap().clone();
        let greens: Vec<Value> = info
            .greens
            .iter()
            .map(|&r| regs[r as usize].clone())
            .collect();
        let program = Program {
            functions: vec![function],
            host_funcs: vec![],
        };
        let mut state = DispatchState::new();
        let mut backend = NullBackend;
        let mut frame_regs = regs;
        frame_regs.resize(REG_FILE, Value::Int(0));
        let frame = Frame {
            func: 0,
            pc: info.pc as usize,
            regs: frame_regs,
        };
        let key = CellKey {
            func: 0,
            head,
            greens,
        };
        match trace_loop(&mut state, &mut backend, &program, key, &frame).unwrap() {
            TraceResult::ClosedLoop { trace, .. } => trace,
            other => panic!("expected a closed loop, got {other:?}"),
        }
    }

    fn count_kind(trace: &Trace, pred: impl Fn(&OpKind) -> bool) -> usize {
        trace.ops.iter().filter(|op| pred(&op.kind)).count()
    }

    #[test]
    fn test_constant_operands_fold_and_append_nothing() {
        // Loop body computes 2 + 3 from constants, then i += 5 from the
        // folded constant. Only the variable add and the exit check may
        // appear in the trace.
        let trace = record(
            |b| {
                let head_pc = b.here();
                let head = b.loop_head(&[0], &[1, 2]);
                b.load_const(3, Value::Int(2));
                b.load_const(4, Value::Int(3));
                b.int_add(5, 3, 4); // 2 + 3: folded, nothing recorded
                b.int_add(1, 1, 5); // i + 5: recorded
                b.int_lt(6, 1, 2); // i < n: recorded
                b.jump_if_true_to(6, head_pc);
                b.ret(1);
                head
            },
            vec![Value::Int(0), Value::Int(0), Value::Int(1_000_000)],
        );
        assert_eq!(
            count_kind(&trace, |k| matches!(k, OpKind::IntBin(_))),
            2,
            "constant add must fold away"
        );
        for op in &trace.ops {
            assert!(
                !op.args.iter().all(Operand::is_const)
                    || !matches!(op.kind, OpKind::IntBin(_)),
                "recorded pure op with all-constant operands: {op:?}"
            );
        }
    }

    #[test]
    fn test_guard_idempotence_on_promoted_operand() {
        // Promoting the same register twice appends exactly one guard.
        let trace = record(
            |b| {
                let head_pc = b.here();
                let head = b.loop_head(&[0], &[1, 2]);
                b.promote(1);
                b.promote(1);
                b.int_add(1, 1, 2);
                b.jump_to(head_pc);
                head
            },
            vec![Value::Int(0), Value::Int(7), Value::Int(0)],
        );
        assert_eq!(
            count_kind(&trace, |k| matches!(k, OpKind::Guard(GuardKind::Value))),
            1
        );
    }

    #[test]
    fn test_branch_promotes_condition_register() {
        // After the branch guard, re-branching on the same register is
        // constant-folded: one boolean guard for two branches.
        let trace = record(
            |b| {
                let head_pc = b.here();
                let head = b.loop_head(&[0], &[1, 2]);
                b.int_lt(3, 1, 2);
                let out = b.jump_if_false(3);
                let out2 = b.jump_if_false(3);
                b.int_add(1, 1, 1);
                b.jump_to(head_pc);
                b.patch_here(out);
                b.patch_here(out2);
                b.ret(1);
                head
            },
            vec![Value::Int(0), Value::Int(1), Value::Int(100)],
        );
        assert_eq!(
            count_kind(&trace, |k| matches!(
                k,
                OpKind::Guard(GuardKind::True) | OpKind::Guard(GuardKind::False)
            )),
            1
        );
    }

    #[test]
    fn test_guards_share_snapshot_tails() {
        // Two guards at the same interpreter state intern one snapshot.
        let mut b = FunctionBuilder::new("f", 4);
        let head_pc = b.here();
        let head = b.loop_head(&[0], &[1, 2]);
        b.promote(1);
        b.promote(2);
        b.int_add(1, 1, 2);
        b.jump_to(head_pc);
        let function = b.build();
        let info = function.loop_head(head).unwrap().clone();
        let program = Program {
            functions: vec![function],
            host_funcs: vec![],
        };
        let mut state = DispatchState::new();
        let mut backend = NullBackend;
        let regs = vec![Value::Int(0), Value::Int(3), Value::Int(4), Value::Int(0)];
        let frame = Frame {
            func: 0,
            pc: info.pc as usize,
            regs,
        };
        let key = CellKey {
            func: 0,
            head,
            greens: vec![Value::Int(0)],
        };
        trace_loop(&mut state, &mut backend, &program, key, &frame).unwrap();
        assert_eq!(state.descr_count(), 2);
        // Distinct resume points, so two nodes; both chains end here.
        assert!(state.snapshots.node_count() <= 2);
    }
}
