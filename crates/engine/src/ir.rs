//! Trace IR: the ordered, append-only operation log produced by the
//! recorder and consumed by the compilation pipeline and the backend.
//!
//! Operands are SSA-style: a [`VarId`] is defined by exactly one operation
//! (or is a trace input) and never mutated, only referenced. Constants are
//! interchangeable with variables wherever an operand is expected.

use smallvec::SmallVec;

use crate::bytecode::IntBinOp;
use crate::resume::ResumeId;
use crate::tokens::TokenHandle;
use crate::value::Value;

/// SSA handle produced by a trace input or an operation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

/// An operand of an IR operation: a variable or an inline constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    Var(VarId),
    Const(Value),
}

impl Operand {
    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }

    pub fn as_var(&self) -> Option<VarId> {
        match self {
            Operand::Var(v) => Some(*v),
            Operand::Const(_) => None,
        }
    }
}

/// Guard kinds. Every guard operation owns exactly one resume descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardKind {
    /// Argument must be a true integer.
    True,
    /// Argument must be a false integer.
    False,
    /// Argument must equal the attached constant (value promotion).
    Value,
    /// The preceding checked op must not have overflowed.
    NoOverflow,
    /// The preceding checked op must have overflowed.
    Overflow,
    /// The preceding call must not have raised.
    NoException,
    /// The preceding call must have raised; the guard's result binds the
    /// exception value.
    Exception,
    /// The virtualizable must still be under this frame's control.
    NotForced,
}

/// How a non-looping trace leaves compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishMode {
    Return,
    Raise,
}

/// Operation kinds. A closed set matched exhaustively everywhere.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    IntBin(IntBinOp),
    IntIsZero,
    /// Checked add; sets the overflow flag consumed by the following
    /// overflow guard. The result is bound only on the non-overflow path.
    IntAddOvf,
    FloatAdd,
    /// Call to a host function. Args are the call arguments.
    ResidualCall { host: u16 },
    /// Call to a non-inlined portal function, executed by the slow
    /// interpreter at runtime.
    CallPortal { func: u16 },
    /// Call through a procedure token (real or placeholder) belonging to
    /// the target's dispatch cell. `func` is the callee, used when the
    /// token resolves to a placeholder that calls back the interpreter.
    CallAssembler { func: u16, token: TokenHandle },
    /// Write the current virtualizable field values back to the object.
    /// Args: object operand, then one operand per flat field.
    VtSync,
    Guard(GuardKind),
    /// Loop entry label. Compiled loops start here after the inputs.
    Label,
    /// Back edge or cross-procedure jump to `target`'s label. Args are the
    /// next iteration's input values, in input order.
    Jump { target: TokenHandle },
    /// Leave compiled code with a finished frame. One arg: the return
    /// value or the raised exception.
    Finish(FinishMode),
}

/// One IR operation. Immutable once appended, except that the pipeline may
/// replace descriptors while wiring bridges.
#[derive(Debug, Clone, PartialEq)]
pub struct IrOp {
    pub kind: OpKind,
    pub args: SmallVec<[Operand; 3]>,
    pub result: Option<VarId>,
    pub descr: Option<ResumeId>,
}

/// Compile-time-constant subsequence of the loop-header arguments that
/// identifies one compiled variant: the concrete green values.
pub type SpecKey = Vec<Value>;

/// Virtualizable metadata attached to a trace: which input is the object
/// and which inputs are its unboxed fields, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceVt {
    pub obj: VarId,
    pub fields: Vec<VarId>,
}

/// A finished or in-progress trace.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub inputs: Vec<VarId>,
    pub ops: Vec<IrOp>,
    pub spec_key: Option<SpecKey>,
    pub vt: Option<TraceVt>,
    next_var: u32,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_var(&mut self) -> VarId {
        let v = VarId(self.next_var);
        self.next_var += 1;
        v
    }

    pub fn new_input(&mut self) -> VarId {
        let v = self.new_var();
        self.inputs.push(v);
        v
    }

    pub fn push(&mut self, op: IrOp) {
        self.ops.push(op);
    }

    /// Append an operation with a fresh result variable.
    pub fn record(&mut self, kind: OpKind, args: impl IntoIterator<Item = Operand>) -> VarId {
        let result = self.new_var();
        self.ops.push(IrOp {
            kind,
            args: args.into_iter().collect(),
            result: Some(result),
            descr: None,
        });
        result
    }

    /// Append an operation that produces no value.
    pub fn record_effect(&mut self, kind: OpKind, args: impl IntoIterator<Item = Operand>) {
        self.ops.push(IrOp {
            kind,
            args: args.into_iter().collect(),
            result: None,
            descr: None,
        });
    }

    /// Append a guard with its resume descriptor. Returns the fresh result
    /// variable for guards that bind one (`GuardKind::Exception`).
    pub fn record_guard(
        &mut self,
        kind: GuardKind,
        args: impl IntoIterator<Item = Operand>,
        descr: ResumeId,
        with_result: bool,
    ) -> Option<VarId> {
        let result = with_result.then(|| self.new_var());
        self.ops.push(IrOp {
            kind: OpKind::Guard(kind),
            args: args.into_iter().collect(),
            result,
            descr: Some(descr),
        });
        result
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_allocates_distinct_vars() {
        let mut t = Trace::new();
        let a = t.new_input();
        let b = t.new_input();
        let c = t.record(
            OpKind::IntBin(IntBinOp::Add),
            [Operand::Var(a), Operand::Var(b)],
        );
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(t.inputs, vec![a, b]);
        assert_eq!(t.ops.len(), 1);
        assert_eq!(t.ops[0].result, Some(c));
    }

    #[test]
    fn test_operand_const() {
        assert!(Operand::Const(Value::Int(1)).is_const());
        assert!(!Operand::Var(VarId(0)).is_const());
        assert_eq!(Operand::Var(VarId(3)).as_var(), Some(VarId(3)));
    }
}
