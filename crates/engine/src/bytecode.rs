//! Portal program model: byte-encoded instructions, constant pools, and the
//! per-function metadata the engine consumes (exception handler table, loop
//! head declarations, virtualizable declaration, inlining policy).
//!
//! The engine does not define a source language or a compiler to this
//! format; [`FunctionBuilder`] exists so embeddings and tests can assemble
//! functions directly. Instruction encoding is deliberately simple: one
//! opcode byte followed by fixed-shape operands (`u8` registers, `u16`
//! little-endian immediates).

use std::rc::Rc;

use bytes::Bytes;
use strum::EnumString;

use crate::errors::VmError;
use crate::value::Value;
use crate::virtualizable::VtLayout;

/// Closed portal opcode set. Explicit discriminants are the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString)]
pub enum Opcode {
    LoadConst = 0x01,
    Mov = 0x02,

    // Integer arithmetic and comparisons. Division by zero yields 0.
    IntAdd = 0x10,
    IntSub = 0x11,
    IntMul = 0x12,
    IntDiv = 0x13,
    IntAddOvf = 0x14,
    IntLt = 0x18,
    IntEq = 0x19,
    IntIsZero = 0x1A,
    IntAnd = 0x1B,
    IntOr = 0x1C,

    FloatAdd = 0x20,

    // Control flow.
    Jump = 0x30,
    JumpIfTrue = 0x31,
    JumpIfFalse = 0x32,
    LoopHead = 0x33,
    Return = 0x34,
    Promote = 0x35,

    // Calls and exceptions.
    Call = 0x40,
    ResidualCall = 0x41,
    Raise = 0x42,

    // Virtualizable field access.
    VtGet = 0x50,
    VtSet = 0x51,
    VtArrGet = 0x52,
    VtArrSet = 0x53,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        let op = match byte {
            0x01 => Opcode::LoadConst,
            0x02 => Opcode::Mov,
            0x10 => Opcode::IntAdd,
            0x11 => Opcode::IntSub,
            0x12 => Opcode::IntMul,
            0x13 => Opcode::IntDiv,
            0x14 => Opcode::IntAddOvf,
            0x18 => Opcode::IntLt,
            0x19 => Opcode::IntEq,
            0x1A => Opcode::IntIsZero,
            0x1B => Opcode::IntAnd,
            0x1C => Opcode::IntOr,
            0x20 => Opcode::FloatAdd,
            0x30 => Opcode::Jump,
            0x31 => Opcode::JumpIfTrue,
            0x32 => Opcode::JumpIfFalse,
            0x33 => Opcode::LoopHead,
            0x34 => Opcode::Return,
            0x35 => Opcode::Promote,
            0x40 => Opcode::Call,
            0x41 => Opcode::ResidualCall,
            0x42 => Opcode::Raise,
            0x50 => Opcode::VtGet,
            0x51 => Opcode::VtSet,
            0x52 => Opcode::VtArrGet,
            0x53 => Opcode::VtArrSet,
            other => return Err(other),
        };
        Ok(op)
    }
}

/// Pure binary integer operations, shared between the instruction set and
/// the trace IR so evaluation logic lives in one place (`eval`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Eq,
    And,
    Or,
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    LoadConst { dst: u8, cidx: u16 },
    Mov { dst: u8, src: u8 },
    IntBin { op: IntBinOp, dst: u8, a: u8, b: u8 },
    /// Checked add: on signed overflow, jump to `on_ovf` without writing
    /// `dst`. The recorder turns the two outcomes into overflow guards.
    IntAddOvf { dst: u8, a: u8, b: u8, on_ovf: u16 },
    IntIsZero { dst: u8, src: u8 },
    FloatAdd { dst: u8, a: u8, b: u8 },
    Jump { target: u16 },
    JumpIf { cond: u8, target: u16, when: bool },
    LoopHead { head: u16 },
    Return { src: u8 },
    Promote { src: u8 },
    Call { dst: u8, func: u16, args: Vec<u8> },
    ResidualCall { dst: u8, host: u16, args: Vec<u8> },
    Raise { src: u8 },
    VtGet { dst: u8, field: u8 },
    VtSet { field: u8, src: u8 },
    VtArrGet { dst: u8, field: u8, index: u8 },
    VtArrSet { field: u8, index: u8, src: u8 },
}

fn read_u8(code: &[u8], at: usize) -> Result<u8, VmError> {
    code.get(at).copied().ok_or(VmError::TruncatedInstruction(at))
}

fn read_u16(code: &[u8], at: usize) -> Result<u16, VmError> {
    let lo = read_u8(code, at)?;
    let hi = read_u8(code, at + 1)?;
    Ok(u16::from_le_bytes([lo, hi]))
}

/// Decode the instruction at `pc`. Returns the instruction and the pc of
/// the next instruction.
pub fn decode(code: &[u8], pc: usize) -> Result<(Insn, usize), VmError> {
    let byte = read_u8(code, pc)?;
    let opcode = Opcode::try_from(byte).map_err(|b| VmError::InvalidOpcode(b, pc))?;
    let insn = match opcode {
        Opcode::LoadConst => (
            Insn::LoadConst {
                dst: read_u8(code, pc + 1)?,
                cidx: read_u16(code, pc + 2)?,
            },
            pc + 4,
        ),
        Opcode::Mov => (
            Insn::Mov {
                dst: read_u8(code, pc + 1)?,
                src: read_u8(code, pc + 2)?,
            },
            pc + 3,
        ),
        Opcode::IntAdd
        | Opcode::IntSub
        | Opcode::IntMul
        | Opcode::IntDiv
        | Opcode::IntLt
        | Opcode::IntEq
        | Opcode::IntAnd
        | Opcode::IntOr => {
            let op = match opcode {
                Opcode::IntAdd => IntBinOp::Add,
                Opcode::IntSub => IntBinOp::Sub,
                Opcode::IntMul => IntBinOp::Mul,
                Opcode::IntDiv => IntBinOp::Div,
                Opcode::IntLt => IntBinOp::Lt,
                Opcode::IntEq => IntBinOp::Eq,
                Opcode::IntAnd => IntBinOp::And,
                _ => IntBinOp::Or,
            };
            (
                Insn::IntBin {
                    op,
                    dst: read_u8(code, pc + 1)?,
                    a: read_u8(code, pc + 2)?,
                    b: read_u8(code, pc + 3)?,
                },
                pc + 4,
            )
        }
        Opcode::IntAddOvf => (
            Insn::IntAddOvf {
                dst: read_u8(code, pc + 1)?,
                a: read_u8(code, pc + 2)?,
                b: read_u8(code, pc + 3)?,
                on_ovf: read_u16(code, pc + 4)?,
            },
            pc + 6,
        ),
        Opcode::IntIsZero => (
            Insn::IntIsZero {
                dst: read_u8(code, pc + 1)?,
                src: read_u8(code, pc + 2)?,
            },
            pc + 3,
        ),
        Opcode::FloatAdd => (
            Insn::FloatAdd {
                dst: read_u8(code, pc + 1)?,
                a: read_u8(code, pc + 2)?,
                b: read_u8(code, pc + 3)?,
            },
            pc + 4,
        ),
        Opcode::Jump => (
            Insn::Jump {
                target: read_u16(code, pc + 1)?,
            },
            pc + 3,
        ),
        Opcode::JumpIfTrue | Opcode::JumpIfFalse => (
            Insn::JumpIf {
                cond: read_u8(code, pc + 1)?,
                target: read_u16(code, pc + 2)?,
                when: opcode == Opcode::JumpIfTrue,
            },
            pc + 4,
        ),
        Opcode::LoopHead => (
            Insn::LoopHead {
                head: read_u16(code, pc + 1)?,
            },
            pc + 3,
        ),
        Opcode::Return => (
            Insn::Return {
                src: read_u8(code, pc + 1)?,
            },
            pc + 2,
        ),
        Opcode::Promote => (
            Insn::Promote {
                src: read_u8(code, pc + 1)?,
            },
            pc + 2,
        ),
        Opcode::Call | Opcode::ResidualCall => {
            let dst = read_u8(code, pc + 1)?;
            let target = read_u16(code, pc + 2)?;
            let nargs = read_u8(code, pc + 4)? as usize;
            let mut args = Vec::with_capacity(nargs);
            for i in 0..nargs {
                args.push(read_u8(code, pc + 5 + i)?);
            }
            let next = pc + 5 + nargs;
            if opcode == Opcode::Call {
                (
                    Insn::Call {
                        dst,
                        func: target,
                        args,
                    },
                    next,
                )
            } else {
                (
                    Insn::ResidualCall {
                        dst,
                        host: target,
                        args,
                    },
                    next,
                )
            }
        }
        Opcode::Raise => (
            Insn::Raise {
                src: read_u8(code, pc + 1)?,
            },
            pc + 2,
        ),
        Opcode::VtGet => (
            Insn::VtGet {
                dst: read_u8(code, pc + 1)?,
                field: read_u8(code, pc + 2)?,
            },
            pc + 3,
        ),
        Opcode::VtSet => (
            Insn::VtSet {
                field: read_u8(code, pc + 1)?,
                src: read_u8(code, pc + 2)?,
            },
            pc + 3,
        ),
        Opcode::VtArrGet => (
            Insn::VtArrGet {
                dst: read_u8(code, pc + 1)?,
                field: read_u8(code, pc + 2)?,
                index: read_u8(code, pc + 3)?,
            },
            pc + 4,
        ),
        Opcode::VtArrSet => (
            Insn::VtArrSet {
                field: read_u8(code, pc + 1)?,
                index: read_u8(code, pc + 2)?,
                src: read_u8(code, pc + 3)?,
            },
            pc + 4,
        ),
    };
    Ok(insn)
}

/// One entry of a function's exception handler table. A pending exception
/// raised while `from <= pc < to` transfers control to `target` with the
/// exception value stored in `exc_reg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub from: u16,
    pub to: u16,
    pub target: u16,
    pub exc_reg: u8,
}

/// Declaration of one loop head: which registers form the specialization
/// key (greens) and which carry the loop-variant state (reds).
///
/// Greens and reds together must cover every register live across the head;
/// anything else is treated as dead there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopHeadInfo {
    /// Byte offset of the `LoopHead` instruction itself.
    pub pc: u16,
    pub greens: Vec<u8>,
    pub reds: Vec<u8>,
}

/// Declaration that one argument register holds the function's
/// virtualizable, with the field layout the unboxing protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtDecl {
    pub reg: u8,
    pub layout: VtLayout,
}

/// A portal function: encoded code plus the metadata driving the engine.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub code: Bytes,
    pub consts: Vec<Value>,
    pub num_regs: u8,
    pub handlers: Vec<Handler>,
    pub loop_heads: Vec<LoopHeadInfo>,
    pub virtualizable: Option<VtDecl>,
    /// Externally-decided inlining policy bit, consumed by the recorder.
    pub inlinable: bool,
}

impl Function {
    pub fn constant(&self, idx: u16) -> Result<&Value, VmError> {
        self.consts
            .get(idx as usize)
            .ok_or(VmError::ConstOutOfRange(idx))
    }

    pub fn loop_head(&self, head: u16) -> Result<&LoopHeadInfo, VmError> {
        self.loop_heads
            .get(head as usize)
            .ok_or(VmError::LoopHeadOutOfRange(head))
    }

    /// First handler covering `pc`, in table order.
    pub fn find_handler(&self, pc: usize) -> Option<&Handler> {
        self.handlers
            .iter()
            .find(|h| (h.from as usize) <= pc && pc < (h.to as usize))
    }

    /// The loop head declared at pc 0, if any: the function's entry head,
    /// used for placeholder-token installation on non-inlined recursion.
    pub fn entry_head(&self) -> Option<u16> {
        self.loop_heads
            .iter()
            .position(|h| h.pc == 0)
            .map(|i| i as u16)
    }
}

/// Host function callable from portal code via `ResidualCall`. `Err` is an
/// interpreted-language exception, not a host error.
#[derive(Clone)]
pub struct HostFunction {
    pub name: String,
    /// Effect bit: whether a call to this function makes the virtualizable
    /// escape into code the engine cannot see.
    pub escapes_virtualizable: bool,
    /// A call that cannot be represented in a trace at all; recording it
    /// aborts to the interpreter after the call completes.
    pub untraceable: bool,
    pub run: Rc<dyn Fn(&[Value]) -> Result<Value, Value>>,
}

impl HostFunction {
    pub fn new(
        name: impl Into<String>,
        run: impl Fn(&[Value]) -> Result<Value, Value> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            escapes_virtualizable: false,
            untraceable: false,
            run: Rc::new(run),
        }
    }

    pub fn escaping(
        name: impl Into<String>,
        run: impl Fn(&[Value]) -> Result<Value, Value> + 'static,
    ) -> Self {
        Self {
            escapes_virtualizable: true,
            ..Self::new(name, run)
        }
    }

    pub fn untraceable(
        name: impl Into<String>,
        run: impl Fn(&[Value]) -> Result<Value, Value> + 'static,
    ) -> Self {
        Self {
            untraceable: true,
            ..Self::new(name, run)
        }
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("escapes_virtualizable", &self.escapes_virtualizable)
            .field("untraceable", &self.untraceable)
            .finish_non_exhaustive()
    }
}

/// A whole portal program: functions plus the host function table.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: Vec<Function>,
    pub host_funcs: Vec<HostFunction>,
}

impl Program {
    pub fn function(&self, idx: u16) -> Result<&Function, VmError> {
        self.functions
            .get(idx as usize)
            .ok_or(VmError::FunctionOutOfRange(idx))
    }

    pub fn host_fn(&self, idx: u16) -> Result<&HostFunction, VmError> {
        self.host_funcs
            .get(idx as usize)
            .ok_or(VmError::HostFnOutOfRange(idx))
    }
}

/// Unresolved forward jump returned by the builder's jump emitters.
#[derive(Debug, Clone, Copy)]
#[must_use = "unpatched jumps point at pc 0"]
pub struct JumpPatch(usize);

/// Assembles one [`Function`]. Used by embeddings and pervasively by tests.
pub struct FunctionBuilder {
    name: String,
    num_regs: u8,
    code: Vec<u8>,
    consts: Vec<Value>,
    handlers: Vec<Handler>,
    loop_heads: Vec<LoopHeadInfo>,
    virtualizable: Option<VtDecl>,
    inlinable: bool,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, num_regs: u8) -> Self {
        Self {
            name: name.into(),
            num_regs,
            code: Vec::new(),
            consts: Vec::new(),
            handlers: Vec::new(),
            loop_heads: Vec::new(),
            virtualizable: None,
            inlinable: true,
        }
    }

    /// Current pc, usable as a backward jump target.
    pub fn here(&self) -> u16 {
        self.code.len() as u16
    }

    fn const_idx(&mut self, value: Value) -> u16 {
        if let Some(i) = self.consts.iter().position(|c| *c == value) {
            return i as u16;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u16
    }

    fn emit_u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    pub fn load_const(&mut self, dst: u8, value: Value) -> &mut Self {
        let cidx = self.const_idx(value);
        self.code.push(Opcode::LoadConst as u8);
        self.code.push(dst);
        self.emit_u16(cidx);
        self
    }

    pub fn mov(&mut self, dst: u8, src: u8) -> &mut Self {
        self.code.extend_from_slice(&[Opcode::Mov as u8, dst, src]);
        self
    }

    fn int_bin(&mut self, opcode: Opcode, dst: u8, a: u8, b: u8) -> &mut Self {
        self.code.extend_from_slice(&[opcode as u8, dst, a, b]);
        self
    }

    pub fn int_add(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.int_bin(Opcode::IntAdd, dst, a, b)
    }

    pub fn int_sub(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.int_bin(Opcode::IntSub, dst, a, b)
    }

    pub fn int_mul(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.int_bin(Opcode::IntMul, dst, a, b)
    }

    pub fn int_div(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.int_bin(Opcode::IntDiv, dst, a, b)
    }

    pub fn int_lt(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.int_bin(Opcode::IntLt, dst, a, b)
    }

    pub fn int_eq(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.int_bin(Opcode::IntEq, dst, a, b)
    }

    pub fn int_and(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.int_bin(Opcode::IntAnd, dst, a, b)
    }

    pub fn int_or(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.int_bin(Opcode::IntOr, dst, a, b)
    }

    pub fn int_is_zero(&mut self, dst: u8, src: u8) -> &mut Self {
        self.code
            .extend_from_slice(&[Opcode::IntIsZero as u8, dst, src]);
        self
    }

    pub fn int_add_ovf(&mut self, dst: u8, a: u8, b: u8) -> JumpPatch {
        self.code
            .extend_from_slice(&[Opcode::IntAddOvf as u8, dst, a, b]);
        let patch = JumpPatch(self.code.len());
        self.emit_u16(0);
        patch
    }

    pub fn float_add(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.int_bin(Opcode::FloatAdd, dst, a, b)
    }

    pub fn jump(&mut self) -> JumpPatch {
        self.code.push(Opcode::Jump as u8);
        let patch = JumpPatch(self.code.len());
        self.emit_u16(0);
        patch
    }

    pub fn jump_to(&mut self, target: u16) -> &mut Self {
        self.code.push(Opcode::Jump as u8);
        self.emit_u16(target);
        self
    }

    pub fn jump_if_true(&mut self, cond: u8) -> JumpPatch {
        self.code
            .extend_from_slice(&[Opcode::JumpIfTrue as u8, cond]);
        let patch = JumpPatch(self.code.len());
        self.emit_u16(0);
        patch
    }

    pub fn jump_if_false(&mut self, cond: u8) -> JumpPatch {
        self.code
            .extend_from_slice(&[Opcode::JumpIfFalse as u8, cond]);
        let patch = JumpPatch(self.code.len());
        self.emit_u16(0);
        patch
    }

    pub fn jump_if_true_to(&mut self, cond: u8, target: u16) -> &mut Self {
        self.code
            .extend_from_slice(&[Opcode::JumpIfTrue as u8, cond]);
        self.emit_u16(target);
        self
    }

    pub fn jump_if_false_to(&mut self, cond: u8, target: u16) -> &mut Self {
        self.code
            .extend_from_slice(&[Opcode::JumpIfFalse as u8, cond]);
        self.emit_u16(target);
        self
    }

    /// Resolve a forward jump to the current position.
    pub fn patch_here(&mut self, patch: JumpPatch) -> &mut Self {
        let target = self.here();
        self.patch_to(patch, target)
    }

    pub fn patch_to(&mut self, patch: JumpPatch, target: u16) -> &mut Self {
        self.code[patch.0..patch.0 + 2].copy_from_slice(&target.to_le_bytes());
        self
    }

    /// Declare and emit a loop head at the current position.
    pub fn loop_head(&mut self, greens: &[u8], reds: &[u8]) -> u16 {
        let pc = self.here();
        let head = self.loop_heads.len() as u16;
        self.loop_heads.push(LoopHeadInfo {
            pc,
            greens: greens.to_vec(),
            reds: reds.to_vec(),
        });
        self.code.push(Opcode::LoopHead as u8);
        self.emit_u16(head);
        head
    }

    pub fn ret(&mut self, src: u8) -> &mut Self {
        self.code.extend_from_slice(&[Opcode::Return as u8, src]);
        self
    }

    pub fn promote(&mut self, src: u8) -> &mut Self {
        self.code.extend_from_slice(&[Opcode::Promote as u8, src]);
        self
    }

    pub fn call(&mut self, dst: u8, func: u16, args: &[u8]) -> &mut Self {
        self.code.extend_from_slice(&[Opcode::Call as u8, dst]);
        self.emit_u16(func);
        self.code.push(args.len() as u8);
        self.code.extend_from_slice(args);
        self
    }

    pub fn residual_call(&mut self, dst: u8, host: u16, args: &[u8]) -> &mut Self {
        self.code
            .extend_from_slice(&[Opcode::ResidualCall as u8, dst]);
        self.emit_u16(host);
        self.code.push(args.len() as u8);
        self.code.extend_from_slice(args);
        self
    }

    pub fn raise(&mut self, src: u8) -> &mut Self {
        self.code.extend_from_slice(&[Opcode::Raise as u8, src]);
        self
    }

    pub fn vt_get(&mut self, dst: u8, field: u8) -> &mut Self {
        self.code
            .extend_from_slice(&[Opcode::VtGet as u8, dst, field]);
        self
    }

    pub fn vt_set(&mut self, field: u8, src: u8) -> &mut Self {
        self.code
            .extend_from_slice(&[Opcode::VtSet as u8, field, src]);
        self
    }

    pub fn vt_arr_get(&mut self, dst: u8, field: u8, index: u8) -> &mut Self {
        self.code
            .extend_from_slice(&[Opcode::VtArrGet as u8, dst, field, index]);
        self
    }

    pub fn vt_arr_set(&mut self, field: u8, index: u8, src: u8) -> &mut Self {
        self.code
            .extend_from_slice(&[Opcode::VtArrSet as u8, field, index, src]);
        self
    }

    pub fn handler(&mut self, from: u16, to: u16, target: u16, exc_reg: u8) -> &mut Self {
        self.handlers.push(Handler {
            from,
            to,
            target,
            exc_reg,
        });
        self
    }

    pub fn set_inlinable(&mut self, inlinable: bool) -> &mut Self {
        self.inlinable = inlinable;
        self
    }

    pub fn set_virtualizable(&mut self, reg: u8, layout: VtLayout) -> &mut Self {
        self.virtualizable = Some(VtDecl { reg, layout });
        self
    }

    pub fn build(self) -> Function {
        Function {
            name: self.name,
            code: Bytes::from(self.code),
            consts: self.consts,
            num_regs: self.num_regs,
            handlers: self.handlers,
            loop_heads: self.loop_heads,
            virtualizable: self.virtualizable,
            inlinable: self.inlinable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_roundtrip_simple() {
        let mut b = FunctionBuilder::new("f", 3);
        b.load_const(0, Value::Int(7));
        b.int_add(2, 0, 1);
        b.ret(2);
        let f = b.build();

        let (insn, next) = decode(&f.code, 0).unwrap();
        assert_eq!(insn, Insn::LoadConst { dst: 0, cidx: 0 });
        let (insn, next) = decode(&f.code, next).unwrap();
        assert_eq!(
            insn,
            Insn::IntBin {
                op: IntBinOp::Add,
                dst: 2,
                a: 0,
                b: 1
            }
        );
        let (insn, _) = decode(&f.code, next).unwrap();
        assert_eq!(insn, Insn::Return { src: 2 });
        assert_eq!(f.consts[0], Value::Int(7));
    }

    #[test]
    fn test_decode_invalid_opcode() {
        let err = decode(&[0xEE], 0).unwrap_err();
        assert_eq!(err, VmError::InvalidOpcode(0xEE, 0));
    }

    #[test]
    fn test_decode_truncated() {
        // IntAdd needs 3 operand bytes.
        let err = decode(&[Opcode::IntAdd as u8, 0], 0).unwrap_err();
        assert_eq!(err, VmError::TruncatedInstruction(2));
    }

    #[test]
    fn test_jump_patching() {
        let mut b = FunctionBuilder::new("f", 2);
        let skip = b.jump_if_false(0);
        b.load_const(1, Value::Int(1));
        b.patch_here(skip);
        b.ret(1);
        let f = b.build();

        let (insn, _) = decode(&f.code, 0).unwrap();
        match insn {
            Insn::JumpIf {
                cond: 0,
                target,
                when: false,
            } => assert_eq!(target as usize, 4 + 4),
            other => panic!("unexpected insn {other:?}"),
        }
    }

    #[test]
    fn test_const_pool_dedup() {
        let mut b = FunctionBuilder::new("f", 2);
        b.load_const(0, Value::Int(5));
        b.load_const(1, Value::Int(5));
        let f = b.build();
        assert_eq!(f.consts.len(), 1);
    }

    #[test]
    fn test_loop_head_metadata() {
        let mut b = FunctionBuilder::new("f", 4);
        b.load_const(0, Value::Int(0));
        let head = b.loop_head(&[0], &[1, 2]);
        let f = b.build();
        let info = f.loop_head(head).unwrap();
        assert_eq!(info.pc, 4);
        assert_eq!(info.greens, vec![0]);
        assert_eq!(info.reds, vec![1, 2]);
        assert_eq!(f.entry_head(), None);
    }

    #[test]
    fn test_handler_lookup() {
        let mut b = FunctionBuilder::new("f", 2);
        b.handler(0, 10, 20, 1);
        let f = b.build();
        assert!(f.find_handler(5).is_some());
        assert!(f.find_handler(10).is_none());
    }
}
