//! Structural validation of traces before they are accepted as compiled
//! procedures.
//!
//! The evaluator trusts what it stores, so everything it relies on is
//! checked here once: SSA discipline (each variable defined exactly once,
//! used only after definition), guards carrying descriptors, the label
//! only at the front, and a terminator only at the end.

use ember_engine::ir::{OpKind, Operand, Trace};
use rustc_hash::FxHashSet;

use crate::error::BackendError;

pub fn validate_trace(trace: &Trace) -> Result<(), BackendError> {
    let mut defined: FxHashSet<u32> = trace.inputs.iter().map(|v| v.0).collect();
    if defined.len() != trace.inputs.len() {
        return Err(BackendError::Redefined(0));
    }

    let last = trace.ops.len().checked_sub(1);
    for (i, op) in trace.ops.iter().enumerate() {
        for arg in &op.args {
            if let Operand::Var(v) = arg {
                if !defined.contains(&v.0) {
                    return Err(BackendError::UndefinedVar(v.0));
                }
            }
        }
        if let Some(result) = op.result {
            if !defined.insert(result.0) {
                return Err(BackendError::Redefined(result.0));
            }
        }
        match &op.kind {
            OpKind::Guard(_) => {
                if op.descr.is_none() {
                    return Err(BackendError::GuardWithoutDescr);
                }
            }
            OpKind::Label => {
                if i != 0 {
                    return Err(BackendError::MisplacedLabel);
                }
            }
            OpKind::Jump { .. } | OpKind::Finish(_) => {
                if Some(i) != last {
                    return Err(BackendError::EarlyTerminator);
                }
            }
            _ => {}
        }
    }

    match trace.ops.last().map(|op| &op.kind) {
        Some(OpKind::Jump { .. }) | Some(OpKind::Finish(_)) => Ok(()),
        _ => Err(BackendError::MissingTerminator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_engine::ir::{FinishMode, IrOp, OpKind, Operand, Trace};
    use ember_engine::value::Value;

    fn finish(trace: &mut Trace, op: Operand) {
        trace.push(IrOp {
            kind: OpKind::Finish(FinishMode::Return),
            args: [op].into_iter().collect(),
            result: None,
            descr: None,
        });
    }

    #[test]
    fn test_accepts_minimal_finish_trace() {
        let mut trace = Trace::new();
        let v = trace.new_input();
        finish(&mut trace, Operand::Var(v));
        assert!(validate_trace(&trace).is_ok());
    }

    #[test]
    fn test_rejects_undefined_var() {
        let mut trace = Trace::new();
        let v = trace.new_var(); // not an input, never defined
        finish(&mut trace, Operand::Var(v));
        assert_eq!(
            validate_trace(&trace),
            Err(BackendError::UndefinedVar(v.0))
        );
    }

    #[test]
    fn test_rejects_missing_terminator() {
        let mut trace = Trace::new();
        let a = trace.new_input();
        trace.record(
            OpKind::IntBin(ember_engine::bytecode::IntBinOp::Add),
            [Operand::Var(a), Operand::Const(Value::Int(1))],
        );
        assert_eq!(validate_trace(&trace), Err(BackendError::MissingTerminator));
    }

    #[test]
    fn test_rejects_guard_without_descr() {
        let mut trace = Trace::new();
        let a = trace.new_input();
        trace.push(IrOp {
            kind: OpKind::Guard(ember_engine::ir::GuardKind::True),
            args: [Operand::Var(a)].into_iter().collect(),
            result: None,
            descr: None,
        });
        finish(&mut trace, Operand::Var(a));
        assert_eq!(validate_trace(&trace), Err(BackendError::GuardWithoutDescr));
    }
}
