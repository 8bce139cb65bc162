//! Concrete evaluation of pure portal operations.
//!
//! Shared by the plain interpreter, the recorder's concrete side, constant
//! folding, and the reference backend, so the semantics of every pure op
//! live in exactly one place. Comparison results are `Int(1)`/`Int(0)`;
//! division by zero yields 0.

use crate::bytecode::IntBinOp;
use crate::errors::VmError;
use crate::value::Value;

fn int_of(v: &Value) -> Result<i64, VmError> {
    v.as_int().ok_or(VmError::TypeMismatch {
        expected: "int",
        got: v.kind_name(),
    })
}

fn float_of(v: &Value) -> Result<f64, VmError> {
    v.as_float().ok_or(VmError::TypeMismatch {
        expected: "float",
        got: v.kind_name(),
    })
}

pub fn int_bin(op: IntBinOp, a: &Value, b: &Value) -> Result<Value, VmError> {
    let a = int_of(a)?;
    let b = int_of(b)?;
    let r = match op {
        IntBinOp::Add => a.wrapping_add(b),
        IntBinOp::Sub => a.wrapping_sub(b),
        IntBinOp::Mul => a.wrapping_mul(b),
        IntBinOp::Div => {
            if b == 0 {
                0
            } else {
                a.wrapping_div(b)
            }
        }
        IntBinOp::Lt => (a < b) as i64,
        IntBinOp::Eq => (a == b) as i64,
        IntBinOp::And => a & b,
        IntBinOp::Or => a | b,
    };
    Ok(Value::Int(r))
}

pub fn int_is_zero(v: &Value) -> Result<Value, VmError> {
    Ok(Value::Int((int_of(v)? == 0) as i64))
}

/// Checked add. `None` means signed overflow.
pub fn int_add_ovf(a: &Value, b: &Value) -> Result<Option<Value>, VmError> {
    Ok(int_of(a)?.checked_add(int_of(b)?).map(Value::Int))
}

pub fn float_add(a: &Value, b: &Value) -> Result<Value, VmError> {
    Ok(Value::Float(float_of(a)? + float_of(b)?))
}

pub fn truthy(v: &Value) -> Result<bool, VmError> {
    v.truthy().ok_or(VmError::TypeMismatch {
        expected: "int",
        got: v.kind_name(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_bin_basic() {
        assert_eq!(
            int_bin(IntBinOp::Add, &Value::Int(2), &Value::Int(3)).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            int_bin(IntBinOp::Lt, &Value::Int(2), &Value::Int(3)).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            int_bin(IntBinOp::Eq, &Value::Int(2), &Value::Int(3)).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn test_div_by_zero_yields_zero() {
        assert_eq!(
            int_bin(IntBinOp::Div, &Value::Int(9), &Value::Int(0)).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn test_type_mismatch() {
        let err = int_bin(IntBinOp::Add, &Value::Int(1), &Value::Float(1.0)).unwrap_err();
        assert_eq!(
            err,
            VmError::TypeMismatch {
                expected: "int",
                got: "float"
            }
        );
    }

    #[test]
    fn test_add_ovf() {
        assert_eq!(
            int_add_ovf(&Value::Int(1), &Value::Int(2)).unwrap(),
            Some(Value::Int(3))
        );
        assert_eq!(int_add_ovf(&Value::Int(i64::MAX), &Value::Int(1)).unwrap(), None);
    }
}
