//! Interpreted-language exceptions across the trace boundary: residual
//! calls that raise, handler dispatch, and exception guards in bridges.

use std::cell::RefCell;
use std::rc::Rc;

use ember_engine::bytecode::{FunctionBuilder, HostFunction, Program};
use ember_engine::value::{Outcome, Value};

use crate::tests::test_helpers::*;

/// `throwy(tag, n)`: each iteration calls a host function that raises on
/// every third index; the handler folds the exception payload into the
/// accumulator.
fn throwy_program() -> Program {
    let host = HostFunction::new("maybe_raise", |args| {
        let i = args[0].as_int().expect("int arg");
        if i % 3 == 0 {
            Err(Value::Int(100 + i))
        } else {
            Ok(Value::Int(i))
        }
    });

    let mut b = FunctionBuilder::new("throwy", 10);
    b.load_const(2, Value::Int(0));
    b.load_const(3, Value::Int(0));
    let head_pc = b.here();
    b.loop_head(&[0], &[1, 2, 3]);
    b.int_lt(4, 2, 1);
    let exit = b.jump_if_false(4);
    let call_pc = b.here();
    b.residual_call(6, 0, &[2]);
    let call_end = b.here();
    b.int_add(3, 3, 6); // acc += call result
    let join = b.jump();
    let handler_pc = b.here();
    b.int_add(3, 3, 7); // acc += exception payload (in r7)
    b.patch_here(join);
    b.load_const(5, Value::Int(1));
    b.int_add(2, 2, 5);
    b.jump_to(head_pc);
    b.patch_here(exit);
    b.ret(3);
    b.handler(call_pc, call_end, handler_pc, 7);
    Program {
        functions: vec![b.build()],
        host_funcs: vec![host],
    }
}

fn throwy_expected(n: i64) -> Value {
    let mut acc = 0;
    for i in 0..n {
        if i % 3 == 0 {
            acc += 100 + i;
        } else {
            acc += i;
        }
    }
    Value::Int(acc)
}

#[test]
fn test_raising_residual_calls_match_interpreter() {
    let program = throwy_program();
    let (outcome, state, _) = assert_matches_interp(
        config(4, 3),
        &program,
        0,
        &[Value::Int(0), Value::Int(60)],
    );
    assert_eq!(outcome, Outcome::Return(throwy_expected(60)));
    assert!(state.metrics.loops_compiled >= 1);
    // Exception guards fire on the untaken path until bridged.
    assert!(state.metrics.bridges_compiled >= 1);
}

#[test]
fn test_uncaught_exception_propagates_unchanged() {
    // No handler: the host exception pops the frame and surfaces as the
    // call outcome, compiled or not.
    let host = HostFunction::new("always_raise", |_| Err(Value::Int(13)));
    let mut b = FunctionBuilder::new("boom", 6);
    b.load_const(2, Value::Int(0));
    let head_pc = b.here();
    b.loop_head(&[0], &[1, 2]);
    b.int_lt(3, 2, 1);
    let exit = b.jump_if_false(3);
    b.load_const(4, Value::Int(1));
    b.int_add(2, 2, 4);
    b.jump_to(head_pc);
    b.patch_here(exit);
    b.residual_call(5, 0, &[2]);
    b.ret(5);
    let program = Program {
        functions: vec![b.build()],
        host_funcs: vec![host],
    };

    let (outcome, _, _) = assert_matches_interp(
        config(3, 2),
        &program,
        0,
        &[Value::Int(0), Value::Int(25)],
    );
    assert_eq!(outcome, Outcome::Raise(Value::Int(13)));
}

/// Host side effects must happen exactly once per iteration regardless of
/// tracing, compiled execution, aborts and deopts.
#[test]
fn test_side_effects_not_duplicated() {
    let log: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let host = HostFunction::new("log", move |args| {
        sink.borrow_mut().push(args[0].as_int().expect("int"));
        Ok(Value::Int(0))
    });

    let mut b = FunctionBuilder::new("logger", 8);
    b.load_const(2, Value::Int(0));
    let head_pc = b.here();
    b.loop_head(&[0], &[1, 2]);
    b.int_lt(3, 2, 1);
    let exit = b.jump_if_false(3);
    b.residual_call(4, 0, &[2]);
    b.load_const(5, Value::Int(1));
    b.int_add(2, 2, 5);
    b.jump_to(head_pc);
    b.patch_here(exit);
    b.ret(2);
    let program = Program {
        functions: vec![b.build()],
        host_funcs: vec![host],
    };

    let (outcome, state, _) = run_with(
        config(4, 3),
        &program,
        0,
        &[Value::Int(0), Value::Int(30)],
    );
    assert_eq!(outcome, Outcome::Return(Value::Int(30)));
    assert!(state.metrics.loops_compiled >= 1);
    assert_eq!(*log.borrow(), (0..30).collect::<Vec<i64>>());
}
