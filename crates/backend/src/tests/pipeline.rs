//! Pipeline-level behavior: rejection handling, retrace against the
//! preamble, token redirects, finish-shaped procedures.

use ember_engine::backend::{ExecutionBackend, ExitDescr};
use ember_engine::compile::{self, Closing};
use ember_engine::ir::{FinishMode, IrOp, OpKind, Operand, Trace};
use ember_engine::state::DispatchState;
use ember_engine::value::Value;

use crate::EvalBackend;
use crate::tests::test_helpers::*;

/// A minimal finish-shaped trace returning its only input.
fn identity_trace() -> Trace {
    let mut trace = Trace::new();
    let v = trace.new_input();
    trace.push(IrOp {
        kind: OpKind::Finish(FinishMode::Return),
        args: [Operand::Var(v)].into_iter().collect(),
        result: None,
        descr: None,
    });
    trace
}

fn constant_trace(value: i64) -> Trace {
    let mut trace = Trace::new();
    let _ = trace.new_input();
    trace.push(IrOp {
        kind: OpKind::Finish(FinishMode::Return),
        args: [Operand::Const(Value::Int(value))].into_iter().collect(),
        result: None,
        descr: None,
    });
    trace
}

#[test]
fn test_rejected_loop_returns_no_token() {
    let program = sum_program();
    let mut state = DispatchState::new();
    let mut backend = EvalBackend::new();
    backend.reject_next_loops(1);

    let token = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        identity_trace(),
        Closing::Finished,
        None,
    );
    assert!(token.is_none());
    assert_eq!(state.metrics.compile_failures, 1);
    assert_eq!(state.metrics.loops_compiled, 0);
    assert_eq!(state.tokens.live_count(), 0, "failed token freed");
}

#[test]
fn test_invalid_loop_retraced_against_preamble() {
    let program = sum_program();
    let mut state = DispatchState::new();
    let mut backend = EvalBackend::new();

    // An existing compiled procedure acts as the preamble.
    let preamble = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        constant_trace(1),
        Closing::Finished,
        None,
    )
    .expect("preamble compiles");

    backend.reject_next_loops(1);
    let token = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        identity_trace(),
        Closing::Finished,
        Some(preamble),
    );
    assert!(token.is_some(), "retrace against the preamble succeeds");
    assert_eq!(state.metrics.retraces, 1);
    assert_eq!(state.metrics.loops_compiled, 2);
}

#[test]
fn test_retrace_gives_up_after_limit() {
    let program = sum_program();
    let mut state = DispatchState::new();
    let mut backend = EvalBackend::new();

    let preamble = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        constant_trace(1),
        Closing::Finished,
        None,
    )
    .expect("preamble compiles");

    backend.reject_next_loops(1);
    backend.reject_next_retraces(10);
    let token = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        identity_trace(),
        Closing::Finished,
        Some(preamble),
    );
    assert!(token.is_none());
    assert_eq!(
        state.metrics.retraces,
        state.config.max_retrace as u64,
        "bounded retrace attempts"
    );
    assert_eq!(state.metrics.compile_failures, 1);
}

#[test]
fn test_redirect_forwards_old_token_executions() {
    let program = sum_program();
    let mut state = DispatchState::new();
    let mut backend = EvalBackend::new();

    let old = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        identity_trace(),
        Closing::Finished,
        None,
    )
    .expect("old compiles");
    let new = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        constant_trace(42),
        Closing::Finished,
        None,
    )
    .expect("new compiles");

    compile::install_redirect(&mut state, &mut backend, old, new);
    assert_eq!(state.metrics.redirects, 1);

    // Executing through the old handle reaches the replacement.
    let df = backend
        .execute(&mut state, &program, old, vec![Value::Int(7)])
        .expect("execute");
    assert_eq!(df.latest_descr(), ExitDescr::Finish(FinishMode::Return));
    assert_eq!(df.get_int_value(0).unwrap(), 42);
}

#[test]
fn test_execute_finish_procedure_returns_input() {
    let program = sum_program();
    let mut state = DispatchState::new();
    let mut backend = EvalBackend::new();

    let token = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        identity_trace(),
        Closing::Finished,
        None,
    )
    .expect("compiles");

    let df = backend
        .execute(&mut state, &program, token, vec![Value::Int(99)])
        .expect("execute");
    assert_eq!(df.get_int_value(0).unwrap(), 99);
}

#[test]
fn test_dead_token_execution_fails_cleanly() {
    let program = sum_program();
    let mut state = DispatchState::new();
    let mut backend = EvalBackend::new();

    let token = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        identity_trace(),
        Closing::Finished,
        None,
    )
    .expect("compiles");
    state.tokens.free(token);

    let err = backend
        .execute(&mut state, &program, token, vec![Value::Int(1)])
        .unwrap_err();
    assert_eq!(err, ember_engine::VmError::DeadToken);
}

#[test]
fn test_malformed_trace_rejected_by_validation() {
    let program = sum_program();
    let mut state = DispatchState::new();
    let mut backend = EvalBackend::new();

    // No terminator: backend validation refuses it.
    let mut trace = Trace::new();
    let a = trace.new_input();
    trace.record(
        OpKind::IntBin(ember_engine::bytecode::IntBinOp::Add),
        [Operand::Var(a), Operand::Const(Value::Int(1))],
    );
    let token = compile::compile_loop(
        &mut state,
        &mut backend,
        &program,
        trace,
        Closing::Finished,
        None,
    );
    assert!(token.is_none());
    assert_eq!(state.metrics.compile_failures, 1);
}
