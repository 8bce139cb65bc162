//! Virtualizable coherence between interpreted and compiled execution:
//! unboxed field updates, synchronization around residual calls, forced
//! escapes aborting the trace.

use std::cell::RefCell;
use std::rc::Rc;

use ember_engine::bytecode::HostFunction;
use ember_engine::value::{Outcome, Value};
use ember_engine::virtualizable::EscapeMarker;

use crate::tests::test_helpers::*;

#[test]
fn test_vt_fields_coherent_across_compiled_loop() {
    let program = vt_program(None);
    let obj = fresh_vt_object(5, 100);
    let args = [Value::Ref(Some(obj.clone())), Value::Int(40)];

    let (outcome, state, _) = run_with(config(6, 4), &program, 0, &args);

    // acc = 5 + sum(0..40), counted 40 iterations on top of 100.
    let expected = 5 + (0..40).sum::<i64>();
    assert_eq!(outcome, Outcome::Return(Value::Int(expected)));
    assert!(state.metrics.loops_compiled >= 1, "the vt loop compiled");

    let obj = obj.borrow();
    assert_eq!(obj.scalars[0], Value::Int(expected));
    assert_eq!(obj.arrays[0][0], Value::Int(140));
    assert_eq!(obj.marker(), EscapeMarker::Absent, "ownership released");
}

#[test]
fn test_vt_matches_pure_interpretation() {
    let program = vt_program(None);

    let obj_ref = fresh_vt_object(1, 2);
    let expected = reference(
        &program,
        0,
        &[Value::Ref(Some(obj_ref.clone())), Value::Int(33)],
    );

    let obj_jit = fresh_vt_object(1, 2);
    let (outcome, _, _) = run_with(
        config(4, 3),
        &program,
        0,
        &[Value::Ref(Some(obj_jit.clone())), Value::Int(33)],
    );

    assert_eq!(outcome, expected);
    assert_eq!(*obj_jit.borrow(), *obj_ref.borrow());
}

/// A non-escaping residual call must observe synchronized heap fields at
/// every call, interpreted or compiled.
#[test]
fn test_residual_calls_see_synchronized_fields() {
    let observed: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));

    let make_host = |obj: ember_engine::value::ObjRef, sink: Rc<RefCell<Vec<i64>>>| {
        HostFunction::new("peek", move |_args| {
            let acc = obj.borrow().scalars[0].as_int().expect("int field");
            sink.borrow_mut().push(acc);
            Ok(Value::Int(0))
        })
    };

    // Reference run.
    let obj_ref = fresh_vt_object(0, 0);
    let ref_log: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
    let program = vt_program(Some(make_host(obj_ref.clone(), ref_log.clone())));
    let expected = reference(
        &program,
        0,
        &[Value::Ref(Some(obj_ref)), Value::Int(25)],
    );

    // JIT run against its own object and log.
    let obj = fresh_vt_object(0, 0);
    let program = vt_program(Some(make_host(obj.clone(), observed.clone())));
    let (outcome, state, _) = run_with(
        config(5, 4),
        &program,
        0,
        &[Value::Ref(Some(obj)), Value::Int(25)],
    );

    assert_eq!(outcome, expected);
    assert!(state.metrics.loops_compiled >= 1);
    assert_eq!(
        *observed.borrow(),
        *ref_log.borrow(),
        "host saw stale virtualizable fields"
    );
}

/// An escaping residual call forces the object: the trace aborts, fields
/// are synchronized wholesale, and semantics are unchanged.
#[test]
fn test_escaping_call_forces_and_aborts() {
    let escape_sink: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));

    let make_host = |obj: ember_engine::value::ObjRef, sink: Rc<RefCell<Vec<i64>>>| {
        HostFunction::escaping("escape", move |_args| {
            let acc = obj.borrow().scalars[0].as_int().expect("int field");
            sink.borrow_mut().push(acc);
            Ok(Value::Int(0))
        })
    };

    let obj_ref = fresh_vt_object(0, 0);
    let ref_log: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
    let program = vt_program(Some(make_host(obj_ref.clone(), ref_log.clone())));
    let expected = reference(
        &program,
        0,
        &[Value::Ref(Some(obj_ref)), Value::Int(20)],
    );

    let obj = fresh_vt_object(0, 0);
    let program = vt_program(Some(make_host(obj.clone(), escape_sink.clone())));
    let (outcome, state, _) = run_with(
        config(4, 3),
        &program,
        0,
        &[Value::Ref(Some(obj.clone())), Value::Int(20)],
    );

    assert_eq!(outcome, expected);
    assert_eq!(*escape_sink.borrow(), *ref_log.borrow());
    assert!(
        state.metrics.traces_aborted >= 1,
        "escaping call must abort the trace"
    );
    assert_eq!(
        state.metrics.loops_compiled, 0,
        "a loop whose every iteration escapes never compiles"
    );
    assert_eq!(obj.borrow().marker(), EscapeMarker::Absent);
}

/// Round-trip at the scenario level: a single compiled pass over objects
/// with zero, one and many array elements preserves untouched fields
/// exactly.
#[test]
fn test_untouched_fields_survive_roundtrip() {
    let program = vt_program(None);
    for extra in [0usize, 1, 7] {
        let obj = fresh_vt_object(0, 0);
        obj.borrow_mut().arrays[0].extend((0..extra as i64).map(Value::Int));
        let before_tail: Vec<Value> = obj.borrow().arrays[0][1..].to_vec();

        let (_, _, _) = run_with(
            config(3, 3),
            &program,
            0,
            &[Value::Ref(Some(obj.clone())), Value::Int(12)],
        );
        assert_eq!(
            &obj.borrow().arrays[0][1..],
            &before_tail[..],
            "untouched array elements must round-trip unchanged"
        );
    }
}
