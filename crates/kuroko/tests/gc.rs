//! Collector behavior: interning identity, reclamation of unreachable
//! objects, upvalue closing, and observable-output stability under stress
//! collection.

mod common;

use common::{expect_int, load_global, new_vm, run, store_global};
use kuroko::{CodeBuilder, Opcode, UpvalueDesc, Value, Vm};
use pretty_assertions::assert_eq;

#[test]
fn equal_strings_share_one_heap_object() {
    let (mut vm, _) = new_vm();
    let a = vm.intern_string("hello world");
    let b = vm.intern_string("hello world");
    assert!(a.identical(b));

    // The same content produced by managed concatenation interns to the
    // same object.
    let mut code = CodeBuilder::new();
    let hello = vm.intern_string("hello ");
    code.emit_const(hello);
    let world = vm.intern_string("world");
    code.emit_const(world);
    code.emit(Opcode::Add);
    code.emit(Opcode::Return);
    let joined = run(&mut vm, code);
    assert!(joined.identical(a));
}

#[test]
fn collection_reclaims_unreachable_objects() {
    let (mut vm, _) = new_vm();
    // Build a pile of lists that nothing references after the program ends.
    let mut code = CodeBuilder::new();
    for _ in 0..100 {
        code.emit_const(Value::Int(0));
        code.emit_u16(Opcode::BuildList, 1);
        code.emit(Opcode::Pop);
    }
    code.emit(Opcode::None);
    code.emit(Opcode::Return);
    run(&mut vm, code);
    let before = vm.heap_stats();
    vm.collect_garbage();
    let after = vm.heap_stats();
    assert!(
        after.live_objects < before.live_objects,
        "collection freed nothing: {before:?} -> {after:?}"
    );
    assert!(after.free_slots > 0);
    assert!(after.bytes_allocated <= before.bytes_allocated);
}

#[test]
fn reachable_objects_survive_collection() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    for i in 0..5 {
        code.emit_const(Value::Int(i));
    }
    code.emit_u16(Opcode::BuildList, 5);
    store_global(&mut vm, &mut code, "keep");
    load_global(&mut vm, &mut code, "keep");
    code.emit(Opcode::Return);
    let kept = run(&mut vm, code);
    // The module table roots the list through its globals.
    for _ in 0..3 {
        vm.collect_garbage();
    }
    assert_eq!(vm.repr_value(kept).unwrap(), "[0, 1, 2, 3, 4]");
}

/// Assembles `def make(): x = 10; return lambda: x` plus a module body that
/// calls the closure after `make`'s frame is long gone.
fn make_and_call_program(vm: &mut Vm) -> CodeBuilder {
    let mut lambda = CodeBuilder::new();
    lambda.set_name(vm.intern_string("<lambda>"));
    lambda.set_upvalues(vec![UpvalueDesc {
        is_local: true,
        index: 0,
    }]);
    lambda.emit_u8(Opcode::GetUpvalue, 0);
    lambda.emit(Opcode::Return);
    let lambda = vm.alloc_code_object(lambda.build());

    let mut make = CodeBuilder::new();
    make.set_name(vm.intern_string("make"));
    make.emit_const(Value::Int(10)); // local 0: x
    let lambda_const = make.add_const(lambda);
    make.emit_make_closure(lambda_const, 0);
    make.emit(Opcode::Return);
    let make = vm.alloc_code_object(make.build());

    let mut code = CodeBuilder::new();
    let make_const = code.add_const(make);
    code.emit_make_closure(make_const, 0);
    code.emit_u8(Opcode::Call, 0);
    store_global(vm, &mut code, "f");
    load_global(vm, &mut code, "f");
    code.emit_u8(Opcode::Call, 0);
    code.emit(Opcode::Return);
    code
}

#[test]
fn upvalues_close_when_their_scope_exits() {
    let (mut vm, _) = new_vm();
    let program = make_and_call_program(&mut vm);
    assert_eq!(expect_int(run(&mut vm, program)), 10);
}

#[test]
fn closed_upvalues_survive_collection() {
    let (mut vm, _) = new_vm();
    let program = make_and_call_program(&mut vm);
    vm.set_gc_stress(true);
    assert_eq!(expect_int(run(&mut vm, program)), 10);
}

/// A shared upvalue mutated through `SetUpvalue` acts as one cell, not a
/// copy per closure.
#[test]
fn closures_share_their_captured_cell() {
    let (mut vm, _) = new_vm();
    // inner: x = x + 1; return x
    let mut inner = CodeBuilder::new();
    inner.set_name(vm.intern_string("bump"));
    inner.set_upvalues(vec![UpvalueDesc {
        is_local: true,
        index: 0,
    }]);
    inner.emit_u8(Opcode::GetUpvalue, 0);
    inner.emit_const(Value::Int(1));
    inner.emit(Opcode::Add);
    inner.emit(Opcode::Dup);
    inner.emit_u8(Opcode::SetUpvalue, 0);
    inner.emit(Opcode::Return);
    let inner = vm.alloc_code_object(inner.build());

    // outer: x = 0; return bump
    let mut outer = CodeBuilder::new();
    outer.set_name(vm.intern_string("counter"));
    outer.emit_const(Value::Int(0));
    let inner_const = outer.add_const(inner);
    outer.emit_make_closure(inner_const, 0);
    outer.emit(Opcode::Return);
    let outer = vm.alloc_code_object(outer.build());

    let mut code = CodeBuilder::new();
    let outer_const = code.add_const(outer);
    code.emit_make_closure(outer_const, 0);
    code.emit_u8(Opcode::Call, 0);
    store_global(&mut vm, &mut code, "bump");
    // bump(); bump(); return bump()
    for _ in 0..2 {
        load_global(&mut vm, &mut code, "bump");
        code.emit_u8(Opcode::Call, 0);
        code.emit(Opcode::Pop);
    }
    load_global(&mut vm, &mut code, "bump");
    code.emit_u8(Opcode::Call, 0);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 3);
}

/// Builds `d = {}; for i in range(60): d[i] = [i]; return len(d)`.
fn dict_churn_program(vm: &mut Vm) -> CodeBuilder {
    let mut code = CodeBuilder::new();
    code.emit_u16(Opcode::BuildDict, 0);
    store_global(vm, &mut code, "d");
    load_global(vm, &mut code, "range");
    code.emit_const(Value::Int(60));
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::GetIter);
    let loop_start = code.current_offset();
    let exit = code.emit_jump(Opcode::ForIter);
    store_global(vm, &mut code, "i");
    load_global(vm, &mut code, "d");
    load_global(vm, &mut code, "i");
    load_global(vm, &mut code, "i");
    code.emit_u16(Opcode::BuildList, 1);
    code.emit(Opcode::SetIndex);
    code.emit_jump_to(Opcode::Jump, loop_start);
    code.patch_jump(exit);
    code.emit(Opcode::Pop);
    load_global(vm, &mut code, "len");
    load_global(vm, &mut code, "d");
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Return);
    code
}

#[test]
fn stress_collection_does_not_change_observable_results() {
    let (mut vm, _) = new_vm();
    let relaxed = dict_churn_program(&mut vm);
    assert_eq!(expect_int(run(&mut vm, relaxed)), 60);

    let (mut vm, _) = new_vm();
    let program = dict_churn_program(&mut vm);
    vm.set_gc_stress(true);
    assert_eq!(expect_int(run(&mut vm, program)), 60);
}

#[test]
fn heap_stats_break_down_by_variant() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(1));
    code.emit_u16(Opcode::BuildList, 1);
    store_global(&mut vm, &mut code, "xs");
    code.emit(Opcode::None);
    code.emit(Opcode::Return);
    run(&mut vm, code);
    let stats = vm.heap_stats();
    assert!(stats.objects_by_variant.get("list").copied().unwrap_or(0) >= 1);
    assert!(stats.interned_strings > 0);
    assert_eq!(stats.live_objects + stats.free_slots, stats.total_slots);
}

#[test]
fn dead_interned_strings_are_dropped() {
    let (mut vm, _) = new_vm();
    let before = vm.heap_stats().interned_strings;
    // Interned but never rooted anywhere.
    for i in 0..50 {
        let _ = vm.intern_string(&format!("transient-{i}"));
    }
    assert!(vm.heap_stats().interned_strings >= before + 50);
    vm.collect_garbage();
    let after = vm.heap_stats().interned_strings;
    assert!(
        after < before + 50,
        "transient strings should not survive: {before} -> {after}"
    );
}
