//! Built-in container contracts: dict round-trips, iterator parity, slicing,
//! membership, string methods, and constructors.

mod common;

use common::{expect_bool, expect_int, load_global, new_vm, run, store_global};
use kuroko::{CodeBuilder, Opcode, Value, Vm};
use pretty_assertions::assert_eq;

fn name(vm: &mut Vm, code: &mut CodeBuilder, text: &str) -> u16 {
    common::name_const(vm, code, text)
}

#[test]
fn dict_round_trips_through_items() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    // d = {'a': 1, 2: 'b'}
    let a = vm.intern_string("a");
    code.emit_const(a);
    code.emit_const(Value::Int(1));
    code.emit_const(Value::Int(2));
    let b = vm.intern_string("b");
    code.emit_const(b);
    code.emit_u16(Opcode::BuildDict, 2);
    store_global(&mut vm, &mut code, "d");
    // dict(d.items()) == d
    load_global(&mut vm, &mut code, "dict");
    load_global(&mut vm, &mut code, "d");
    let items = name(&mut vm, &mut code, "items");
    code.emit_u16(Opcode::GetAttr, items);
    code.emit_u8(Opcode::Call, 0);
    code.emit_u8(Opcode::Call, 1);
    load_global(&mut vm, &mut code, "d");
    code.emit(Opcode::Eq);
    code.emit(Opcode::Return);
    assert!(expect_bool(run(&mut vm, code)));
}

/// Emits `total = 0; for x in <iterable on stack>: total = total + x`.
fn emit_sum_loop(vm: &mut Vm, code: &mut CodeBuilder, total_name: &str) {
    code.emit_const(Value::Int(0));
    store_global(vm, code, total_name);
    code.emit(Opcode::GetIter);
    let loop_start = code.current_offset();
    let exit = code.emit_jump(Opcode::ForIter);
    load_global(vm, code, total_name);
    code.emit(Opcode::Add);
    store_global(vm, code, total_name);
    code.emit_jump_to(Opcode::Jump, loop_start);
    code.patch_jump(exit);
    code.emit(Opcode::Pop);
}

#[test]
fn iterating_an_iterator_visits_the_same_sequence() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    for i in [1, 2, 3, 4] {
        code.emit_const(Value::Int(i));
    }
    code.emit_u16(Opcode::BuildList, 4);
    store_global(&mut vm, &mut code, "seq");
    // Sum the list directly.
    load_global(&mut vm, &mut code, "seq");
    emit_sum_loop(&mut vm, &mut code, "direct");
    // Sum iter(seq).
    load_global(&mut vm, &mut code, "iter");
    load_global(&mut vm, &mut code, "seq");
    code.emit_u8(Opcode::Call, 1);
    emit_sum_loop(&mut vm, &mut code, "indirect");
    load_global(&mut vm, &mut code, "direct");
    load_global(&mut vm, &mut code, "indirect");
    code.emit(Opcode::Eq);
    code.emit(Opcode::Return);
    assert!(expect_bool(run(&mut vm, code)));
}

#[test]
fn list_slices_select_and_reverse() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    for i in 0..5 {
        code.emit_const(Value::Int(i));
    }
    code.emit_u16(Opcode::BuildList, 5);
    store_global(&mut vm, &mut code, "xs");
    // xs[1:4]
    load_global(&mut vm, &mut code, "xs");
    code.emit_const(Value::Int(1));
    code.emit_const(Value::Int(4));
    code.emit_u8(Opcode::BuildSlice, 2);
    code.emit(Opcode::GetIndex);
    code.emit(Opcode::Return);
    let window = run(&mut vm, code);
    assert_eq!(vm.repr_value(window).unwrap(), "[1, 2, 3]");

    // xs[::-1]
    let mut code = CodeBuilder::new();
    for i in 0..3 {
        code.emit_const(Value::Int(i));
    }
    code.emit_u16(Opcode::BuildList, 3);
    code.emit(Opcode::None);
    code.emit(Opcode::None);
    code.emit_const(Value::Int(-1));
    code.emit_u8(Opcode::BuildSlice, 3);
    code.emit(Opcode::GetIndex);
    code.emit(Opcode::Return);
    let reversed = run(&mut vm, code);
    assert_eq!(vm.repr_value(reversed).unwrap(), "[2, 1, 0]");
}

#[test]
fn string_slices_select_characters() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    let hello = vm.intern_string("hello");
    code.emit_const(hello);
    code.emit_const(Value::Int(1));
    code.emit_const(Value::Int(3));
    code.emit_u8(Opcode::BuildSlice, 2);
    code.emit(Opcode::GetIndex);
    code.emit(Opcode::Return);
    let result = run(&mut vm, code);
    assert_eq!(vm.str_value(result).unwrap(), "el");
}

#[test]
fn negative_indices_count_from_the_end() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    for i in [10, 20, 30] {
        code.emit_const(Value::Int(i));
    }
    code.emit_u16(Opcode::BuildList, 3);
    code.emit_const(Value::Int(-1));
    code.emit(Opcode::GetIndex);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 30);
}

#[test]
fn membership_checks_containers_and_strings() {
    let (mut vm, _) = new_vm();
    // 2 in [1, 2]
    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(2));
    code.emit_const(Value::Int(1));
    code.emit_const(Value::Int(2));
    code.emit_u16(Opcode::BuildList, 2);
    code.emit(Opcode::In);
    code.emit(Opcode::Return);
    assert!(expect_bool(run(&mut vm, code)));

    // 'ex' in 'text'
    let mut code = CodeBuilder::new();
    let ex = vm.intern_string("ex");
    code.emit_const(ex);
    let text = vm.intern_string("text");
    code.emit_const(text);
    code.emit(Opcode::In);
    code.emit(Opcode::Return);
    assert!(expect_bool(run(&mut vm, code)));

    // Dict membership is key membership.
    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(7));
    code.emit_const(Value::Int(7));
    let v = vm.intern_string("v");
    code.emit_const(v);
    code.emit_u16(Opcode::BuildDict, 1);
    code.emit(Opcode::In);
    code.emit(Opcode::Return);
    assert!(expect_bool(run(&mut vm, code)));
}

#[test]
fn string_methods_split_join_and_case() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    // '-'.join('a,b,c'.split(','))
    let dash = vm.intern_string("-");
    code.emit_const(dash);
    let join = name(&mut vm, &mut code, "join");
    code.emit_u16(Opcode::GetAttr, join);
    let csv = vm.intern_string("a,b,c");
    code.emit_const(csv);
    let split = name(&mut vm, &mut code, "split");
    code.emit_u16(Opcode::GetAttr, split);
    let comma = vm.intern_string(",");
    code.emit_const(comma);
    code.emit_u8(Opcode::Call, 1);
    code.emit_u8(Opcode::Call, 1);
    let upper = name(&mut vm, &mut code, "upper");
    code.emit_u16(Opcode::GetAttr, upper);
    code.emit_u8(Opcode::Call, 0);
    code.emit(Opcode::Return);
    let result = run(&mut vm, code);
    assert_eq!(vm.str_value(result).unwrap(), "A-B-C");
}

#[test]
fn tuple_concatenation_and_repr() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(1));
    code.emit_const(Value::Int(2));
    code.emit_u16(Opcode::BuildTuple, 2);
    code.emit_const(Value::Int(3));
    code.emit_u16(Opcode::BuildTuple, 1);
    code.emit(Opcode::Add);
    code.emit(Opcode::Return);
    let combined = run(&mut vm, code);
    assert_eq!(vm.repr_value(combined).unwrap(), "(1, 2, 3)");

    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(9));
    code.emit_u16(Opcode::BuildTuple, 1);
    code.emit(Opcode::Return);
    let single = run(&mut vm, code);
    assert_eq!(vm.repr_value(single).unwrap(), "(9,)");
}

#[test]
fn range_supports_len_membership_and_materialization() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    load_global(&mut vm, &mut code, "len");
    load_global(&mut vm, &mut code, "range");
    code.emit_const(Value::Int(10));
    code.emit_u8(Opcode::Call, 1);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 10);

    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(7));
    load_global(&mut vm, &mut code, "range");
    code.emit_const(Value::Int(0));
    code.emit_const(Value::Int(10));
    code.emit_u8(Opcode::Call, 2);
    code.emit(Opcode::In);
    code.emit(Opcode::Return);
    assert!(expect_bool(run(&mut vm, code)));

    let mut code = CodeBuilder::new();
    load_global(&mut vm, &mut code, "list");
    load_global(&mut vm, &mut code, "range");
    code.emit_const(Value::Int(3));
    code.emit_u8(Opcode::Call, 1);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Return);
    let materialized = run(&mut vm, code);
    assert_eq!(vm.repr_value(materialized).unwrap(), "[0, 1, 2]");
}

#[test]
fn bytes_construct_and_index() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    load_global(&mut vm, &mut code, "bytes");
    code.emit_const(Value::Int(65));
    code.emit_const(Value::Int(66));
    code.emit_u16(Opcode::BuildList, 2);
    code.emit_u8(Opcode::Call, 1);
    store_global(&mut vm, &mut code, "bs");
    load_global(&mut vm, &mut code, "bs");
    code.emit_const(Value::Int(0));
    code.emit(Opcode::GetIndex);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 65);
}

#[test]
fn conversions_between_builtin_types() {
    let (mut vm, _) = new_vm();
    // int('42') + len(str(100)) -> 45
    let mut code = CodeBuilder::new();
    load_global(&mut vm, &mut code, "int");
    let forty_two = vm.intern_string("42");
    code.emit_const(forty_two);
    code.emit_u8(Opcode::Call, 1);
    load_global(&mut vm, &mut code, "len");
    load_global(&mut vm, &mut code, "str");
    code.emit_const(Value::Int(100));
    code.emit_u8(Opcode::Call, 1);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Add);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 45);
}

#[test]
fn float_repr_keeps_the_decimal_point() {
    let (mut vm, _) = new_vm();
    assert_eq!(vm.repr_value(Value::Float(2.5)).unwrap(), "2.5");
    assert_eq!(vm.repr_value(Value::Float(1.0)).unwrap(), "1.0");
    assert_eq!(vm.repr_value(Value::Int(1)).unwrap(), "1");
}

#[test]
fn dict_update_merges_another_dict() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    // a = {1: 10}; a.update({2: 20}); return len(a)
    code.emit_const(Value::Int(1));
    code.emit_const(Value::Int(10));
    code.emit_u16(Opcode::BuildDict, 1);
    store_global(&mut vm, &mut code, "a");
    load_global(&mut vm, &mut code, "a");
    let update = name(&mut vm, &mut code, "update");
    code.emit_u16(Opcode::GetAttr, update);
    code.emit_const(Value::Int(2));
    code.emit_const(Value::Int(20));
    code.emit_u16(Opcode::BuildDict, 1);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Pop);
    load_global(&mut vm, &mut code, "len");
    load_global(&mut vm, &mut code, "a");
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 2);
}

#[test]
fn stack_shuffling_opcodes() {
    let (mut vm, _) = new_vm();
    // [a, b, c] rotated right once is [c, a, b]; subtracting the new top two
    // pins down the exact order.
    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(1));
    code.emit_const(Value::Int(2));
    code.emit_const(Value::Int(3));
    code.emit(Opcode::Rot3); // stack: 3 1 2
    code.emit(Opcode::Sub); // 1 - 2
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), -1);

    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(5));
    code.emit(Opcode::Dup);
    code.emit(Opcode::Mul);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 25);
}

#[test]
fn unary_operators() {
    let (mut vm, _) = new_vm();
    let cases: Vec<(Value, Opcode, Value)> = vec![
        (Value::Int(3), Opcode::Negate, Value::Int(-3)),
        (Value::Float(2.5), Opcode::Negate, Value::Float(-2.5)),
        (Value::Int(0), Opcode::Not, Value::Bool(true)),
        (Value::Bool(true), Opcode::Not, Value::Bool(false)),
        (Value::Int(0), Opcode::Invert, Value::Int(-1)),
    ];
    for (operand, op, expected) in cases {
        let mut code = CodeBuilder::new();
        code.emit_const(operand);
        code.emit(op);
        code.emit(Opcode::Return);
        let got = run(&mut vm, code);
        assert!(got.identical(expected), "{op:?} {operand:?} = {got:?}");
    }
}

#[test]
fn ord_and_chr_round_trip() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    load_global(&mut vm, &mut code, "ord");
    load_global(&mut vm, &mut code, "chr");
    code.emit_const(Value::Int(65));
    code.emit_u8(Opcode::Call, 1);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 65);
}
