//! The class and descriptor protocol: instance fields, bound methods,
//! inheritance, dunder dispatch, properties, and subclassed built-ins.

mod common;

use common::{assert_raised, expect_bool, expect_int, load_global, name_const, new_vm, run, run_err, store_global};
use kuroko::{CodeBuilder, ExcKind, Opcode, Params, Value, Vm};
use pretty_assertions::assert_eq;

/// Builds a method code object with the given parameter names (receiver
/// included) from the instructions `emit` writes.
fn method_code(vm: &mut Vm, name: &str, params: &[&str], emit: impl FnOnce(&mut Vm, &mut CodeBuilder)) -> Value {
    let mut code = CodeBuilder::new();
    let names = params.iter().map(|p| vm.intern_name(p)).collect::<Vec<_>>();
    code.set_params(Params {
        required: names.len(),
        names,
        ..Params::default()
    });
    code.set_name(vm.intern_string(name));
    emit(vm, &mut code);
    vm.alloc_code_object(code.build())
}

/// Emits `class <name>` with the given methods, finalizes it, and stores it
/// in a global of the same name.
fn define_class(vm: &mut Vm, code: &mut CodeBuilder, name: &str, base: Option<&str>, methods: &[(&str, Value)]) {
    if let Some(base) = base {
        load_global(vm, code, base);
    }
    let name_idx = name_const(vm, code, name);
    code.emit_make_class(name_idx, u8::from(base.is_some()));
    for &(method_name, method) in methods {
        let method_const = code.add_const(method);
        code.emit_make_closure(method_const, 0);
        let method_name_idx = name_const(vm, code, method_name);
        code.emit_u16(Opcode::DefineMethod, method_name_idx);
    }
    code.emit(Opcode::FinalizeClass);
    store_global(vm, code, name);
}

#[test]
fn init_stores_instance_fields() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    let init = method_code(&mut vm, "__init__", &["self", "x"], |vm, code| {
        code.emit_u8(Opcode::GetLocal, 0);
        code.emit_u8(Opcode::GetLocal, 1);
        let x_name = name_const(vm, code, "x");
        code.emit_u16(Opcode::SetAttr, x_name);
        code.emit(Opcode::None);
        code.emit(Opcode::Return);
    });
    define_class(&mut vm, &mut code, "P", None, &[("__init__", init)]);
    load_global(&mut vm, &mut code, "P");
    code.emit_const(Value::Int(5));
    code.emit_u8(Opcode::Call, 1);
    let x_name = name_const(&mut vm, &mut code, "x");
    code.emit_u16(Opcode::GetAttr, x_name);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 5);
}

#[test]
fn methods_bind_their_receiver() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    let get = method_code(&mut vm, "get", &["self"], |vm, code| {
        code.emit_u8(Opcode::GetLocal, 0);
        let v_name = name_const(vm, code, "v");
        code.emit_u16(Opcode::GetAttr, v_name);
        code.emit(Opcode::Return);
    });
    define_class(&mut vm, &mut code, "C", None, &[("get", get)]);
    // c = C(); c.v = 3; return c.get()
    load_global(&mut vm, &mut code, "C");
    code.emit_u8(Opcode::Call, 0);
    store_global(&mut vm, &mut code, "c");
    load_global(&mut vm, &mut code, "c");
    code.emit_const(Value::Int(3));
    let v_name = name_const(&mut vm, &mut code, "v");
    code.emit_u16(Opcode::SetAttr, v_name);
    load_global(&mut vm, &mut code, "c");
    let get_name = name_const(&mut vm, &mut code, "get");
    code.emit_u16(Opcode::GetAttr, get_name);
    code.emit_u8(Opcode::Call, 0);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 3);
}

#[test]
fn methods_resolve_along_the_base_chain() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    let m = method_code(&mut vm, "m", &["self"], |_, code| {
        code.emit_const(Value::Int(1));
        code.emit(Opcode::Return);
    });
    define_class(&mut vm, &mut code, "A", None, &[("m", m)]);
    define_class(&mut vm, &mut code, "B", Some("A"), &[]);
    load_global(&mut vm, &mut code, "B");
    code.emit_u8(Opcode::Call, 0);
    let m_name = name_const(&mut vm, &mut code, "m");
    code.emit_u16(Opcode::GetAttr, m_name);
    code.emit_u8(Opcode::Call, 0);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 1);
}

/// `Num` wraps an int and implements `__add__`/`__radd__` asymmetrically so
/// the test can tell which side dispatched.
fn define_num(vm: &mut Vm, code: &mut CodeBuilder) {
    let init = method_code(vm, "__init__", &["self", "v"], |vm, code| {
        code.emit_u8(Opcode::GetLocal, 0);
        code.emit_u8(Opcode::GetLocal, 1);
        let v_name = name_const(vm, code, "v");
        code.emit_u16(Opcode::SetAttr, v_name);
        code.emit(Opcode::None);
        code.emit(Opcode::Return);
    });
    let add = method_code(vm, "__add__", &["self", "other"], |vm, code| {
        code.emit_u8(Opcode::GetLocal, 0);
        let v_name = name_const(vm, code, "v");
        code.emit_u16(Opcode::GetAttr, v_name);
        code.emit_u8(Opcode::GetLocal, 1);
        code.emit(Opcode::Add);
        code.emit(Opcode::Return);
    });
    let radd = method_code(vm, "__radd__", &["self", "other"], |vm, code| {
        code.emit_u8(Opcode::GetLocal, 0);
        let v_name = name_const(vm, code, "v");
        code.emit_u16(Opcode::GetAttr, v_name);
        code.emit_u8(Opcode::GetLocal, 1);
        code.emit(Opcode::Sub);
        code.emit(Opcode::Return);
    });
    define_class(vm, code, "Num", None, &[("__init__", init), ("__add__", add), ("__radd__", radd)]);
}

#[test]
fn left_operand_dunder_dispatches_first() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    define_num(&mut vm, &mut code);
    load_global(&mut vm, &mut code, "Num");
    code.emit_const(Value::Int(40));
    code.emit_u8(Opcode::Call, 1);
    code.emit_const(Value::Int(2));
    code.emit(Opcode::Add);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 42);
}

#[test]
fn reflected_dunder_handles_the_right_operand() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    define_num(&mut vm, &mut code);
    // 2 + Num(40): int has no __add__ for Num, so __radd__ runs (40 - 2).
    code.emit_const(Value::Int(2));
    load_global(&mut vm, &mut code, "Num");
    code.emit_const(Value::Int(40));
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Add);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 38);
}

#[test]
fn not_implemented_defers_to_the_reflected_side() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    // Decliner.__add__ returns NotImplemented; Catcher.__radd__ handles it.
    let declining_add = method_code(&mut vm, "__add__", &["self", "other"], |vm, code| {
        let ni = name_const(vm, code, "NotImplemented");
        code.emit_u16(Opcode::GetGlobal, ni);
        code.emit(Opcode::Return);
    });
    define_class(&mut vm, &mut code, "Decliner", None, &[("__add__", declining_add)]);
    let catching_radd = method_code(&mut vm, "__radd__", &["self", "other"], |_, code| {
        code.emit_const(Value::Int(123));
        code.emit(Opcode::Return);
    });
    define_class(&mut vm, &mut code, "Catcher", None, &[("__radd__", catching_radd)]);
    load_global(&mut vm, &mut code, "Decliner");
    code.emit_u8(Opcode::Call, 0);
    load_global(&mut vm, &mut code, "Catcher");
    code.emit_u8(Opcode::Call, 0);
    code.emit(Opcode::Add);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 123);
}

#[test]
fn property_reads_through_its_getter() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    let getter = method_code(&mut vm, "p", &["self"], |_, code| {
        code.emit_const(Value::Int(42));
        code.emit(Opcode::Return);
    });
    // class T: p = property(getter)
    let t_name = name_const(&mut vm, &mut code, "T");
    code.emit_make_class(t_name, 0);
    load_global(&mut vm, &mut code, "property");
    let getter_const = code.add_const(getter);
    code.emit_make_closure(getter_const, 0);
    code.emit_u8(Opcode::Call, 1);
    let p_name = name_const(&mut vm, &mut code, "p");
    code.emit_u16(Opcode::DefineMethod, p_name);
    code.emit(Opcode::FinalizeClass);
    store_global(&mut vm, &mut code, "T");
    load_global(&mut vm, &mut code, "T");
    code.emit_u8(Opcode::Call, 0);
    code.emit_u16(Opcode::GetAttr, p_name);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 42);
}

#[test]
fn data_descriptor_intercepts_writes() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    let getter = method_code(&mut vm, "p", &["self"], |vm, code| {
        code.emit_u8(Opcode::GetLocal, 0);
        let backing = name_const(vm, code, "_p");
        code.emit_u16(Opcode::GetAttr, backing);
        code.emit(Opcode::Return);
    });
    let setter = method_code(&mut vm, "p", &["self", "value"], |vm, code| {
        code.emit_u8(Opcode::GetLocal, 0);
        code.emit_u8(Opcode::GetLocal, 1);
        let backing = name_const(vm, code, "_p");
        code.emit_u16(Opcode::SetAttr, backing);
        code.emit(Opcode::None);
        code.emit(Opcode::Return);
    });
    // class T: p = property(getter, setter)
    let t_name = name_const(&mut vm, &mut code, "T");
    code.emit_make_class(t_name, 0);
    load_global(&mut vm, &mut code, "property");
    let getter_const = code.add_const(getter);
    code.emit_make_closure(getter_const, 0);
    let setter_const = code.add_const(setter);
    code.emit_make_closure(setter_const, 0);
    code.emit_u8(Opcode::Call, 2);
    let p_name = name_const(&mut vm, &mut code, "p");
    code.emit_u16(Opcode::DefineMethod, p_name);
    code.emit(Opcode::FinalizeClass);
    store_global(&mut vm, &mut code, "T");
    // t = T(); t.p = 9; return t.p  (reads the intercepted write back)
    load_global(&mut vm, &mut code, "T");
    code.emit_u8(Opcode::Call, 0);
    store_global(&mut vm, &mut code, "t");
    load_global(&mut vm, &mut code, "t");
    code.emit_const(Value::Int(9));
    code.emit_u16(Opcode::SetAttr, p_name);
    load_global(&mut vm, &mut code, "t");
    code.emit_u16(Opcode::GetAttr, p_name);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 9);
}

#[test]
fn getattr_hook_catches_missing_names() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    let hook = method_code(&mut vm, "__getattr__", &["self", "name"], |_, code| {
        code.emit_u8(Opcode::GetLocal, 1);
        code.emit(Opcode::Return);
    });
    define_class(&mut vm, &mut code, "G", None, &[("__getattr__", hook)]);
    load_global(&mut vm, &mut code, "G");
    code.emit_u8(Opcode::Call, 0);
    let whatever = name_const(&mut vm, &mut code, "whatever");
    code.emit_u16(Opcode::GetAttr, whatever);
    code.emit(Opcode::Return);
    let result = run(&mut vm, code);
    assert_eq!(vm.str_value(result).unwrap(), "whatever");
}

#[test]
fn missing_attribute_without_hook_raises() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    define_class(&mut vm, &mut code, "Bare", None, &[]);
    load_global(&mut vm, &mut code, "Bare");
    code.emit_u8(Opcode::Call, 0);
    let nope = name_const(&mut vm, &mut code, "nope");
    code.emit_u16(Opcode::GetAttr, nope);
    code.emit(Opcode::Return);
    let exc = run_err(&mut vm, code);
    assert_raised(&vm, exc, ExcKind::AttributeError);
}

#[test]
fn no_inherit_classes_reject_subclassing() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    load_global(&mut vm, &mut code, "int");
    let x_name = name_const(&mut vm, &mut code, "X");
    code.emit_make_class(x_name, 1);
    code.emit(Opcode::FinalizeClass);
    code.emit(Opcode::Return);
    let exc = run_err(&mut vm, code);
    assert_raised(&vm, exc, ExcKind::TypeError);
}

#[test]
fn subclassed_list_carries_a_native_payload() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    define_class(&mut vm, &mut code, "MyList", Some("list"), &[]);
    // m = MyList(); m.append(1); m.append(2); return len(m)
    load_global(&mut vm, &mut code, "MyList");
    code.emit_u8(Opcode::Call, 0);
    store_global(&mut vm, &mut code, "m");
    for i in [1, 2] {
        load_global(&mut vm, &mut code, "m");
        let append_name = name_const(&mut vm, &mut code, "append");
        code.emit_u16(Opcode::GetAttr, append_name);
        code.emit_const(Value::Int(i));
        code.emit_u8(Opcode::Call, 1);
        code.emit(Opcode::Pop);
    }
    load_global(&mut vm, &mut code, "len");
    load_global(&mut vm, &mut code, "m");
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), 2);

    // And it still answers isinstance against the built-in base.
    let mut code = CodeBuilder::new();
    load_global(&mut vm, &mut code, "isinstance");
    load_global(&mut vm, &mut code, "m");
    load_global(&mut vm, &mut code, "list");
    code.emit_u8(Opcode::Call, 2);
    code.emit(Opcode::Return);
    let exc = run_err(&mut vm, code);
    // `m` was a global of the previous module body, not this one.
    assert_raised(&vm, exc, ExcKind::NameError);
}

#[test]
fn class_attribute_assignment_refreshes_dunder_slots() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    define_class(&mut vm, &mut code, "D", None, &[]);
    // D.__repr__ = lambda self: 'custom'
    let custom_repr = method_code(&mut vm, "__repr__", &["self"], |vm, code| {
        let text = vm.intern_string("custom");
        code.emit_const(text);
        code.emit(Opcode::Return);
    });
    load_global(&mut vm, &mut code, "D");
    let repr_const = code.add_const(custom_repr);
    code.emit_make_closure(repr_const, 0);
    let repr_name = name_const(&mut vm, &mut code, "__repr__");
    code.emit_u16(Opcode::SetAttr, repr_name);
    // return repr(D())
    load_global(&mut vm, &mut code, "repr");
    load_global(&mut vm, &mut code, "D");
    code.emit_u8(Opcode::Call, 0);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Return);
    let result = run(&mut vm, code);
    assert_eq!(vm.str_value(result).unwrap(), "custom");
}

#[test]
fn everything_is_an_object_instance() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    load_global(&mut vm, &mut code, "isinstance");
    code.emit_const(Value::Int(5));
    load_global(&mut vm, &mut code, "object");
    code.emit_u8(Opcode::Call, 2);
    code.emit(Opcode::Return);
    assert!(expect_bool(run(&mut vm, code)));
}

#[test]
fn recursive_list_repr_prints_the_placeholder_once() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    // xs = []; xs.append(xs); return xs
    code.emit_u16(Opcode::BuildList, 0);
    store_global(&mut vm, &mut code, "xs");
    load_global(&mut vm, &mut code, "xs");
    let append_name = name_const(&mut vm, &mut code, "append");
    code.emit_u16(Opcode::GetAttr, append_name);
    load_global(&mut vm, &mut code, "xs");
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Pop);
    load_global(&mut vm, &mut code, "xs");
    code.emit(Opcode::Return);
    let xs = run(&mut vm, code);
    assert_eq!(vm.repr_value(xs).unwrap(), "[[...]]");
}
