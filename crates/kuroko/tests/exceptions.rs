//! Raising, handler matching, nested unwinds, context managers, and
//! traceback rendering.

mod common;

use common::{assert_raised, expect_bool, expect_int, load_global, name_const, new_vm, run, run_err, store_global};
use kuroko::{CodeBuilder, ExcKind, Opcode, Params, Value, Vm};
use pretty_assertions::assert_eq;

#[test]
fn zero_division_is_catchable() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    let handler = code.emit_jump(Opcode::PushTry);
    code.emit_const(Value::Int(1));
    code.emit_const(Value::Int(0));
    code.emit(Opcode::Div);
    code.emit(Opcode::Pop);
    code.emit(Opcode::PopTry);
    let done = code.emit_jump(Opcode::Jump);
    code.patch_jump(handler);
    code.adjust_stack_depth(1);
    code.emit(Opcode::Pop); // discard the exception
    code.emit_const(Value::Int(-1));
    code.emit(Opcode::Return);
    code.patch_jump(done);
    code.emit_const(Value::Int(0));
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), -1);
}

#[test]
fn builtin_container_errors_have_the_right_kinds() {
    let (mut vm, _) = new_vm();
    // [1][5] -> IndexError
    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(1));
    code.emit_u16(Opcode::BuildList, 1);
    code.emit_const(Value::Int(5));
    code.emit(Opcode::GetIndex);
    code.emit(Opcode::Return);
    let exc = run_err(&mut vm, code);
    assert_raised(&vm, exc, ExcKind::IndexError);

    // {}['k'] -> KeyError carrying the repr of the key
    let mut code = CodeBuilder::new();
    code.emit_u16(Opcode::BuildDict, 0);
    let key = vm.intern_string("k");
    code.emit_const(key);
    code.emit(Opcode::GetIndex);
    code.emit(Opcode::Return);
    let exc = run_err(&mut vm, code);
    assert_raised(&vm, exc, ExcKind::KeyError);
    assert_eq!(vm.exception_message(exc).as_deref(), Some("'k'"));
}

#[test]
fn handlers_nest_and_reraise_propagates_outward() {
    let (mut vm, output) = new_vm();
    let mut code = CodeBuilder::new();
    // try:
    //     try: raise ValueError('inner')
    //     except: print('caught'); raise
    // except: print('outer')
    let outer = code.emit_jump(Opcode::PushTry);
    let inner = code.emit_jump(Opcode::PushTry);
    load_global(&mut vm, &mut code, "ValueError");
    let inner_msg = vm.intern_string("inner");
    code.emit_const(inner_msg);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Raise);
    code.emit(Opcode::PopTry);
    let inner_done = code.emit_jump(Opcode::Jump);
    code.patch_jump(inner);
    code.adjust_stack_depth(1);
    load_global(&mut vm, &mut code, "print");
    let caught = vm.intern_string("caught");
    code.emit_const(caught);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Pop);
    code.emit(Opcode::Raise); // re-raise the bound exception
    code.patch_jump(inner_done);
    code.emit(Opcode::PopTry);
    let outer_done = code.emit_jump(Opcode::Jump);
    code.patch_jump(outer);
    code.adjust_stack_depth(1);
    code.emit(Opcode::Pop);
    load_global(&mut vm, &mut code, "print");
    let outer_msg = vm.intern_string("outer");
    code.emit_const(outer_msg);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Pop);
    code.patch_jump(outer_done);
    code.emit(Opcode::None);
    code.emit(Opcode::Return);
    run(&mut vm, code);
    assert_eq!(output.borrow().as_str(), "caught\nouter\n");
}

#[test]
fn raising_a_class_instantiates_it() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    load_global(&mut vm, &mut code, "TypeError");
    code.emit(Opcode::Raise);
    code.emit(Opcode::None);
    code.emit(Opcode::Return);
    let exc = run_err(&mut vm, code);
    assert_raised(&vm, exc, ExcKind::TypeError);
}

#[test]
fn raising_a_non_exception_is_a_type_error() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    code.emit_const(Value::Int(3));
    code.emit(Opcode::Raise);
    code.emit(Opcode::None);
    code.emit(Opcode::Return);
    let exc = run_err(&mut vm, code);
    assert_raised(&vm, exc, ExcKind::TypeError);
}

#[test]
fn pop_try_retires_its_handler() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    // The handler is discarded before the raise, so the exception escapes.
    let handler = code.emit_jump(Opcode::PushTry);
    code.emit(Opcode::PopTry);
    load_global(&mut vm, &mut code, "ValueError");
    code.emit_u8(Opcode::Call, 0);
    code.emit(Opcode::Raise);
    code.patch_jump(handler);
    code.adjust_stack_depth(1);
    code.emit(Opcode::Pop);
    code.emit(Opcode::None);
    code.emit(Opcode::Return);
    let exc = run_err(&mut vm, code);
    assert_raised(&vm, exc, ExcKind::ValueError);
}

/// Defines `class CM` whose `__exit__` records itself in the global
/// `closed`.
fn define_cm(vm: &mut Vm, code: &mut CodeBuilder) {
    let mut enter = CodeBuilder::new();
    enter.set_params(Params {
        names: vec![vm.intern_name("self")],
        required: 1,
        ..Params::default()
    });
    enter.set_name(vm.intern_string("__enter__"));
    enter.emit_const(Value::Int(1));
    enter.emit(Opcode::Return);
    let enter = vm.alloc_code_object(enter.build());

    let mut exit = CodeBuilder::new();
    exit.set_params(Params {
        names: vec![vm.intern_name("self")],
        required: 1,
        collect_args: true,
        ..Params::default()
    });
    exit.set_name(vm.intern_string("__exit__"));
    exit.emit(Opcode::True);
    let closed = vm.intern_string("closed");
    let closed_const = exit.add_const(closed);
    exit.emit_u16(Opcode::SetGlobal, closed_const);
    exit.emit(Opcode::None);
    exit.emit(Opcode::Return);
    let exit = vm.alloc_code_object(exit.build());

    let cm_name = name_const(vm, code, "CM");
    code.emit_make_class(cm_name, 0);
    let enter_const = code.add_const(enter);
    code.emit_make_closure(enter_const, 0);
    let enter_name = name_const(vm, code, "__enter__");
    code.emit_u16(Opcode::DefineMethod, enter_name);
    let exit_const = code.add_const(exit);
    code.emit_make_closure(exit_const, 0);
    let exit_name = name_const(vm, code, "__exit__");
    code.emit_u16(Opcode::DefineMethod, exit_name);
    code.emit(Opcode::FinalizeClass);
    store_global(vm, code, "CM");
}

#[test]
fn with_block_runs_exit_on_normal_completion() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    define_cm(&mut vm, &mut code);
    code.emit(Opcode::False);
    store_global(&mut vm, &mut code, "closed");
    // with CM(): pass
    load_global(&mut vm, &mut code, "CM");
    code.emit_u8(Opcode::Call, 0);
    let cleanup = code.emit_jump(Opcode::PushWith);
    code.emit(Opcode::Pop); // discard the __enter__ result
    code.patch_jump(cleanup);
    code.emit(Opcode::PopWith);
    load_global(&mut vm, &mut code, "closed");
    code.emit(Opcode::Return);
    assert!(expect_bool(run(&mut vm, code)));
}

#[test]
fn with_block_runs_exit_during_unwinding() {
    let (mut vm, _) = new_vm();
    let mut code = CodeBuilder::new();
    define_cm(&mut vm, &mut code);
    code.emit(Opcode::False);
    store_global(&mut vm, &mut code, "closed");
    // try:
    //     with CM(): raise ValueError('boom')
    // except ValueError: pass
    // return closed
    let handler = code.emit_jump(Opcode::PushTry);
    load_global(&mut vm, &mut code, "CM");
    code.emit_u8(Opcode::Call, 0);
    let cleanup = code.emit_jump(Opcode::PushWith);
    code.emit(Opcode::Pop);
    load_global(&mut vm, &mut code, "ValueError");
    let boom = vm.intern_string("boom");
    code.emit_const(boom);
    code.emit_u8(Opcode::Call, 1);
    code.emit(Opcode::Raise);
    code.patch_jump(cleanup);
    code.emit(Opcode::PopWith);
    code.emit(Opcode::PopTry);
    let done = code.emit_jump(Opcode::Jump);
    code.patch_jump(handler);
    code.adjust_stack_depth(1);
    code.emit(Opcode::Pop);
    code.patch_jump(done);
    load_global(&mut vm, &mut code, "closed");
    code.emit(Opcode::Return);
    assert!(expect_bool(run(&mut vm, code)));
}

#[test]
fn unhandled_exceptions_render_a_traceback() {
    let (mut vm, _) = new_vm();
    // def boom(): raise ValueError('deep')
    let mut fn_code = CodeBuilder::new();
    fn_code.set_name(vm.intern_string("boom"));
    fn_code.set_filename(vm.intern_string("test.krk"));
    fn_code.set_line(3);
    let ve_name = name_const(&mut vm, &mut fn_code, "ValueError");
    fn_code.emit_u16(Opcode::GetGlobal, ve_name);
    let deep = vm.intern_string("deep");
    fn_code.emit_const(deep);
    fn_code.emit_u8(Opcode::Call, 1);
    fn_code.emit(Opcode::Raise);
    fn_code.emit(Opcode::None);
    fn_code.emit(Opcode::Return);
    let boom = vm.alloc_code_object(fn_code.build());

    let mut code = CodeBuilder::new();
    code.set_name(vm.intern_string("<module>"));
    code.set_filename(vm.intern_string("test.krk"));
    code.set_line(1);
    let boom_const = code.add_const(boom);
    code.emit_make_closure(boom_const, 0);
    store_global(&mut vm, &mut code, "boom");
    load_global(&mut vm, &mut code, "boom");
    code.emit_u8(Opcode::Call, 0);
    code.emit(Opcode::Return);
    let exc = run_err(&mut vm, code);
    assert!(vm.has_exception(), "unhandled exception must be parked on the thread");
    let parked = vm.take_exception().unwrap();
    assert!(parked.identical(exc));

    let rendered = vm.render_exception(exc);
    assert!(rendered.starts_with("Traceback (most recent call last):"), "{rendered}");
    assert!(rendered.contains("in boom"), "{rendered}");
    assert!(rendered.contains("test.krk"), "{rendered}");
    assert!(rendered.ends_with("ValueError: deep"), "{rendered}");
}

#[test]
fn handler_scoped_to_its_own_frame() {
    let (mut vm, _) = new_vm();
    // def safe(): try: return risky() ... except ValueError: return -1
    // def risky(): raise ValueError()
    let mut risky = CodeBuilder::new();
    risky.set_name(vm.intern_string("risky"));
    let ve = name_const(&mut vm, &mut risky, "ValueError");
    risky.emit_u16(Opcode::GetGlobal, ve);
    risky.emit_u8(Opcode::Call, 0);
    risky.emit(Opcode::Raise);
    risky.emit(Opcode::None);
    risky.emit(Opcode::Return);
    let risky = vm.alloc_code_object(risky.build());

    let mut safe = CodeBuilder::new();
    safe.set_name(vm.intern_string("safe"));
    let handler = safe.emit_jump(Opcode::PushTry);
    let risky_name = name_const(&mut vm, &mut safe, "risky");
    safe.emit_u16(Opcode::GetGlobal, risky_name);
    safe.emit_u8(Opcode::Call, 0);
    safe.emit(Opcode::PopTry);
    safe.emit(Opcode::Return);
    safe.patch_jump(handler);
    safe.adjust_stack_depth(1);
    safe.emit(Opcode::Pop);
    safe.emit_const(Value::Int(-1));
    safe.emit(Opcode::Return);
    let safe = vm.alloc_code_object(safe.build());

    let mut code = CodeBuilder::new();
    let risky_const = code.add_const(risky);
    code.emit_make_closure(risky_const, 0);
    store_global(&mut vm, &mut code, "risky");
    let safe_const = code.add_const(safe);
    code.emit_make_closure(safe_const, 0);
    store_global(&mut vm, &mut code, "safe");
    load_global(&mut vm, &mut code, "safe");
    code.emit_u8(Opcode::Call, 0);
    code.emit(Opcode::Return);
    assert_eq!(expect_int(run(&mut vm, code)), -1);
}
