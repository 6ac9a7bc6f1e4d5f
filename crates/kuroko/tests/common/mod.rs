//! Shared helpers for driving the VM through assembled code objects.
#![expect(dead_code, reason = "each test binary uses a subset of the helpers")]

use std::{cell::RefCell, rc::Rc};

use kuroko::{CodeBuilder, ExcKind, NoopTracer, Opcode, PrintWriter, RunError, Value, Vm, VmOptions};

/// Print writer backed by a shared buffer, so tests keep a handle to the
/// output after the writer moves into the VM.
pub struct SharedPrint(pub Rc<RefCell<String>>);

impl PrintWriter for SharedPrint {
    fn write_str(&mut self, output: &str) {
        self.0.borrow_mut().push_str(output);
    }

    fn write_char(&mut self, c: char) {
        self.0.borrow_mut().push(c);
    }
}

pub fn new_vm() -> (Vm, Rc<RefCell<String>>) {
    let buffer = Rc::new(RefCell::new(String::new()));
    let vm = Vm::with_io(
        VmOptions::default(),
        Box::new(SharedPrint(Rc::clone(&buffer))),
        Box::new(NoopTracer),
    );
    (vm, buffer)
}

/// Adds an interned-name constant and returns its pool index.
pub fn name_const(vm: &mut Vm, builder: &mut CodeBuilder, name: &str) -> u16 {
    let value = vm.intern_string(name);
    builder.add_const(value)
}

pub fn load_global(vm: &mut Vm, builder: &mut CodeBuilder, name: &str) {
    let index = name_const(vm, builder, name);
    builder.emit_u16(Opcode::GetGlobal, index);
}

pub fn store_global(vm: &mut Vm, builder: &mut CodeBuilder, name: &str) {
    let index = name_const(vm, builder, name);
    builder.emit_u16(Opcode::SetGlobal, index);
}

/// Runs a module body that must complete without raising.
pub fn run(vm: &mut Vm, builder: CodeBuilder) -> Value {
    match vm.interpret(builder.build(), "__main__") {
        Ok(value) => value,
        Err(RunError::Raise(exc)) => {
            let rendered = vm.render_exception(exc);
            panic!("program raised unexpectedly:\n{rendered}");
        }
        Err(RunError::Internal(msg)) => panic!("internal VM error: {msg}"),
    }
}

/// Runs a module body that must raise, returning the exception instance.
pub fn run_err(vm: &mut Vm, builder: CodeBuilder) -> Value {
    match vm.interpret(builder.build(), "__main__") {
        Ok(value) => panic!("program unexpectedly succeeded with {value:?}"),
        Err(RunError::Raise(exc)) => exc,
        Err(RunError::Internal(msg)) => panic!("internal VM error: {msg}"),
    }
}

pub fn assert_raised(vm: &Vm, exc: Value, kind: ExcKind) {
    let class = vm.exception_class(kind);
    assert!(
        vm.is_instance_of(exc, class),
        "expected {kind:?}, raised exception is not an instance of it"
    );
}

pub fn expect_int(value: Value) -> i64 {
    match value {
        Value::Int(i) => i,
        other => panic!("expected int, got {other:?}"),
    }
}

pub fn expect_bool(value: Value) -> bool {
    match value {
        Value::Bool(b) => b,
        other => panic!("expected bool, got {other:?}"),
    }
}
