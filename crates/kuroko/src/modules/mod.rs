//! Native module registry.
//!
//! `import` resolves against already-loaded modules first, then against this
//! registry of native initializers. Searching the file system for managed
//! source is the embedding host's business; the runtime only creates module
//! instances and links `__builtins__` into them.

use indexmap::IndexMap;

use crate::{exception::RunResult, heap::HeapId, value::Value, vm::Vm};

/// Initializer for a native module: builds the module instance and returns
/// its heap id.
pub type ModuleInit = fn(&mut Vm) -> RunResult<HeapId>;

/// Registers the modules every VM ships with.
pub(crate) fn register_defaults(registry: &mut IndexMap<&'static str, ModuleInit>) {
    registry.insert("kuroko", kuroko_module);
}

/// The `kuroko` module: interpreter introspection for managed code.
fn kuroko_module(vm: &mut Vm) -> RunResult<HeapId> {
    let module = vm.make_module("kuroko");
    let version = Value::Object(vm.intern(env!("CARGO_PKG_VERSION")));
    vm.attach_named_value(module, "version", version);
    let argv = vm.alloc_list(Vec::new());
    vm.attach_named_value(module, "argv", argv);
    let module_paths = vm.alloc_list(Vec::new());
    vm.attach_named_value(module, "module_paths", module_paths);
    Ok(module)
}
