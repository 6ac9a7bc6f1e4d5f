//! Callable object payloads: closures, natives, bound methods, upvalues, and
//! property descriptors.

use crate::{args::Args, exception::RunResult, heap::HeapId, value::Value, vm::Vm};

/// Signature shared by every native function. Arguments are a copied view of
/// the stack window; the originals stay on the stack (and thus GC-rooted)
/// until the call returns.
pub type NativeFn = fn(&mut Vm, Args) -> RunResult<Value>;

/// Behavior flags shared by closures and natives.
///
/// `is_dynamic_property` marks a function that attribute lookup calls with
/// the receiver instead of binding; `is_class_method` binds the class rather
/// than the instance; `is_static_method` suppresses binding entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionFlags {
    pub is_method: bool,
    pub is_class_method: bool,
    pub is_static_method: bool,
    pub is_dynamic_property: bool,
}

/// A callable formed from a code object and its captured upvalues.
#[derive(Debug)]
pub(crate) struct Closure {
    /// The immutable code object (a `HeapData::Code` slot).
    pub code: HeapId,
    /// Captured upvalue cells, in the order the code object's descriptors
    /// declare them.
    pub upvalues: Vec<HeapId>,
    /// Evaluated defaults for optional positional parameters, left to right.
    pub defaults: Vec<Value>,
    /// Evaluated defaults for keyword-only parameters, keyed by name.
    pub kw_defaults: Vec<(HeapId, Value)>,
    /// The globals table this function executes against (a module).
    pub globals: HeapId,
    /// Annotations dict, attached lazily on first `__annotations__` access
    /// (or replaced wholesale by assigning the attribute).
    pub annotations: Option<HeapId>,
    pub flags: FunctionFlags,
}

/// A host function exposed to managed code.
pub(crate) struct NativeFunction {
    pub name: HeapId,
    pub func: NativeFn,
    pub flags: FunctionFlags,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// A method paired with the receiver it was looked up on.
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}

/// Indirection cell letting an inner closure share a variable with its
/// enclosing scope.
///
/// Open upvalues record the stack *slot index* of the live variable; the
/// transition to `Closed` happens exactly once, when the owning slot is about
/// to leave scope. Because the slot is an index rather than a pointer, stack
/// reallocation never invalidates an open upvalue.
#[derive(Debug)]
pub(crate) enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A descriptor wrapping a getter (and optionally a setter). A property with
/// a setter is a data descriptor: it intercepts writes and takes priority
/// over instance fields on reads.
#[derive(Debug)]
pub(crate) struct Property {
    pub getter: Value,
    pub setter: Option<Value>,
}
