//! The virtual machine.
//!
//! `Vm` owns everything: the heap, the intern table, the built-in classes and
//! exception classes, the modules table, and the (single) thread state. The
//! dispatch loop in `run_until` executes the topmost frame's bytecode until
//! the frame stack drops back to the caller's depth, using a locally cached
//! code handle so operand fetches never borrow the arena.

mod attr;
mod binary;
mod call;
mod compare;
pub(crate) mod exceptions;

use std::{
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use indexmap::IndexMap;
use strum::{EnumCount, VariantArray};

use crate::{
    bytecode::{CodeObject, Opcode},
    config::VmOptions,
    exception::{ExcKind, RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    intern::{SpecialName, SpecialNames, Strings},
    io::{PrintWriter, StdPrint},
    modules::{self, ModuleInit},
    table::Table,
    tracer::{NoopTracer, VmTracer},
    types::{
        BinaryOp, ClassObject, Closure, Instance, IterState, List, Module, NativePayload, SubclassEntry, Upvalue,
        class::finalize_class,
        dict::dict_table,
        list::list_items,
        str::repr_str,
        tuple::tuple_items,
    },
    value::Value,
};

pub use call::CallOutcome;

/// Heap ids of the built-in classes, kept rooted for the VM's lifetime.
#[derive(Debug)]
pub(crate) struct CoreClasses {
    pub object_: HeapId,
    pub type_: HeapId,
    pub none_: HeapId,
    pub notimplemented: HeapId,
    pub bool_: HeapId,
    pub int_: HeapId,
    pub float_: HeapId,
    pub str_: HeapId,
    pub bytes: HeapId,
    pub tuple: HeapId,
    pub list: HeapId,
    pub dict: HeapId,
    pub function: HeapId,
    pub bound_method: HeapId,
    pub native: HeapId,
    pub module: HeapId,
    pub code: HeapId,
    pub property: HeapId,
    pub slice: HeapId,
    pub range: HeapId,
    pub iterator: HeapId,
}

impl CoreClasses {
    fn all(&self) -> [HeapId; 21] {
        [
            self.object_,
            self.type_,
            self.none_,
            self.notimplemented,
            self.bool_,
            self.int_,
            self.float_,
            self.str_,
            self.bytes,
            self.tuple,
            self.list,
            self.dict,
            self.function,
            self.bound_method,
            self.native,
            self.module,
            self.code,
            self.property,
            self.slice,
            self.range,
            self.iterator,
        ]
    }
}

/// Heap ids of the built-in exception classes, indexed by `ExcKind`.
#[derive(Debug)]
pub(crate) struct CoreExceptions {
    ids: Vec<HeapId>,
}

impl CoreExceptions {
    #[must_use]
    pub fn get(&self, kind: ExcKind) -> HeapId {
        self.ids[kind as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.ids.iter().copied()
    }
}

/// One active call.
#[derive(Debug)]
pub(crate) struct CallFrame {
    /// The invoked closure.
    pub closure: HeapId,
    /// Owned handle to the closure's code; operand fetches go through this
    /// rather than the heap.
    pub code: Rc<CodeObject>,
    pub ip: usize,
    /// Stack slot of local 0.
    pub base: usize,
    /// Stack slot the return value lands in (the callable's slot).
    pub out: usize,
    /// Globals table (a module) for this frame.
    pub globals: HeapId,
    /// Active exception handlers and with-block cleanups, innermost last.
    pub try_stack: Vec<TryBlock>,
    /// For `__init__` frames: the instance to produce instead of the return
    /// value.
    pub init_instance: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TryBlock {
    pub handler_ip: usize,
    pub stack_depth: usize,
    pub kind: TryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TryKind {
    Handler,
    With,
}

/// Per-thread interpreter state: value stack, frame stack, upvalue list,
/// scratch shield, and the in-flight exception slot.
#[derive(Debug)]
pub(crate) struct ThreadState {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Open upvalues, sorted by descending stack slot: capture is a linear
    /// scan, close-above-a-slot pops from the front.
    pub open_upvalues: Vec<HeapId>,
    /// Unhandled exception parked for the host.
    pub current_exception: Option<Value>,
    /// Values shielded from collection during native construction sequences.
    pub scratch: Vec<Value>,
    /// Set externally to interrupt the dispatch loop with KeyboardInterrupt.
    pub signal: Arc<AtomicBool>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            current_exception: None,
            scratch: Vec::new(),
            signal: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Locally cached frame state for the dispatch loop. The `Rc` clone means
/// operand fetches read owned memory, independent of any heap borrow.
struct CachedFrame {
    code: Rc<CodeObject>,
    ip: usize,
    base: usize,
}

macro_rules! fetch_byte {
    ($cached:expr) => {{
        let byte = $cached.code.bytecode()[$cached.ip];
        $cached.ip += 1;
        byte
    }};
}

macro_rules! fetch_u16 {
    ($cached:expr) => {{
        let hi = $cached.code.bytecode()[$cached.ip];
        let lo = $cached.code.bytecode()[$cached.ip + 1];
        $cached.ip += 2;
        u16::from_be_bytes([hi, lo])
    }};
}

macro_rules! fetch_i16 {
    ($cached:expr) => {{
        let hi = $cached.code.bytecode()[$cached.ip];
        let lo = $cached.code.bytecode()[$cached.ip + 1];
        $cached.ip += 2;
        i16::from_be_bytes([hi, lo])
    }};
}

/// Evaluates a fallible operation inside the dispatch loop. On error, runs
/// the unwinder; if a handler catches, reloads the cached frame and resumes
/// the loop, otherwise propagates out of `run_until`.
macro_rules! vm_try {
    ($self:expr, $cached:ident, $exit_depth:expr, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => {
                $self.handle_unwind(err, $exit_depth)?;
                $cached = $self.cached_frame();
                continue;
            }
        }
    };
}

/// The Kuroko virtual machine.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) strings: Strings,
    pub(crate) names: SpecialNames,
    pub(crate) classes: CoreClasses,
    pub(crate) excs: CoreExceptions,
    /// Loaded modules, keyed by name string.
    pub(crate) modules: Table,
    /// The `__builtins__` module instance.
    pub(crate) builtins: HeapId,
    pub(crate) registry: IndexMap<&'static str, ModuleInit>,
    pub(crate) thread: ThreadState,
    pub(crate) options: VmOptions,
    pub(crate) print: Box<dyn PrintWriter>,
    pub(crate) tracer: Box<dyn VmTracer>,
    next_class_uid: u64,
    /// Byte offset of the instruction currently executing in the top frame,
    /// for precise traceback capture.
    pub(crate) last_op_ip: usize,
}

impl Vm {
    /// Builds a VM with default print and tracing sinks.
    #[must_use]
    pub fn new(options: VmOptions) -> Self {
        Self::with_io(options, Box::new(StdPrint::default()), Box::new(NoopTracer))
    }

    /// Builds a VM with explicit print and tracer sinks.
    #[must_use]
    pub fn with_io(options: VmOptions, print: Box<dyn PrintWriter>, tracer: Box<dyn VmTracer>) -> Self {
        let mut heap = Heap::new(options.gc_stress);
        // Bootstrap allocations cross-reference heavily; collection stays
        // deferred until the roots below are registered on the Vm.
        heap.pause();
        let mut strings = Strings::new();
        let names = SpecialNames::intern_all(&mut strings, &mut heap);

        let mut uid = 0u64;
        let mut class = |heap: &mut Heap, strings: &mut Strings, name: &str, base: Option<HeapId>| {
            uid += 1;
            let name_id = strings.intern(heap, name);
            heap.allocate(HeapData::Class(ClassObject::new(name_id, base, uid)))
        };

        let object_ = class(&mut heap, &mut strings, "object", None);
        let classes = CoreClasses {
            object_,
            type_: class(&mut heap, &mut strings, "type", Some(object_)),
            none_: class(&mut heap, &mut strings, "NoneType", Some(object_)),
            notimplemented: class(&mut heap, &mut strings, "NotImplementedType", Some(object_)),
            bool_: class(&mut heap, &mut strings, "bool", Some(object_)),
            int_: class(&mut heap, &mut strings, "int", Some(object_)),
            float_: class(&mut heap, &mut strings, "float", Some(object_)),
            str_: class(&mut heap, &mut strings, "str", Some(object_)),
            bytes: class(&mut heap, &mut strings, "bytes", Some(object_)),
            tuple: class(&mut heap, &mut strings, "tuple", Some(object_)),
            list: class(&mut heap, &mut strings, "list", Some(object_)),
            dict: class(&mut heap, &mut strings, "dict", Some(object_)),
            function: class(&mut heap, &mut strings, "function", Some(object_)),
            bound_method: class(&mut heap, &mut strings, "method", Some(object_)),
            native: class(&mut heap, &mut strings, "builtin_function_or_method", Some(object_)),
            module: class(&mut heap, &mut strings, "module", Some(object_)),
            code: class(&mut heap, &mut strings, "codeobject", Some(object_)),
            property: class(&mut heap, &mut strings, "property", Some(object_)),
            slice: class(&mut heap, &mut strings, "slice", Some(object_)),
            range: class(&mut heap, &mut strings, "range", Some(object_)),
            iterator: class(&mut heap, &mut strings, "iterator", Some(object_)),
        };

        // Exception classes chain per ExcKind::base; kinds are declared
        // base-first so every base id exists by the time it is needed.
        let mut exc_ids: Vec<HeapId> = Vec::with_capacity(ExcKind::COUNT);
        for &kind in ExcKind::VARIANTS {
            let base = kind.base().map_or(classes.object_, |b| exc_ids[b as usize]);
            exc_ids.push(class(&mut heap, &mut strings, kind.name(), Some(base)));
        }

        let builtins_name = strings.intern(&mut heap, "__builtins__");
        let builtins = heap.allocate(HeapData::Module(Module::new(builtins_name)));

        let mut vm = Self {
            heap,
            strings,
            names,
            classes,
            excs: CoreExceptions { ids: exc_ids },
            modules: Table::new(),
            builtins,
            registry: IndexMap::new(),
            thread: ThreadState::new(),
            options,
            print,
            tracer,
            next_class_uid: uid + 1,
            last_op_ip: 0,
        };

        crate::builtins::install(&mut vm);
        modules::register_defaults(&mut vm.registry);
        // The `kuroko` module is created eagerly and stays rooted via the
        // modules table.
        let _ = vm.import_module("kuroko");
        vm.heap.resume();
        vm
    }

    // --- stack -------------------------------------------------------------

    pub fn push(&mut self, value: Value) {
        self.thread.stack.push(value);
    }

    /// # Panics
    /// Panics on stack underflow, which is always a dispatch bug.
    pub fn pop(&mut self) -> Value {
        self.thread.stack.pop().expect("value stack underflow")
    }

    /// Value `n` slots below the top, without mutation.
    #[must_use]
    pub fn peek(&self, n: usize) -> Value {
        let len = self.thread.stack.len();
        self.thread.stack[len - 1 - n]
    }

    /// Swaps the top of stack with the value `n` slots below it.
    pub fn swap(&mut self, n: usize) {
        let len = self.thread.stack.len();
        self.thread.stack.swap(len - 1, len - 1 - n);
    }

    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.thread.stack.len()
    }

    /// Interrupt handle: setting the flag raises KeyboardInterrupt between
    /// instructions.
    #[must_use]
    pub fn signal_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.thread.signal)
    }

    // --- allocation & collection -------------------------------------------

    /// Allocates, collecting first when the pacing threshold is crossed.
    pub(crate) fn alloc(&mut self, data: HeapData) -> HeapId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(data)
    }

    /// Interns a string, returning the canonical object id for its content.
    pub(crate) fn intern(&mut self, text: &str) -> HeapId {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.strings.intern(&mut self.heap, text)
    }

    /// Runs a full mark-and-sweep collection now.
    pub fn collect_garbage(&mut self) {
        let roots = self.gc_roots();
        self.heap.mark(roots);
        self.strings.sweep(&self.heap);
        let freed = self.heap.sweep();
        self.tracer.on_gc(freed, self.heap.bytes_allocated());
    }

    /// Heap statistics snapshot.
    #[must_use]
    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        let mut stats = self.heap.stats();
        stats.interned_strings = self.strings.len();
        stats
    }

    /// Toggles collect-on-every-allocation. Used by GC-soundness tests to
    /// assemble code cheaply and then run it under maximum collector
    /// pressure.
    pub fn set_gc_stress(&mut self, on: bool) {
        self.heap.set_stress(on);
    }

    /// Interns `text` and returns it as a value. The host-facing way to
    /// build string constants for `CodeBuilder`.
    pub fn intern_string(&mut self, text: &str) -> Value {
        Value::Object(self.intern(text))
    }

    /// Interns `text` and returns the raw id, for `Params` name lists.
    pub fn intern_name(&mut self, text: &str) -> HeapId {
        self.intern(text)
    }

    /// Moves an assembled code object onto the heap, for use as a
    /// `MakeClosure` constant.
    pub fn alloc_code_object(&mut self, code: CodeObject) -> Value {
        Value::Object(self.alloc(HeapData::Code(Rc::new(code))))
    }

    /// Renders a code object's instruction listing; the disassembly surface.
    #[must_use]
    pub fn disassemble(&self, code: &CodeObject) -> String {
        code.disassemble(&self.heap)
    }

    /// The class object behind a built-in exception kind.
    #[must_use]
    pub fn exception_class(&self, kind: ExcKind) -> HeapId {
        self.excs.get(kind)
    }

    /// The `__builtins__` module, for hosts attaching their own natives.
    #[must_use]
    pub fn builtins_module(&self) -> HeapId {
        self.builtins
    }

    /// Attribute read by name text; the host-facing face of the descriptor
    /// protocol.
    pub fn get_attribute(&mut self, obj: Value, name: &str) -> RunResult<Value> {
        let name_id = self.intern(name);
        self.get_attr(obj, name_id)
    }

    /// Attribute write by name text.
    pub fn set_attribute(&mut self, obj: Value, name: &str, value: Value) -> RunResult<()> {
        let name_id = self.intern(name);
        self.set_attr(obj, name_id, value)
    }

    fn gc_roots(&self) -> Vec<HeapId> {
        let mut roots = Vec::with_capacity(self.thread.stack.len() + 64);
        let mut root_value = |roots: &mut Vec<HeapId>, value: Value| {
            if let Value::Object(id) = value {
                roots.push(id);
            }
        };
        for &value in &self.thread.stack {
            root_value(&mut roots, value);
        }
        for frame in &self.thread.frames {
            roots.push(frame.closure);
            roots.push(frame.globals);
            if let Some(instance) = frame.init_instance {
                root_value(&mut roots, instance);
            }
        }
        roots.extend(self.thread.open_upvalues.iter().copied());
        if let Some(exc) = self.thread.current_exception {
            root_value(&mut roots, exc);
        }
        for &value in &self.thread.scratch {
            root_value(&mut roots, value);
        }
        roots.extend(self.names.iter());
        roots.extend(self.classes.all());
        roots.extend(self.excs.iter());
        roots.push(self.builtins);
        for (key, value) in self.modules.iter() {
            root_value(&mut roots, key);
            root_value(&mut roots, value);
        }
        roots
    }

    // --- common constructors -----------------------------------------------

    /// Allocates a list. The items are shielded in scratch for the duration:
    /// a collection triggered by this very allocation cannot see them until
    /// the list owns them.
    pub(crate) fn alloc_list(&mut self, items: Vec<Value>) -> Value {
        let scratch_base = self.thread.scratch.len();
        self.thread.scratch.extend(items.iter().copied());
        let id = self.alloc(HeapData::List(List::new(items)));
        self.thread.scratch.truncate(scratch_base);
        Value::Object(id)
    }

    pub(crate) fn alloc_tuple(&mut self, items: Vec<Value>) -> Value {
        let scratch_base = self.thread.scratch.len();
        self.thread.scratch.extend(items.iter().copied());
        let id = self.alloc(HeapData::Tuple(items));
        self.thread.scratch.truncate(scratch_base);
        Value::Object(id)
    }

    pub(crate) fn alloc_dict(&mut self, table: Table) -> Value {
        let scratch_base = self.thread.scratch.len();
        for (key, value) in table.iter() {
            self.thread.scratch.push(key);
            self.thread.scratch.push(value);
        }
        let id = self.alloc(HeapData::Dict(table));
        self.thread.scratch.truncate(scratch_base);
        Value::Object(id)
    }

    /// Allocates a bare instance of `class_id`, with the payload its class
    /// prescribes.
    pub(crate) fn alloc_instance(&mut self, class_id: HeapId) -> Value {
        let payload_kind = match self.heap.get(class_id) {
            HeapData::Class(class) => class.payload_kind,
            other => panic!("alloc_instance on {}", other.variant_name()),
        };
        let mut instance = Instance::new(class_id);
        instance.payload = payload_kind.instantiate();
        Value::Object(self.alloc(HeapData::Instance(instance)))
    }

    /// Wraps `target` in a fresh iterator instance.
    pub(crate) fn make_iterator(&mut self, target: Value) -> RunResult<Value> {
        let iterator_class = self.classes.iterator;
        let mut instance = Instance::new(iterator_class);
        instance.payload = Some(NativePayload::Iter(IterState::new(target)));
        Ok(Value::Object(self.alloc(HeapData::Instance(instance))))
    }

    // --- classes -----------------------------------------------------------

    /// Creates a class object. The embedding half of `makeClass`.
    pub fn make_class(&mut self, name: &str, base: Option<HeapId>) -> HeapId {
        self.heap.pause();
        let name_id = self.intern(name);
        let id = self.make_class_from_id(name_id, base);
        self.heap.resume();
        id
    }

    pub(crate) fn make_class_from_id(&mut self, name_id: HeapId, base: Option<HeapId>) -> HeapId {
        let base = base.or(Some(self.classes.object_));
        let uid = self.next_class_uid;
        self.next_class_uid += 1;
        let mut class = ClassObject::new(name_id, base, uid);
        if let Some(base_id) = base
            && let HeapData::Class(base_class) = self.heap.get(base_id)
        {
            class.payload_kind = base_class.payload_kind;
        }
        let id = self.alloc(HeapData::Class(class));
        if let Some(base_id) = base
            && let HeapData::Class(base_class) = self.heap.get_mut(base_id)
        {
            base_class.subclasses.push(SubclassEntry { class_id: id, uid });
        }
        id
    }

    /// Populates the cached dunder slots. The embedding half of
    /// `finalizeClass`.
    pub fn finalize_class(&mut self, class_id: HeapId) {
        finalize_class(&mut self.heap, &self.names, class_id);
        // Subclasses may inherit stale slots; refresh the live ones.
        let entries = match self.heap.get(class_id) {
            HeapData::Class(class) => class.subclasses.clone(),
            _ => Vec::new(),
        };
        for entry in entries {
            let live = matches!(self.heap.get(entry.class_id), HeapData::Class(c) if c.uid == entry.uid);
            if live {
                self.finalize_class(entry.class_id);
            }
        }
    }

    /// The class of any value. The embedding half of `getType`.
    #[must_use]
    pub fn class_of(&self, value: Value) -> HeapId {
        match value {
            Value::None => self.classes.none_,
            Value::Bool(_) => self.classes.bool_,
            Value::Int(_) => self.classes.int_,
            Value::Float(_) => self.classes.float_,
            Value::NotImplemented => self.classes.notimplemented,
            Value::Kwargs(_) => self.classes.object_,
            Value::Object(id) => match self.heap.get(id) {
                HeapData::Str(_) => self.classes.str_,
                HeapData::Bytes(_) => self.classes.bytes,
                HeapData::Tuple(_) => self.classes.tuple,
                HeapData::List(_) => self.classes.list,
                HeapData::Dict(_) => self.classes.dict,
                HeapData::Closure(_) => self.classes.function,
                HeapData::Native(_) => self.classes.native,
                HeapData::BoundMethod(_) => self.classes.bound_method,
                HeapData::Class(_) => self.classes.type_,
                HeapData::Instance(instance) => instance.class,
                HeapData::Upvalue(_) => self.classes.object_,
                HeapData::Code(_) => self.classes.code,
                HeapData::Module(_) => self.classes.module,
                HeapData::Property(_) => self.classes.property,
            },
        }
    }

    /// Whether `value`'s class chain passes through `class_id`.
    #[must_use]
    pub fn is_instance_of(&self, value: Value, class_id: HeapId) -> bool {
        let mut current = Some(self.class_of(value));
        while let Some(id) = current {
            if id == class_id {
                return true;
            }
            current = match self.heap.get(id) {
                HeapData::Class(class) => class.base,
                _ => None,
            };
        }
        false
    }

    /// Display name of a value's class.
    #[must_use]
    pub(crate) fn type_name(&self, value: Value) -> String {
        let class_id = self.class_of(value);
        match self.heap.get(class_id) {
            HeapData::Class(class) => self.heap.str_of(class.name).to_string(),
            _ => value.variant_name(&self.heap).to_string(),
        }
    }

    // --- natives & modules -------------------------------------------------

    /// Registers a native function in an object's primary table.
    pub fn define_native(&mut self, owner: HeapId, name: &str, func: crate::types::NativeFn) {
        self.define_native_flagged(owner, name, func, crate::types::FunctionFlags {
            is_method: true,
            ..Default::default()
        });
    }

    /// Registers a native dynamic property: attribute lookup calls it with
    /// the receiver and yields the result.
    pub fn define_native_property(&mut self, owner: HeapId, name: &str, func: crate::types::NativeFn) {
        self.define_native_flagged(owner, name, func, crate::types::FunctionFlags {
            is_method: true,
            is_dynamic_property: true,
            ..Default::default()
        });
    }

    pub(crate) fn define_native_flagged(
        &mut self,
        owner: HeapId,
        name: &str,
        func: crate::types::NativeFn,
        flags: crate::types::FunctionFlags,
    ) {
        self.heap.pause();
        let name_id = self.intern(name);
        let native = self.alloc(HeapData::Native(crate::types::NativeFunction {
            name: name_id,
            func,
            flags,
        }));
        self.heap.table_set(owner, Value::Object(name_id), Value::Object(native));
        self.heap.resume();
    }

    /// Binds `name` to `value` in an object's primary table.
    pub fn attach_named_value(&mut self, owner: HeapId, name: &str, value: Value) {
        self.heap.pause();
        let name_id = self.intern(name);
        self.heap.table_set(owner, Value::Object(name_id), value);
        self.heap.resume();
    }

    /// Loads a module: already-loaded table hit, then the native registry.
    /// File-system search is the host's business, not the runtime's.
    pub fn import_module(&mut self, name: &str) -> RunResult<Value> {
        let name_id = self.intern(name);
        if let Some(module) = self.modules.get(&self.heap, Value::Object(name_id)) {
            return Ok(module);
        }
        let Some(init) = self.registry.get(name).copied() else {
            return Err(self.raise(ExcKind::ImportError, format!("no module named '{name}'")));
        };
        let module_id = init(self)?;
        let mut modules = std::mem::take(&mut self.modules);
        modules.set(&self.heap, Value::Object(name_id), Value::Object(module_id));
        self.modules = modules;
        Ok(Value::Object(module_id))
    }

    /// Creates an empty module with `__builtins__` and `__name__` linked.
    pub fn make_module(&mut self, name: &str) -> HeapId {
        self.heap.pause();
        let name_id = self.intern(name);
        let module_id = self.alloc(HeapData::Module(Module::new(name_id)));
        let builtins_key = Value::Object(self.names.get(SpecialName::Builtins));
        self.heap.table_set(module_id, builtins_key, Value::Object(self.builtins));
        let name_key = Value::Object(self.names.get(SpecialName::DunderName));
        self.heap.table_set(module_id, name_key, Value::Object(name_id));
        self.heap.resume();
        module_id
    }

    // --- strings & repr ----------------------------------------------------

    /// String content of a str value or str-payload instance.
    #[must_use]
    pub(crate) fn string_content(&self, value: Value) -> Option<&str> {
        if let Some(text) = self.heap.value_as_str(value) {
            return Some(text);
        }
        let id = value.as_object()?;
        match self.heap.get(id) {
            HeapData::Instance(instance) => match &instance.payload {
                Some(NativePayload::Str(text)) => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// `repr()` of any value. Dispatches managed `__repr__` for instances.
    pub fn repr_value(&mut self, value: Value) -> RunResult<String> {
        match value {
            Value::None => Ok("None".to_string()),
            Value::Bool(true) => Ok("True".to_string()),
            Value::Bool(false) => Ok("False".to_string()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(format_float(f)),
            Value::NotImplemented => Ok("NotImplemented".to_string()),
            Value::Kwargs(_) => Err(RunError::internal("kwargs sentinel escaped to repr")),
            Value::Object(id) => self.repr_object(id),
        }
    }

    fn repr_object(&mut self, id: HeapId) -> RunResult<String> {
        match self.heap.get(id) {
            HeapData::Str(s) => Ok(repr_str(s.as_str())),
            HeapData::Bytes(bytes) => {
                let mut out = String::from("b'");
                for &b in bytes {
                    if (0x20..0x7f).contains(&b) && b != b'\'' && b != b'\\' {
                        out.push(b as char);
                    } else {
                        out.push_str(&format!("\\x{b:02x}"));
                    }
                }
                out.push('\'');
                Ok(out)
            }
            HeapData::Tuple(_) => self.repr_guarded(id, |vm, id| vm.repr_tuple_items(id)),
            HeapData::List(_) => self.repr_guarded(id, |vm, id| vm.repr_list_items(id)),
            HeapData::Dict(_) => self.repr_guarded(id, |vm, id| vm.repr_dict_items(id)),
            HeapData::Closure(closure) => {
                let code = closure.code;
                let HeapData::Code(code) = self.heap.get(code) else {
                    return Err(RunError::internal("closure without code object"));
                };
                Ok(format!("<function {}>", code.name_str(&self.heap)))
            }
            HeapData::Native(native) => Ok(format!("<built-in function {}>", self.heap.str_of(native.name))),
            HeapData::BoundMethod(bound) => {
                let method = bound.method;
                let inner = self.repr_value(method)?;
                Ok(format!("<bound method of {inner}>"))
            }
            HeapData::Class(class) => Ok(format!("<class '{}'>", self.heap.str_of(class.name))),
            HeapData::Upvalue(_) => Ok("<upvalue>".to_string()),
            HeapData::Code(code) => Ok(format!("<code object {}>", code.name_str(&self.heap))),
            HeapData::Module(module) => Ok(format!("<module '{}'>", self.heap.str_of(module.name))),
            HeapData::Property(_) => Ok("<property>".to_string()),
            HeapData::Instance(instance) => {
                let class_id = instance.class;
                let repr_slot = match self.heap.get(class_id) {
                    HeapData::Class(class) => class.slots.repr,
                    _ => None,
                };
                if let Some(method) = repr_slot {
                    let result = self.call_and_run(method, &[Value::Object(id)])?;
                    return match self.string_content(result) {
                        Some(text) => Ok(text.to_string()),
                        None => {
                            let found = self.type_name(result);
                            Err(self.raise(ExcKind::TypeError, format!("__repr__ returned non-string ({found})")))
                        }
                    };
                }
                // Subclassed built-ins without a custom __repr__ render
                // their payload.
                match &instance.payload {
                    Some(NativePayload::List(_)) => self.repr_guarded(id, |vm, id| vm.repr_list_items(id)),
                    Some(NativePayload::Tuple(_)) => self.repr_guarded(id, |vm, id| vm.repr_tuple_items(id)),
                    Some(NativePayload::Dict(_)) => self.repr_guarded(id, |vm, id| vm.repr_dict_items(id)),
                    Some(NativePayload::Str(text)) => Ok(repr_str(text)),
                    _ => {
                        let name = self.type_name(Value::Object(id));
                        Ok(format!("<instance of {name}>"))
                    }
                }
            }
        }
    }

    /// Runs `render` with the in-repr flag held, so self-referential
    /// containers print the recursion placeholder exactly once.
    fn repr_guarded(
        &mut self,
        id: HeapId,
        render: fn(&mut Self, HeapId) -> RunResult<String>,
    ) -> RunResult<String> {
        if !self.heap.enter_repr(id) {
            let placeholder = match self.heap.get(id) {
                HeapData::Dict(_) => "{...}",
                HeapData::Tuple(_) => "(...)",
                HeapData::Instance(instance) => match &instance.payload {
                    Some(NativePayload::Dict(_)) => "{...}",
                    Some(NativePayload::Tuple(_)) => "(...)",
                    _ => "[...]",
                },
                _ => "[...]",
            };
            return Ok(placeholder.to_string());
        }
        let result = render(self, id);
        self.heap.exit_repr(id);
        result
    }

    fn repr_list_items(&mut self, id: HeapId) -> RunResult<String> {
        let len = list_items(&self.heap, Value::Object(id)).map_or(0, Vec::len);
        let mut out = String::from("[");
        for i in 0..len {
            if i > 0 {
                out.push_str(", ");
            }
            let item = list_items(&self.heap, Value::Object(id)).expect("list receiver")[i];
            out.push_str(&self.repr_value(item)?);
        }
        out.push(']');
        Ok(out)
    }

    fn repr_tuple_items(&mut self, id: HeapId) -> RunResult<String> {
        let len = tuple_items(&self.heap, Value::Object(id)).map_or(0, Vec::len);
        let mut out = String::from("(");
        for i in 0..len {
            if i > 0 {
                out.push_str(", ");
            }
            let item = tuple_items(&self.heap, Value::Object(id)).expect("tuple receiver")[i];
            out.push_str(&self.repr_value(item)?);
        }
        if len == 1 {
            out.push(',');
        }
        out.push(')');
        Ok(out)
    }

    fn repr_dict_items(&mut self, id: HeapId) -> RunResult<String> {
        let pairs: Vec<(Value, Value)> = dict_table(&self.heap, Value::Object(id))
            .map(|t| t.iter().collect())
            .unwrap_or_default();
        let mut out = String::from("{");
        for (i, (key, value)) in pairs.into_iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.repr_value(key)?);
            out.push_str(": ");
            out.push_str(&self.repr_value(value)?);
        }
        out.push('}');
        Ok(out)
    }

    /// `str()` of any value: strings verbatim, instances via `__str__`,
    /// everything else like `repr`.
    pub fn str_value(&mut self, value: Value) -> RunResult<String> {
        if let Some(text) = self.string_content(value) {
            return Ok(text.to_string());
        }
        if let Value::Object(id) = value
            && let HeapData::Instance(instance) = self.heap.get(id)
        {
            let str_slot = match self.heap.get(instance.class) {
                HeapData::Class(class) => class.slots.str_,
                _ => None,
            };
            if let Some(method) = str_slot {
                let result = self.call_and_run(method, &[value])?;
                return match self.string_content(result) {
                    Some(text) => Ok(text.to_string()),
                    None => {
                        let found = self.type_name(result);
                        Err(self.raise(ExcKind::TypeError, format!("__str__ returned non-string ({found})")))
                    }
                };
            }
        }
        self.repr_value(value)
    }

    // --- iteration ---------------------------------------------------------

    /// `iter(value)`: dispatches the class's `__iter__` slot.
    pub(crate) fn get_iter(&mut self, value: Value) -> RunResult<Value> {
        let class_id = self.class_of(value);
        let iter_slot = match self.heap.get(class_id) {
            HeapData::Class(class) => class.slots.iter,
            _ => None,
        };
        match iter_slot {
            Some(method) => self.call_and_run(method, &[value]),
            None => {
                let found = self.type_name(value);
                Err(self.raise(ExcKind::TypeError, format!("'{found}' object is not iterable")))
            }
        }
    }

    /// Advances an iterator: `None` when it signals exhaustion by returning
    /// itself.
    pub(crate) fn iter_next(&mut self, iterator: Value) -> RunResult<Option<Value>> {
        let next = self.call_and_run(iterator, &[])?;
        Ok(if next.identical(iterator) { None } else { Some(next) })
    }

    /// Materializes any iterable into a vector, shielding partial results in
    /// the thread's scratch space.
    pub(crate) fn collect_iterable(&mut self, value: Value) -> RunResult<Vec<Value>> {
        if let Some(items) = list_items(&self.heap, value).or_else(|| tuple_items(&self.heap, value)) {
            return Ok(items.clone());
        }
        let iterator = self.get_iter(value)?;
        let scratch_base = self.thread.scratch.len();
        self.thread.scratch.push(iterator);
        let result = loop {
            match self.iter_next(iterator) {
                Ok(Some(item)) => self.thread.scratch.push(item),
                Ok(None) => break Ok(self.thread.scratch[scratch_base + 1..].to_vec()),
                Err(err) => break Err(err),
            }
        };
        self.thread.scratch.truncate(scratch_base);
        result
    }

    // --- slices ------------------------------------------------------------

    /// The id of `value` when it is a slice instance.
    #[must_use]
    pub(crate) fn as_slice_instance(&self, value: Value) -> Option<HeapId> {
        let id = value.as_object()?;
        match self.heap.get(id) {
            HeapData::Instance(instance) if instance.class == self.classes.slice => Some(id),
            _ => None,
        }
    }

    /// Builds a slice instance from raw bound values.
    pub(crate) fn make_slice(&mut self, start: Value, stop: Value, step: Value) -> RunResult<Value> {
        if let Some(0) = step.as_int() {
            return Err(self.raise(ExcKind::ValueError, "slice step cannot be zero".to_string()));
        }
        self.heap.pause();
        let slice_class = self.classes.slice;
        let instance = self.alloc_instance(slice_class);
        let instance_id = instance.as_object().expect("instance just allocated");
        for (name, bound) in [
            (SpecialName::Start, start),
            (SpecialName::Stop, stop),
            (SpecialName::Step, step),
        ] {
            let key = Value::Object(self.names.get(name));
            self.heap.table_set(instance_id, key, bound);
        }
        self.heap.resume();
        Ok(instance)
    }

    /// Resolves a slice instance against a sequence length and gathers the
    /// selected elements via `get`.
    pub(crate) fn slice_elements(
        &mut self,
        slice_id: HeapId,
        len: usize,
        get: impl Fn(usize, &Heap) -> Value,
    ) -> RunResult<Vec<Value>> {
        let field = |vm: &Self, name: SpecialName| {
            vm.heap
                .table_get(slice_id, Value::Object(vm.names.get(name)))
                .unwrap_or(Value::None)
        };
        let step = match field(self, SpecialName::Step) {
            Value::None => 1,
            v => v
                .as_int()
                .ok_or_else(|| RunError::internal("slice step must be an int"))?,
        };
        if step == 0 {
            return Err(self.raise(ExcKind::ValueError, "slice step cannot be zero".to_string()));
        }
        let len_i = len as i64;
        let clamp = |raw: i64| raw.clamp(if step > 0 { 0 } else { -1 }, len_i);
        let resolve = |bound: Value, default: i64| match bound {
            Value::None => default,
            v => {
                let raw = v.as_int().unwrap_or(default);
                clamp(if raw < 0 { raw + len_i } else { raw })
            }
        };
        let start = resolve(field(self, SpecialName::Start), if step > 0 { 0 } else { len_i - 1 });
        let stop = resolve(field(self, SpecialName::Stop), if step > 0 { len_i } else { -1 });
        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            if (0..len_i).contains(&i) {
                out.push(get(i as usize, &self.heap));
            }
            i += step;
        }
        Ok(out)
    }

    // --- globals -----------------------------------------------------------

    fn get_global(&mut self, name_id: HeapId) -> RunResult<Value> {
        let globals = self.frame().globals;
        if let Some(value) = self.heap.table_get(globals, Value::Object(name_id)) {
            return Ok(value);
        }
        if let Some(value) = self.heap.table_get(self.builtins, Value::Object(name_id)) {
            return Ok(value);
        }
        let name = self.heap.str_of(name_id).to_string();
        Err(self.raise(ExcKind::NameError, format!("name '{name}' is not defined")))
    }

    fn set_global(&mut self, name_id: HeapId, value: Value) {
        let globals = self.frame().globals;
        self.heap.table_set(globals, Value::Object(name_id), value);
    }

    fn del_global(&mut self, name_id: HeapId) -> RunResult<()> {
        let globals = self.frame().globals;
        if self.heap.table_delete(globals, Value::Object(name_id)) {
            Ok(())
        } else {
            let name = self.heap.str_of(name_id).to_string();
            Err(self.raise(ExcKind::NameError, format!("name '{name}' is not defined")))
        }
    }

    // --- upvalues ----------------------------------------------------------

    /// Finds or creates the upvalue for a live stack slot. The open list is
    /// kept sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.thread.open_upvalues.len();
        for (i, &id) in self.thread.open_upvalues.iter().enumerate() {
            match self.heap.get(id) {
                HeapData::Upvalue(Upvalue::Open(existing)) if *existing == slot => return id,
                HeapData::Upvalue(Upvalue::Open(existing)) if *existing < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let id = self.alloc(HeapData::Upvalue(Upvalue::Open(slot)));
        self.thread.open_upvalues.insert(insert_at, id);
        id
    }

    /// Closes every open upvalue whose slot is at or above `from_slot`,
    /// moving the value off the stack into the cell.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&id) = self.thread.open_upvalues.first() {
            let slot = match self.heap.get(id) {
                HeapData::Upvalue(Upvalue::Open(slot)) => *slot,
                _ => {
                    self.thread.open_upvalues.remove(0);
                    continue;
                }
            };
            if slot < from_slot {
                break;
            }
            let value = self.thread.stack[slot];
            *self.heap.get_mut(id) = HeapData::Upvalue(Upvalue::Closed(value));
            self.thread.open_upvalues.remove(0);
        }
    }

    fn read_upvalue(&self, closure_id: HeapId, index: usize) -> RunResult<Value> {
        let HeapData::Closure(closure) = self.heap.get(closure_id) else {
            return Err(RunError::internal("frame closure is not a closure"));
        };
        let &cell = closure
            .upvalues
            .get(index)
            .ok_or_else(|| RunError::internal("upvalue index out of range"))?;
        match self.heap.get(cell) {
            HeapData::Upvalue(Upvalue::Open(slot)) => Ok(self.thread.stack[*slot]),
            HeapData::Upvalue(Upvalue::Closed(value)) => Ok(*value),
            _ => Err(RunError::internal("upvalue cell is not an upvalue")),
        }
    }

    fn write_upvalue(&mut self, closure_id: HeapId, index: usize, value: Value) -> RunResult<()> {
        let HeapData::Closure(closure) = self.heap.get(closure_id) else {
            return Err(RunError::internal("frame closure is not a closure"));
        };
        let &cell = closure
            .upvalues
            .get(index)
            .ok_or_else(|| RunError::internal("upvalue index out of range"))?;
        match self.heap.get(cell) {
            HeapData::Upvalue(Upvalue::Open(slot)) => {
                let slot = *slot;
                self.thread.stack[slot] = value;
            }
            HeapData::Upvalue(Upvalue::Closed(_)) => {
                *self.heap.get_mut(cell) = HeapData::Upvalue(Upvalue::Closed(value));
            }
            _ => return Err(RunError::internal("upvalue cell is not an upvalue")),
        }
        Ok(())
    }

    // --- frames ------------------------------------------------------------

    pub(crate) fn frame(&self) -> &CallFrame {
        self.thread.frames.last().expect("no active frame")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut CallFrame {
        self.thread.frames.last_mut().expect("no active frame")
    }

    fn cached_frame(&self) -> CachedFrame {
        let frame = self.frame();
        CachedFrame {
            code: Rc::clone(&frame.code),
            ip: frame.ip,
            base: frame.base,
        }
    }

    // --- entry points ------------------------------------------------------

    /// Runs a compiled code object as the body of a fresh module. Returns
    /// its result, or parks the unhandled exception on the thread state and
    /// propagates it.
    pub fn interpret(&mut self, code: CodeObject, module_name: &str) -> RunResult<Value> {
        self.heap.pause();
        let module_id = self.make_module(module_name);
        let module_name_id = match self.heap.get(module_id) {
            HeapData::Module(module) => module.name,
            _ => unreachable!("make_module returns a module"),
        };
        let mut modules = std::mem::take(&mut self.modules);
        modules.set(&self.heap, Value::Object(module_name_id), Value::Object(module_id));
        self.modules = modules;
        let code_id = self.alloc(HeapData::Code(Rc::new(code)));
        let closure_id = self.alloc(HeapData::Closure(Closure {
            code: code_id,
            upvalues: Vec::new(),
            defaults: Vec::new(),
            kw_defaults: Vec::new(),
            globals: module_id,
            annotations: None,
            flags: crate::types::FunctionFlags::default(),
        }));
        self.heap.resume();

        let entry_depth = self.thread.frames.len();
        let entry_stack = self.thread.stack.len();
        self.push(Value::Object(closure_id));
        let result = self.call_value(0).and_then(|outcome| match outcome {
            CallOutcome::ResumeVm => self.run_until(entry_depth),
            CallOutcome::NativeDone => Ok(self.pop()),
        });
        match result {
            Ok(value) => Ok(value),
            Err(RunError::Raise(exc)) => {
                self.thread.frames.truncate(entry_depth);
                self.thread.stack.truncate(entry_stack);
                self.thread.current_exception = Some(exc);
                Err(RunError::Raise(exc))
            }
            Err(other) => Err(other),
        }
    }

    /// Resumes execution after `call_value` returned `ResumeVm`; the host
    /// half of the embedding contract.
    pub fn run_next(&mut self) -> RunResult<Value> {
        let exit_depth = self.thread.frames.len().saturating_sub(1);
        self.run_until(exit_depth)
    }

    /// The unhandled exception left for the host, if any.
    #[must_use]
    pub fn has_exception(&self) -> bool {
        self.thread.current_exception.is_some()
    }

    pub fn take_exception(&mut self) -> Option<Value> {
        self.thread.current_exception.take()
    }

    // --- dispatch loop -----------------------------------------------------

    /// Executes until the frame stack drops back to `exit_depth`, returning
    /// the value produced by the frame that brought it there.
    pub(crate) fn run_until(&mut self, exit_depth: usize) -> RunResult<Value> {
        let mut cached = self.cached_frame();
        loop {
            if self.thread.signal.swap(false, Ordering::Relaxed) {
                self.frame_mut().ip = cached.ip;
                let err = self.raise(ExcKind::KeyboardInterrupt, String::new());
                self.handle_unwind(err, exit_depth)?;
                cached = self.cached_frame();
                continue;
            }
            if cached.ip >= cached.code.bytecode().len() {
                return Err(RunError::internal("instruction pointer escaped bytecode range"));
            }
            self.last_op_ip = cached.ip;
            let opcode = match Opcode::decode(fetch_byte!(cached)) {
                Some(op) => op,
                None => return Err(RunError::internal("invalid opcode in bytecode")),
            };
            self.tracer.on_instruction(
                self.last_op_ip,
                opcode,
                self.thread.stack.len().saturating_sub(cached.base),
                self.thread.frames.len(),
            );

            match opcode {
                Opcode::Constant => {
                    let index = fetch_u16!(cached);
                    self.push(cached.code.constant(index));
                }
                Opcode::None => self.push(Value::None),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Dup => {
                    let top = self.peek(0);
                    self.push(top);
                }
                Opcode::Swap => {
                    let n = fetch_byte!(cached) as usize;
                    self.swap(n);
                }
                Opcode::Rot3 => {
                    let len = self.thread.stack.len();
                    self.thread.stack[len - 3..].rotate_right(1);
                }
                Opcode::GetLocal => {
                    let slot = fetch_byte!(cached) as usize;
                    self.push(self.thread.stack[cached.base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = fetch_byte!(cached) as usize;
                    let value = self.pop();
                    self.thread.stack[cached.base + slot] = value;
                }
                Opcode::GetGlobal => {
                    let index = fetch_u16!(cached);
                    let name_id = vm_try!(self, cached, exit_depth, self.const_name(&cached, index));
                    self.frame_mut().ip = cached.ip;
                    let value = vm_try!(self, cached, exit_depth, self.get_global(name_id));
                    self.push(value);
                }
                Opcode::SetGlobal => {
                    let index = fetch_u16!(cached);
                    let name_id = vm_try!(self, cached, exit_depth, self.const_name(&cached, index));
                    let value = self.pop();
                    self.set_global(name_id, value);
                }
                Opcode::DelGlobal => {
                    let index = fetch_u16!(cached);
                    let name_id = vm_try!(self, cached, exit_depth, self.const_name(&cached, index));
                    self.frame_mut().ip = cached.ip;
                    vm_try!(self, cached, exit_depth, self.del_global(name_id));
                }
                Opcode::GetUpvalue => {
                    let index = fetch_byte!(cached) as usize;
                    let closure = self.frame().closure;
                    let value = vm_try!(self, cached, exit_depth, self.read_upvalue(closure, index));
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let index = fetch_byte!(cached) as usize;
                    let value = self.pop();
                    let closure = self.frame().closure;
                    vm_try!(self, cached, exit_depth, self.write_upvalue(closure, index, value));
                }
                Opcode::CloseUpvalue => {
                    let top = self.thread.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Opcode::GetAttr => {
                    let index = fetch_u16!(cached);
                    let name_id = vm_try!(self, cached, exit_depth, self.const_name(&cached, index));
                    self.frame_mut().ip = cached.ip;
                    let obj = self.peek(0);
                    let value = vm_try!(self, cached, exit_depth, self.get_attr(obj, name_id));
                    self.pop();
                    self.push(value);
                }
                Opcode::SetAttr => {
                    let index = fetch_u16!(cached);
                    let name_id = vm_try!(self, cached, exit_depth, self.const_name(&cached, index));
                    self.frame_mut().ip = cached.ip;
                    let value = self.peek(0);
                    let obj = self.peek(1);
                    vm_try!(self, cached, exit_depth, self.set_attr(obj, name_id, value));
                    self.pop();
                    self.pop();
                }
                Opcode::DelAttr => {
                    let index = fetch_u16!(cached);
                    let name_id = vm_try!(self, cached, exit_depth, self.const_name(&cached, index));
                    self.frame_mut().ip = cached.ip;
                    let obj = self.peek(0);
                    vm_try!(self, cached, exit_depth, self.del_attr(obj, name_id));
                    self.pop();
                }
                Opcode::GetIndex => {
                    self.frame_mut().ip = cached.ip;
                    let index = self.peek(0);
                    let obj = self.peek(1);
                    let value = vm_try!(self, cached, exit_depth, self.get_index(obj, index));
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                Opcode::SetIndex => {
                    self.frame_mut().ip = cached.ip;
                    let value = self.peek(0);
                    let index = self.peek(1);
                    let obj = self.peek(2);
                    vm_try!(self, cached, exit_depth, self.set_index(obj, index, value));
                    self.pop();
                    self.pop();
                    self.pop();
                }
                Opcode::DelIndex => {
                    self.frame_mut().ip = cached.ip;
                    let index = self.peek(0);
                    let obj = self.peek(1);
                    vm_try!(self, cached, exit_depth, self.del_index(obj, index));
                    self.pop();
                    self.pop();
                }
                Opcode::BuildSlice => {
                    self.frame_mut().ip = cached.ip;
                    let count = fetch_byte!(cached);
                    let (start, stop, step) = if count == 3 {
                        (self.peek(2), self.peek(1), self.peek(0))
                    } else {
                        (self.peek(1), self.peek(0), Value::None)
                    };
                    let slice = vm_try!(self, cached, exit_depth, self.make_slice(start, stop, step));
                    for _ in 0..count {
                        self.pop();
                    }
                    self.push(slice);
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::FloorDiv
                | Opcode::Mod
                | Opcode::Pow
                | Opcode::BitAnd
                | Opcode::BitOr
                | Opcode::BitXor
                | Opcode::Shl
                | Opcode::Shr => {
                    self.frame_mut().ip = cached.ip;
                    let op = match opcode {
                        Opcode::Add => BinaryOp::Add,
                        Opcode::Sub => BinaryOp::Sub,
                        Opcode::Mul => BinaryOp::Mul,
                        Opcode::Div => BinaryOp::TrueDiv,
                        Opcode::FloorDiv => BinaryOp::FloorDiv,
                        Opcode::Mod => BinaryOp::Mod,
                        Opcode::Pow => BinaryOp::Pow,
                        Opcode::BitAnd => BinaryOp::BitAnd,
                        Opcode::BitOr => BinaryOp::BitOr,
                        Opcode::BitXor => BinaryOp::BitXor,
                        Opcode::Shl => BinaryOp::Shl,
                        _ => BinaryOp::Shr,
                    };
                    vm_try!(self, cached, exit_depth, self.binary_op_top(op));
                }
                Opcode::Negate => {
                    self.frame_mut().ip = cached.ip;
                    vm_try!(self, cached, exit_depth, self.unary_negate());
                }
                Opcode::Not => {
                    let value = self.pop();
                    let truthy = value.truthy(&self.heap);
                    self.push(Value::Bool(!truthy));
                }
                Opcode::Invert => {
                    self.frame_mut().ip = cached.ip;
                    vm_try!(self, cached, exit_depth, self.unary_invert());
                }
                Opcode::Eq | Opcode::Ne => {
                    self.frame_mut().ip = cached.ip;
                    let b = self.peek(0);
                    let a = self.peek(1);
                    let equal = vm_try!(self, cached, exit_depth, self.values_eq(a, b));
                    self.pop();
                    self.pop();
                    self.push(Value::Bool(if opcode == Opcode::Eq { equal } else { !equal }));
                }
                Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    self.frame_mut().ip = cached.ip;
                    let op = match opcode {
                        Opcode::Lt => crate::types::CompareOp::Lt,
                        Opcode::Le => crate::types::CompareOp::Le,
                        Opcode::Gt => crate::types::CompareOp::Gt,
                        _ => crate::types::CompareOp::Ge,
                    };
                    vm_try!(self, cached, exit_depth, self.compare_op_top(op));
                }
                Opcode::Is | Opcode::IsNot => {
                    let b = self.pop();
                    let a = self.pop();
                    let same = a.identical(b);
                    self.push(Value::Bool(if opcode == Opcode::Is { same } else { !same }));
                }
                Opcode::In => {
                    self.frame_mut().ip = cached.ip;
                    let container = self.peek(0);
                    let item = self.peek(1);
                    let found = vm_try!(self, cached, exit_depth, self.contains(container, item));
                    self.pop();
                    self.pop();
                    self.push(Value::Bool(found));
                }
                Opcode::Jump => {
                    let offset = fetch_i16!(cached);
                    cached.ip = jump_target(cached.ip, offset);
                }
                Opcode::JumpIfFalse => {
                    let offset = fetch_i16!(cached);
                    let value = self.pop();
                    if !value.truthy(&self.heap) {
                        cached.ip = jump_target(cached.ip, offset);
                    }
                }
                Opcode::JumpIfTrue => {
                    let offset = fetch_i16!(cached);
                    let value = self.pop();
                    if value.truthy(&self.heap) {
                        cached.ip = jump_target(cached.ip, offset);
                    }
                }
                Opcode::MakeClosure => {
                    self.frame_mut().ip = cached.ip;
                    let index = fetch_u16!(cached);
                    let defaults_count = fetch_byte!(cached) as usize;
                    vm_try!(
                        self,
                        cached,
                        exit_depth,
                        self.make_closure(&cached, index, defaults_count)
                    );
                }
                Opcode::MakeClass => {
                    self.frame_mut().ip = cached.ip;
                    let name_index = fetch_u16!(cached);
                    let base_count = fetch_byte!(cached);
                    let name_id = vm_try!(self, cached, exit_depth, self.const_name(&cached, name_index));
                    vm_try!(self, cached, exit_depth, self.op_make_class(name_id, base_count));
                }
                Opcode::DefineMethod => {
                    let index = fetch_u16!(cached);
                    let name_id = vm_try!(self, cached, exit_depth, self.const_name(&cached, index));
                    self.frame_mut().ip = cached.ip;
                    let method = self.peek(0);
                    let class = self.peek(1);
                    let class_id = class
                        .as_object()
                        .filter(|&id| matches!(self.heap.get(id), HeapData::Class(_)));
                    let Some(class_id) = class_id else {
                        return Err(RunError::internal("DefineMethod without a class on stack"));
                    };
                    self.heap.table_set(class_id, Value::Object(name_id), method);
                    self.pop();
                }
                Opcode::FinalizeClass => {
                    let class = self.peek(0);
                    if let Some(class_id) = class.as_object().filter(|&id| matches!(self.heap.get(id), HeapData::Class(_))) {
                        self.finalize_class(class_id);
                    }
                }
                Opcode::BuildList => {
                    let count = fetch_u16!(cached) as usize;
                    let start = self.thread.stack.len() - count;
                    let items = self.thread.stack[start..].to_vec();
                    let list = self.alloc_list(items);
                    self.thread.stack.truncate(start);
                    self.push(list);
                }
                Opcode::BuildTuple => {
                    let count = fetch_u16!(cached) as usize;
                    let start = self.thread.stack.len() - count;
                    let items = self.thread.stack[start..].to_vec();
                    let tuple = self.alloc_tuple(items);
                    self.thread.stack.truncate(start);
                    self.push(tuple);
                }
                Opcode::BuildDict => {
                    self.frame_mut().ip = cached.ip;
                    let pairs = fetch_u16!(cached) as usize;
                    vm_try!(self, cached, exit_depth, self.op_build_dict(pairs));
                }
                Opcode::PushKwargs => {
                    let count = fetch_u16!(cached);
                    self.push(Value::Kwargs(u32::from(count)));
                }
                Opcode::Call => {
                    let argc = fetch_byte!(cached) as usize;
                    self.frame_mut().ip = cached.ip;
                    let outcome = vm_try!(self, cached, exit_depth, self.call_value(argc));
                    if matches!(outcome, CallOutcome::ResumeVm) {
                        cached = self.cached_frame();
                    }
                }
                Opcode::Return => {
                    let mut result = self.pop();
                    let frame = self.thread.frames.pop().expect("return without a frame");
                    self.close_upvalues(frame.base);
                    if let Some(instance) = frame.init_instance {
                        result = instance;
                    }
                    self.thread.stack.truncate(frame.out);
                    self.tracer.on_return(self.thread.frames.len());
                    if self.thread.frames.len() == exit_depth {
                        return Ok(result);
                    }
                    self.push(result);
                    cached = self.cached_frame();
                }
                Opcode::GetIter => {
                    self.frame_mut().ip = cached.ip;
                    let value = self.peek(0);
                    let iterator = vm_try!(self, cached, exit_depth, self.get_iter(value));
                    self.pop();
                    self.push(iterator);
                }
                Opcode::ForIter => {
                    let offset = fetch_i16!(cached);
                    self.frame_mut().ip = cached.ip;
                    let iterator = self.peek(0);
                    let next = vm_try!(self, cached, exit_depth, self.iter_next(iterator));
                    match next {
                        Some(value) => self.push(value),
                        None => cached.ip = jump_target(cached.ip, offset),
                    }
                }
                Opcode::Raise => {
                    self.frame_mut().ip = cached.ip;
                    let exc = self.pop();
                    let err = self.raise_value(exc);
                    self.handle_unwind(err, exit_depth)?;
                    cached = self.cached_frame();
                }
                Opcode::PushTry => {
                    let offset = fetch_i16!(cached);
                    let handler_ip = jump_target(cached.ip, offset);
                    let stack_depth = self.thread.stack.len();
                    self.frame_mut().try_stack.push(TryBlock {
                        handler_ip,
                        stack_depth,
                        kind: TryKind::Handler,
                    });
                }
                Opcode::PopTry => {
                    self.frame_mut().try_stack.pop();
                }
                Opcode::PushWith => {
                    let offset = fetch_i16!(cached);
                    self.frame_mut().ip = cached.ip;
                    let handler_ip = jump_target(cached.ip, offset);
                    vm_try!(self, cached, exit_depth, self.op_push_with(handler_ip));
                }
                Opcode::PopWith => {
                    self.frame_mut().ip = cached.ip;
                    vm_try!(self, cached, exit_depth, self.op_pop_with());
                }
                Opcode::Import => {
                    let index = fetch_u16!(cached);
                    let name_id = vm_try!(self, cached, exit_depth, self.const_name(&cached, index));
                    self.frame_mut().ip = cached.ip;
                    let name = self.heap.str_of(name_id).to_string();
                    let module = vm_try!(self, cached, exit_depth, self.import_module(&name));
                    self.push(module);
                }
            }
        }
    }

    // --- dispatch helpers ---------------------------------------------------

    /// Reads a name constant (must be an interned string).
    fn const_name(&mut self, cached: &CachedFrame, index: u16) -> RunResult<HeapId> {
        let value = cached.code.constant(index);
        value
            .as_object()
            .filter(|&id| matches!(self.heap.get(id), HeapData::Str(_)))
            .ok_or_else(|| RunError::internal("name constant is not a string"))
    }

    fn make_closure(&mut self, cached: &CachedFrame, index: u16, defaults_count: usize) -> RunResult<()> {
        let code_value = cached.code.constant(index);
        let Some(code_id) = code_value
            .as_object()
            .filter(|&id| matches!(self.heap.get(id), HeapData::Code(_)))
        else {
            return Err(RunError::internal("MakeClosure constant is not a code object"));
        };
        let (descs, flags) = {
            let HeapData::Code(code) = self.heap.get(code_id) else {
                unreachable!("checked above");
            };
            (code.upvalue_descs().to_vec(), code.flags)
        };
        let mut upvalues = Vec::with_capacity(descs.len());
        for desc in descs {
            if desc.is_local {
                upvalues.push(self.capture_upvalue(cached.base + desc.index as usize));
            } else {
                let enclosing = self.frame().closure;
                let HeapData::Closure(closure) = self.heap.get(enclosing) else {
                    return Err(RunError::internal("enclosing frame closure missing"));
                };
                let &cell = closure
                    .upvalues
                    .get(desc.index as usize)
                    .ok_or_else(|| RunError::internal("upvalue pass-through index out of range"))?;
                upvalues.push(cell);
            }
        }
        let defaults_start = self.thread.stack.len() - defaults_count;
        let defaults = self.thread.stack[defaults_start..].to_vec();
        let globals = self.frame().globals;
        let closure_id = self.alloc(HeapData::Closure(Closure {
            code: code_id,
            upvalues,
            defaults,
            kw_defaults: Vec::new(),
            globals,
            annotations: None,
            flags,
        }));
        self.thread.stack.truncate(defaults_start);
        self.push(Value::Object(closure_id));
        Ok(())
    }

    fn op_make_class(&mut self, name_id: HeapId, base_count: u8) -> RunResult<()> {
        let base = match base_count {
            0 => None,
            1 => {
                let base_value = self.peek(0);
                let Some(base_id) = base_value
                    .as_object()
                    .filter(|&id| matches!(self.heap.get(id), HeapData::Class(_)))
                else {
                    let found = self.type_name(base_value);
                    return Err(self.raise(ExcKind::TypeError, format!("cannot subclass '{found}'")));
                };
                let HeapData::Class(base_class) = self.heap.get(base_id) else {
                    unreachable!("checked above");
                };
                if base_class.no_inherit {
                    let name = self.heap.str_of(base_class.name).to_string();
                    return Err(self.raise(ExcKind::TypeError, format!("class '{name}' cannot be subclassed")));
                }
                Some(base_id)
            }
            _ => {
                return Err(self.raise(
                    ExcKind::TypeError,
                    "multiple inheritance is not supported".to_string(),
                ));
            }
        };
        let class_id = self.make_class_from_id(name_id, base);
        for _ in 0..base_count {
            self.pop();
        }
        self.push(Value::Object(class_id));
        Ok(())
    }

    fn op_build_dict(&mut self, pairs: usize) -> RunResult<()> {
        let start = self.thread.stack.len() - pairs * 2;
        // The dict is allocated before keys are checked so the window stays
        // rooted through any collection the allocation triggers.
        let dict = self.alloc_dict(Table::new());
        let dict_id = dict.as_object().expect("dict just allocated");
        for i in 0..pairs {
            let key = self.thread.stack[start + i * 2];
            let value = self.thread.stack[start + i * 2 + 1];
            crate::types::dict::check_hashable(self, key)?;
            self.heap.table_set(dict_id, key, value);
        }
        self.thread.stack.truncate(start);
        self.push(dict);
        Ok(())
    }

    fn op_push_with(&mut self, handler_ip: usize) -> RunResult<()> {
        let mgr = self.peek(0);
        let class_id = self.class_of(mgr);
        let (enter, exit) = match self.heap.get(class_id) {
            HeapData::Class(class) => (class.slots.enter, class.slots.exit),
            _ => (None, None),
        };
        let (Some(enter), Some(_)) = (enter, exit) else {
            let found = self.type_name(mgr);
            return Err(self.raise(
                ExcKind::TypeError,
                format!("'{found}' object does not support the context manager protocol"),
            ));
        };
        let stack_depth = self.thread.stack.len() - 1;
        self.frame_mut().try_stack.push(TryBlock {
            handler_ip,
            stack_depth,
            kind: TryKind::With,
        });
        let entered = self.call_and_run(enter, &[mgr])?;
        self.push(entered);
        Ok(())
    }

    fn op_pop_with(&mut self) -> RunResult<()> {
        let block = self
            .frame_mut()
            .try_stack
            .pop()
            .ok_or_else(|| RunError::internal("PopWith without an active with-block"))?;
        if block.kind != TryKind::With {
            return Err(RunError::internal("PopWith popped a non-with handler"));
        }
        let mgr = self.pop();
        let class_id = self.class_of(mgr);
        let exit = match self.heap.get(class_id) {
            HeapData::Class(class) => class.slots.exit,
            _ => None,
        };
        if let Some(exit) = exit {
            self.call_and_run(exit, &[mgr])?;
        }
        Ok(())
    }
}

fn jump_target(ip: usize, offset: i16) -> usize {
    let target = ip as i64 + i64::from(offset);
    usize::try_from(target).expect("jump produced a negative instruction pointer")
}

/// Floats format with `ryu`, which keeps `1.0` distinct from `1`.
fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let mut buffer = ryu::Buffer::new();
    buffer.format(f).to_string()
}
