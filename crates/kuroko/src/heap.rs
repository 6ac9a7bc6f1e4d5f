//! Object heap and garbage collector.
//!
//! All heap-only runtime values live in a slot arena indexed by `HeapId`.
//! Freed slots go on a free list and are reused by later allocations, keeping
//! memory usage flat for long-running allocation churn.
//!
//! Collection is stop-the-world mark-and-sweep, paced by bytes: every
//! allocation adds a per-variant size estimate to `bytes_allocated`, and once
//! that crosses `next_gc` (and the collector is not paused) the VM runs a
//! collection before the allocation proceeds. After a sweep the threshold is
//! reset to twice the surviving byte count, floored at `MIN_HEAP`.
//!
//! Marking is tri-color with a gray worklist; `scan_children` is the
//! per-variant blacken step. Sweeping drops the slot's `HeapData`, which
//! releases native payloads (vectors, tables, byte buffers) through ordinary
//! `Drop`.

use std::{collections::BTreeMap, rc::Rc};

use crate::{
    bytecode::CodeObject,
    table::Table,
    types::{
        BoundMethod, ClassObject, Closure, Instance, List, Module, NativeFunction, NativePayload, Property, StrObject,
        Upvalue,
    },
    value::Value,
};

/// Collection threshold floor: the heap never schedules a collection below
/// this many live bytes.
const MIN_HEAP: usize = 1 << 20;

/// Index of a live object in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Every runtime object variant. One enum plus a polymorphic scan function,
/// rather than an inheritance tree.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(StrObject),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(List),
    Dict(Table),
    Closure(Closure),
    Native(NativeFunction),
    BoundMethod(BoundMethod),
    Class(ClassObject),
    Instance(Instance),
    Upvalue(Upvalue),
    Code(Rc<CodeObject>),
    Module(Module),
    Property(Property),
}

impl HeapData {
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Closure(_) => "function",
            Self::Native(_) => "native function",
            Self::BoundMethod(_) => "bound method",
            Self::Class(_) => "class",
            Self::Instance(_) => "instance",
            Self::Upvalue(_) => "upvalue",
            Self::Code(_) => "code object",
            Self::Module(_) => "module",
            Self::Property(_) => "property",
        }
    }

    /// Rough live-byte estimate used for collection pacing.
    fn estimate_size(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.as_str().len(),
            Self::Bytes(b) => b.len(),
            Self::Tuple(items) => items.len() * size_of::<Value>(),
            Self::List(list) => list.items.capacity() * size_of::<Value>(),
            Self::Dict(table) => table.capacity() * 3 * size_of::<Value>(),
            Self::Closure(c) => (c.upvalues.len() + c.defaults.len()) * size_of::<Value>(),
            Self::Class(c) => c.methods.capacity() * 3 * size_of::<Value>(),
            Self::Instance(i) => i.fields.capacity() * 3 * size_of::<Value>(),
            Self::Code(code) => code.bytecode.len() + code.constants.len() * size_of::<Value>(),
            Self::Module(m) => m.fields.capacity() * 3 * size_of::<Value>(),
            Self::Native(_) | Self::BoundMethod(_) | Self::Upvalue(_) | Self::Property(_) => 0,
        };
        size_of::<Self>() + payload
    }
}

#[derive(Debug)]
struct Slot {
    data: HeapData,
    marked: bool,
    /// Set while a container repr is being rendered; recursion prints `[...]`.
    in_repr: bool,
    size: usize,
}

/// Snapshot of heap state at a point in time.
///
/// The `objects_by_variant` map uses `BTreeMap` for deterministic iteration
/// order, making snapshots suitable for display and comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Total number of live objects on the heap.
    pub live_objects: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total heap capacity (live + free).
    pub total_slots: usize,
    /// Estimated live bytes, as tracked for collection pacing.
    pub bytes_allocated: usize,
    /// Number of interned strings currently registered.
    pub interned_strings: usize,
    /// Breakdown of live objects by variant name.
    pub objects_by_variant: BTreeMap<&'static str, usize>,
}

/// Slot arena backing all heap-only runtime values.
#[derive(Debug)]
pub struct Heap {
    entries: Vec<Option<Slot>>,
    /// Freed slot ids available for reuse. Populated by `sweep`, consumed by
    /// `allocate`.
    free_list: Vec<HeapId>,
    bytes_allocated: usize,
    next_gc: usize,
    /// While non-zero, collections are deferred. Used around allocation
    /// sequences that produce transiently unreachable values.
    pause_depth: u32,
    /// Collect before every allocation; exercised by GC-soundness tests.
    stress: bool,
}

impl Heap {
    #[must_use]
    pub(crate) fn new(stress: bool) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: MIN_HEAP,
            pause_depth: 0,
            stress,
        }
    }

    /// Stores `data` in a fresh or recycled slot.
    ///
    /// Never collects; the VM decides collection via `should_collect` before
    /// calling this, because only the VM can enumerate roots.
    pub(crate) fn allocate(&mut self, data: HeapData) -> HeapId {
        let size = data.estimate_size();
        self.bytes_allocated += size;
        let slot = Slot {
            data,
            marked: false,
            in_repr: false,
            size,
        };
        if let Some(id) = self.free_list.pop() {
            debug_assert!(self.entries[id.0 as usize].is_none(), "free list slot still occupied");
            self.entries[id.0 as usize] = Some(slot);
            id
        } else {
            let id = HeapId(u32::try_from(self.entries.len()).expect("heap slot count exceeds u32"));
            self.entries.push(Some(slot));
            id
        }
    }

    /// # Panics
    /// Panics on a stale id; the collector only frees unreachable objects, so
    /// a stale id always indicates a rooting bug.
    #[must_use]
    pub(crate) fn get(&self, id: HeapId) -> &HeapData {
        &self.entries[id.0 as usize].as_ref().expect("stale heap id").data
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entries[id.0 as usize].as_mut().expect("stale heap id").data
    }

    /// Borrows the string content of a `Str` object.
    #[must_use]
    pub(crate) fn str_of(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => s.as_str(),
            other => panic!("expected str, found {}", other.variant_name()),
        }
    }

    /// Returns the string content if `value` is a `Str` object.
    #[must_use]
    pub(crate) fn value_as_str(&self, value: Value) -> Option<&str> {
        match value {
            Value::Object(id) => match self.get(id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    /// The primary table of a container-like object: dict entries, instance
    /// fields, class methods, or module globals.
    #[must_use]
    pub(crate) fn table_of(&self, id: HeapId) -> Option<&Table> {
        match self.get(id) {
            HeapData::Dict(table) => Some(table),
            HeapData::Instance(instance) => Some(&instance.fields),
            HeapData::Class(class) => Some(&class.methods),
            HeapData::Module(module) => Some(&module.fields),
            _ => None,
        }
    }

    /// Temporarily extracts the primary table so it can be mutated while the
    /// heap is still readable for hashing. Pair with `put_table`; nothing may
    /// allocate in between.
    pub(crate) fn take_table(&mut self, id: HeapId) -> Table {
        match self.get_mut(id) {
            HeapData::Dict(table) => std::mem::take(table),
            HeapData::Instance(instance) => std::mem::take(&mut instance.fields),
            HeapData::Class(class) => std::mem::take(&mut class.methods),
            HeapData::Module(module) => std::mem::take(&mut module.fields),
            other => panic!("object {} has no table", other.variant_name()),
        }
    }

    pub(crate) fn put_table(&mut self, id: HeapId, table: Table) {
        match self.get_mut(id) {
            HeapData::Dict(slot) => *slot = table,
            HeapData::Instance(instance) => instance.fields = table,
            HeapData::Class(class) => class.methods = table,
            HeapData::Module(module) => module.fields = table,
            other => panic!("object {} has no table", other.variant_name()),
        }
    }

    /// Inserts into an object's primary table. Returns true iff the key was
    /// new. The key must already be hashable.
    pub(crate) fn table_set(&mut self, id: HeapId, key: Value, value: Value) -> bool {
        let mut table = self.take_table(id);
        let is_new = table.set(self, key, value);
        self.put_table(id, table);
        is_new
    }

    /// Looks up in an object's primary table.
    #[must_use]
    pub(crate) fn table_get(&self, id: HeapId, key: Value) -> Option<Value> {
        self.table_of(id).and_then(|t| t.get(self, key))
    }

    /// Deletes from an object's primary table. Returns true iff present.
    pub(crate) fn table_delete(&mut self, id: HeapId, key: Value) -> bool {
        let mut table = self.take_table(id);
        let removed = table.delete(self, key);
        self.put_table(id, table);
        removed
    }

    // --- collection pacing -------------------------------------------------

    #[must_use]
    pub(crate) fn should_collect(&self) -> bool {
        self.pause_depth == 0 && (self.stress || self.bytes_allocated >= self.next_gc)
    }

    pub(crate) fn set_stress(&mut self, on: bool) {
        self.stress = on;
    }

    pub(crate) fn pause(&mut self) {
        self.pause_depth += 1;
    }

    pub(crate) fn resume(&mut self) {
        debug_assert!(self.pause_depth > 0, "unbalanced GC resume");
        self.pause_depth = self.pause_depth.saturating_sub(1);
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // --- mark phase --------------------------------------------------------

    /// Traces every object reachable from `roots`, setting mark bits.
    pub(crate) fn mark(&mut self, roots: Vec<HeapId>) {
        let mut gray = roots;
        while let Some(id) = gray.pop() {
            let idx = id.0 as usize;
            let Some(slot) = self.entries.get_mut(idx).and_then(Option::as_mut) else {
                continue;
            };
            if slot.marked {
                continue;
            }
            slot.marked = true;
            let slot = self.entries[idx].as_ref().expect("slot vanished during mark");
            scan_children(&slot.data, &mut gray);
        }
    }

    #[must_use]
    pub(crate) fn is_marked(&self, id: HeapId) -> bool {
        self.entries[id.0 as usize].as_ref().is_some_and(|s| s.marked)
    }

    /// Frees every unmarked slot and clears mark bits on survivors. Returns
    /// the number of objects freed and resets the pacing threshold.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (idx, entry) in self.entries.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(slot.size);
                    *entry = None;
                    self.free_list.push(HeapId(idx as u32));
                    freed += 1;
                }
                None => {}
            }
        }
        self.next_gc = (self.bytes_allocated * 2).max(MIN_HEAP);
        freed
    }

    // --- repr recursion flag -----------------------------------------------

    /// Flags `id` as being rendered. Returns false if it already was, in
    /// which case the caller prints the recursion placeholder instead.
    pub(crate) fn enter_repr(&mut self, id: HeapId) -> bool {
        let slot = self.entries[id.0 as usize].as_mut().expect("stale heap id");
        if slot.in_repr {
            return false;
        }
        slot.in_repr = true;
        true
    }

    pub(crate) fn exit_repr(&mut self, id: HeapId) {
        if let Some(slot) = self.entries[id.0 as usize].as_mut() {
            slot.in_repr = false;
        }
    }

    // --- introspection ------------------------------------------------------

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_variant: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut live_objects = 0;
        for slot in self.entries.iter().flatten() {
            live_objects += 1;
            *objects_by_variant.entry(slot.data.variant_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            bytes_allocated: self.bytes_allocated,
            interned_strings: 0,
            objects_by_variant,
        }
    }
}

/// Pushes a value's object id, if any, onto the gray worklist.
fn mark_value(value: Value, gray: &mut Vec<HeapId>) {
    if let Value::Object(id) = value {
        gray.push(id);
    }
}

fn mark_table(table: &Table, gray: &mut Vec<HeapId>) {
    for (key, value) in table.iter() {
        mark_value(key, gray);
        mark_value(value, gray);
    }
}

/// Blackens one object: pushes everything it references onto the worklist.
fn scan_children(data: &HeapData, gray: &mut Vec<HeapId>) {
    match data {
        HeapData::Str(_) | HeapData::Bytes(_) => {}
        HeapData::Tuple(items) => {
            for &item in items {
                mark_value(item, gray);
            }
        }
        HeapData::List(list) => {
            for &item in &list.items {
                mark_value(item, gray);
            }
        }
        HeapData::Dict(table) => mark_table(table, gray),
        HeapData::Closure(closure) => {
            gray.push(closure.code);
            gray.push(closure.globals);
            gray.extend(closure.upvalues.iter().copied());
            for &value in &closure.defaults {
                mark_value(value, gray);
            }
            for &(name, value) in &closure.kw_defaults {
                gray.push(name);
                mark_value(value, gray);
            }
            if let Some(annotations) = closure.annotations {
                gray.push(annotations);
            }
        }
        HeapData::Native(native) => gray.push(native.name),
        HeapData::BoundMethod(bound) => {
            mark_value(bound.receiver, gray);
            mark_value(bound.method, gray);
        }
        HeapData::Class(class) => {
            gray.push(class.name);
            if let Some(base) = class.base {
                gray.push(base);
            }
            mark_table(&class.methods, gray);
            // The subclasses registry is weak by design: entries are
            // validated against slot reuse on access, never kept alive here.
        }
        HeapData::Instance(instance) => {
            gray.push(instance.class);
            mark_table(&instance.fields, gray);
            match &instance.payload {
                None => {}
                Some(NativePayload::List(items) | NativePayload::Tuple(items)) => {
                    for &item in items {
                        mark_value(item, gray);
                    }
                }
                Some(NativePayload::Dict(table)) => mark_table(table, gray),
                Some(NativePayload::Str(_)) => {}
                Some(NativePayload::Iter(iter)) => mark_value(iter.target, gray),
            }
        }
        HeapData::Upvalue(upvalue) => {
            // An open upvalue's slot is owned by the thread stack, which is
            // itself a root; only the closed value is traced here.
            if let Upvalue::Closed(value) = upvalue {
                mark_value(*value, gray);
            }
        }
        HeapData::Code(code) => {
            for &constant in &code.constants {
                mark_value(constant, gray);
            }
            mark_value(code.name, gray);
            mark_value(code.filename, gray);
            mark_value(code.docstring, gray);
            gray.extend(code.params.names.iter().copied());
            gray.extend(code.params.keyword_only.iter().copied());
            gray.extend(code.local_names.iter().copied());
        }
        HeapData::Module(module) => {
            gray.push(module.name);
            mark_table(&module.fields, gray);
        }
        HeapData::Property(property) => {
            mark_value(property.getter, gray);
            if let Some(setter) = property.setter {
                mark_value(setter, gray);
            }
        }
    }
}
