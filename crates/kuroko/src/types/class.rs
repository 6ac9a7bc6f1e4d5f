//! Class objects, instances, and the cached dunder-slot machinery.
//!
//! Classes form a single-inheritance chain terminating at `object`. Method
//! lookup walks the chain; class finalization flattens the reserved
//! double-underscore names into `CachedSlots` so hot operations (calls,
//! indexing, arithmetic) skip the hash lookups.

use strum::{EnumCount, IntoStaticStr, VariantArray};

use crate::{
    heap::{Heap, HeapData, HeapId},
    intern::{SpecialName, SpecialNames},
    table::Table,
    types::{IterState, NativeFn},
    value::Value,
};

/// Binary operator identities, indexing the per-class dunder slot arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, VariantArray, IntoStaticStr)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    /// The operator's surface syntax, for TypeError messages.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::TrueDiv => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
        }
    }

    #[must_use]
    pub fn dunder(self) -> SpecialName {
        match self {
            Self::Add => SpecialName::Add,
            Self::Sub => SpecialName::Sub,
            Self::Mul => SpecialName::Mul,
            Self::TrueDiv => SpecialName::TrueDiv,
            Self::FloorDiv => SpecialName::FloorDiv,
            Self::Mod => SpecialName::Mod,
            Self::Pow => SpecialName::Pow,
            Self::BitAnd => SpecialName::And,
            Self::BitOr => SpecialName::Or,
            Self::BitXor => SpecialName::Xor,
            Self::Shl => SpecialName::LShift,
            Self::Shr => SpecialName::RShift,
        }
    }

    #[must_use]
    pub fn reflected_dunder(self) -> SpecialName {
        match self {
            Self::Add => SpecialName::RAdd,
            Self::Sub => SpecialName::RSub,
            Self::Mul => SpecialName::RMul,
            Self::TrueDiv => SpecialName::RTrueDiv,
            Self::FloorDiv => SpecialName::RFloorDiv,
            Self::Mod => SpecialName::RMod,
            Self::Pow => SpecialName::RPow,
            Self::BitAnd => SpecialName::RAnd,
            Self::BitOr => SpecialName::ROr,
            Self::BitXor => SpecialName::RXor,
            Self::Shl => SpecialName::RLShift,
            Self::Shr => SpecialName::RRShift,
        }
    }
}

/// Ordering comparisons. The reflected form swaps operands and mirrors the
/// operator (`a < b` retries as `b > a`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, VariantArray)]
pub(crate) enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    #[must_use]
    pub fn dunder(self) -> SpecialName {
        match self {
            Self::Lt => SpecialName::Lt,
            Self::Le => SpecialName::Le,
            Self::Gt => SpecialName::Gt,
            Self::Ge => SpecialName::Ge,
        }
    }

    #[must_use]
    pub fn mirrored(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }
}

/// Which native payload instances of a class embed. Subclassed built-ins
/// inherit their root's kind so a `class Mine(list)` instance carries real
/// list storage after the instance header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum PayloadKind {
    #[default]
    None,
    List,
    Dict,
    Str,
    Tuple,
    Iter,
}

/// Native storage embedded in instances of subclassed built-ins.
#[derive(Debug)]
pub(crate) enum NativePayload {
    List(Vec<Value>),
    Dict(Table),
    Str(String),
    Tuple(Vec<Value>),
    Iter(IterState),
}

impl PayloadKind {
    /// Fresh payload for a newly allocated instance of this kind.
    #[must_use]
    pub fn instantiate(self) -> Option<NativePayload> {
        match self {
            Self::None => None,
            Self::List => Some(NativePayload::List(Vec::new())),
            Self::Dict => Some(NativePayload::Dict(Table::new())),
            Self::Str => Some(NativePayload::Str(String::new())),
            Self::Tuple => Some(NativePayload::Tuple(Vec::new())),
            Self::Iter => Some(NativePayload::Iter(IterState::new(Value::None))),
        }
    }
}

/// Weakly tracked subclass entry.
///
/// Stores the heap id plus the class uid captured at registration, so stale
/// entries can be detected after slot reuse without keeping the subclass
/// alive through collections.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubclassEntry {
    pub class_id: HeapId,
    pub uid: u64,
}

/// Cached dunder-slot pointers, populated at class finalization by walking
/// the base chain so inherited slots are visible without a hash lookup.
#[derive(Debug, Default)]
pub(crate) struct CachedSlots {
    pub init: Option<Value>,
    pub repr: Option<Value>,
    pub str_: Option<Value>,
    pub call: Option<Value>,
    pub eq: Option<Value>,
    pub hash: Option<Value>,
    pub iter: Option<Value>,
    pub len: Option<Value>,
    pub contains: Option<Value>,
    pub getitem: Option<Value>,
    pub setitem: Option<Value>,
    pub delitem: Option<Value>,
    pub enter: Option<Value>,
    pub exit: Option<Value>,
    pub getattr: Option<Value>,
    pub setattr: Option<Value>,
    pub delattr: Option<Value>,
    /// Descriptor protocol (`__get__`/`__set__`) as implemented by instances
    /// of this class when stored on another class.
    pub descr_get: Option<Value>,
    pub descr_set: Option<Value>,
    pub binary: [Option<Value>; BinaryOp::COUNT],
    pub reflected: [Option<Value>; BinaryOp::COUNT],
    pub compare: [Option<Value>; CompareOp::COUNT],
}

/// A class: name, optional base, methods table, and the cached slots.
#[derive(Debug)]
pub(crate) struct ClassObject {
    /// Name string object.
    pub name: HeapId,
    /// Single-inheritance link; `None` only for `object` itself.
    pub base: Option<HeapId>,
    /// Class attributes and methods, keyed by interned name strings.
    pub methods: Table,
    /// Payload embedded in instances (inherited from built-in roots).
    pub payload_kind: PayloadKind,
    /// Built-in constructor override; when present, calling the class runs
    /// this instead of the allocate-and-`__init__` protocol.
    pub ctor: Option<NativeFn>,
    /// Managed code may not subclass this class.
    pub no_inherit: bool,
    /// Identity stamp validating weak subclass entries across slot reuse.
    pub uid: u64,
    pub subclasses: Vec<SubclassEntry>,
    pub slots: CachedSlots,
}

impl ClassObject {
    #[must_use]
    pub fn new(name: HeapId, base: Option<HeapId>, uid: u64) -> Self {
        Self {
            name,
            base,
            methods: Table::new(),
            payload_kind: PayloadKind::None,
            ctor: None,
            no_inherit: false,
            uid,
            subclasses: Vec::new(),
            slots: CachedSlots::default(),
        }
    }
}

/// An instance: class pointer, per-instance fields, and (for subclassed
/// built-ins) an embedded native payload.
#[derive(Debug)]
pub(crate) struct Instance {
    pub class: HeapId,
    pub fields: Table,
    pub payload: Option<NativePayload>,
}

impl Instance {
    #[must_use]
    pub fn new(class: HeapId) -> Self {
        Self {
            class,
            fields: Table::new(),
            payload: None,
        }
    }
}

/// Finds `name` along the base chain starting at `class_id`.
#[must_use]
pub(crate) fn lookup_method(heap: &Heap, class_id: HeapId, name: HeapId) -> Option<Value> {
    let mut current = Some(class_id);
    while let Some(id) = current {
        let HeapData::Class(class) = heap.get(id) else {
            return None;
        };
        if let Some(found) = class.methods.get(heap, Value::Object(name)) {
            return Some(found);
        }
        current = class.base;
    }
    None
}

/// Scans the methods table (and the base chain) to populate the cached
/// dunder slots. Runs when a class body completes and whenever the embedding
/// host finalizes a class it assembled.
pub(crate) fn finalize_class(heap: &mut Heap, names: &SpecialNames, class_id: HeapId) {
    let slot_of = |heap: &Heap, special: SpecialName| lookup_method(heap, class_id, names.get(special));

    let mut slots = CachedSlots {
        init: slot_of(heap, SpecialName::Init),
        repr: slot_of(heap, SpecialName::Repr),
        str_: slot_of(heap, SpecialName::Str),
        call: slot_of(heap, SpecialName::Call),
        eq: slot_of(heap, SpecialName::Eq),
        hash: slot_of(heap, SpecialName::Hash),
        iter: slot_of(heap, SpecialName::Iter),
        len: slot_of(heap, SpecialName::Len),
        contains: slot_of(heap, SpecialName::Contains),
        getitem: slot_of(heap, SpecialName::GetItem),
        setitem: slot_of(heap, SpecialName::SetItem),
        delitem: slot_of(heap, SpecialName::DelItem),
        enter: slot_of(heap, SpecialName::Enter),
        exit: slot_of(heap, SpecialName::Exit),
        getattr: slot_of(heap, SpecialName::GetAttr),
        setattr: slot_of(heap, SpecialName::SetAttr),
        delattr: slot_of(heap, SpecialName::DelAttr),
        descr_get: slot_of(heap, SpecialName::Get),
        descr_set: slot_of(heap, SpecialName::Set),
        ..CachedSlots::default()
    };
    for (i, &op) in BinaryOp::VARIANTS.iter().enumerate() {
        slots.binary[i] = slot_of(heap, op.dunder());
        slots.reflected[i] = slot_of(heap, op.reflected_dunder());
    }
    for (i, &op) in CompareOp::VARIANTS.iter().enumerate() {
        slots.compare[i] = slot_of(heap, op.dunder());
    }

    let HeapData::Class(class) = heap.get_mut(class_id) else {
        panic!("finalize_class on a non-class object");
    };
    class.slots = slots;
}
