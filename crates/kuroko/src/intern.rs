//! String interning and the cached special-method names.
//!
//! Every string object is interned: a content-keyed map hands back the
//! existing heap id when the bytes match, so string equality anywhere in the
//! runtime is id equality. The map holds weak entries: after the mark phase
//! the VM drops every entry whose string did not survive, then lets the sweep
//! free the objects.

use ahash::AHashMap;
use strum::{EnumCount, IntoStaticStr, VariantArray};

use crate::{
    heap::{Heap, HeapData, HeapId},
    types::StrObject,
};

/// Content-keyed intern map. Not a GC root.
#[derive(Debug, Default)]
pub(crate) struct Strings {
    map: AHashMap<Box<str>, HeapId>,
}

impl Strings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing id for `text`, or allocates and registers a new
    /// string object. The caller handles collection pacing before this runs.
    pub fn intern(&mut self, heap: &mut Heap, text: &str) -> HeapId {
        if let Some(&id) = self.map.get(text) {
            return id;
        }
        let id = heap.allocate(HeapData::Str(StrObject::new(text)));
        self.map.insert(text.into(), id);
        id
    }

    /// Number of interned strings currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Drops entries whose strings did not survive marking. Must run after
    /// the mark phase and before the sweep, so probe results never point at
    /// freed slots.
    pub fn sweep(&mut self, heap: &Heap) {
        self.map.retain(|_, id| heap.is_marked(*id));
    }
}

/// Reserved names the runtime looks up on classes and instances. Interned
/// once at startup and kept rooted, so slot population and attribute paths
/// compare ids instead of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, VariantArray, IntoStaticStr)]
pub(crate) enum SpecialName {
    #[strum(serialize = "__init__")]
    Init,
    #[strum(serialize = "__repr__")]
    Repr,
    #[strum(serialize = "__str__")]
    Str,
    #[strum(serialize = "__call__")]
    Call,
    #[strum(serialize = "__eq__")]
    Eq,
    #[strum(serialize = "__hash__")]
    Hash,
    #[strum(serialize = "__iter__")]
    Iter,
    #[strum(serialize = "__len__")]
    Len,
    #[strum(serialize = "__contains__")]
    Contains,
    #[strum(serialize = "__getitem__")]
    GetItem,
    #[strum(serialize = "__setitem__")]
    SetItem,
    #[strum(serialize = "__delitem__")]
    DelItem,
    #[strum(serialize = "__enter__")]
    Enter,
    #[strum(serialize = "__exit__")]
    Exit,
    #[strum(serialize = "__getattr__")]
    GetAttr,
    #[strum(serialize = "__setattr__")]
    SetAttr,
    #[strum(serialize = "__delattr__")]
    DelAttr,
    #[strum(serialize = "__get__")]
    Get,
    #[strum(serialize = "__set__")]
    Set,
    #[strum(serialize = "__add__")]
    Add,
    #[strum(serialize = "__radd__")]
    RAdd,
    #[strum(serialize = "__sub__")]
    Sub,
    #[strum(serialize = "__rsub__")]
    RSub,
    #[strum(serialize = "__mul__")]
    Mul,
    #[strum(serialize = "__rmul__")]
    RMul,
    #[strum(serialize = "__truediv__")]
    TrueDiv,
    #[strum(serialize = "__rtruediv__")]
    RTrueDiv,
    #[strum(serialize = "__floordiv__")]
    FloorDiv,
    #[strum(serialize = "__rfloordiv__")]
    RFloorDiv,
    #[strum(serialize = "__mod__")]
    Mod,
    #[strum(serialize = "__rmod__")]
    RMod,
    #[strum(serialize = "__pow__")]
    Pow,
    #[strum(serialize = "__rpow__")]
    RPow,
    #[strum(serialize = "__and__")]
    And,
    #[strum(serialize = "__rand__")]
    RAnd,
    #[strum(serialize = "__or__")]
    Or,
    #[strum(serialize = "__ror__")]
    ROr,
    #[strum(serialize = "__xor__")]
    Xor,
    #[strum(serialize = "__rxor__")]
    RXor,
    #[strum(serialize = "__lshift__")]
    LShift,
    #[strum(serialize = "__rlshift__")]
    RLShift,
    #[strum(serialize = "__rshift__")]
    RShift,
    #[strum(serialize = "__rrshift__")]
    RRShift,
    #[strum(serialize = "__lt__")]
    Lt,
    #[strum(serialize = "__le__")]
    Le,
    #[strum(serialize = "__gt__")]
    Gt,
    #[strum(serialize = "__ge__")]
    Ge,
    #[strum(serialize = "__annotations__")]
    Annotations,
    #[strum(serialize = "__builtins__")]
    Builtins,
    #[strum(serialize = "__name__")]
    DunderName,
    #[strum(serialize = "__doc__")]
    Doc,
    #[strum(serialize = "args")]
    ExcArgs,
    #[strum(serialize = "traceback")]
    Traceback,
    #[strum(serialize = "start")]
    Start,
    #[strum(serialize = "stop")]
    Stop,
    #[strum(serialize = "step")]
    Step,
}

impl SpecialName {
    #[must_use]
    pub fn text(self) -> &'static str {
        self.into()
    }
}

/// The interned ids of every `SpecialName`, indexed by discriminant.
/// These are GC roots: the names stay alive for the VM's lifetime.
#[derive(Debug)]
pub(crate) struct SpecialNames {
    ids: [HeapId; SpecialName::COUNT],
}

impl SpecialNames {
    pub fn intern_all(strings: &mut Strings, heap: &mut Heap) -> Self {
        let ids = std::array::from_fn(|i| strings.intern(heap, SpecialName::VARIANTS[i].text()));
        Self { ids }
    }

    #[must_use]
    pub fn get(&self, name: SpecialName) -> HeapId {
        self.ids[name as usize]
    }

    /// All name ids, for root enumeration.
    pub fn iter(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.ids.iter().copied()
    }
}
