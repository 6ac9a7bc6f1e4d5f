//! Call-argument views and the stack-window split.
//!
//! A call site pushes positional arguments and, optionally, a kwargs marker
//! followed by name/value pairs. `split_window` recovers the two groups from
//! the raw stack window; `Args` is the copied view native functions receive
//! (the originals stay on the stack, rooted, for the duration of the call).

use smallvec::SmallVec;

use crate::{
    heap::{Heap, HeapId},
    value::Value,
    vm::Vm,
};

/// Arguments to a native function: positional values (receiver first for
/// method calls) plus resolved keyword pairs.
#[derive(Debug, Default)]
pub struct Args {
    values: SmallVec<[Value; 6]>,
    kwargs: SmallVec<[(HeapId, Value); 2]>,
}

impl Args {
    /// Builds an argument view from a raw stack window, splitting out any
    /// kwargs marker. Returns `None` if the window is malformed (a marker
    /// not followed by the announced pairs, or a non-string name).
    #[must_use]
    pub(crate) fn from_window(heap: &Heap, window: &[Value]) -> Option<Self> {
        let (positional, pairs) = split_window(heap, window)?;
        Some(Self {
            values: SmallVec::from_slice(positional),
            kwargs: pairs,
        })
    }

    /// Positional argument at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.values.get(index).copied()
    }

    /// Number of positional arguments (including the receiver, if any).
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn positional(&self) -> &[Value] {
        &self.values
    }

    /// Looks up a keyword argument by name text.
    #[must_use]
    pub fn kwarg(&self, vm: &Vm, name: &str) -> Option<Value> {
        self.kwargs
            .iter()
            .find(|(id, _)| vm.heap.str_of(*id) == name)
            .map(|&(_, value)| value)
    }
}

/// Splits a call window into positional arguments and keyword pairs.
///
/// The window shape is `[pos..., Kwargs(n), name1, v1, ..., namen, vn]` with
/// the marker section optional. Returns `None` on a malformed window.
pub(crate) fn split_window<'a>(
    heap: &Heap,
    window: &'a [Value],
) -> Option<(&'a [Value], SmallVec<[(HeapId, Value); 2]>)> {
    let marker = window.iter().position(|v| matches!(v, Value::Kwargs(_)));
    let Some(marker_at) = marker else {
        return Some((window, SmallVec::new()));
    };
    let Value::Kwargs(count) = window[marker_at] else {
        unreachable!("position() matched a kwargs marker");
    };
    let pairs_section = &window[marker_at + 1..];
    if pairs_section.len() != count as usize * 2 {
        return None;
    }
    let mut pairs = SmallVec::new();
    for chunk in pairs_section.chunks_exact(2) {
        let name = chunk[0].as_object()?;
        heap.value_as_str(chunk[0])?;
        pairs.push((name, chunk[1]));
    }
    Some((&window[..marker_at], pairs))
}
