//! Iterator instances and the identity-sentinel iteration protocol.
//!
//! An iterator is an instance of the built-in `iterator` class carrying an
//! `IterState` payload. Advancing is calling the iterator; exhaustion is
//! signaled by the call returning the iterator object *itself*, a sentinel
//! distinguishable by identity and cheaper than exception-driven loop
//! termination. `ForIter` and every native that consumes iterables rely on
//! that contract.

use crate::{
    args::Args,
    exception::{ExcKind, RunResult},
    heap::HeapData,
    intern::SpecialName,
    types::{NativePayload, dict::dict_table, list::list_items, tuple::tuple_items},
    value::Value,
    vm::Vm,
};

/// Iteration cursor. `index` is a position whose meaning depends on the
/// target: element index for sequences, byte offset for strings, slot cursor
/// for dict tables, step count for ranges.
#[derive(Debug)]
pub(crate) struct IterState {
    pub target: Value,
    pub index: usize,
}

impl IterState {
    #[must_use]
    pub fn new(target: Value) -> Self {
        Self { target, index: 0 }
    }
}

/// `iterator.__call__`: produce the next element, or the iterator itself
/// when exhausted.
pub(crate) fn iter_call(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    let Some(receiver_id) = receiver.as_object() else {
        return Err(vm.raise(ExcKind::TypeError, "__call__() requires an iterator receiver".to_string()));
    };
    let (target, index) = match vm.heap.get(receiver_id) {
        HeapData::Instance(instance) => match &instance.payload {
            Some(NativePayload::Iter(state)) => (state.target, state.index),
            _ => {
                return Err(vm.raise(ExcKind::TypeError, "__call__() requires an iterator receiver".to_string()));
            }
        },
        _ => {
            return Err(vm.raise(ExcKind::TypeError, "__call__() requires an iterator receiver".to_string()));
        }
    };

    let step = advance(vm, target, index)?;
    let Some((value, next_index)) = step else {
        // Exhausted: hand the loop the iterator itself.
        return Ok(receiver);
    };
    if let HeapData::Instance(instance) = vm.heap.get_mut(receiver_id)
        && let Some(NativePayload::Iter(state)) = &mut instance.payload
    {
        state.index = next_index;
    }
    Ok(value)
}

/// `iterator.__iter__` returns the iterator unchanged, so iterating an
/// iterator visits the same sequence as iterating its source.
pub(crate) fn iter_iter(_vm: &mut Vm, args: Args) -> RunResult<Value> {
    Ok(args.get(0).unwrap_or(Value::None))
}

/// Computes the element at `index` of `target` and the successor index, or
/// `None` when the target is exhausted.
fn advance(vm: &mut Vm, target: Value, index: usize) -> RunResult<Option<(Value, usize)>> {
    if let Some(items) = list_items(&vm.heap, target).or_else(|| tuple_items(&vm.heap, target)) {
        return Ok(items.get(index).map(|&v| (v, index + 1)));
    }
    if let Some(table) = dict_table(&vm.heap, target) {
        return Ok(table.next_entry(index).map(|(next, key, _)| (key, next)));
    }
    if let Some(text) = vm.string_content(target) {
        let Some(c) = text[index.min(text.len())..].chars().next() else {
            return Ok(None);
        };
        let next = index + c.len_utf8();
        let rendered = c.to_string();
        let id = vm.intern(&rendered);
        return Ok(Some((Value::Object(id), next)));
    }
    if let Value::Object(id) = target
        && let HeapData::Bytes(bytes) = vm.heap.get(id)
    {
        return Ok(bytes.get(index).map(|&b| (Value::Int(i64::from(b)), index + 1)));
    }
    if let Some((start, stop, step)) = range_parts(vm, target) {
        let value = start + (index as i64) * step;
        let in_bounds = if step > 0 { value < stop } else { value > stop };
        return Ok(in_bounds.then_some((Value::Int(value), index + 1)));
    }
    let found = target.variant_name(&vm.heap);
    Err(vm.raise(ExcKind::TypeError, format!("'{found}' object is not iterable")))
}

/// Reads `(start, stop, step)` off a range instance, or `None` if `target`
/// is not one.
#[must_use]
pub(crate) fn range_parts(vm: &Vm, target: Value) -> Option<(i64, i64, i64)> {
    let id = target.as_object()?;
    let HeapData::Instance(instance) = vm.heap.get(id) else {
        return None;
    };
    if instance.class != vm.classes.range {
        return None;
    }
    let field = |name: SpecialName| {
        instance
            .fields
            .get(&vm.heap, Value::Object(vm.names.get(name)))
            .and_then(Value::as_int)
    };
    Some((field(SpecialName::Start)?, field(SpecialName::Stop)?, field(SpecialName::Step)?))
}

fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 {
        (stop - start + step - 1).div_euclid(step).max(0)
    } else {
        (start - stop - step - 1).div_euclid(-step).max(0)
    }
}

pub(crate) fn range_iter(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    if range_parts(vm, receiver).is_none() {
        return Err(vm.raise(ExcKind::TypeError, "__iter__() requires a range receiver".to_string()));
    }
    vm.make_iterator(receiver)
}

pub(crate) fn range_len_native(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    let Some((start, stop, step)) = range_parts(vm, receiver) else {
        return Err(vm.raise(ExcKind::TypeError, "__len__() requires a range receiver".to_string()));
    };
    Ok(Value::Int(range_len(start, stop, step)))
}

pub(crate) fn range_contains(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    let Some((start, stop, step)) = range_parts(vm, receiver) else {
        return Err(vm.raise(ExcKind::TypeError, "__contains__() requires a range receiver".to_string()));
    };
    let Some(needle) = args.get(1).and_then(Value::as_int) else {
        return Ok(Value::Bool(false));
    };
    let in_span = if step > 0 {
        needle >= start && needle < stop
    } else {
        needle <= start && needle > stop
    };
    Ok(Value::Bool(in_span && (needle - start) % step == 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_length_matches_enumeration() {
        let cases = [(0, 10, 1), (0, 10, 3), (10, 0, -1), (10, 0, -3), (5, 5, 1), (0, -3, 1)];
        for (start, stop, step) in cases {
            let mut count = 0;
            let mut v = start;
            while if step > 0 { v < stop } else { v > stop } {
                count += 1;
                v += step;
            }
            assert_eq!(range_len(start, stop, step), count, "range({start}, {stop}, {step})");
        }
    }
}
