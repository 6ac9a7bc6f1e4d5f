//! Tuple method natives.

use crate::{
    args::Args,
    exception::{ExcKind, RunResult},
    heap::{Heap, HeapData},
    types::{NativePayload, list::normalize_index},
    value::Value,
    vm::Vm,
};

/// Items of a tuple value or tuple-payload instance.
#[must_use]
pub(crate) fn tuple_items(heap: &Heap, value: Value) -> Option<&Vec<Value>> {
    let id = value.as_object()?;
    match heap.get(id) {
        HeapData::Tuple(items) => Some(items),
        HeapData::Instance(instance) => match &instance.payload {
            Some(NativePayload::Tuple(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn receiver_items(vm: &mut Vm, args: &Args, method: &str) -> RunResult<Vec<Value>> {
    let receiver = args.get(0).unwrap_or(Value::None);
    match tuple_items(&vm.heap, receiver) {
        Some(items) => Ok(items.clone()),
        None => Err(vm.raise(ExcKind::TypeError, format!("{method}() requires a tuple receiver"))),
    }
}

pub(crate) fn tuple_len(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let items = receiver_items(vm, &args, "__len__")?;
    Ok(Value::Int(items.len() as i64))
}

pub(crate) fn tuple_getitem(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let items = receiver_items(vm, &args, "__getitem__")?;
    let Some(index) = args.get(1) else {
        return Err(vm.arity_error("__getitem__", 1, 0));
    };
    match index.as_int().and_then(|i| normalize_index(i, items.len())) {
        Some(i) => Ok(items[i]),
        None => Err(vm.raise(ExcKind::IndexError, "tuple index out of range".to_string())),
    }
}

pub(crate) fn tuple_contains(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let items = receiver_items(vm, &args, "__contains__")?;
    let Some(needle) = args.get(1) else {
        return Err(vm.arity_error("__contains__", 1, 0));
    };
    for item in items {
        if vm.values_eq(item, needle)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

pub(crate) fn tuple_iter(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    if tuple_items(&vm.heap, receiver).is_none() {
        return Err(vm.raise(ExcKind::TypeError, "__iter__() requires a tuple receiver".to_string()));
    }
    vm.make_iterator(receiver)
}
