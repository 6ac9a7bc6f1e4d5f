//! Dict method natives.
//!
//! A `{...}` literal is a `HeapData::Dict` wrapping the open-addressed
//! table; subclassed dicts embed the same table as an instance payload.

use crate::{
    args::Args,
    exception::{ExcKind, RunResult},
    heap::{Heap, HeapData, HeapId},
    table::Table,
    types::NativePayload,
    value::Value,
    vm::Vm,
};

/// Table of a dict value or dict-payload instance.
#[must_use]
pub(crate) fn dict_table(heap: &Heap, value: Value) -> Option<&Table> {
    let id = value.as_object()?;
    match heap.get(id) {
        HeapData::Dict(table) => Some(table),
        HeapData::Instance(instance) => match &instance.payload {
            Some(NativePayload::Dict(table)) => Some(table),
            _ => None,
        },
        _ => None,
    }
}

/// Extracts the table for mutation; pair with `put_dict_table`.
pub(crate) fn take_dict_table(heap: &mut Heap, id: HeapId) -> Option<Table> {
    match heap.get_mut(id) {
        HeapData::Dict(table) => Some(std::mem::take(table)),
        HeapData::Instance(instance) => match &mut instance.payload {
            Some(NativePayload::Dict(table)) => Some(std::mem::take(table)),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn put_dict_table(heap: &mut Heap, id: HeapId, table: Table) {
    match heap.get_mut(id) {
        HeapData::Dict(slot) => *slot = table,
        HeapData::Instance(instance) => {
            instance.payload = Some(NativePayload::Dict(table));
        }
        other => panic!("put_dict_table on {}", other.variant_name()),
    }
}

fn receiver_dict_id(vm: &mut Vm, args: &Args, method: &str) -> RunResult<HeapId> {
    let receiver = args.get(0).unwrap_or(Value::None);
    match receiver.as_object() {
        Some(id) if dict_table(&vm.heap, receiver).is_some() => Ok(id),
        _ => Err(vm.raise(ExcKind::TypeError, format!("{method}() requires a dict receiver"))),
    }
}

/// Raises TypeError unless `key` is usable as a table key.
pub(crate) fn check_hashable(vm: &mut Vm, key: Value) -> RunResult<()> {
    if crate::hash::hash_value(&vm.heap, key).is_none() {
        let found = key.variant_name(&vm.heap);
        return Err(vm.raise(ExcKind::TypeError, format!("unhashable type: '{found}'")));
    }
    Ok(())
}

pub(crate) fn dict_get(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "get")?;
    let Some(key) = args.get(1) else {
        return Err(vm.arity_error("get", 1, 0));
    };
    check_hashable(vm, key)?;
    let fallback = args.get(2).unwrap_or(Value::None);
    let found = dict_table(&vm.heap, Value::Object(id))
        .expect("receiver checked above")
        .get(&vm.heap, key);
    Ok(found.unwrap_or(fallback))
}

pub(crate) fn dict_pop(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "pop")?;
    let Some(key) = args.get(1) else {
        return Err(vm.arity_error("pop", 1, 0));
    };
    check_hashable(vm, key)?;
    let mut table = take_dict_table(&mut vm.heap, id).expect("receiver checked above");
    let found = table.get(&vm.heap, key);
    if found.is_some() {
        table.delete(&vm.heap, key);
    }
    put_dict_table(&mut vm.heap, id, table);
    match (found, args.get(2)) {
        (Some(value), _) => Ok(value),
        (None, Some(fallback)) => Ok(fallback),
        (None, None) => {
            let repr = vm.repr_value(key)?;
            Err(vm.raise(ExcKind::KeyError, repr))
        }
    }
}

pub(crate) fn dict_keys(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "keys")?;
    let keys: Vec<Value> = dict_table(&vm.heap, Value::Object(id))
        .expect("receiver checked above")
        .iter()
        .map(|(k, _)| k)
        .collect();
    Ok(vm.alloc_list(keys))
}

pub(crate) fn dict_values(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "values")?;
    let values: Vec<Value> = dict_table(&vm.heap, Value::Object(id))
        .expect("receiver checked above")
        .iter()
        .map(|(_, v)| v)
        .collect();
    Ok(vm.alloc_list(values))
}

/// `items()` materializes a list of `(key, value)` tuples in slot order.
pub(crate) fn dict_items(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "items")?;
    let pairs: Vec<(Value, Value)> = dict_table(&vm.heap, Value::Object(id))
        .expect("receiver checked above")
        .iter()
        .collect();
    vm.heap.pause();
    let tuples: Vec<Value> = pairs.into_iter().map(|(k, v)| vm.alloc_tuple(vec![k, v])).collect();
    let result = vm.alloc_list(tuples);
    vm.heap.resume();
    Ok(result)
}

pub(crate) fn dict_update(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "update")?;
    let Some(other) = args.get(1) else {
        return Err(vm.arity_error("update", 1, 0));
    };
    let Some(other_id) = other.as_object().filter(|_| dict_table(&vm.heap, other).is_some()) else {
        let found = other.variant_name(&vm.heap);
        return Err(vm.raise(ExcKind::TypeError, format!("update() argument must be a dict, not {found}")));
    };
    if other_id == id {
        return Ok(Value::None);
    }
    let mut table = take_dict_table(&mut vm.heap, id).expect("receiver checked above");
    let source = dict_table(&vm.heap, other).expect("checked above");
    table.add_all(&vm.heap, source);
    put_dict_table(&mut vm.heap, id, table);
    Ok(Value::None)
}

pub(crate) fn dict_len(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "__len__")?;
    let len = dict_table(&vm.heap, Value::Object(id)).expect("receiver checked above").len();
    Ok(Value::Int(len as i64))
}

pub(crate) fn dict_contains(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "__contains__")?;
    let Some(key) = args.get(1) else {
        return Err(vm.arity_error("__contains__", 1, 0));
    };
    check_hashable(vm, key)?;
    let found = dict_table(&vm.heap, Value::Object(id))
        .expect("receiver checked above")
        .get(&vm.heap, key)
        .is_some();
    Ok(Value::Bool(found))
}

pub(crate) fn dict_getitem(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "__getitem__")?;
    let Some(key) = args.get(1) else {
        return Err(vm.arity_error("__getitem__", 1, 0));
    };
    check_hashable(vm, key)?;
    match dict_table(&vm.heap, Value::Object(id))
        .expect("receiver checked above")
        .get(&vm.heap, key)
    {
        Some(value) => Ok(value),
        None => {
            let repr = vm.repr_value(key)?;
            Err(vm.raise(ExcKind::KeyError, repr))
        }
    }
}

pub(crate) fn dict_setitem(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "__setitem__")?;
    let (Some(key), Some(value)) = (args.get(1), args.get(2)) else {
        return Err(vm.arity_error("__setitem__", 2, args.len().saturating_sub(1)));
    };
    check_hashable(vm, key)?;
    let mut table = take_dict_table(&mut vm.heap, id).expect("receiver checked above");
    table.set(&vm.heap, key, value);
    put_dict_table(&mut vm.heap, id, table);
    Ok(Value::None)
}

pub(crate) fn dict_delitem(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_dict_id(vm, &args, "__delitem__")?;
    let Some(key) = args.get(1) else {
        return Err(vm.arity_error("__delitem__", 1, 0));
    };
    check_hashable(vm, key)?;
    let mut table = take_dict_table(&mut vm.heap, id).expect("receiver checked above");
    let removed = table.delete(&vm.heap, key);
    put_dict_table(&mut vm.heap, id, table);
    if removed {
        Ok(Value::None)
    } else {
        let repr = vm.repr_value(key)?;
        Err(vm.raise(ExcKind::KeyError, repr))
    }
}

pub(crate) fn dict_iter(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    receiver_dict_id(vm, &args, "__iter__")?;
    vm.make_iterator(receiver)
}
