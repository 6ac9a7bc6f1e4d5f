//! List payloads and list method natives.
//!
//! A plain `[...]` literal is a `HeapData::List`; an instance of a managed
//! subclass of `list` carries the same storage as an embedded payload. The
//! view helpers below accept either shape so every method and opcode fast
//! path works on both.

use crate::{
    args::Args,
    exception::{ExcKind, RunResult},
    heap::{Heap, HeapData, HeapId},
    types::NativePayload,
    value::Value,
    vm::Vm,
};

/// Growable sequence storage.
#[derive(Debug, Default)]
pub(crate) struct List {
    pub items: Vec<Value>,
}

impl List {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }
}

/// Items of a list value or list-payload instance.
#[must_use]
pub(crate) fn list_items(heap: &Heap, value: Value) -> Option<&Vec<Value>> {
    let id = value.as_object()?;
    match heap.get(id) {
        HeapData::List(list) => Some(&list.items),
        HeapData::Instance(instance) => match &instance.payload {
            Some(NativePayload::List(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

#[must_use]
pub(crate) fn list_items_mut(heap: &mut Heap, id: HeapId) -> Option<&mut Vec<Value>> {
    match heap.get_mut(id) {
        HeapData::List(list) => Some(&mut list.items),
        HeapData::Instance(instance) => match &mut instance.payload {
            Some(NativePayload::List(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

/// Translates a possibly negative index against `len`.
#[must_use]
pub(crate) fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let adjusted = if index < 0 { index + len } else { index };
    (0..len).contains(&adjusted).then(|| adjusted as usize)
}

fn receiver_list_id(vm: &mut Vm, args: &Args, method: &str) -> RunResult<HeapId> {
    let receiver = args.get(0).unwrap_or(Value::None);
    match receiver.as_object() {
        Some(id) if list_items(&vm.heap, receiver).is_some() => Ok(id),
        _ => Err(vm.raise(ExcKind::TypeError, format!("{method}() requires a list receiver"))),
    }
}

pub(crate) fn list_append(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "append")?;
    let Some(item) = args.get(1) else {
        return Err(vm.arity_error("append", 1, 0));
    };
    list_items_mut(&mut vm.heap, id)
        .expect("receiver checked above")
        .push(item);
    Ok(Value::None)
}

/// `pop()` removes and returns the last element; `pop(i)` removes at `i`.
pub(crate) fn list_pop(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "pop")?;
    let len = list_items(&vm.heap, Value::Object(id)).expect("receiver checked above").len();
    if len == 0 {
        return Err(vm.raise(ExcKind::IndexError, "pop from empty list".to_string()));
    }
    let index = match args.get(1) {
        None => len - 1,
        Some(v) => match v.as_int().and_then(|i| normalize_index(i, len)) {
            Some(i) => i,
            None => return Err(vm.raise(ExcKind::IndexError, "pop index out of range".to_string())),
        },
    };
    Ok(list_items_mut(&mut vm.heap, id).expect("receiver checked above").remove(index))
}

pub(crate) fn list_insert(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "insert")?;
    let (Some(index), Some(item)) = (args.get(1), args.get(2)) else {
        return Err(vm.arity_error("insert", 2, args.len().saturating_sub(1)));
    };
    let Some(index) = index.as_int() else {
        return Err(vm.raise(ExcKind::TypeError, "insert() index must be an int".to_string()));
    };
    let items = list_items_mut(&mut vm.heap, id).expect("receiver checked above");
    // Out-of-range insert indices clamp rather than raise.
    let slot = if index < 0 {
        (index + items.len() as i64).max(0) as usize
    } else {
        (index as usize).min(items.len())
    };
    items.insert(slot, item);
    Ok(Value::None)
}

pub(crate) fn list_clear(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "clear")?;
    list_items_mut(&mut vm.heap, id).expect("receiver checked above").clear();
    Ok(Value::None)
}

pub(crate) fn list_extend(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "extend")?;
    let Some(iterable) = args.get(1) else {
        return Err(vm.arity_error("extend", 1, 0));
    };
    let new_items = vm.collect_iterable(iterable)?;
    list_items_mut(&mut vm.heap, id)
        .expect("receiver checked above")
        .extend(new_items);
    Ok(Value::None)
}

pub(crate) fn list_index(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "index")?;
    let Some(needle) = args.get(1) else {
        return Err(vm.arity_error("index", 1, 0));
    };
    let len = list_items(&vm.heap, Value::Object(id)).expect("receiver checked above").len();
    for i in 0..len {
        let item = list_items(&vm.heap, Value::Object(id)).expect("receiver checked above")[i];
        if vm.values_eq(item, needle)? {
            return Ok(Value::Int(i as i64));
        }
    }
    let repr = vm.repr_value(needle)?;
    Err(vm.raise(ExcKind::ValueError, format!("{repr} is not in list")))
}

pub(crate) fn list_len(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "__len__")?;
    let len = list_items(&vm.heap, Value::Object(id)).expect("receiver checked above").len();
    Ok(Value::Int(len as i64))
}

pub(crate) fn list_contains(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "__contains__")?;
    let Some(needle) = args.get(1) else {
        return Err(vm.arity_error("__contains__", 1, 0));
    };
    let len = list_items(&vm.heap, Value::Object(id)).expect("receiver checked above").len();
    for i in 0..len {
        let item = list_items(&vm.heap, Value::Object(id)).expect("receiver checked above")[i];
        if vm.values_eq(item, needle)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

pub(crate) fn list_iter(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    receiver_list_id(vm, &args, "__iter__")?;
    vm.make_iterator(receiver)
}

pub(crate) fn list_getitem(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "__getitem__")?;
    let Some(index) = args.get(1) else {
        return Err(vm.arity_error("__getitem__", 1, 0));
    };
    if let Some(slice) = vm.as_slice_instance(index) {
        let len = list_items(&vm.heap, Value::Object(id)).expect("receiver checked above").len();
        let selected = vm.slice_elements(slice, len, |i, heap| {
            list_items(heap, Value::Object(id)).expect("receiver checked above")[i]
        })?;
        return Ok(vm.alloc_list(selected));
    }
    let items = list_items(&vm.heap, Value::Object(id)).expect("receiver checked above");
    match index.as_int().and_then(|i| normalize_index(i, items.len())) {
        Some(i) => Ok(items[i]),
        None => Err(vm.raise(ExcKind::IndexError, "list index out of range".to_string())),
    }
}

pub(crate) fn list_setitem(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "__setitem__")?;
    let (Some(index), Some(value)) = (args.get(1), args.get(2)) else {
        return Err(vm.arity_error("__setitem__", 2, args.len().saturating_sub(1)));
    };
    let items = list_items_mut(&mut vm.heap, id).expect("receiver checked above");
    let len = items.len();
    match index.as_int().and_then(|i| normalize_index(i, len)) {
        Some(i) => {
            items[i] = value;
            Ok(Value::None)
        }
        None => Err(vm.raise(ExcKind::IndexError, "list assignment index out of range".to_string())),
    }
}

pub(crate) fn list_delitem(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let id = receiver_list_id(vm, &args, "__delitem__")?;
    let Some(index) = args.get(1) else {
        return Err(vm.arity_error("__delitem__", 1, 0));
    };
    let items = list_items_mut(&mut vm.heap, id).expect("receiver checked above");
    let len = items.len();
    match index.as_int().and_then(|i| normalize_index(i, len)) {
        Some(i) => {
            items.remove(i);
            Ok(Value::None)
        }
        None => Err(vm.raise(ExcKind::IndexError, "list index out of range".to_string())),
    }
}
