//! Population of the `__builtins__` module.
//!
//! Runs once at VM construction: wires payload kinds, constructors, and
//! method natives onto the built-in classes, finalizes everything, and
//! attaches classes, exception classes, and global functions to the
//! `__builtins__` module that every globals lookup falls back to.

use strum::VariantArray;

use crate::{
    args::Args,
    exception::{ExcKind, RunResult},
    heap::{HeapData, HeapId},
    table::Table,
    types::{PayloadKind, Property,
        dict::{check_hashable, dict_table},
        iter,
        list::{self, list_items},
        str as str_type,
        tuple::{self, tuple_items},
    },
    value::Value,
    vm::{Vm, exceptions},
};

/// Wires up every built-in class and fills the `__builtins__` module.
pub(crate) fn install(vm: &mut Vm) {
    configure_classes(vm);
    register_methods(vm);
    finalize_all(vm);
    attach_globals(vm);
}

fn configure_classes(vm: &mut Vm) {
    let set = |vm: &mut Vm, id: HeapId, payload: PayloadKind, ctor, no_inherit: bool| {
        let HeapData::Class(class) = vm.heap.get_mut(id) else {
            unreachable!("core class ids always point at classes");
        };
        class.payload_kind = payload;
        class.ctor = ctor;
        class.no_inherit = no_inherit;
    };
    let c = |f: crate::types::NativeFn| Some(f);

    let configured: [(HeapId, PayloadKind, Option<crate::types::NativeFn>, bool); 13] = [
        (vm.classes.list, PayloadKind::List, c(list_ctor), false),
        (vm.classes.dict, PayloadKind::Dict, c(dict_ctor), false),
        (vm.classes.str_, PayloadKind::Str, c(str_ctor), false),
        (vm.classes.tuple, PayloadKind::Tuple, c(tuple_ctor), false),
        (vm.classes.bytes, PayloadKind::None, c(bytes_ctor), false),
        (vm.classes.int_, PayloadKind::None, c(int_ctor), true),
        (vm.classes.float_, PayloadKind::None, c(float_ctor), true),
        (vm.classes.bool_, PayloadKind::None, c(bool_ctor), true),
        (vm.classes.type_, PayloadKind::None, c(type_ctor), true),
        (vm.classes.range, PayloadKind::None, c(range_ctor), true),
        (vm.classes.slice, PayloadKind::None, c(slice_ctor), true),
        (vm.classes.property, PayloadKind::None, c(property_ctor), true),
        (vm.classes.iterator, PayloadKind::Iter, None, true),
    ];
    for (id, payload, ctor, no_inherit) in configured {
        set(vm, id, payload, ctor, no_inherit);
    }
    for id in [
        vm.classes.none_,
        vm.classes.notimplemented,
        vm.classes.function,
        vm.classes.bound_method,
        vm.classes.native,
        vm.classes.module,
        vm.classes.code,
    ] {
        set(vm, id, PayloadKind::None, None, true);
    }
}

fn register_methods(vm: &mut Vm) {
    let list = vm.classes.list;
    vm.define_native(list, "append", list::list_append);
    vm.define_native(list, "pop", list::list_pop);
    vm.define_native(list, "insert", list::list_insert);
    vm.define_native(list, "clear", list::list_clear);
    vm.define_native(list, "extend", list::list_extend);
    vm.define_native(list, "index", list::list_index);
    vm.define_native(list, "__len__", list::list_len);
    vm.define_native(list, "__getitem__", list::list_getitem);
    vm.define_native(list, "__setitem__", list::list_setitem);
    vm.define_native(list, "__delitem__", list::list_delitem);
    vm.define_native(list, "__contains__", list::list_contains);
    vm.define_native(list, "__iter__", list::list_iter);

    let dict = vm.classes.dict;
    vm.define_native(dict, "get", crate::types::dict::dict_get);
    vm.define_native(dict, "pop", crate::types::dict::dict_pop);
    vm.define_native(dict, "keys", crate::types::dict::dict_keys);
    vm.define_native(dict, "values", crate::types::dict::dict_values);
    vm.define_native(dict, "items", crate::types::dict::dict_items);
    vm.define_native(dict, "update", crate::types::dict::dict_update);
    vm.define_native(dict, "__len__", crate::types::dict::dict_len);
    vm.define_native(dict, "__getitem__", crate::types::dict::dict_getitem);
    vm.define_native(dict, "__setitem__", crate::types::dict::dict_setitem);
    vm.define_native(dict, "__delitem__", crate::types::dict::dict_delitem);
    vm.define_native(dict, "__contains__", crate::types::dict::dict_contains);
    vm.define_native(dict, "__iter__", crate::types::dict::dict_iter);

    let str_ = vm.classes.str_;
    vm.define_native(str_, "upper", str_type::str_upper);
    vm.define_native(str_, "lower", str_type::str_lower);
    vm.define_native(str_, "strip", str_type::str_strip);
    vm.define_native(str_, "split", str_type::str_split);
    vm.define_native(str_, "join", str_type::str_join);
    vm.define_native(str_, "startswith", str_type::str_startswith);
    vm.define_native(str_, "__len__", str_type::str_len);
    vm.define_native(str_, "__contains__", str_type::str_contains);
    vm.define_native(str_, "__iter__", str_type::str_iter);

    let tuple_class = vm.classes.tuple;
    vm.define_native(tuple_class, "__len__", tuple::tuple_len);
    vm.define_native(tuple_class, "__getitem__", tuple::tuple_getitem);
    vm.define_native(tuple_class, "__contains__", tuple::tuple_contains);
    vm.define_native(tuple_class, "__iter__", tuple::tuple_iter);

    let range = vm.classes.range;
    vm.define_native(range, "__iter__", iter::range_iter);
    vm.define_native(range, "__len__", iter::range_len_native);
    vm.define_native(range, "__contains__", iter::range_contains);

    let iterator = vm.classes.iterator;
    vm.define_native(iterator, "__call__", iter::iter_call);
    vm.define_native(iterator, "__iter__", iter::iter_iter);

    let property = vm.classes.property;
    vm.define_native(property, "setter", property_setter);

    let base_exception = vm.excs.get(ExcKind::BaseException);
    vm.define_native(base_exception, "__init__", exceptions::exc_init);
    vm.define_native(base_exception, "__str__", exceptions::exc_str);
    vm.define_native(base_exception, "__repr__", exceptions::exc_repr);
}

fn finalize_all(vm: &mut Vm) {
    for id in [
        vm.classes.object_,
        vm.classes.type_,
        vm.classes.none_,
        vm.classes.notimplemented,
        vm.classes.bool_,
        vm.classes.int_,
        vm.classes.float_,
        vm.classes.str_,
        vm.classes.bytes,
        vm.classes.tuple,
        vm.classes.list,
        vm.classes.dict,
        vm.classes.function,
        vm.classes.bound_method,
        vm.classes.native,
        vm.classes.module,
        vm.classes.code,
        vm.classes.property,
        vm.classes.slice,
        vm.classes.range,
        vm.classes.iterator,
    ] {
        vm.finalize_class(id);
    }
    let exception_ids: Vec<HeapId> = vm.excs.iter().collect();
    for id in exception_ids {
        vm.finalize_class(id);
    }
}

fn attach_globals(vm: &mut Vm) {
    let builtins = vm.builtins;
    for (name, class) in [
        ("object", vm.classes.object_),
        ("type", vm.classes.type_),
        ("bool", vm.classes.bool_),
        ("int", vm.classes.int_),
        ("float", vm.classes.float_),
        ("str", vm.classes.str_),
        ("bytes", vm.classes.bytes),
        ("tuple", vm.classes.tuple),
        ("list", vm.classes.list),
        ("dict", vm.classes.dict),
        ("range", vm.classes.range),
        ("slice", vm.classes.slice),
        ("property", vm.classes.property),
    ] {
        vm.attach_named_value(builtins, name, Value::Object(class));
    }
    for &kind in ExcKind::VARIANTS {
        let class = vm.excs.get(kind);
        vm.attach_named_value(builtins, kind.name(), Value::Object(class));
    }
    vm.attach_named_value(builtins, "NotImplemented", Value::NotImplemented);
    vm.define_native(builtins, "print", builtin_print);
    vm.define_native(builtins, "len", builtin_len);
    vm.define_native(builtins, "repr", builtin_repr);
    vm.define_native(builtins, "isinstance", builtin_isinstance);
    vm.define_native(builtins, "hash", builtin_hash);
    vm.define_native(builtins, "id", builtin_id);
    vm.define_native(builtins, "ord", builtin_ord);
    vm.define_native(builtins, "chr", builtin_chr);
    vm.define_native(builtins, "iter", builtin_iter);
}

// --- global functions --------------------------------------------------------

fn builtin_print(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let sep = match args.kwarg(vm, "sep") {
        Some(v) => vm
            .string_content(v)
            .map(str::to_owned)
            .ok_or_else(|| vm.raise(ExcKind::TypeError, "sep must be a string".to_string()))?,
        None => " ".to_string(),
    };
    let end = match args.kwarg(vm, "end") {
        Some(v) => vm
            .string_content(v)
            .map(str::to_owned)
            .ok_or_else(|| vm.raise(ExcKind::TypeError, "end must be a string".to_string()))?,
        None => "\n".to_string(),
    };
    let mut rendered = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        let value = args.get(i).expect("index in range");
        rendered.push(vm.str_value(value)?);
    }
    for (i, piece) in rendered.iter().enumerate() {
        if i > 0 {
            for c in sep.chars() {
                vm.print.write_char(c);
            }
        }
        vm.print.write_str(piece);
    }
    for c in end.chars() {
        vm.print.write_char(c);
    }
    Ok(Value::None)
}

fn builtin_len(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(value) = args.get(0) else {
        return Err(vm.arity_error("len", 1, 0));
    };
    if let Some(items) = list_items(&vm.heap, value).or_else(|| tuple_items(&vm.heap, value)) {
        return Ok(Value::Int(items.len() as i64));
    }
    if let Some(table) = dict_table(&vm.heap, value) {
        return Ok(Value::Int(table.len() as i64));
    }
    if let Some(text) = vm.string_content(value) {
        return Ok(Value::Int(text.chars().count() as i64));
    }
    if let Value::Object(id) = value
        && let HeapData::Bytes(bytes) = vm.heap.get(id)
    {
        return Ok(Value::Int(bytes.len() as i64));
    }
    let len_slot = vm.slot_of(value, |slots| slots.len);
    if let Some(method) = len_slot {
        let result = vm.call_and_run(method, &[value])?;
        if let Some(n) = result.as_int() {
            return Ok(Value::Int(n));
        }
        return Err(vm.raise(ExcKind::TypeError, "__len__ returned a non-integer".to_string()));
    }
    let found = vm.type_name(value);
    Err(vm.raise(ExcKind::TypeError, format!("object of type '{found}' has no len()")))
}

fn builtin_repr(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(value) = args.get(0) else {
        return Err(vm.arity_error("repr", 1, 0));
    };
    let rendered = vm.repr_value(value)?;
    Ok(Value::Object(vm.intern(&rendered)))
}

fn builtin_isinstance(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let (Some(value), Some(spec)) = (args.get(0), args.get(1)) else {
        return Err(vm.arity_error("isinstance", 2, args.len()));
    };
    let classes: Vec<HeapId> = match spec.as_object() {
        Some(id) if matches!(vm.heap.get(id), HeapData::Class(_)) => vec![id],
        Some(id) if matches!(vm.heap.get(id), HeapData::Tuple(_)) => {
            let HeapData::Tuple(items) = vm.heap.get(id) else {
                unreachable!("checked above");
            };
            let items = items.clone();
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_object() {
                    Some(cid) if matches!(vm.heap.get(cid), HeapData::Class(_)) => out.push(cid),
                    _ => {
                        return Err(vm.raise(
                            ExcKind::TypeError,
                            "isinstance() arg 2 must be a type or tuple of types".to_string(),
                        ));
                    }
                }
            }
            out
        }
        _ => {
            return Err(vm.raise(
                ExcKind::TypeError,
                "isinstance() arg 2 must be a type or tuple of types".to_string(),
            ));
        }
    };
    Ok(Value::Bool(classes.iter().any(|&cls| vm.is_instance_of(value, cls))))
}

fn builtin_hash(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(value) = args.get(0) else {
        return Err(vm.arity_error("hash", 1, 0));
    };
    // A managed __hash__ wins for instances; everything else uses the
    // structural contract.
    if let Some(id) = value.as_object()
        && matches!(vm.heap.get(id), HeapData::Instance(_))
        && let Some(method) = vm.slot_of(value, |slots| slots.hash)
    {
        let result = vm.call_and_run(method, &[value])?;
        if let Some(n) = result.as_int() {
            return Ok(Value::Int(n));
        }
        return Err(vm.raise(ExcKind::TypeError, "__hash__ returned a non-integer".to_string()));
    }
    match crate::hash::hash_value(&vm.heap, value) {
        Some(h) => Ok(Value::Int(h.cast_signed())),
        None => {
            let found = vm.type_name(value);
            Err(vm.raise(ExcKind::TypeError, format!("unhashable type: '{found}'")))
        }
    }
}

fn builtin_id(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(value) = args.get(0) else {
        return Err(vm.arity_error("id", 1, 0));
    };
    match value {
        Value::Object(id) => Ok(Value::Int(i64::from(id.index()))),
        other => Ok(Value::Int(
            crate::hash::hash_value(&vm.heap, other).unwrap_or(0).cast_signed(),
        )),
    }
}

fn builtin_ord(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let text = args
        .get(0)
        .and_then(|v| vm.string_content(v))
        .map(str::to_owned)
        .ok_or_else(|| vm.raise(ExcKind::TypeError, "ord() expected a string".to_string()))?;
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(Value::Int(i64::from(c as u32))),
        _ => Err(vm.raise(
            ExcKind::TypeError,
            format!("ord() expected a character, but string of length {} found", text.chars().count()),
        )),
    }
}

fn builtin_chr(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(code) = args.get(0).and_then(Value::as_int) else {
        return Err(vm.raise(ExcKind::TypeError, "chr() requires an int".to_string()));
    };
    let c = u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| vm.raise(ExcKind::ValueError, format!("chr() arg not in range: {code}")))?;
    let rendered = c.to_string();
    Ok(Value::Object(vm.intern(&rendered)))
}

fn builtin_iter(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(value) = args.get(0) else {
        return Err(vm.arity_error("iter", 1, 0));
    };
    vm.get_iter(value)
}

// --- class constructors ------------------------------------------------------
// Constructors receive the class as argument 0.

fn list_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let items = match args.get(1) {
        Some(iterable) => vm.collect_iterable(iterable)?,
        None => Vec::new(),
    };
    Ok(vm.alloc_list(items))
}

fn tuple_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let items = match args.get(1) {
        Some(iterable) => vm.collect_iterable(iterable)?,
        None => Vec::new(),
    };
    Ok(vm.alloc_tuple(items))
}

fn dict_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(source) = args.get(1) else {
        return Ok(vm.alloc_dict(Table::new()));
    };
    // Another dict copies directly; otherwise an iterable of (key, value)
    // pairs.
    if let Some(table) = dict_table(&vm.heap, source) {
        let pairs: Vec<(Value, Value)> = table.iter().collect();
        let dict = vm.alloc_dict(Table::new());
        let dict_id = dict.as_object().expect("dict just allocated");
        for (key, value) in pairs {
            vm.heap.table_set(dict_id, key, value);
        }
        return Ok(dict);
    }
    let pairs = vm.collect_iterable(source)?;
    let scratch_base = vm.thread.scratch.len();
    vm.thread.scratch.extend(pairs.iter().copied());
    let dict = vm.alloc_dict(Table::new());
    vm.thread.scratch.push(dict);
    let dict_id = dict.as_object().expect("dict just allocated");
    let result = (|| {
        for pair in &pairs {
            let Some(items) = tuple_items(&vm.heap, *pair).cloned() else {
                return Err(vm.raise(
                    ExcKind::TypeError,
                    "dict() requires an iterable of key/value pairs".to_string(),
                ));
            };
            if items.len() != 2 {
                return Err(vm.raise(
                    ExcKind::ValueError,
                    format!("dictionary update sequence element has length {}; 2 is required", items.len()),
                ));
            }
            check_hashable(vm, items[0])?;
            vm.heap.table_set(dict_id, items[0], items[1]);
        }
        Ok(dict)
    })();
    vm.thread.scratch.truncate(scratch_base);
    result
}

fn str_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let rendered = match args.get(1) {
        Some(value) => vm.str_value(value)?,
        None => String::new(),
    };
    Ok(Value::Object(vm.intern(&rendered)))
}

fn bytes_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(source) = args.get(1) else {
        return Ok(Value::Object(vm.alloc(HeapData::Bytes(Vec::new()))));
    };
    let items = vm.collect_iterable(source)?;
    let mut bytes = Vec::with_capacity(items.len());
    for item in items {
        let byte = item
            .as_int()
            .and_then(|i| u8::try_from(i).ok())
            .ok_or_else(|| vm.raise(ExcKind::ValueError, "bytes must be in range(0, 256)".to_string()))?;
        bytes.push(byte);
    }
    Ok(Value::Object(vm.alloc(HeapData::Bytes(bytes))))
}

fn int_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(value) = args.get(1) else {
        return Ok(Value::Int(0));
    };
    match value {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        other => {
            let Some(text) = vm.string_content(other) else {
                let found = vm.type_name(other);
                return Err(vm.raise(
                    ExcKind::TypeError,
                    format!("int() argument must be a string or a number, not '{found}'"),
                ));
            };
            let text = text.trim().to_owned();
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| vm.raise(ExcKind::ValueError, format!("invalid literal for int(): '{text}'")))
        }
    }
}

fn float_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(value) = args.get(1) else {
        return Ok(Value::Float(0.0));
    };
    match value.as_float() {
        Some(f) => Ok(Value::Float(f)),
        None => {
            let Some(text) = vm.string_content(value) else {
                let found = vm.type_name(value);
                return Err(vm.raise(
                    ExcKind::TypeError,
                    format!("float() argument must be a string or a number, not '{found}'"),
                ));
            };
            let text = text.trim().to_owned();
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| vm.raise(ExcKind::ValueError, format!("could not convert string to float: '{text}'")))
        }
    }
}

fn bool_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let truthy = args.get(1).is_some_and(|v| v.truthy(&vm.heap));
    Ok(Value::Bool(truthy))
}

/// `type(x)` returns x's class.
fn type_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(value) = args.get(1) else {
        return Err(vm.arity_error("type", 1, 0));
    };
    Ok(Value::Object(vm.class_of(value)))
}

fn range_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let ints: Vec<i64> = (1..args.len())
        .map(|i| args.get(i).and_then(Value::as_int))
        .collect::<Option<Vec<i64>>>()
        .ok_or_else(|| vm.raise(ExcKind::TypeError, "range() arguments must be integers".to_string()))?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(vm.arity_error("range", 1, ints.len())),
    };
    if step == 0 {
        return Err(vm.raise(ExcKind::ValueError, "range() arg 3 must not be zero".to_string()));
    }
    vm.heap.pause();
    let range_class = vm.classes.range;
    let instance = vm.alloc_instance(range_class);
    let instance_id = instance.as_object().expect("instance just allocated");
    for (name, bound) in [
        (crate::intern::SpecialName::Start, start),
        (crate::intern::SpecialName::Stop, stop),
        (crate::intern::SpecialName::Step, step),
    ] {
        let key = Value::Object(vm.names.get(name));
        vm.heap.table_set(instance_id, key, Value::Int(bound));
    }
    vm.heap.resume();
    Ok(instance)
}

fn slice_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    match args.len() - 1 {
        1 => vm.make_slice(Value::None, args.get(1).expect("checked"), Value::None),
        2 => vm.make_slice(args.get(1).expect("checked"), args.get(2).expect("checked"), Value::None),
        3 => vm.make_slice(
            args.get(1).expect("checked"),
            args.get(2).expect("checked"),
            args.get(3).expect("checked"),
        ),
        got => Err(vm.arity_error("slice", 1, got)),
    }
}

fn property_ctor(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(getter) = args.get(1) else {
        return Err(vm.arity_error("property", 1, 0));
    };
    let setter = args.get(2);
    Ok(Value::Object(vm.alloc(HeapData::Property(Property { getter, setter }))))
}

/// `p.setter(fn)`: a new property sharing the getter.
fn property_setter(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    let Some(receiver_id) = receiver.as_object() else {
        return Err(vm.raise(ExcKind::TypeError, "setter() requires a property receiver".to_string()));
    };
    let HeapData::Property(property) = vm.heap.get(receiver_id) else {
        return Err(vm.raise(ExcKind::TypeError, "setter() requires a property receiver".to_string()));
    };
    let getter = property.getter;
    let Some(setter) = args.get(1) else {
        return Err(vm.arity_error("setter", 1, 0));
    };
    Ok(Value::Object(vm.alloc(HeapData::Property(Property {
        getter,
        setter: Some(setter),
    }))))
}
