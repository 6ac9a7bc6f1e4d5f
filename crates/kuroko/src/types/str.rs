//! String objects and string method natives.
//!
//! Every string in the runtime is interned: objects with equal bytes share a
//! heap slot, so equality reduces to id comparison. The FNV-1a hash is
//! computed once at creation and cached alongside the bytes.

use std::fmt::Write;

use crate::{
    args::Args,
    exception::{ExcKind, RunResult},
    hash::fnv1a,
    value::Value,
    vm::Vm,
};

/// An immutable, interned string with its cached hash.
#[derive(Debug)]
pub(crate) struct StrObject {
    text: Box<str>,
    hash: u64,
}

impl StrObject {
    #[must_use]
    pub fn new(text: impl Into<Box<str>>) -> Self {
        let text = text.into();
        let hash = fnv1a(text.as_bytes());
        Self { text, hash }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Renders a string the way `repr` shows it: single quotes unless the text
/// contains one and no double quote, with control characters escaped.
#[must_use]
pub(crate) fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

// --- method natives ---------------------------------------------------------

fn receiver_str(vm: &Vm, args: &Args) -> Option<String> {
    vm.string_content(args.get(0)?).map(str::to_owned)
}

pub(crate) fn str_upper(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(s) = receiver_str(vm, &args) else {
        return Err(vm.raise(ExcKind::TypeError, "upper() requires a str receiver".to_string()));
    };
    Ok(Value::Object(vm.intern(&s.to_uppercase())))
}

pub(crate) fn str_lower(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(s) = receiver_str(vm, &args) else {
        return Err(vm.raise(ExcKind::TypeError, "lower() requires a str receiver".to_string()));
    };
    Ok(Value::Object(vm.intern(&s.to_lowercase())))
}

pub(crate) fn str_strip(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(s) = receiver_str(vm, &args) else {
        return Err(vm.raise(ExcKind::TypeError, "strip() requires a str receiver".to_string()));
    };
    Ok(Value::Object(vm.intern(s.trim())))
}

/// `s.split(sep)`; with no separator, splits on runs of whitespace.
pub(crate) fn str_split(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(s) = receiver_str(vm, &args) else {
        return Err(vm.raise(ExcKind::TypeError, "split() requires a str receiver".to_string()));
    };
    let parts: Vec<String> = match args.get(1) {
        None => s.split_whitespace().map(str::to_owned).collect(),
        Some(sep) => {
            let Some(sep) = vm.string_content(sep).map(str::to_owned) else {
                return Err(vm.raise(ExcKind::TypeError, "split() separator must be a str".to_string()));
            };
            if sep.is_empty() {
                return Err(vm.raise(ExcKind::ValueError, "empty separator".to_string()));
            }
            s.split(&sep).map(str::to_owned).collect()
        }
    };
    vm.heap.pause();
    let items: Vec<Value> = parts.iter().map(|p| Value::Object(vm.intern(p))).collect();
    let list = vm.alloc_list(items);
    vm.heap.resume();
    Ok(list)
}

/// `sep.join(iterable)`.
pub(crate) fn str_join(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(sep) = receiver_str(vm, &args) else {
        return Err(vm.raise(ExcKind::TypeError, "join() requires a str receiver".to_string()));
    };
    let Some(iterable) = args.get(1) else {
        return Err(vm.arity_error("join", 1, 0));
    };
    let items = vm.collect_iterable(iterable)?;
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(&sep);
        }
        match vm.string_content(*item) {
            Some(piece) => out.push_str(piece),
            None => {
                let found = item.variant_name(&vm.heap);
                return Err(vm.raise(
                    ExcKind::TypeError,
                    format!("sequence item {i}: expected str instance, {found} found"),
                ));
            }
        }
    }
    Ok(Value::Object(vm.intern(&out)))
}

pub(crate) fn str_len(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(s) = args.get(0).and_then(|v| vm.string_content(v)) else {
        return Err(vm.raise(ExcKind::TypeError, "__len__() requires a str receiver".to_string()));
    };
    // Characters, not bytes.
    Ok(Value::Int(s.chars().count() as i64))
}

pub(crate) fn str_contains(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(s) = receiver_str(vm, &args) else {
        return Err(vm.raise(ExcKind::TypeError, "__contains__() requires a str receiver".to_string()));
    };
    let Some(needle) = args.get(1).and_then(|v| vm.string_content(v)).map(str::to_owned) else {
        return Err(vm.raise(ExcKind::TypeError, "'in <string>' requires a string operand".to_string()));
    };
    Ok(Value::Bool(s.contains(&needle)))
}

pub(crate) fn str_iter(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    if vm.string_content(receiver).is_none() {
        return Err(vm.raise(ExcKind::TypeError, "__iter__() requires a str receiver".to_string()));
    }
    vm.make_iterator(receiver)
}

pub(crate) fn str_startswith(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(s) = receiver_str(vm, &args) else {
        return Err(vm.raise(ExcKind::TypeError, "startswith() requires a str receiver".to_string()));
    };
    let prefix = args
        .get(1)
        .and_then(|v| vm.string_content(v))
        .map(str::to_owned)
        .ok_or_else(|| vm.raise(ExcKind::TypeError, "startswith() requires a str argument".to_string()))?;
    Ok(Value::Bool(s.starts_with(&prefix)))
}
