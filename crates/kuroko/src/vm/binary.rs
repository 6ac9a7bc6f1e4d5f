//! Binary/unary operator dispatch and the subscript protocol.
//!
//! Numeric fast paths run first; otherwise the left operand's dunder slot is
//! tried, a `NotImplemented` result retries the right operand's reflected
//! dunder, and a second `NotImplemented` raises TypeError.

use crate::{
    exception::{ExcKind, RunResult},
    heap::{HeapData, HeapId},
    types::{
        BinaryOp,
        dict::{check_hashable, dict_table, put_dict_table, take_dict_table},
        list::{list_items, list_items_mut, normalize_index},
        tuple::tuple_items,
    },
    value::Value,
    vm::Vm,
};

impl Vm {
    /// Pops two operands, applies `op`, pushes the result.
    pub(crate) fn binary_op_top(&mut self, op: BinaryOp) -> RunResult<()> {
        let rhs = self.peek(0);
        let lhs = self.peek(1);
        let result = self.binary_op(op, lhs, rhs)?;
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    pub(crate) fn binary_op(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Value> {
        if let Some(result) = self.binary_fast_path(op, lhs, rhs)? {
            return Ok(result);
        }
        if let Some(result) = self.binary_dunder(op, lhs, rhs)? {
            return Ok(result);
        }
        let left = self.type_name(lhs);
        let right = self.type_name(rhs);
        Err(self.raise(
            ExcKind::TypeError,
            format!(
                "unsupported operand type(s) for {}: '{left}' and '{right}'",
                op.symbol()
            ),
        ))
    }

    /// Built-in operand combinations, handled without method lookup.
    fn binary_fast_path(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Option<Value>> {
        // int (+ bool) pairs
        if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int())
            && !matches!(lhs, Value::Float(_))
            && !matches!(rhs, Value::Float(_))
        {
            return self.int_binary(op, a, b).map(Some);
        }
        // float combinations (any numeric mix involving a float)
        if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
            if let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) {
                return self.float_binary(op, a, b).map(Some);
            }
        }
        // str + str, str * int
        if let Some(a) = self.heap.value_as_str(lhs) {
            match op {
                BinaryOp::Add => {
                    if let Some(b) = self.heap.value_as_str(rhs) {
                        let joined = format!("{a}{b}");
                        return Ok(Some(Value::Object(self.intern(&joined))));
                    }
                }
                BinaryOp::Mul => {
                    if let Some(n) = rhs.as_int() {
                        let repeated = a.repeat(n.max(0) as usize);
                        return Ok(Some(Value::Object(self.intern(&repeated))));
                    }
                }
                _ => {}
            }
        }
        // list + list, list * int, tuple + tuple
        if let Some(a) = list_items(&self.heap, lhs) {
            match op {
                BinaryOp::Add => {
                    if let Some(b) = list_items(&self.heap, rhs) {
                        let mut items = a.clone();
                        items.extend(b.iter().copied());
                        return Ok(Some(self.alloc_list(items)));
                    }
                }
                BinaryOp::Mul => {
                    if let Some(n) = rhs.as_int() {
                        let mut items = Vec::new();
                        for _ in 0..n.max(0) {
                            items.extend(a.iter().copied());
                        }
                        return Ok(Some(self.alloc_list(items)));
                    }
                }
                _ => {}
            }
        }
        if op == BinaryOp::Add
            && let Some(a) = tuple_items(&self.heap, lhs)
            && let Some(b) = tuple_items(&self.heap, rhs)
        {
            let mut items = a.clone();
            items.extend(b.iter().copied());
            return Ok(Some(self.alloc_tuple(items)));
        }
        Ok(None)
    }

    fn int_binary(&mut self, op: BinaryOp, a: i64, b: i64) -> RunResult<Value> {
        let overflow = |vm: &mut Self| vm.raise(ExcKind::ValueError, "integer overflow".to_string());
        Ok(match op {
            BinaryOp::Add => Value::Int(a.checked_add(b).ok_or_else(|| overflow(self))?),
            BinaryOp::Sub => Value::Int(a.checked_sub(b).ok_or_else(|| overflow(self))?),
            BinaryOp::Mul => Value::Int(a.checked_mul(b).ok_or_else(|| overflow(self))?),
            BinaryOp::TrueDiv => {
                if b == 0 {
                    return Err(self.raise(ExcKind::ZeroDivisionError, "division by zero".to_string()));
                }
                Value::Float(a as f64 / b as f64)
            }
            BinaryOp::FloorDiv => {
                if b == 0 {
                    return Err(self.raise(ExcKind::ZeroDivisionError, "integer division by zero".to_string()));
                }
                Value::Int(a.div_euclid(b))
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return Err(self.raise(ExcKind::ZeroDivisionError, "integer modulo by zero".to_string()));
                }
                Value::Int(a.rem_euclid(b))
            }
            BinaryOp::Pow => {
                if b < 0 {
                    Value::Float((a as f64).powf(b as f64))
                } else {
                    let exp = u32::try_from(b).map_err(|_| overflow(self))?;
                    Value::Int(a.checked_pow(exp).ok_or_else(|| overflow(self))?)
                }
            }
            BinaryOp::BitAnd => Value::Int(a & b),
            BinaryOp::BitOr => Value::Int(a | b),
            BinaryOp::BitXor => Value::Int(a ^ b),
            BinaryOp::Shl => {
                if b < 0 {
                    return Err(self.raise(ExcKind::ValueError, "negative shift count".to_string()));
                }
                let shift = u32::try_from(b).map_err(|_| overflow(self))?;
                Value::Int(a.checked_shl(shift).ok_or_else(|| overflow(self))?)
            }
            BinaryOp::Shr => {
                if b < 0 {
                    return Err(self.raise(ExcKind::ValueError, "negative shift count".to_string()));
                }
                let shift = u32::try_from(b).unwrap_or(63).min(63);
                Value::Int(a >> shift)
            }
        })
    }

    fn float_binary(&mut self, op: BinaryOp, a: f64, b: f64) -> RunResult<Value> {
        Ok(match op {
            BinaryOp::Add => Value::Float(a + b),
            BinaryOp::Sub => Value::Float(a - b),
            BinaryOp::Mul => Value::Float(a * b),
            BinaryOp::TrueDiv => {
                if b == 0.0 {
                    return Err(self.raise(ExcKind::ZeroDivisionError, "float division by zero".to_string()));
                }
                Value::Float(a / b)
            }
            BinaryOp::FloorDiv => {
                if b == 0.0 {
                    return Err(self.raise(ExcKind::ZeroDivisionError, "float floor division by zero".to_string()));
                }
                Value::Float((a / b).floor())
            }
            BinaryOp::Mod => {
                if b == 0.0 {
                    return Err(self.raise(ExcKind::ZeroDivisionError, "float modulo".to_string()));
                }
                Value::Float(a - (a / b).floor() * b)
            }
            BinaryOp::Pow => Value::Float(a.powf(b)),
            _ => {
                let left = self.type_name(Value::Float(a));
                return Err(self.raise(
                    ExcKind::TypeError,
                    format!("unsupported operand type(s) for {}: '{left}'", op.symbol()),
                ));
            }
        })
    }

    /// Dunder dispatch: left operand first, then the reflected name on the
    /// right operand. `None` means both declined.
    fn binary_dunder(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Option<Value>> {
        if let Some(method) = self.binary_slot(lhs, op, false) {
            let result = self.call_and_run(method, &[lhs, rhs])?;
            if !matches!(result, Value::NotImplemented) {
                return Ok(Some(result));
            }
        }
        if let Some(method) = self.binary_slot(rhs, op, true) {
            let result = self.call_and_run(method, &[rhs, lhs])?;
            if !matches!(result, Value::NotImplemented) {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    fn binary_slot(&self, value: Value, op: BinaryOp, reflected: bool) -> Option<Value> {
        let class_id = self.class_of(value);
        match self.heap.get(class_id) {
            HeapData::Class(class) => {
                if reflected {
                    class.slots.reflected[op as usize]
                } else {
                    class.slots.binary[op as usize]
                }
            }
            _ => None,
        }
    }

    // --- unary -------------------------------------------------------------

    pub(crate) fn unary_negate(&mut self) -> RunResult<()> {
        let value = self.peek(0);
        let result = match value {
            Value::Int(i) => Value::Int(-i),
            Value::Bool(b) => Value::Int(-i64::from(b)),
            Value::Float(f) => Value::Float(-f),
            other => {
                let found = self.type_name(other);
                return Err(self.raise(ExcKind::TypeError, format!("bad operand type for unary -: '{found}'")));
            }
        };
        self.pop();
        self.push(result);
        Ok(())
    }

    pub(crate) fn unary_invert(&mut self) -> RunResult<()> {
        let value = self.peek(0);
        let result = match value.as_int() {
            Some(i) if !matches!(value, Value::Float(_)) => Value::Int(!i),
            _ => {
                let found = self.type_name(value);
                return Err(self.raise(ExcKind::TypeError, format!("bad operand type for unary ~: '{found}'")));
            }
        };
        self.pop();
        self.push(result);
        Ok(())
    }

    // --- subscripting ------------------------------------------------------

    pub(crate) fn get_index(&mut self, obj: Value, index: Value) -> RunResult<Value> {
        // List fast path, including slices.
        if let Some(obj_id) = obj.as_object()
            && list_items(&self.heap, obj).is_some()
        {
            if let Some(slice_id) = self.as_slice_instance(index) {
                let len = list_items(&self.heap, obj).expect("checked above").len();
                let selected = self.slice_elements(slice_id, len, |i, heap| {
                    list_items(heap, Value::Object(obj_id)).expect("list receiver")[i]
                })?;
                return Ok(self.alloc_list(selected));
            }
            let items = list_items(&self.heap, obj).expect("checked above");
            return match index.as_int().and_then(|i| normalize_index(i, items.len())) {
                Some(i) => Ok(items[i]),
                None if index.as_int().is_some() => {
                    Err(self.raise(ExcKind::IndexError, "list index out of range".to_string()))
                }
                None => {
                    let found = self.type_name(index);
                    Err(self.raise(
                        ExcKind::TypeError,
                        format!("list indices must be integers, not {found}"),
                    ))
                }
            };
        }
        if let Some(items) = tuple_items(&self.heap, obj) {
            return match index.as_int().and_then(|i| normalize_index(i, items.len())) {
                Some(i) => Ok(items[i]),
                None => Err(self.raise(ExcKind::IndexError, "tuple index out of range".to_string())),
            };
        }
        if dict_table(&self.heap, obj).is_some() {
            check_hashable(self, index)?;
            return match dict_table(&self.heap, obj).expect("checked above").get(&self.heap, index) {
                Some(value) => Ok(value),
                None => {
                    let repr = self.repr_value(index)?;
                    Err(self.raise(ExcKind::KeyError, repr))
                }
            };
        }
        if let Some(text) = self.string_content(obj) {
            if let Some(slice_id) = self.as_slice_instance(index) {
                let chars: Vec<char> = text.chars().collect();
                let selected = self.slice_char_indices(slice_id, &chars)?;
                return Ok(Value::Object(self.intern(&selected)));
            }
            let chars: Vec<char> = text.chars().collect();
            return match index.as_int().and_then(|i| normalize_index(i, chars.len())) {
                Some(i) => {
                    let piece = chars[i].to_string();
                    Ok(Value::Object(self.intern(&piece)))
                }
                None => Err(self.raise(ExcKind::IndexError, "string index out of range".to_string())),
            };
        }
        if let Value::Object(id) = obj
            && let HeapData::Bytes(bytes) = self.heap.get(id)
        {
            let len = bytes.len();
            return match index.as_int().and_then(|i| normalize_index(i, len)) {
                Some(i) => {
                    let HeapData::Bytes(bytes) = self.heap.get(id) else {
                        unreachable!("checked above");
                    };
                    Ok(Value::Int(i64::from(bytes[i])))
                }
                None => Err(self.raise(ExcKind::IndexError, "bytes index out of range".to_string())),
            };
        }
        // Instances: the class's __getitem__ slot.
        let getitem = self.slot_of(obj, |slots| slots.getitem);
        if let Some(method) = getitem {
            return self.call_and_run(method, &[obj, index]);
        }
        let found = self.type_name(obj);
        Err(self.raise(ExcKind::TypeError, format!("'{found}' object is not subscriptable")))
    }

    pub(crate) fn set_index(&mut self, obj: Value, index: Value, value: Value) -> RunResult<()> {
        if let Some(obj_id) = obj.as_object()
            && list_items(&self.heap, obj).is_some()
        {
            let items = list_items_mut(&mut self.heap, obj_id).expect("checked above");
            let len = items.len();
            return match index.as_int().and_then(|i| normalize_index(i, len)) {
                Some(i) => {
                    items[i] = value;
                    Ok(())
                }
                None => Err(self.raise(ExcKind::IndexError, "list assignment index out of range".to_string())),
            };
        }
        if let Some(obj_id) = obj.as_object()
            && dict_table(&self.heap, obj).is_some()
        {
            check_hashable(self, index)?;
            let mut table = take_dict_table(&mut self.heap, obj_id).expect("checked above");
            table.set(&self.heap, index, value);
            put_dict_table(&mut self.heap, obj_id, table);
            return Ok(());
        }
        let setitem = self.slot_of(obj, |slots| slots.setitem);
        if let Some(method) = setitem {
            self.call_and_run(method, &[obj, index, value])?;
            return Ok(());
        }
        let found = self.type_name(obj);
        Err(self.raise(
            ExcKind::TypeError,
            format!("'{found}' object does not support item assignment"),
        ))
    }

    pub(crate) fn del_index(&mut self, obj: Value, index: Value) -> RunResult<()> {
        if let Some(obj_id) = obj.as_object()
            && list_items(&self.heap, obj).is_some()
        {
            let items = list_items_mut(&mut self.heap, obj_id).expect("checked above");
            let len = items.len();
            return match index.as_int().and_then(|i| normalize_index(i, len)) {
                Some(i) => {
                    items.remove(i);
                    Ok(())
                }
                None => Err(self.raise(ExcKind::IndexError, "list index out of range".to_string())),
            };
        }
        if let Some(obj_id) = obj.as_object()
            && dict_table(&self.heap, obj).is_some()
        {
            check_hashable(self, index)?;
            let mut table = take_dict_table(&mut self.heap, obj_id).expect("checked above");
            let removed = table.delete(&self.heap, index);
            put_dict_table(&mut self.heap, obj_id, table);
            if removed {
                return Ok(());
            }
            let repr = self.repr_value(index)?;
            return Err(self.raise(ExcKind::KeyError, repr));
        }
        let delitem = self.slot_of(obj, |slots| slots.delitem);
        if let Some(method) = delitem {
            self.call_and_run(method, &[obj, index])?;
            return Ok(());
        }
        let found = self.type_name(obj);
        Err(self.raise(
            ExcKind::TypeError,
            format!("'{found}' object does not support item deletion"),
        ))
    }

    /// `item in container` through `__contains__`.
    pub(crate) fn contains(&mut self, container: Value, item: Value) -> RunResult<bool> {
        // Builtin fast paths mirror the registered natives.
        if let Some(items) = list_items(&self.heap, container).or_else(|| tuple_items(&self.heap, container)) {
            let items = items.clone();
            for candidate in items {
                if self.values_eq(candidate, item)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        if dict_table(&self.heap, container).is_some() {
            check_hashable(self, item)?;
            return Ok(dict_table(&self.heap, container)
                .expect("checked above")
                .get(&self.heap, item)
                .is_some());
        }
        if let Some(text) = self.string_content(container) {
            let Some(needle) = self.string_content(item) else {
                let found = self.type_name(item);
                return Err(self.raise(
                    ExcKind::TypeError,
                    format!("'in <string>' requires string as left operand, not {found}"),
                ));
            };
            return Ok(text.contains(needle));
        }
        let contains = self.slot_of(container, |slots| slots.contains);
        if let Some(method) = contains {
            let result = self.call_and_run(method, &[container, item])?;
            return Ok(result.truthy(&self.heap));
        }
        let found = self.type_name(container);
        Err(self.raise(ExcKind::TypeError, format!("'{found}' object is not a container")))
    }

    /// Reads a cached slot off a value's class.
    pub(crate) fn slot_of(&self, value: Value, pick: fn(&crate::types::CachedSlots) -> Option<Value>) -> Option<Value> {
        let class_id = self.class_of(value);
        match self.heap.get(class_id) {
            HeapData::Class(class) => pick(&class.slots),
            _ => None,
        }
    }

    fn slice_char_indices(&mut self, slice_id: HeapId, chars: &[char]) -> RunResult<String> {
        let indices = self.slice_elements(slice_id, chars.len(), |i, _| Value::Int(i as i64))?;
        let mut out = String::new();
        for value in indices {
            if let Some(i) = value.as_int() {
                out.push(chars[i as usize]);
            }
        }
        Ok(out)
    }
}
