//! Equality and ordering.
//!
//! `values_eq` layers managed `__eq__` dispatch over the structural fast
//! paths; ordering comparisons short-circuit on numerics and strings, then
//! fall back to the dunder pair (`a < b` retrying as `b > a`).

use crate::{
    exception::{ExcKind, RunResult},
    heap::HeapData,
    types::{CompareOp, dict::dict_table, list::list_items, tuple::tuple_items},
    value::{Value, values_equal},
    vm::Vm,
};

impl Vm {
    /// Managed `==`: identity and numeric fast paths, container recursion,
    /// then instance `__eq__` (falling back to identity).
    pub fn values_eq(&mut self, a: Value, b: Value) -> RunResult<bool> {
        if a.identical(b) {
            return Ok(true);
        }
        // Instance __eq__ runs before structural comparison so user classes
        // control their own equality.
        if let Some(result) = self.instance_eq(a, b)? {
            return Ok(result);
        }
        // Sequences compare pairwise through the full equality.
        let a_list = list_items(&self.heap, a).map(Vec::len);
        let b_list = list_items(&self.heap, b).map(Vec::len);
        if let (Some(len_a), Some(len_b)) = (a_list, b_list) {
            if len_a != len_b {
                return Ok(false);
            }
            for i in 0..len_a {
                let item_a = list_items(&self.heap, a).expect("list checked above")[i];
                let item_b = list_items(&self.heap, b).expect("list checked above")[i];
                if !self.values_eq(item_a, item_b)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        let a_tuple = tuple_items(&self.heap, a).map(Vec::len);
        let b_tuple = tuple_items(&self.heap, b).map(Vec::len);
        if let (Some(len_a), Some(len_b)) = (a_tuple, b_tuple) {
            if len_a != len_b {
                return Ok(false);
            }
            for i in 0..len_a {
                let item_a = tuple_items(&self.heap, a).expect("tuple checked above")[i];
                let item_b = tuple_items(&self.heap, b).expect("tuple checked above")[i];
                if !self.values_eq(item_a, item_b)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        // Dicts: same length, every key maps to an equal value.
        if dict_table(&self.heap, a).is_some() && dict_table(&self.heap, b).is_some() {
            let len_a = dict_table(&self.heap, a).expect("dict checked above").len();
            let len_b = dict_table(&self.heap, b).expect("dict checked above").len();
            if len_a != len_b {
                return Ok(false);
            }
            let pairs: Vec<(Value, Value)> = dict_table(&self.heap, a)
                .expect("dict checked above")
                .iter()
                .collect();
            for (key, value_a) in pairs {
                let Some(value_b) = dict_table(&self.heap, b).expect("dict checked above").get(&self.heap, key)
                else {
                    return Ok(false);
                };
                if !self.values_eq(value_a, value_b)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
        Ok(values_equal(&self.heap, a, b))
    }

    /// Dispatches `__eq__` when either operand is an instance whose class
    /// defines it. `None` means no instance took part.
    fn instance_eq(&mut self, a: Value, b: Value) -> RunResult<Option<bool>> {
        for (lhs, rhs) in [(a, b), (b, a)] {
            let Some(id) = lhs.as_object() else {
                continue;
            };
            if !matches!(self.heap.get(id), HeapData::Instance(_)) {
                continue;
            }
            let eq_slot = self.slot_of(lhs, |slots| slots.eq);
            if let Some(method) = eq_slot {
                let result = self.call_and_run(method, &[lhs, rhs])?;
                if !matches!(result, Value::NotImplemented) {
                    return Ok(Some(result.truthy(&self.heap)));
                }
            }
        }
        // An instance without __eq__ compares by identity, which already
        // failed upstream. Subclassed built-ins fall through so their
        // payloads compare structurally.
        let blocks = |vm: &Self, v: Value| {
            v.as_object().is_some_and(|id| match vm.heap.get(id) {
                HeapData::Instance(instance) => instance.payload.is_none(),
                _ => false,
            })
        };
        if blocks(self, a) || blocks(self, b) {
            return Ok(Some(false));
        }
        Ok(None)
    }

    /// Pops two operands, applies an ordering comparison, pushes the bool.
    pub(crate) fn compare_op_top(&mut self, op: CompareOp) -> RunResult<()> {
        let rhs = self.peek(0);
        let lhs = self.peek(1);
        let result = self.compare_op(op, lhs, rhs)?;
        self.pop();
        self.pop();
        self.push(Value::Bool(result));
        Ok(())
    }

    pub(crate) fn compare_op(&mut self, op: CompareOp, lhs: Value, rhs: Value) -> RunResult<bool> {
        // Numeric fast path covers int/float/bool mixes.
        if let (Some(a), Some(b)) = (lhs.as_float(), rhs.as_float()) {
            return Ok(match op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
            });
        }
        if let (Some(a), Some(b)) = (self.heap.value_as_str(lhs), self.heap.value_as_str(rhs)) {
            return Ok(match op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
            });
        }
        if let Some(method) = self.compare_slot(lhs, op) {
            let result = self.call_and_run(method, &[lhs, rhs])?;
            if !matches!(result, Value::NotImplemented) {
                return Ok(result.truthy(&self.heap));
            }
        }
        let mirrored = op.mirrored();
        if let Some(method) = self.compare_slot(rhs, mirrored) {
            let result = self.call_and_run(method, &[rhs, lhs])?;
            if !matches!(result, Value::NotImplemented) {
                return Ok(result.truthy(&self.heap));
            }
        }
        let left = self.type_name(lhs);
        let right = self.type_name(rhs);
        Err(self.raise(
            ExcKind::TypeError,
            format!(
                "'{}' not supported between instances of '{left}' and '{right}'",
                op.symbol()
            ),
        ))
    }

    fn compare_slot(&self, value: Value, op: CompareOp) -> Option<Value> {
        let class_id = self.class_of(value);
        match self.heap.get(class_id) {
            HeapData::Class(class) => class.slots.compare[op as usize],
            _ => None,
        }
    }
}
