//! Attribute access and the descriptor protocol.
//!
//! Lookup order on instances: data descriptors on the class chain first,
//! then instance fields, then the rest of the class chain (dynamic
//! properties called, functions bound), then `__getattr__`, then
//! AttributeError. Writes mirror it: data descriptors intercept, then
//! `__setattr__`, then the fields table.

use crate::{
    exception::{ExcKind, RunResult},
    heap::{HeapData, HeapId},
    intern::SpecialName,
    table::Table,
    types::{BoundMethod, Property, class::lookup_method},
    value::Value,
    vm::Vm,
};

/// How a class-chain hit participates in attribute access.
#[derive(Clone, Copy)]
enum Resolved {
    /// A data descriptor: intercepts both reads and writes.
    DataDescriptor(Value),
    /// A plain value (or non-data descriptor) from the methods table.
    Plain(Value),
}

impl Vm {
    pub(crate) fn get_attr(&mut self, obj: Value, name: HeapId) -> RunResult<Value> {
        if let Some(obj_id) = obj.as_object() {
            match self.heap.get(obj_id) {
                HeapData::Module(_) => {
                    if let Some(value) = self.heap.table_get(obj_id, Value::Object(name)) {
                        return Ok(value);
                    }
                    return Err(self.attribute_error(obj, name));
                }
                HeapData::Class(_) => {
                    if let Some(found) = lookup_method(&self.heap, obj_id, name) {
                        return Ok(self.bind_for_class_access(obj, found));
                    }
                    return Err(self.attribute_error(obj, name));
                }
                HeapData::Closure(_) if name == self.names.get(SpecialName::Annotations) => {
                    return Ok(self.closure_annotations(obj_id));
                }
                HeapData::Instance(instance) => {
                    let class_id = instance.class;
                    let resolved = self.resolve_on_chain(class_id, name);
                    if let Some(Resolved::DataDescriptor(descriptor)) = resolved {
                        return self.descriptor_get(descriptor, obj);
                    }
                    if let Some(value) = self.heap.table_get(obj_id, Value::Object(name)) {
                        return Ok(value);
                    }
                    if let Some(Resolved::Plain(found)) = resolved {
                        return self.dispatch_found(obj, found);
                    }
                    // __getattr__ runs only after everything else misses.
                    let getattr = match self.heap.get(class_id) {
                        HeapData::Class(class) => class.slots.getattr,
                        _ => None,
                    };
                    if let Some(hook) = getattr {
                        return self.call_and_run(hook, &[obj, Value::Object(name)]);
                    }
                    return Err(self.attribute_error(obj, name));
                }
                _ => {}
            }
        }
        // Primitives and plain built-in objects: methods off the class chain.
        let class_id = self.class_of(obj);
        match self.resolve_on_chain(class_id, name) {
            Some(Resolved::DataDescriptor(descriptor)) => self.descriptor_get(descriptor, obj),
            Some(Resolved::Plain(found)) => self.dispatch_found(obj, found),
            None => Err(self.attribute_error(obj, name)),
        }
    }

    pub(crate) fn set_attr(&mut self, obj: Value, name: HeapId, value: Value) -> RunResult<()> {
        if let Some(obj_id) = obj.as_object() {
            match self.heap.get(obj_id) {
                HeapData::Module(_) => {
                    self.heap.table_set(obj_id, Value::Object(name), value);
                    return Ok(());
                }
                HeapData::Class(_) => {
                    self.heap.table_set(obj_id, Value::Object(name), value);
                    // Dunder assignment must stay visible to the slot cache.
                    self.finalize_class(obj_id);
                    return Ok(());
                }
                HeapData::Closure(_) if name == self.names.get(SpecialName::Annotations) => {
                    let dict_id = value
                        .as_object()
                        .filter(|&id| matches!(self.heap.get(id), HeapData::Dict(_)));
                    let Some(dict_id) = dict_id else {
                        let found = self.type_name(value);
                        return Err(self.raise(
                            ExcKind::TypeError,
                            format!("__annotations__ must be set to a dict, not '{found}'"),
                        ));
                    };
                    if let HeapData::Closure(closure) = self.heap.get_mut(obj_id) {
                        closure.annotations = Some(dict_id);
                    }
                    return Ok(());
                }
                HeapData::Instance(instance) => {
                    let class_id = instance.class;
                    if let Some(Resolved::DataDescriptor(descriptor)) = self.resolve_on_chain(class_id, name) {
                        return self.descriptor_set(descriptor, obj, value);
                    }
                    let setattr = match self.heap.get(class_id) {
                        HeapData::Class(class) => class.slots.setattr,
                        _ => None,
                    };
                    if let Some(hook) = setattr {
                        self.call_and_run(hook, &[obj, Value::Object(name), value])?;
                        return Ok(());
                    }
                    self.heap.table_set(obj_id, Value::Object(name), value);
                    return Ok(());
                }
                _ => {}
            }
        }
        let found = self.type_name(obj);
        Err(self.raise(
            ExcKind::AttributeError,
            format!("cannot set attributes of '{found}' object"),
        ))
    }

    pub(crate) fn del_attr(&mut self, obj: Value, name: HeapId) -> RunResult<()> {
        if let Some(obj_id) = obj.as_object() {
            match self.heap.get(obj_id) {
                HeapData::Module(_) | HeapData::Class(_) => {
                    if self.heap.table_delete(obj_id, Value::Object(name)) {
                        if matches!(self.heap.get(obj_id), HeapData::Class(_)) {
                            self.finalize_class(obj_id);
                        }
                        return Ok(());
                    }
                    return Err(self.attribute_error(obj, name));
                }
                HeapData::Instance(instance) => {
                    let class_id = instance.class;
                    let delattr = match self.heap.get(class_id) {
                        HeapData::Class(class) => class.slots.delattr,
                        _ => None,
                    };
                    if let Some(hook) = delattr {
                        self.call_and_run(hook, &[obj, Value::Object(name)])?;
                        return Ok(());
                    }
                    if self.heap.table_delete(obj_id, Value::Object(name)) {
                        return Ok(());
                    }
                    return Err(self.attribute_error(obj, name));
                }
                _ => {}
            }
        }
        Err(self.attribute_error(obj, name))
    }

    /// The annotations dict of a function, attached on first access so plain
    /// closures never pay for one.
    fn closure_annotations(&mut self, closure_id: HeapId) -> Value {
        let existing = match self.heap.get(closure_id) {
            HeapData::Closure(closure) => closure.annotations,
            _ => None,
        };
        if let Some(id) = existing {
            return Value::Object(id);
        }
        // Shield the closure: the host-facing attribute path may hand us an
        // otherwise unrooted function.
        let scratch_base = self.thread.scratch.len();
        self.thread.scratch.push(Value::Object(closure_id));
        let dict = self.alloc_dict(Table::new());
        self.thread.scratch.truncate(scratch_base);
        let dict_id = dict.as_object().expect("dict just allocated");
        if let HeapData::Closure(closure) = self.heap.get_mut(closure_id) {
            closure.annotations = Some(dict_id);
        }
        dict
    }

    /// Walks the class chain for `name`, classifying the hit.
    fn resolve_on_chain(&self, class_id: HeapId, name: HeapId) -> Option<Resolved> {
        let found = lookup_method(&self.heap, class_id, name)?;
        if self.is_data_descriptor(found) {
            Some(Resolved::DataDescriptor(found))
        } else {
            Some(Resolved::Plain(found))
        }
    }

    /// A data descriptor is a property with a setter, or an instance whose
    /// class defines `__set__`.
    fn is_data_descriptor(&self, value: Value) -> bool {
        let Some(id) = value.as_object() else {
            return false;
        };
        match self.heap.get(id) {
            HeapData::Property(Property { setter: Some(_), .. }) => true,
            HeapData::Instance(instance) => match self.heap.get(instance.class) {
                HeapData::Class(class) => class.slots.descr_set.is_some(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Runs a descriptor's read protocol against `receiver`.
    fn descriptor_get(&mut self, descriptor: Value, receiver: Value) -> RunResult<Value> {
        let Some(id) = descriptor.as_object() else {
            return Ok(descriptor);
        };
        match self.heap.get(id) {
            HeapData::Property(property) => {
                let getter = property.getter;
                self.call_and_run(getter, &[receiver])
            }
            HeapData::Instance(instance) => {
                let get_slot = match self.heap.get(instance.class) {
                    HeapData::Class(class) => class.slots.descr_get,
                    _ => None,
                };
                match get_slot {
                    Some(hook) => self.call_and_run(hook, &[descriptor, receiver]),
                    None => Ok(descriptor),
                }
            }
            _ => Ok(descriptor),
        }
    }

    fn descriptor_set(&mut self, descriptor: Value, receiver: Value, value: Value) -> RunResult<()> {
        let Some(id) = descriptor.as_object() else {
            return Ok(());
        };
        match self.heap.get(id) {
            HeapData::Property(property) => {
                let Some(setter) = property.setter else {
                    return Err(self.raise(ExcKind::AttributeError, "property has no setter".to_string()));
                };
                self.call_and_run(setter, &[receiver, value])?;
                Ok(())
            }
            HeapData::Instance(instance) => {
                let set_slot = match self.heap.get(instance.class) {
                    HeapData::Class(class) => class.slots.descr_set,
                    _ => None,
                };
                match set_slot {
                    Some(hook) => {
                        self.call_and_run(hook, &[descriptor, receiver, value])?;
                        Ok(())
                    }
                    None => Err(crate::exception::RunError::internal("data descriptor lost its __set__ slot")),
                }
            }
            _ => Err(crate::exception::RunError::internal("data descriptor lost its __set__ slot")),
        }
    }

    /// Applies the dispatch rules to a plain class-chain hit: dynamic
    /// properties are called with the receiver, properties read through
    /// their getter, callables become bound methods.
    fn dispatch_found(&mut self, receiver: Value, found: Value) -> RunResult<Value> {
        let Some(found_id) = found.as_object() else {
            return Ok(found);
        };
        let flags = match self.heap.get(found_id) {
            HeapData::Closure(closure) => Some(closure.flags),
            HeapData::Native(native) => Some(native.flags),
            HeapData::Property(_) => {
                return self.descriptor_get(found, receiver);
            }
            HeapData::Instance(instance) => {
                let has_get = match self.heap.get(instance.class) {
                    HeapData::Class(class) => class.slots.descr_get.is_some(),
                    _ => false,
                };
                if has_get {
                    return self.descriptor_get(found, receiver);
                }
                return Ok(found);
            }
            _ => None,
        };
        let Some(flags) = flags else {
            return Ok(found);
        };
        if flags.is_dynamic_property {
            return self.call_and_run(found, &[receiver]);
        }
        if flags.is_static_method {
            return Ok(found);
        }
        let bound_receiver = if flags.is_class_method {
            Value::Object(self.class_of(receiver))
        } else {
            receiver
        };
        let bound = self.alloc(crate::heap::HeapData::BoundMethod(BoundMethod {
            receiver: bound_receiver,
            method: found,
        }));
        Ok(Value::Object(bound))
    }

    /// Class attribute access: class methods bind the class; everything else
    /// comes back unbound.
    fn bind_for_class_access(&mut self, class_value: Value, found: Value) -> Value {
        let Some(found_id) = found.as_object() else {
            return found;
        };
        let flags = match self.heap.get(found_id) {
            HeapData::Closure(closure) => closure.flags,
            HeapData::Native(native) => native.flags,
            _ => return found,
        };
        if flags.is_class_method {
            let bound = self.alloc(crate::heap::HeapData::BoundMethod(BoundMethod {
                receiver: class_value,
                method: found,
            }));
            return Value::Object(bound);
        }
        found
    }

    pub(crate) fn attribute_error(&mut self, obj: Value, name: HeapId) -> crate::exception::RunError {
        let type_name = self.type_name(obj);
        let attr = self.heap.str_of(name).to_string();
        self.raise(
            ExcKind::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }
}
