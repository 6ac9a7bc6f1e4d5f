//! The calling convention.
//!
//! `call_value` inspects the callee `argc + 1` slots down and either pushes
//! a frame (closures: "resume the VM") or completes immediately (natives).
//! Bound methods insert their receiver and retry; classes allocate an
//! instance and route through `__init__`; instances route through their
//! class's `__call__` slot.

use std::rc::Rc;

use crate::{
    args::{Args, split_window},
    bytecode::CodeObject,
    exception::{ExcKind, RunError, RunResult},
    heap::{HeapData, HeapId},
    types::NativeFn,
    value::Value,
    vm::{CallFrame, Vm},
};

/// What the host (or the dispatch loop) must do after `call_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// A frame was pushed; run the VM to produce the result.
    ResumeVm,
    /// A native completed; the result is on the stack.
    NativeDone,
}

impl Vm {
    /// Calls the value `argc + 1` slots from the top, with `argc` argument
    /// slots above it (keyword markers included in the count).
    pub fn call_value(&mut self, argc: usize) -> RunResult<CallOutcome> {
        let mut argc = argc;
        let mut pending_init: Option<Value> = None;
        loop {
            let callee_slot = self.thread.stack.len() - argc - 1;
            let callee = self.thread.stack[callee_slot];
            let Some(callee_id) = callee.as_object() else {
                let found = self.type_name(callee);
                return Err(self.raise(ExcKind::TypeError, format!("'{found}' object is not callable")));
            };
            match self.heap.get(callee_id) {
                HeapData::Closure(_) => {
                    return self.call_closure(callee_slot, argc, callee_id, pending_init);
                }
                HeapData::Native(native) => {
                    let func = native.func;
                    return self.call_native(callee_slot, func, pending_init, false);
                }
                HeapData::BoundMethod(bound) => {
                    let (receiver, method) = (bound.receiver, bound.method);
                    self.thread.stack[callee_slot] = method;
                    self.thread.stack.insert(callee_slot + 1, receiver);
                    argc += 1;
                }
                HeapData::Class(class) => {
                    let ctor = class.ctor;
                    let init = class.slots.init;
                    let name = self.heap.str_of(class.name).to_string();
                    if let Some(ctor) = ctor {
                        // Built-in constructors see the class as argument 0.
                        return self.call_native(callee_slot, ctor, None, true);
                    }
                    let instance = self.alloc_instance(callee_id);
                    match init {
                        Some(init_method) => {
                            self.thread.stack[callee_slot] = init_method;
                            self.thread.stack.insert(callee_slot + 1, instance);
                            argc += 1;
                            pending_init = Some(instance);
                        }
                        None => {
                            if argc > 0 {
                                return Err(self.raise(
                                    ExcKind::ArgumentError,
                                    format!("{name}() takes no arguments ({argc} given)"),
                                ));
                            }
                            self.thread.stack.truncate(callee_slot);
                            self.push(instance);
                            return Ok(CallOutcome::NativeDone);
                        }
                    }
                }
                HeapData::Instance(instance) => {
                    let call_slot = match self.heap.get(instance.class) {
                        HeapData::Class(class) => class.slots.call,
                        _ => None,
                    };
                    let Some(method) = call_slot else {
                        let found = self.type_name(callee);
                        return Err(self.raise(ExcKind::TypeError, format!("'{found}' object is not callable")));
                    };
                    self.thread.stack[callee_slot] = method;
                    self.thread.stack.insert(callee_slot + 1, callee);
                    argc += 1;
                }
                _ => {
                    let found = self.type_name(callee);
                    return Err(self.raise(ExcKind::TypeError, format!("'{found}' object is not callable")));
                }
            }
        }
    }

    /// Pushes `callee` and `args` and runs the call to completion. The
    /// reentrant entry every protocol dispatch (dunders, iteration, repr)
    /// goes through.
    pub(crate) fn call_and_run(&mut self, callee: Value, args: &[Value]) -> RunResult<Value> {
        let base = self.thread.stack.len();
        self.push(callee);
        for &arg in args {
            self.push(arg);
        }
        let depth = self.thread.frames.len();
        let result = match self.call_value(args.len()) {
            Ok(CallOutcome::ResumeVm) => self.run_until(depth),
            Ok(CallOutcome::NativeDone) => Ok(self.pop()),
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.thread.stack.truncate(base.min(self.thread.stack.len()));
        }
        result
    }

    fn call_native(
        &mut self,
        callee_slot: usize,
        func: NativeFn,
        pending_init: Option<Value>,
        include_callee: bool,
    ) -> RunResult<CallOutcome> {
        let window_start = if include_callee { callee_slot } else { callee_slot + 1 };
        let args = Args::from_window(&self.heap, &self.thread.stack[window_start..])
            .ok_or_else(|| RunError::internal("malformed keyword-argument window"))?;
        let result = func(self, args)?;
        self.thread.stack.truncate(callee_slot);
        self.push(pending_init.unwrap_or(result));
        Ok(CallOutcome::NativeDone)
    }

    fn call_closure(
        &mut self,
        callee_slot: usize,
        argc: usize,
        closure_id: HeapId,
        pending_init: Option<Value>,
    ) -> RunResult<CallOutcome> {
        if self.thread.frames.len() >= self.options.max_call_depth {
            return Err(self.raise(ExcKind::RecursionError, "maximum recursion depth exceeded".to_string()));
        }
        let HeapData::Closure(closure) = self.heap.get(closure_id) else {
            return Err(RunError::internal("call_closure on a non-closure"));
        };
        let (code_id, globals) = (closure.code, closure.globals);
        let defaults = closure.defaults.clone();
        let kw_defaults = closure.kw_defaults.clone();
        let HeapData::Code(code) = self.heap.get(code_id) else {
            return Err(RunError::internal("closure without a code object"));
        };
        let code = Rc::clone(code);
        self.bind_arguments(callee_slot, argc, &code, &defaults, &kw_defaults)?;
        self.tracer.on_call(code.name_str(&self.heap), self.thread.frames.len() + 1);
        self.thread.frames.push(CallFrame {
            closure: closure_id,
            code,
            ip: 0,
            base: callee_slot + 1,
            out: callee_slot,
            globals,
            try_stack: Vec::new(),
            init_instance: pending_init,
        });
        Ok(CallOutcome::ResumeVm)
    }

    /// Rewrites the argument window into the frame's local layout:
    /// positional parameters, keyword-only parameters, then the `*args` and
    /// `**kwargs` collectors.
    fn bind_arguments(
        &mut self,
        callee_slot: usize,
        argc: usize,
        code: &CodeObject,
        defaults: &[Value],
        kw_defaults: &[(HeapId, Value)],
    ) -> RunResult<()> {
        let window = &self.thread.stack[callee_slot + 1..callee_slot + 1 + argc];
        let Some((positional, kw_pairs)) = split_window(&self.heap, window) else {
            return Err(RunError::internal("malformed keyword-argument window"));
        };
        let positional: Vec<Value> = positional.to_vec();
        let params = &code.params;
        let pos_count = params.names.len();
        let kwonly_count = params.keyword_only.len();
        let name = code.name_str(&self.heap).to_string();

        let mut slots: Vec<Option<Value>> = vec![None; pos_count + kwonly_count];
        let mut extra_positional: Vec<Value> = Vec::new();
        let mut extra_keyword: Vec<(HeapId, Value)> = Vec::new();

        for (i, &value) in positional.iter().enumerate() {
            if i < pos_count {
                slots[i] = Some(value);
            } else if params.collect_args {
                extra_positional.push(value);
            } else {
                return Err(self.raise(
                    ExcKind::ArgumentError,
                    format!(
                        "{name}() takes {} positional argument{} but {} {} given",
                        pos_count,
                        if pos_count == 1 { "" } else { "s" },
                        positional.len(),
                        if positional.len() == 1 { "was" } else { "were" },
                    ),
                ));
            }
        }

        for &(kw_name, value) in &kw_pairs {
            if let Some(index) = params.names.iter().position(|&n| n == kw_name) {
                if slots[index].is_some() {
                    let text = self.heap.str_of(kw_name).to_string();
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!("{name}() got multiple values for argument '{text}'"),
                    ));
                }
                slots[index] = Some(value);
            } else if let Some(index) = params.keyword_only.iter().position(|&n| n == kw_name) {
                let slot = pos_count + index;
                if slots[slot].is_some() {
                    let text = self.heap.str_of(kw_name).to_string();
                    return Err(self.raise(
                        ExcKind::TypeError,
                        format!("{name}() got multiple values for argument '{text}'"),
                    ));
                }
                slots[slot] = Some(value);
            } else if params.collect_kwargs {
                extra_keyword.push((kw_name, value));
            } else {
                let text = self.heap.str_of(kw_name).to_string();
                return Err(self.raise(
                    ExcKind::TypeError,
                    format!("{name}() got an unexpected keyword argument '{text}'"),
                ));
            }
        }

        // Defaults: positional defaults align with the trailing optional
        // parameters; keyword-only defaults match by name.
        for (j, &default) in defaults.iter().enumerate() {
            let index = params.required + j;
            if index < pos_count && slots[index].is_none() {
                slots[index] = Some(default);
            }
        }
        for &(kw_name, default) in kw_defaults {
            if let Some(index) = params.keyword_only.iter().position(|&n| n == kw_name)
                && slots[pos_count + index].is_none()
            {
                slots[pos_count + index] = Some(default);
            }
        }

        let missing: Vec<String> = slots
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| {
                let name_id = if i < pos_count {
                    params.names[i]
                } else {
                    params.keyword_only[i - pos_count]
                };
                format!("'{}'", self.heap.str_of(name_id))
            })
            .collect();
        if !missing.is_empty() {
            return Err(self.raise(
                ExcKind::ArgumentError,
                format!(
                    "{name}() missing {} required argument{}: {}",
                    missing.len(),
                    if missing.len() == 1 { "" } else { "s" },
                    missing.join(", "),
                ),
            ));
        }

        // Collector allocations happen with collection paused: the values
        // already copied out of the window are invisible to the marker.
        self.heap.pause();
        let mut locals: Vec<Value> = slots.into_iter().map(|slot| slot.expect("missing checked above")).collect();
        if params.collect_args {
            let tuple = self.alloc_tuple(extra_positional);
            locals.push(tuple);
        }
        if params.collect_kwargs {
            let mut table = crate::table::Table::new();
            for (kw_name, value) in extra_keyword {
                table.set(&self.heap, Value::Object(kw_name), value);
            }
            let dict = self.alloc_dict(table);
            locals.push(dict);
        }
        self.thread.stack.truncate(callee_slot + 1);
        self.thread.stack.extend(locals);
        self.heap.resume();
        Ok(())
    }
}
