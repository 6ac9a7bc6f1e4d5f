//! Raising, traceback capture, and unwinding.
//!
//! A raise constructs (or adopts) an exception instance, stamps it with a
//! traceback of `(code, offset)` pairs, and walks the frame stack innermost
//! out. With-blocks on the way run `__exit__` with the in-flight exception;
//! the first try-block handler truncates the value stack to its recorded
//! depth, pushes the exception, and resumes at the handler offset. An
//! exception that escapes `exit_depth` propagates to the Rust caller, and
//! ultimately parks on the thread state for the host.

use crate::{
    args::Args,
    exception::{ExcKind, RunError, RunResult},
    heap::{HeapData, HeapId},
    intern::SpecialName,
    value::Value,
    vm::{TryKind, Vm},
};

impl Vm {
    /// Builds an exception instance of `kind` carrying `msg` and the current
    /// traceback, wrapped as the error carrier. The runtime half of the
    /// embedding `runtimeError` contract.
    pub fn raise(&mut self, kind: ExcKind, msg: String) -> RunError {
        self.heap.pause();
        let class_id = self.excs.get(kind);
        let instance = self.alloc_instance(class_id);
        let instance_id = instance.as_object().expect("instance just allocated");
        let args_value = if msg.is_empty() {
            self.alloc_tuple(Vec::new())
        } else {
            let msg_id = self.intern(&msg);
            self.alloc_tuple(vec![Value::Object(msg_id)])
        };
        let args_key = Value::Object(self.names.get(SpecialName::ExcArgs));
        self.heap.table_set(instance_id, args_key, args_value);
        let traceback = self.capture_traceback();
        let traceback_key = Value::Object(self.names.get(SpecialName::Traceback));
        self.heap.table_set(instance_id, traceback_key, traceback);
        self.heap.resume();
        self.tracer.on_raise(kind.name());
        RunError::Raise(instance)
    }

    /// Convenience for wrong-arity natives.
    pub(crate) fn arity_error(&mut self, name: &str, expected: usize, got: usize) -> RunError {
        self.raise(
            ExcKind::ArgumentError,
            format!(
                "{name}() takes {expected} argument{} ({got} given)",
                if expected == 1 { "" } else { "s" }
            ),
        )
    }

    /// Turns the operand of a `raise` statement into the error carrier:
    /// exception instances raise as-is (keeping any existing traceback),
    /// exception classes are instantiated first, anything else is a
    /// TypeError.
    pub(crate) fn raise_value(&mut self, exc: Value) -> RunError {
        let base_exception = self.excs.get(ExcKind::BaseException);
        if let Some(id) = exc.as_object() {
            if matches!(self.heap.get(id), HeapData::Class(_)) {
                if self.class_chain_contains(id, base_exception) {
                    return match self.call_and_run(exc, &[]) {
                        Ok(instance) => self.raise_value(instance),
                        Err(err) => err,
                    };
                }
            } else if matches!(self.heap.get(id), HeapData::Instance(_)) && self.is_instance_of(exc, base_exception) {
                // Re-raising keeps the original traceback.
                let traceback_key = Value::Object(self.names.get(SpecialName::Traceback));
                let existing = self.heap.table_get(id, traceback_key);
                if existing.is_none_or(Value::is_none) {
                    self.heap.pause();
                    let traceback = self.capture_traceback();
                    self.heap.table_set(id, traceback_key, traceback);
                    self.heap.resume();
                }
                let kind_name = self.type_name(exc);
                self.tracer.on_raise(&kind_name);
                return RunError::Raise(exc);
            }
        }
        self.raise(
            ExcKind::TypeError,
            "exceptions must derive from BaseException".to_string(),
        )
    }

    fn class_chain_contains(&self, class_id: HeapId, target: HeapId) -> bool {
        let mut current = Some(class_id);
        while let Some(id) = current {
            if id == target {
                return true;
            }
            current = match self.heap.get(id) {
                HeapData::Class(class) => class.base,
                _ => None,
            };
        }
        false
    }

    /// Snapshot of the live frames as a list of `(code, offset)` tuples,
    /// outermost first.
    fn capture_traceback(&mut self) -> Value {
        let mut entries: Vec<(Value, i64)> = Vec::with_capacity(self.thread.frames.len());
        let last = self.thread.frames.len().saturating_sub(1);
        for (depth, frame) in self.thread.frames.iter().enumerate() {
            let code_id = match self.heap.get(frame.closure) {
                HeapData::Closure(closure) => closure.code,
                _ => continue,
            };
            let offset = if depth == last {
                self.last_op_ip
            } else {
                frame.ip.saturating_sub(1)
            };
            entries.push((Value::Object(code_id), offset as i64));
        }
        let tuples: Vec<Value> = entries
            .into_iter()
            .map(|(code, offset)| self.alloc_tuple(vec![code, Value::Int(offset)]))
            .collect();
        self.alloc_list(tuples)
    }

    /// Unwinds after a raise. `Ok(())` means a handler took over and the
    /// dispatch loop should resume; `Err` means the exception escaped
    /// `exit_depth`.
    pub(crate) fn handle_unwind(&mut self, err: RunError, exit_depth: usize) -> RunResult<()> {
        let RunError::Raise(mut exc) = err else {
            return Err(err);
        };
        loop {
            if self.thread.frames.len() <= exit_depth {
                return Err(RunError::Raise(exc));
            }
            while let Some(block) = self.frame_mut().try_stack.pop() {
                match block.kind {
                    TryKind::With => {
                        // __exit__ is owed on every exit path. A raise from
                        // inside it replaces the in-flight exception.
                        self.thread.stack.truncate(block.stack_depth + 1);
                        let mgr = self.pop();
                        let exit_slot = self.slot_of(mgr, |slots| slots.exit);
                        if let Some(exit) = exit_slot {
                            match self.call_and_run(exit, &[mgr, exc]) {
                                Ok(_) => {}
                                Err(RunError::Raise(new_exc)) => exc = new_exc,
                                Err(other) => return Err(other),
                            }
                        }
                    }
                    TryKind::Handler => {
                        self.thread.stack.truncate(block.stack_depth);
                        self.push(exc);
                        self.frame_mut().ip = block.handler_ip;
                        return Ok(());
                    }
                }
            }
            let frame = self.thread.frames.pop().expect("unwind ran out of frames");
            self.close_upvalues(frame.base);
            self.thread.stack.truncate(frame.out);
            self.tracer.on_return(self.thread.frames.len());
            if self.thread.frames.len() == exit_depth {
                return Err(RunError::Raise(exc));
            }
        }
    }

    /// The message carried in an exception's `args` tuple, if any.
    #[must_use]
    pub fn exception_message(&self, exc: Value) -> Option<String> {
        let id = exc.as_object()?;
        let args_key = Value::Object(self.names.get(SpecialName::ExcArgs));
        let args = self.heap.table_get(id, args_key)?;
        let args_id = args.as_object()?;
        match self.heap.get(args_id) {
            HeapData::Tuple(items) => {
                let &first = items.first()?;
                self.heap.value_as_str(first).map(str::to_string)
            }
            _ => None,
        }
    }

    /// Renders an unhandled exception the way the host prints it: the
    /// traceback outermost to innermost, then `Class: message`.
    pub fn render_exception(&mut self, exc: Value) -> String {
        let mut out = String::new();
        if let Some(id) = exc.as_object() {
            let traceback_key = Value::Object(self.names.get(SpecialName::Traceback));
            if let Some(traceback) = self.heap.table_get(id, traceback_key)
                && let Some(tb_id) = traceback.as_object()
                && let HeapData::List(list) = self.heap.get(tb_id)
            {
                let entries: Vec<Value> = list.items.clone();
                if !entries.is_empty() {
                    out.push_str("Traceback (most recent call last):\n");
                }
                for entry in entries {
                    let Some(entry_id) = entry.as_object() else {
                        continue;
                    };
                    let HeapData::Tuple(pair) = self.heap.get(entry_id) else {
                        continue;
                    };
                    let (code_value, offset) = (pair[0], pair[1]);
                    let Some(code_id) = code_value.as_object() else {
                        continue;
                    };
                    let HeapData::Code(code) = self.heap.get(code_id) else {
                        continue;
                    };
                    let offset = offset.as_int().unwrap_or(0).max(0) as usize;
                    let line = code.line_for(offset);
                    out.push_str(&format!(
                        "  File \"{}\", line {line}, in {}\n",
                        code.filename_str(&self.heap),
                        code.name_str(&self.heap),
                    ));
                }
            }
        }
        let class_name = self.type_name(exc);
        match self.exception_message(exc) {
            Some(msg) if !msg.is_empty() => out.push_str(&format!("{class_name}: {msg}")),
            _ => out.push_str(&class_name),
        }
        out
    }
}

// --- exception class natives -------------------------------------------------

/// `BaseException.__init__`: stores the constructor arguments in `args`.
pub(crate) fn exc_init(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let Some(receiver) = args.get(0) else {
        return Err(vm.raise(ExcKind::TypeError, "__init__() requires a receiver".to_string()));
    };
    let Some(receiver_id) = receiver.as_object() else {
        return Err(vm.raise(ExcKind::TypeError, "__init__() requires an exception instance".to_string()));
    };
    let rest: Vec<Value> = args.positional()[1..].to_vec();
    vm.heap.pause();
    let args_value = vm.alloc_tuple(rest);
    let args_key = Value::Object(vm.names.get(SpecialName::ExcArgs));
    vm.heap.table_set(receiver_id, args_key, args_value);
    vm.heap.resume();
    Ok(Value::None)
}

/// `BaseException.__str__`: the message, or the empty string.
pub(crate) fn exc_str(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    let message = vm.exception_message(receiver).unwrap_or_default();
    Ok(Value::Object(vm.intern(&message)))
}

/// `BaseException.__repr__`: `Kind('message')`.
pub(crate) fn exc_repr(vm: &mut Vm, args: Args) -> RunResult<Value> {
    let receiver = args.get(0).unwrap_or(Value::None);
    let class_name = vm.type_name(receiver);
    let rendered = match vm.exception_message(receiver) {
        Some(msg) => format!("{class_name}({})", crate::types::str::repr_str(&msg)),
        None => format!("{class_name}()"),
    };
    Ok(Value::Object(vm.intern(&rendered)))
}
