//! Immutable code objects.
//!
//! A code object is the unit the (out-of-scope) compiler hands the runtime:
//! a bytecode vector, a constant pool, a delta-encoded line table, parameter
//! and upvalue descriptors, and naming metadata for tracebacks. Code objects
//! never change after construction; the heap stores them behind `Rc` so call
//! frames can hold a handle without borrowing the arena.

use std::fmt::Write;

use crate::{
    bytecode::op::{Opcode, Operands},
    heap::{Heap, HeapId},
    types::FunctionFlags,
    value::Value,
};

/// One row of the line table: both fields are deltas against the previous
/// row. Large gaps are encoded as several rows.
#[derive(Debug, Clone, Copy)]
pub struct LineEntry {
    pub offset_delta: u8,
    pub line_delta: i8,
}

/// Describes one captured variable of a nested function: either a local slot
/// of the enclosing frame or a pass-through of the enclosing closure's own
/// upvalue at `index`.
#[derive(Debug, Clone, Copy)]
pub struct UpvalueDesc {
    pub is_local: bool,
    pub index: u16,
}

/// Parameter shape of a code object.
///
/// Locals at frame entry are laid out as: positional parameters, then
/// keyword-only parameters, then the `*args` tuple collector (if any), then
/// the `**kwargs` dict collector (if any).
#[derive(Debug, Default)]
pub struct Params {
    /// Positional parameter names (required first, then optional).
    pub names: Vec<HeapId>,
    /// How many of `names` are required.
    pub required: usize,
    /// Keyword-only parameter names.
    pub keyword_only: Vec<HeapId>,
    pub collect_args: bool,
    pub collect_kwargs: bool,
}

impl Params {
    /// Number of local slots the calling convention populates.
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.names.len()
            + self.keyword_only.len()
            + usize::from(self.collect_args)
            + usize::from(self.collect_kwargs)
    }
}

/// Immutable bytecode plus metadata.
#[derive(Debug)]
pub struct CodeObject {
    pub(crate) bytecode: Vec<u8>,
    pub(crate) constants: Vec<Value>,
    pub(crate) lines: Vec<LineEntry>,
    pub(crate) params: Params,
    pub(crate) upvalues: Vec<UpvalueDesc>,
    /// Local slot names, annotated next to `GetLocal`/`SetLocal` operands in
    /// disassembly. May be shorter than the real local count; unnamed slots
    /// render by index alone.
    pub(crate) local_names: Vec<HeapId>,
    /// Qualified name (a `Str` value, or `None`).
    pub(crate) name: Value,
    pub(crate) filename: Value,
    pub(crate) docstring: Value,
    pub(crate) flags: FunctionFlags,
}

impl CodeObject {
    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub(crate) fn constant(&self, index: u16) -> Value {
        self.constants[index as usize]
    }

    #[must_use]
    pub(crate) fn upvalue_descs(&self) -> &[UpvalueDesc] {
        &self.upvalues
    }

    /// Source line for a byte offset, reconstructed from the delta table.
    #[must_use]
    pub fn line_for(&self, offset: usize) -> u32 {
        let mut current_offset = 0usize;
        let mut line = 0i64;
        for entry in &self.lines {
            current_offset += entry.offset_delta as usize;
            if current_offset > offset {
                break;
            }
            line += i64::from(entry.line_delta);
        }
        u32::try_from(line.max(0)).unwrap_or(0)
    }

    /// The function's display name, or a placeholder for anonymous code.
    #[must_use]
    pub(crate) fn name_str<'a>(&self, heap: &'a Heap) -> &'a str {
        heap.value_as_str(self.name).unwrap_or("<anonymous>")
    }

    #[must_use]
    pub(crate) fn filename_str<'a>(&self, heap: &'a Heap) -> &'a str {
        heap.value_as_str(self.filename).unwrap_or("<unknown>")
    }

    /// Diagnostic name of a local slot, when the compiler recorded one.
    #[must_use]
    pub(crate) fn local_name<'a>(&self, heap: &'a Heap, slot: usize) -> Option<&'a str> {
        self.local_names.get(slot).map(|&id| heap.str_of(id))
    }

    /// Renders a human-readable instruction listing.
    #[must_use]
    pub fn disassemble(&self, heap: &Heap) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "== {} ==", self.name_str(heap));
        let mut ip = 0;
        while ip < self.bytecode.len() {
            let line = self.line_for(ip);
            let Some(op) = Opcode::decode(self.bytecode[ip]) else {
                let _ = writeln!(out, "{ip:04} {line:>4} <bad opcode {:#04x}>", self.bytecode[ip]);
                ip += 1;
                continue;
            };
            let _ = write!(out, "{ip:04} {line:>4} {:<14}", op.mnemonic());
            ip += 1;
            match op.operands() {
                Operands::None => {}
                Operands::Byte => {
                    let operand = self.bytecode[ip];
                    let _ = write!(out, " {operand}");
                    if matches!(op, Opcode::GetLocal | Opcode::SetLocal)
                        && let Some(name) = self.local_name(heap, operand as usize)
                    {
                        let _ = write!(out, " ({name})");
                    }
                    ip += 1;
                }
                Operands::Short => {
                    let operand = u16::from_be_bytes([self.bytecode[ip], self.bytecode[ip + 1]]);
                    let _ = write!(out, " {operand}");
                    if references_constant(op)
                        && let Some(&constant) = self.constants.get(operand as usize)
                    {
                        let _ = write!(out, " ({})", describe_constant(heap, constant));
                    }
                    ip += 2;
                }
                Operands::SignedShort => {
                    let offset = i16::from_be_bytes([self.bytecode[ip], self.bytecode[ip + 1]]);
                    ip += 2;
                    let target = ip as i64 + i64::from(offset);
                    let _ = write!(out, " {offset:+} -> {target}");
                }
                Operands::ShortByte => {
                    let operand = u16::from_be_bytes([self.bytecode[ip], self.bytecode[ip + 1]]);
                    let byte = self.bytecode[ip + 2];
                    let _ = write!(out, " {operand} {byte}");
                    ip += 3;
                }
            }
            out.push('\n');
        }
        out
    }
}

/// Whether a short operand indexes the constant pool (rather than counting
/// elements or arguments).
fn references_constant(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Constant
            | Opcode::GetGlobal
            | Opcode::SetGlobal
            | Opcode::DelGlobal
            | Opcode::GetAttr
            | Opcode::SetAttr
            | Opcode::DelAttr
            | Opcode::DefineMethod
            | Opcode::Import
    )
}

fn describe_constant(heap: &Heap, constant: Value) -> String {
    match constant {
        Value::Object(id) => heap
            .value_as_str(constant)
            .map_or_else(|| format!("<{}>", heap.get(id).variant_name()), |s| format!("{s:?}")),
        other => format!("{other:?}"),
    }
}
