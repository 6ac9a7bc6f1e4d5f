//! Builder for assembling code objects.
//!
//! `CodeBuilder` is the interface between the (out-of-scope) compiler and the
//! runtime: it encodes opcodes and operands, handles forward jumps with
//! patching, tracks source lines for tracebacks, and audits stack depth so a
//! malformed program fails at assembly time rather than at dispatch.
//!
//! # Usage
//!
//! ```ignore
//! let mut builder = CodeBuilder::new();
//! builder.set_line(1);
//! builder.emit(Opcode::None);
//! let jump = builder.emit_jump(Opcode::JumpIfFalse);
//! // ... emit more code ...
//! builder.patch_jump(jump);
//! let code = builder.build();
//! ```

use super::{
    code::{CodeObject, LineEntry, Params, UpvalueDesc},
    op::Opcode,
};
use crate::{heap::HeapId, types::FunctionFlags, value::Value};

/// Builder for emitting bytecode.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    bytecode: Vec<u8>,
    constants: Vec<Value>,
    lines: Vec<LineEntry>,
    /// Offset/line of the most recent line-table row, for delta encoding.
    last_offset: usize,
    last_line: u32,
    current_line: u32,
    current_stack_depth: i32,
    max_stack_depth: i32,
    params: Params,
    upvalues: Vec<UpvalueDesc>,
    local_names: Vec<HeapId>,
    name: Value,
    filename: Value,
    docstring: Value,
    flags: FunctionFlags,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: Value::None,
            filename: Value::None,
            docstring: Value::None,
            ..Self::default()
        }
    }

    /// Sets the source line recorded for subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u8 operand.
    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
        match op {
            // Call pops argc slots plus the callable and pushes the result.
            Opcode::Call => self.adjust_stack(-i16::from(operand)),
            // BuildSlice pops 2 or 3 bounds and pushes the slice.
            Opcode::BuildSlice => self.adjust_stack(1 - i16::from(operand)),
            _ => {
                if let Some(effect) = op.stack_effect() {
                    self.adjust_stack(effect);
                }
            }
        }
    }

    /// Emits an instruction with a big-endian u16 operand.
    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_be_bytes());
        let operand_i16 = i16::try_from(operand.min(i16::MAX.cast_unsigned())).unwrap_or(i16::MAX);
        match op {
            // Builders pop n (or 2n) elements and push one container.
            Opcode::BuildList | Opcode::BuildTuple => self.adjust_stack(1 - operand_i16),
            Opcode::BuildDict => self.adjust_stack(1 - 2 * operand_i16),
            _ => {
                if let Some(effect) = op.stack_effect() {
                    self.adjust_stack(effect);
                }
            }
        }
    }

    /// Emits `MakeClosure` with its code-object constant and the number of
    /// evaluated defaults sitting on the stack.
    pub fn emit_make_closure(&mut self, code_constant: u16, defaults_count: u8) {
        self.start_instruction();
        self.bytecode.push(Opcode::MakeClosure as u8);
        self.bytecode.extend_from_slice(&code_constant.to_be_bytes());
        self.bytecode.push(defaults_count);
        // Pops the defaults, pushes the closure.
        self.adjust_stack(1 - i16::from(defaults_count));
    }

    /// Emits `MakeClass` with its name constant and base count.
    pub fn emit_make_class(&mut self, name_constant: u16, base_count: u8) {
        self.start_instruction();
        self.bytecode.push(Opcode::MakeClass as u8);
        self.bytecode.extend_from_slice(&name_constant.to_be_bytes());
        self.bytecode.push(base_count);
        // Pops the bases, pushes the class.
        self.adjust_stack(1 - i16::from(base_count));
    }

    /// Emits a forward jump, returning a label to patch once the target is
    /// known.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.start_instruction();
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&0i16.to_be_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
        label
    }

    /// Patches a forward jump to land at the current offset.
    ///
    /// # Panics
    ///
    /// Panics if the jump offset exceeds i16 range, which indicates the
    /// function is too large. This is an assembly-time error rather than
    /// silent truncation.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.bytecode.len() as i64;
        // Offset is relative to the byte after the operand (opcode + i16 = 3).
        let raw_offset = target - label.0 as i64 - 3;
        let offset = i16::try_from(raw_offset).expect("jump offset exceeds i16 range; function too large");
        let bytes = offset.to_be_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a backward jump to a known target offset.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        self.start_instruction();
        let after = self.bytecode.len() as i64 + 3;
        let offset = i16::try_from(target as i64 - after).expect("jump offset exceeds i16 range; function too large");
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&offset.to_be_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Current bytecode offset; record this before a loop body for the
    /// closing backward jump.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Adds a constant to the pool, returning its index.
    ///
    /// # Panics
    ///
    /// Panics past 65535 entries; the function has too many constants.
    #[must_use]
    pub fn add_const(&mut self, value: Value) -> u16 {
        let index = u16::try_from(self.constants.len()).expect("constant pool exceeds u16 range");
        self.constants.push(value);
        index
    }

    /// Emits `Constant` for `value`, adding it to the pool.
    pub fn emit_const(&mut self, value: Value) {
        let index = self.add_const(value);
        self.emit_u16(Opcode::Constant, index);
    }

    /// Declares the parameter shape; the calling convention binds arguments
    /// into the leading local slots accordingly.
    pub fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    pub fn set_upvalues(&mut self, upvalues: Vec<UpvalueDesc>) {
        self.upvalues = upvalues;
    }

    pub fn set_local_names(&mut self, names: Vec<HeapId>) {
        self.local_names = names;
    }

    pub fn set_name(&mut self, name: Value) {
        self.name = name;
    }

    pub fn set_filename(&mut self, filename: Value) {
        self.filename = filename;
    }

    pub fn set_docstring(&mut self, docstring: Value) {
        self.docstring = docstring;
    }

    pub fn set_flags(&mut self, flags: FunctionFlags) {
        self.flags = flags;
    }

    /// Manually adjust tracked stack depth for shapes the per-opcode
    /// accounting cannot see (exception handlers pushing the exception).
    pub fn adjust_stack_depth(&mut self, delta: i16) {
        self.adjust_stack(delta);
    }

    #[must_use]
    pub fn stack_depth(&self) -> i32 {
        self.current_stack_depth
    }

    /// Builds the final code object.
    #[must_use]
    pub fn build(self) -> CodeObject {
        CodeObject {
            bytecode: self.bytecode,
            constants: self.constants,
            lines: self.lines,
            params: self.params,
            upvalues: self.upvalues,
            local_names: self.local_names,
            name: self.name,
            filename: self.filename,
            docstring: self.docstring,
            flags: self.flags,
        }
    }

    /// Records the line-table row for the instruction about to be emitted.
    /// Rows are only written when the line changes; offsets accumulate into
    /// the next row's delta.
    fn start_instruction(&mut self) {
        if self.current_line == self.last_line {
            return;
        }
        let mut offset_gap = self.bytecode.len() - self.last_offset;
        let mut line_gap = i64::from(self.current_line) - i64::from(self.last_line);
        // Wide gaps take several delta rows.
        while offset_gap > 0 || line_gap != 0 {
            let offset_delta = offset_gap.min(u8::MAX as usize);
            let line_delta = line_gap.clamp(i64::from(i8::MIN), i64::from(i8::MAX));
            self.lines.push(LineEntry {
                offset_delta: offset_delta as u8,
                line_delta: line_delta as i8,
            });
            offset_gap -= offset_delta;
            line_gap -= line_delta;
        }
        self.last_offset = self.bytecode.len();
        self.last_line = self.current_line;
    }

    fn adjust_stack(&mut self, delta: i16) {
        self.current_stack_depth += i32::from(delta);
        debug_assert!(
            self.current_stack_depth >= 0,
            "stack depth went negative at offset {}",
            self.bytecode.len()
        );
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }
}

/// Label for a forward jump awaiting `patch_jump`.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_basic() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::None);
        builder.emit(Opcode::Pop);
        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::None as u8, Opcode::Pop as u8]);
    }

    #[test]
    fn u16_operands_are_big_endian() {
        let mut builder = CodeBuilder::new();
        builder.emit_u16(Opcode::Constant, 0x1234);
        let code = builder.build();
        assert_eq!(code.bytecode(), &[Opcode::Constant as u8, 0x12, 0x34]);
    }

    #[test]
    fn forward_jump_patches_relative_offset() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump(Opcode::Jump);
        builder.emit(Opcode::None); // skipped
        builder.emit(Opcode::Pop); // skipped
        builder.patch_jump(jump);
        builder.emit(Opcode::None);
        builder.emit(Opcode::Return);
        let code = builder.build();
        // Jump at 0, lands at 5: offset = 5 - 0 - 3 = 2.
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::Jump as u8,
                0,
                2,
                Opcode::None as u8,
                Opcode::Pop as u8,
                Opcode::None as u8,
                Opcode::Return as u8,
            ]
        );
    }

    #[test]
    fn backward_jump_encodes_negative_offset() {
        let mut builder = CodeBuilder::new();
        let loop_start = builder.current_offset();
        builder.emit(Opcode::None);
        builder.emit(Opcode::Pop);
        builder.emit_jump_to(Opcode::Jump, loop_start);
        let code = builder.build();
        let expected = (-5i16).to_be_bytes();
        assert_eq!(
            code.bytecode(),
            &[
                Opcode::None as u8,
                Opcode::Pop as u8,
                Opcode::Jump as u8,
                expected[0],
                expected[1],
            ]
        );
    }

    #[test]
    fn line_table_round_trips_offsets() {
        let mut builder = CodeBuilder::new();
        builder.set_line(1);
        builder.emit(Opcode::None);
        builder.set_line(2);
        builder.emit(Opcode::Pop);
        builder.set_line(400);
        builder.emit(Opcode::Return);
        let code = builder.build();
        assert_eq!(code.line_for(0), 1);
        assert_eq!(code.line_for(1), 2);
        assert_eq!(code.line_for(2), 400);
    }

    #[test]
    fn add_const_returns_sequential_indices() {
        let mut builder = CodeBuilder::new();
        assert_eq!(builder.add_const(Value::Int(42)), 0);
        assert_eq!(builder.add_const(Value::None), 1);
    }
}
