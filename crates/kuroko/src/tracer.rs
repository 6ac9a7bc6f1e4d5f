//! VM execution tracing hooks.
//!
//! The [`VmTracer`] trait defines hook points at key execution events. All
//! methods default to no-ops, so [`NoopTracer`] costs one virtual call per
//! hook and nothing else; [`StderrTracer`] produces the human-readable
//! execution log behind the disassembly/tracing surface.

use crate::bytecode::Opcode;

/// Trait for VM execution tracing. Implementations override only the hooks
/// they care about.
pub trait VmTracer {
    /// Called before each opcode dispatch. This is the hottest hook; keep
    /// implementations lightweight.
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Called when a call pushes a new frame.
    fn on_call(&mut self, _name: &str, _depth: usize) {}

    /// Called when a frame returns.
    fn on_return(&mut self, _depth: usize) {}

    /// Called after each garbage collection with the number of freed objects.
    fn on_gc(&mut self, _freed: usize, _live_bytes: usize) {}

    /// Called when an exception begins unwinding.
    fn on_raise(&mut self, _class_name: &str) {}
}

/// Zero-output tracer; the production default.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Human-readable execution log to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        eprintln!("[trace] {ip:04} {:<14} stack={stack_depth} frames={frame_depth}", opcode.mnemonic());
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        eprintln!("[trace] call {name} depth={depth}");
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("[trace] return depth={depth}");
    }

    fn on_gc(&mut self, freed: usize, live_bytes: usize) {
        eprintln!("[trace] gc freed={freed} live={live_bytes}");
    }

    fn on_raise(&mut self, class_name: &str) {
        eprintln!("[trace] raise {class_name}");
    }
}
