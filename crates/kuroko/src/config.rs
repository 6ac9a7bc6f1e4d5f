//! VM construction options.

/// Tunables fixed at `Vm::new`.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Maximum call-frame depth; exceeding it raises RecursionError.
    pub max_call_depth: usize,
    /// Collect on every allocation. Slow; for GC-soundness testing.
    pub gc_stress: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_call_depth: 64,
            gc_stress: false,
        }
    }
}
