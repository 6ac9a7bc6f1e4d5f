//! Exception kinds and the error carrier threaded through the runtime.
//!
//! A raised managed exception travels the Rust call stack as
//! `RunError::Raise(value)`, where the value is the heap-allocated exception
//! instance. Every native that fails returns `Err`, and callers propagate
//! with `?` until a try-block handler catches the unwind or the host observes
//! the exception after `run` returns.

use strum::{Display, EnumCount, IntoStaticStr, VariantArray};

use crate::value::Value;

/// Result type alias for operations that can raise a managed exception.
pub type RunResult<T> = Result<T, RunError>;

/// The error carrier for the interpreter.
#[derive(Debug)]
pub enum RunError {
    /// A managed exception in flight: the heap-allocated exception instance.
    Raise(Value),
    /// A VM-internal invariant violation; never catchable by managed code.
    Internal(String),
}

impl RunError {
    /// Convenience for internal errors.
    #[must_use]
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Built-in exception classes. Each is a class subclassing `BaseException`
/// (directly or through `Exception`); user code may subclass further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumCount, VariantArray)]
pub enum ExcKind {
    BaseException,
    Exception,
    TypeError,
    /// Wrong number of arguments to a call. Subclass of TypeError.
    ArgumentError,
    ValueError,
    IndexError,
    KeyError,
    AttributeError,
    NameError,
    ImportError,
    IOError,
    ZeroDivisionError,
    NotImplementedError,
    SyntaxError,
    AssertionError,
    RecursionError,
    /// Subclass of BaseException, not Exception, so bare `except Exception`
    /// does not swallow interrupts.
    KeyboardInterrupt,
}

impl ExcKind {
    /// The class this kind directly inherits from; `None` for the root.
    #[must_use]
    pub fn base(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception | Self::KeyboardInterrupt => Some(Self::BaseException),
            Self::ArgumentError => Some(Self::TypeError),
            _ => Some(Self::Exception),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_chains_to_base_exception() {
        for &kind in ExcKind::VARIANTS {
            let mut current = kind;
            let mut steps = 0;
            while let Some(base) = current.base() {
                current = base;
                steps += 1;
                assert!(steps <= ExcKind::COUNT, "base chain for {kind} does not terminate");
            }
            assert_eq!(current, ExcKind::BaseException);
        }
    }

    #[test]
    fn keyboard_interrupt_skips_exception() {
        assert_eq!(ExcKind::KeyboardInterrupt.base(), Some(ExcKind::BaseException));
        assert_eq!(ExcKind::ArgumentError.base(), Some(ExcKind::TypeError));
    }
}
