//! Runtime object payload types and built-in method glue.

pub(crate) mod class;
pub(crate) mod dict;
pub(crate) mod function;
pub(crate) mod iter;
pub(crate) mod list;
pub(crate) mod module;
pub(crate) mod str;
pub(crate) mod tuple;

pub(crate) use class::{BinaryOp, CachedSlots, ClassObject, CompareOp, Instance, NativePayload, PayloadKind, SubclassEntry};
pub use function::{FunctionFlags, NativeFn};
pub(crate) use function::{BoundMethod, Closure, NativeFunction, Property, Upvalue};
pub(crate) use iter::IterState;
pub(crate) use list::List;
pub(crate) use module::Module;
pub(crate) use str::StrObject;
