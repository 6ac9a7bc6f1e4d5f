//! Module objects.
//!
//! A module is a name plus a fields table; the fields double as the globals
//! table of every function defined in it. `__builtins__` is linked into the
//! fields at creation so global loads can fall back to it.

use crate::{heap::HeapId, table::Table};

#[derive(Debug)]
pub(crate) struct Module {
    /// Name string object.
    pub name: HeapId,
    /// Module globals.
    pub fields: Table,
}

impl Module {
    #[must_use]
    pub fn new(name: HeapId) -> Self {
        Self {
            name,
            fields: Table::new(),
        }
    }
}
