//! Value hashing.
//!
//! The contract pairs with structural equality: any two values that compare
//! equal hash identically. Integers and booleans hash to their numeric value,
//! integral floats hash like the equivalent integer, strings cache an FNV-1a
//! hash at intern time, tuples combine element hashes, and everything else
//! falls back to slot identity.

use crate::{
    heap::{Heap, HeapData, HeapId},
    value::Value,
};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Fixed hash for `None`; an arbitrary constant shared by every `None`.
const NONE_HASH: u64 = 0x1a2b_3c4d;
/// Fixed hash for `NotImplemented`.
const NOT_IMPLEMENTED_HASH: u64 = 0x4d3c_2b1a;

/// FNV-1a over a byte slice. Used for string hashes (cached at intern time)
/// and for bytes objects.
#[must_use]
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hashes a value, or `None` for unhashable values (lists, dicts, and the
/// internal kwargs sentinel).
///
/// Instances hash by identity here; a managed `__hash__` only affects the
/// `hash()` builtin, never table slot placement.
#[must_use]
pub(crate) fn hash_value(heap: &Heap, value: Value) -> Option<u64> {
    match value {
        Value::None => Some(NONE_HASH),
        Value::NotImplemented => Some(NOT_IMPLEMENTED_HASH),
        Value::Bool(b) => Some(u64::from(b)),
        Value::Int(i) => Some(i.cast_unsigned()),
        Value::Float(f) => Some(hash_float(f)),
        Value::Kwargs(_) => None,
        Value::Object(id) => hash_object(heap, id),
    }
}

/// Integral floats must hash like the equal integer so `1 == 1.0` implies
/// `hash(1) == hash(1.0)`; other floats mix the IEEE bits.
fn hash_float(f: f64) -> u64 {
    if f.fract() == 0.0 && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
        return (f as i64).cast_unsigned();
    }
    let bits = f.to_bits();
    bits ^ bits.rotate_left(32)
}

fn hash_object(heap: &Heap, id: HeapId) -> Option<u64> {
    match heap.get(id) {
        HeapData::Str(s) => Some(s.hash()),
        HeapData::Bytes(b) => Some(fnv1a(b)),
        HeapData::Tuple(items) => {
            let mut hash = 0x0034_5678_u64 ^ items.len() as u64;
            for &item in items {
                let item_hash = hash_value(heap, item)?;
                hash = hash.rotate_left(5).wrapping_mul(FNV_PRIME) ^ item_hash;
            }
            Some(hash)
        }
        HeapData::List(_) | HeapData::Dict(_) => None,
        // Classes, instances, functions, modules: identity.
        _ => Some(u64::from(id.index()).wrapping_mul(0x9e37_79b9_7f4a_7c15)),
    }
}
