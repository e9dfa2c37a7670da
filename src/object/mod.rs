//! Object Module - Managed Object Model
//!
//! A heap object is a contiguous byte range:
//!
//! ```text
//! plug start ──► ┌──────────────────────────────┐
//!                │  header word (hash/sync, GC) │
//! object ref ──► ├──────────────────────────────┤
//!                │  method-table word           │  low bit = mark bit
//!                ├──────────────────────────────┤
//!                │  length word (arrays only)   │
//!                ├──────────────────────────────┤
//!                │  fields / elements ...       │
//!                └──────────────────────────────┘
//! ```
//!
//! An object reference points at the method-table word; the header lives
//! one machine word below it. `object_size` counts the full footprint
//! from the plug start. Free space inside regions is represented by free
//! objects carrying a distinguished method table, so heap walks always
//! see a valid object at every object start.

pub mod header;
pub mod method_table;
pub mod refmap;

pub use header::ObjectHeader;
pub use method_table::{MethodTable, FREE_OBJECT_MT};
pub use refmap::for_each_ref;

use crate::util::constants::{DATA_ALIGNMENT, MIN_OBJECT_SIZE, WORD};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Low bit of the method-table word: set while the object is marked by a
/// blocking collection.
pub const MARK_BIT: usize = 0x1;

/// Mask recovering the method-table pointer from the method-table word.
pub const MT_MASK: usize = !0x7;

/// Offset from an object reference back to its plug start.
#[inline]
pub fn plug_start(obj: usize) -> usize {
    obj - WORD
}

/// Object reference for a plug starting at `plug`.
#[inline]
pub fn obj_at(plug: usize) -> usize {
    plug + WORD
}

#[inline]
fn mt_word(obj: usize) -> &'static AtomicUsize {
    unsafe { &*(obj as *const AtomicUsize) }
}

/// Read the method table of `obj`, stripping GC bits.
///
/// # Safety
/// `obj` must reference a constructed object whose method table outlives
/// the collector.
#[inline]
pub unsafe fn method_table(obj: usize) -> &'static MethodTable {
    let word = mt_word(obj).load(Ordering::Relaxed) & MT_MASK;
    &*(word as *const MethodTable)
}

/// Install the method table word of a freshly-allocated object.
///
/// # Safety
/// `obj` must point at writable, committed heap memory.
#[inline]
pub unsafe fn set_method_table(obj: usize, mt: &'static MethodTable) {
    mt_word(obj).store(mt as *const MethodTable as usize, Ordering::Release);
}

/// Object header accessor.
///
/// # Safety
/// `obj` must reference a constructed object.
#[inline]
pub unsafe fn object_header<'a>(obj: usize) -> &'a ObjectHeader {
    &*(plug_start(obj) as *const ObjectHeader)
}

/// Check the blocking-GC mark bit.
#[inline]
pub unsafe fn is_marked(obj: usize) -> bool {
    mt_word(obj).load(Ordering::Relaxed) & MARK_BIT != 0
}

/// Set the blocking-GC mark bit. Returns true if it was already set.
#[inline]
pub unsafe fn set_marked(obj: usize) -> bool {
    mt_word(obj).fetch_or(MARK_BIT, Ordering::AcqRel) & MARK_BIT != 0
}

/// Clear the blocking-GC mark bit.
#[inline]
pub unsafe fn clear_marked(obj: usize) {
    mt_word(obj).fetch_and(!MARK_BIT, Ordering::AcqRel);
}

/// Whether `obj` is pinned (pin bit in the header, set by pinned handles
/// or pinned-heap allocation).
#[inline]
pub unsafe fn is_pinned(obj: usize) -> bool {
    object_header(obj).is_pinned()
}

/// Array or free-object length word.
///
/// # Safety
/// The object's method table must have a nonzero component size.
#[inline]
pub unsafe fn array_length(obj: usize) -> usize {
    std::ptr::read((obj + WORD) as *const usize)
}

#[inline]
pub unsafe fn set_array_length(obj: usize, len: usize) {
    std::ptr::write((obj + WORD) as *mut usize, len);
}

/// Total footprint of `obj` in bytes, measured from its plug start.
#[inline]
pub unsafe fn object_size(obj: usize) -> usize {
    let mt = method_table(obj);
    if mt.component_size == 0 {
        mt.base_size
    } else {
        crate::util::align_up(
            mt.base_size + array_length(obj) * mt.component_size,
            DATA_ALIGNMENT,
        )
    }
}

/// Whether `obj` is a free object.
#[inline]
pub unsafe fn is_free_object(obj: usize) -> bool {
    std::ptr::eq(method_table(obj), &*FREE_OBJECT_MT)
}

/// Turn `[plug, plug + size)` into a free object.
///
/// `size` must be at least [`MIN_OBJECT_SIZE`] and 8-aligned; smaller
/// gaps must be absorbed by their neighbors during plan.
///
/// # Safety
/// The range must be committed and must not contain a live object.
pub unsafe fn make_free_object(plug: usize, size: usize) {
    debug_assert!(size >= MIN_OBJECT_SIZE, "free object of {} bytes", size);
    debug_assert!(crate::util::is_aligned(size, DATA_ALIGNMENT));
    let obj = obj_at(plug);
    std::ptr::write(plug as *mut usize, 0); // header
    set_method_table(obj, &FREE_OBJECT_MT);
    set_array_length(obj, size - MIN_OBJECT_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::MIN_OBJECT_SIZE;

    fn scratch(len: usize) -> Vec<usize> {
        vec![0usize; len]
    }

    #[test]
    fn test_free_object_roundtrip() {
        let mut buf = scratch(16);
        let plug = buf.as_mut_ptr() as usize;
        unsafe {
            make_free_object(plug, 64);
            let obj = obj_at(plug);
            assert!(is_free_object(obj));
            assert_eq!(object_size(obj), 64);
            assert!(!is_marked(obj));
        }
    }

    #[test]
    fn test_minimum_free_object() {
        let mut buf = scratch(8);
        let plug = buf.as_mut_ptr() as usize;
        unsafe {
            make_free_object(plug, MIN_OBJECT_SIZE);
            assert_eq!(object_size(obj_at(plug)), MIN_OBJECT_SIZE);
        }
    }

    #[test]
    fn test_mark_bit_does_not_disturb_method_table() {
        let mut buf = scratch(8);
        let plug = buf.as_mut_ptr() as usize;
        unsafe {
            make_free_object(plug, 32);
            let obj = obj_at(plug);
            assert!(!set_marked(obj));
            assert!(is_marked(obj));
            assert!(is_free_object(obj));
            assert!(set_marked(obj));
            clear_marked(obj);
            assert!(!is_marked(obj));
            assert_eq!(object_size(obj), 32);
        }
    }
}
