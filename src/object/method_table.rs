//! Method Table - Type Descriptor for Managed Objects
//!
//! The method-table word of every object points at one of these. The
//! collector only consumes the size class and the reference-slot map;
//! everything else about the type belongs to the execution environment.

use crate::util::constants::{MIN_OBJECT_SIZE, WORD};
use lazy_static::lazy_static;

/// Type descriptor consumed by the tracer and the allocator.
///
/// Instances are owned by the execution environment and must outlive
/// every object of the type. The collector stores raw pointers to them
/// in object method-table words.
#[derive(Debug)]
pub struct MethodTable {
    /// Fixed footprint in bytes, measured from the plug start (header
    /// word included). For arrays this covers header, method-table word
    /// and length word only.
    pub base_size: usize,

    /// Per-element size for arrays; 0 for plain objects.
    pub component_size: usize,

    /// Offsets (from the object reference) of fixed reference slots.
    pub ref_offsets: Vec<usize>,

    /// Array elements are references (reference arrays scan every
    /// element).
    pub components_are_refs: bool,

    /// Instances are registered for finalization at allocation.
    pub finalizable: bool,

    /// Diagnostic name.
    pub name: &'static str,
}

impl MethodTable {
    /// Plain object with `field_words` payload words, of which the slots
    /// at `ref_offsets` (byte offsets from the object reference) hold
    /// references.
    pub fn plain(field_words: usize, ref_offsets: Vec<usize>, name: &'static str) -> Self {
        let base = 2 * WORD + field_words.max(1) * WORD;
        debug_assert!(base >= MIN_OBJECT_SIZE);
        Self {
            base_size: base,
            component_size: 0,
            ref_offsets,
            components_are_refs: false,
            finalizable: false,
            name,
        }
    }

    /// Array type with `component_size`-byte elements.
    pub fn array(component_size: usize, components_are_refs: bool, name: &'static str) -> Self {
        Self {
            base_size: 3 * WORD,
            component_size,
            ref_offsets: Vec::new(),
            components_are_refs,
            finalizable: false,
            name,
        }
    }

    /// Mark the type finalizable.
    pub fn with_finalizer(mut self) -> Self {
        self.finalizable = true;
        self
    }

    /// Whether instances carry any reference slots.
    #[inline]
    pub fn has_references(&self) -> bool {
        !self.ref_offsets.is_empty() || self.components_are_refs
    }

    /// Address of this table as stored in method-table words.
    #[inline]
    pub fn as_word(&'static self) -> usize {
        self as *const MethodTable as usize
    }
}

lazy_static! {
    /// Method table of free objects. Behaves like a byte array so a heap
    /// walk can step over dead space: size = MIN_OBJECT_SIZE + length.
    pub static ref FREE_OBJECT_MT: MethodTable = MethodTable {
        base_size: MIN_OBJECT_SIZE,
        component_size: 1,
        ref_offsets: Vec::new(),
        components_are_refs: false,
        finalizable: false,
        name: "<free>",
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_sizes() {
        let mt = MethodTable::plain(1, vec![], "min");
        assert_eq!(mt.base_size, MIN_OBJECT_SIZE);
        let mt = MethodTable::plain(4, vec![WORD, 2 * WORD], "four");
        assert_eq!(mt.base_size, 6 * WORD);
        assert!(mt.has_references());
    }

    #[test]
    fn test_free_object_mt_is_byte_array() {
        assert_eq!(FREE_OBJECT_MT.component_size, 1);
        assert!(!FREE_OBJECT_MT.has_references());
    }
}
