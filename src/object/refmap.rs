//! Reference Map Walking
//!
//! Enumerates the reference slots of an object from its method table:
//! the fixed offsets of the type plus, for reference arrays, every
//! element slot.

use crate::util::constants::WORD;

/// Invoke `f` with the address of every reference slot of `obj`.
///
/// Slots hold `usize` object references (0 = null). The callback receives
/// the *slot address*, not the referent, so callers can both read and
/// update the slot (relocation).
///
/// # Safety
/// `obj` must reference a constructed object with a valid method table.
#[inline]
pub unsafe fn for_each_ref(obj: usize, mut f: impl FnMut(usize)) {
    let mt = super::method_table(obj);
    for &off in &mt.ref_offsets {
        f(obj + off);
    }
    if mt.components_are_refs {
        let len = super::array_length(obj);
        // Elements follow the length word.
        let first = obj + (mt.base_size - WORD);
        for i in 0..len {
            f(first + i * WORD);
        }
    }
}

/// Count of reference slots (diagnostics).
pub unsafe fn ref_slot_count(obj: usize) -> usize {
    let mt = super::method_table(obj);
    let mut n = mt.ref_offsets.len();
    if mt.components_are_refs {
        n += super::array_length(obj);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{obj_at, set_array_length, set_method_table, MethodTable};
    use lazy_static::lazy_static;

    lazy_static! {
        static ref PAIR_MT: MethodTable =
            MethodTable::plain(2, vec![WORD, 2 * WORD], "pair");
        static ref REF_ARRAY_MT: MethodTable = MethodTable::array(WORD, true, "ref[]");
    }

    #[test]
    fn test_fixed_slots() {
        let mut buf = vec![0usize; 8];
        let plug = buf.as_mut_ptr() as usize;
        let obj = obj_at(plug);
        unsafe {
            set_method_table(obj, &PAIR_MT);
            let mut slots = Vec::new();
            for_each_ref(obj, |s| slots.push(s - obj));
            assert_eq!(slots, vec![WORD, 2 * WORD]);
        }
    }

    #[test]
    fn test_ref_array_slots() {
        let mut buf = vec![0usize; 16];
        let plug = buf.as_mut_ptr() as usize;
        let obj = obj_at(plug);
        unsafe {
            set_method_table(obj, &REF_ARRAY_MT);
            set_array_length(obj, 3);
            assert_eq!(ref_slot_count(obj), 3);
            let mut slots = Vec::new();
            for_each_ref(obj, |s| slots.push(s - obj));
            assert_eq!(slots, vec![2 * WORD, 3 * WORD, 4 * WORD]);
        }
    }
}
