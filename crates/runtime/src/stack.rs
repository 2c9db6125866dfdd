//! Value stack
//!
//! A contiguous, growable array of value slots. `current_func_floor` marks
//! where the running function's slots begin; all instruction slot operands
//! are relative to it. Slots own one external reference to their gc value:
//! writing a slot releases what it held, copying between slots retains.
//!
//! An emergency reserve of spare capacity is kept ahead of the live top so
//! the error path can still grow the stack when ordinary growth has just
//! failed with out-of-memory.

use crate::heap::{Heaps, OomError};
use crate::value::{value_to_display, Value};

/// Slots of spare capacity reserved for error-path growth.
pub const STACK_EMERGENCY_MARGIN: usize = 16;

#[derive(Debug, Default)]
pub struct Stack {
    entries: Vec<Value>,
    pub current_func_floor: i64,
}

impl Stack {
    pub fn new() -> Self {
        Stack::default()
    }

    pub fn entry_count(&self) -> i64 {
        self.entries.len() as i64
    }

    pub fn alloc_count(&self) -> i64 {
        self.entries.capacity() as i64
    }

    /// Grow or shrink to exactly `total` live slots. New slots are `none`;
    /// removed slots release their references. Ordinary callers keep the
    /// emergency margin intact; the error path passes
    /// `can_use_emergency_margin` to consume it.
    pub fn to_size(
        &mut self,
        total: i64,
        heaps: &mut Heaps,
        can_use_emergency_margin: bool,
    ) -> Result<(), OomError> {
        debug_assert!(total >= 0);
        let total = total as usize;
        if total < self.entries.len() {
            while self.entries.len() > total {
                let v = self.entries.pop().unwrap();
                heaps.release_value(&v);
            }
            return Ok(());
        }
        let needed_margin = if can_use_emergency_margin {
            0
        } else {
            STACK_EMERGENCY_MARGIN
        };
        let want = total + needed_margin;
        if want > self.entries.capacity() {
            let additional = want - self.entries.len();
            if self.entries.try_reserve(additional).is_err() {
                // The margin reserved by earlier growth may still cover
                // the request itself.
                if !can_use_emergency_margin || total > self.entries.capacity() {
                    return Err(OomError);
                }
            }
        }
        while self.entries.len() < total {
            self.entries.push(Value::None);
        }
        Ok(())
    }

    /// Absolute-slot read.
    pub fn get(&self, idx: i64) -> &Value {
        &self.entries[idx as usize]
    }

    /// Write an owned value into an absolute slot: the slot takes over the
    /// caller's reference, the old occupant's reference is released.
    pub fn write(&mut self, idx: i64, v: Value, heaps: &mut Heaps) {
        let old = std::mem::replace(&mut self.entries[idx as usize], v);
        heaps.release_value(&old);
    }

    /// Copy between absolute slots, retaining for the new location.
    pub fn copy_slot(&mut self, from: i64, to: i64, heaps: &mut Heaps) {
        if from == to {
            return;
        }
        let v = self.entries[from as usize].clone();
        heaps.retain_value(&v);
        self.write(to, v, heaps);
    }

    /// Read a copy of a slot and retain it for the caller.
    pub fn get_retained(&mut self, idx: i64, heaps: &mut Heaps) -> Value {
        let v = self.entries[idx as usize].clone();
        heaps.retain_value(&v);
        v
    }

    /// Move a value out of a slot, leaving `none`. The caller now owns the
    /// slot's reference.
    pub fn take(&mut self, idx: i64) -> Value {
        std::mem::replace(&mut self.entries[idx as usize], Value::None)
    }

    /// Slot index relative to the current function floor.
    pub fn abs_slot(&self, rel: i16) -> i64 {
        self.current_func_floor + rel as i64
    }

    /// Release every live slot. Used at thread teardown.
    pub fn clear(&mut self, heaps: &mut Heaps) {
        while let Some(v) = self.entries.pop() {
            heaps.release_value(&v);
        }
        self.current_func_floor = 0;
    }

    /// One line per slot to stderr, for the instruction tracer.
    pub fn dump_debug(&self, heaps: &Heaps) {
        eprintln!(
            "=== stack: {} entries, {} allocated, floor {} ===",
            self.entry_count(),
            self.alloc_count(),
            self.current_func_floor
        );
        for (i, v) in self.entries.iter().enumerate() {
            eprintln!("{}: {}", i, value_to_display(&heaps.gc, v));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GcKind;
    use crate::hstring::HString;

    #[test]
    fn test_to_size_grow_and_shrink() {
        let mut heaps = Heaps::new();
        let mut st = Stack::new();
        st.to_size(4, &mut heaps, false).unwrap();
        assert_eq!(st.entry_count(), 4);
        assert_eq!(st.get(3), &Value::None);
        st.write(2, Value::Int(9), &mut heaps);
        st.to_size(1, &mut heaps, false).unwrap();
        assert_eq!(st.entry_count(), 1);
    }

    #[test]
    fn test_growth_reserves_emergency_margin() {
        let mut heaps = Heaps::new();
        let mut st = Stack::new();
        st.to_size(8, &mut heaps, false).unwrap();
        assert!(
            st.alloc_count() >= 8 + STACK_EMERGENCY_MARGIN as i64,
            "normal growth must keep the margin allocated"
        );
    }

    #[test]
    fn test_shrink_releases_gc_references() {
        let mut heaps = Heaps::new();
        let mut st = Stack::new();
        st.to_size(2, &mut heaps, false).unwrap();
        let r = heaps
            .gc
            .alloc(GcKind::Str(HString::from_str("held")))
            .unwrap();
        heaps.gc.retain_external(r);
        st.write(0, Value::Gc(r), &mut heaps);
        assert_eq!(heaps.gc.live_count(), 1);
        st.to_size(0, &mut heaps, false).unwrap();
        assert_eq!(heaps.gc.live_count(), 0, "shrink must free the slot's value");
    }

    #[test]
    fn test_copy_slot_retains() {
        let mut heaps = Heaps::new();
        let mut st = Stack::new();
        st.to_size(2, &mut heaps, false).unwrap();
        let r = heaps
            .gc
            .alloc(GcKind::Str(HString::from_str("shared")))
            .unwrap();
        heaps.gc.retain_external(r);
        st.write(0, Value::Gc(r), &mut heaps);
        st.copy_slot(0, 1, &mut heaps);
        assert_eq!(heaps.gc.get(r).externalref, 2);
        st.clear(&mut heaps);
        assert_eq!(heaps.gc.live_count(), 0);
    }

    #[test]
    fn test_write_releases_previous_value() {
        let mut heaps = Heaps::new();
        let mut st = Stack::new();
        st.to_size(1, &mut heaps, false).unwrap();
        let r = heaps
            .gc
            .alloc(GcKind::Str(HString::from_str("old")))
            .unwrap();
        heaps.gc.retain_external(r);
        st.write(0, Value::Gc(r), &mut heaps);
        st.write(0, Value::Int(1), &mut heaps);
        assert_eq!(heaps.gc.live_count(), 0);
    }

    #[test]
    fn test_abs_slot_uses_floor() {
        let mut st = Stack::new();
        st.current_func_floor = 10;
        assert_eq!(st.abs_slot(3), 13);
    }
}
