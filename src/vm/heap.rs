//! Object and array memory.
//!
//! Every allocation is a zeroed run of 64-bit slots with one header slot in
//! front of the returned pointer: `ptr[-1]` holds the class id of an object or
//! the (negative) element tag of an array. Arrays are laid out as
//! `[size, dims, dim_0 .. dim_n-1, elements...]`.
//!
//! Memory is reclaimed when the heap is dropped; there is no collector.

use std::alloc::Layout;
use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard};

use super::error::RuntimeError;
use super::ops::ElemKind;

/// Address of the nil reference.
pub const NIL: i64 = 0;

/// Slots in front of array elements, excluding the dimension sizes.
pub const ARRAY_HEADER_SLOTS: usize = 2;

struct Allocation {
    base: NonNull<i64>,
    layout: Layout,
}

// Allocations are only reached through raw addresses handed to bytecode.
unsafe impl Send for Allocation {}

pub struct Heap {
    allocations: Mutex<Vec<Allocation>>,
    held: Mutex<HashSet<i64>>,
    released: Condvar,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(Vec::new()),
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Allocate `slots` zeroed slots after a header holding `header`.
    fn alloc_slots(&self, header: i64, slots: usize) -> Result<i64, RuntimeError> {
        let total = slots
            .checked_add(1)
            .ok_or(RuntimeError::InvalidArraySize(slots as i64))?;
        let layout = Layout::array::<i64>(total)
            .map_err(|_| RuntimeError::InvalidArraySize(slots as i64))?;
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as *mut i64;
        let base = NonNull::new(base).ok_or_else(|| {
            RuntimeError::Bridge(format!("out of memory ({} bytes)", layout.size()))
        })?;

        unsafe { base.as_ptr().write(header) };
        lock(&self.allocations).push(Allocation { base, layout });
        Ok(unsafe { base.as_ptr().add(1) } as i64)
    }

    /// Allocate an instance with `fields` slots.
    pub fn alloc_object(&self, class_id: u32, fields: u32) -> Result<i64, RuntimeError> {
        self.alloc_slots(class_id as i64, fields as usize)
    }

    /// Allocate static memory for a class.
    pub fn alloc_statics(&self, class_id: u32, statics: u32) -> Result<i64, RuntimeError> {
        self.alloc_slots(class_id as i64, statics.max(1) as usize)
    }

    /// Allocate an array with the given dimension sizes (outermost first).
    pub fn alloc_array(&self, elem: ElemKind, dims: &[i64]) -> Result<i64, RuntimeError> {
        let mut size: i64 = 1;
        for &dim in dims {
            if dim < 0 {
                return Err(RuntimeError::InvalidArraySize(dim));
            }
            size = size
                .checked_mul(dim)
                .ok_or(RuntimeError::InvalidArraySize(dim))?;
        }
        let data_bytes = (size as usize)
            .checked_mul(elem.size())
            .ok_or(RuntimeError::InvalidArraySize(size))?;
        let slots = ARRAY_HEADER_SLOTS + dims.len() + data_bytes.div_ceil(8);

        let ptr = self.alloc_slots(elem.tag(), slots)?;
        unsafe {
            let p = ptr as *mut i64;
            p.write(size);
            p.add(1).write(dims.len() as i64);
            for (i, &dim) in dims.iter().enumerate() {
                p.add(ARRAY_HEADER_SLOTS + i).write(dim);
            }
        }
        Ok(ptr)
    }

    /// Number of live allocations.
    #[cfg(test)]
    pub fn allocation_count(&self) -> usize {
        lock(&self.allocations).len()
    }

    /// Block until no other holder is inside the critical section for `addr`.
    pub fn critical_start(&self, addr: i64) {
        let mut held = lock(&self.held);
        while held.contains(&addr) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        held.insert(addr);
    }

    pub fn critical_end(&self, addr: i64) {
        lock(&self.held).remove(&addr);
        self.released.notify_all();
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let allocations = self
            .allocations
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for a in allocations.drain(..) {
            unsafe { std::alloc::dealloc(a.base.as_ptr() as *mut u8, a.layout) };
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Raw accessors over heap addresses. Callers check for nil first.
pub mod raw {
    use super::ARRAY_HEADER_SLOTS;
    use crate::vm::ops::ElemKind;

    /// Header slot (class id or array tag).
    pub unsafe fn header(ptr: i64) -> i64 {
        unsafe { *(ptr as *const i64).sub(1) }
    }

    pub unsafe fn slot(ptr: i64, index: usize) -> i64 {
        unsafe { *(ptr as *const i64).add(index) }
    }

    pub unsafe fn set_slot(ptr: i64, index: usize, value: i64) {
        unsafe { *(ptr as *mut i64).add(index) = value }
    }

    /// Total element count.
    pub unsafe fn array_size(ptr: i64) -> i64 {
        unsafe { slot(ptr, 0) }
    }

    pub unsafe fn array_dims(ptr: i64) -> usize {
        unsafe { slot(ptr, 1) as usize }
    }

    /// Size of dimension `i`.
    pub unsafe fn array_dim(ptr: i64, i: usize) -> i64 {
        unsafe { slot(ptr, ARRAY_HEADER_SLOTS + i) }
    }

    /// Address of the first element.
    pub unsafe fn array_data(ptr: i64) -> *mut u8 {
        unsafe {
            let dims = array_dims(ptr);
            (ptr as *mut u8).add((ARRAY_HEADER_SLOTS + dims) * 8)
        }
    }

    pub unsafe fn load_elem(ptr: i64, elem: ElemKind, index: usize) -> i64 {
        unsafe {
            let data = array_data(ptr);
            match elem {
                ElemKind::Byte => *data.add(index) as i64,
                ElemKind::Char => *(data as *const u32).add(index) as i64,
                ElemKind::Int | ElemKind::Float => *(data as *const i64).add(index),
            }
        }
    }

    pub unsafe fn store_elem(ptr: i64, elem: ElemKind, index: usize, value: i64) {
        unsafe {
            let data = array_data(ptr);
            match elem {
                ElemKind::Byte => *data.add(index) = value as u8,
                ElemKind::Char => *(data as *mut u32).add(index) = value as u32,
                ElemKind::Int | ElemKind::Float => *(data as *mut i64).add(index) = value,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_layout() {
        let heap = Heap::new();
        let a = heap.alloc_array(ElemKind::Int, &[2, 3]).unwrap();
        unsafe {
            assert_eq!(raw::header(a), ElemKind::Int.tag());
            assert_eq!(raw::array_size(a), 6);
            assert_eq!(raw::array_dims(a), 2);
            assert_eq!(raw::array_dim(a, 0), 2);
            assert_eq!(raw::array_dim(a, 1), 3);
            assert_eq!(raw::array_data(a) as i64 - a, 32);

            raw::store_elem(a, ElemKind::Int, 5, 99);
            assert_eq!(raw::load_elem(a, ElemKind::Int, 5), 99);
        }
    }

    #[test]
    fn test_narrow_elements() {
        let heap = Heap::new();
        let bytes = heap.alloc_array(ElemKind::Byte, &[3]).unwrap();
        let chars = heap.alloc_array(ElemKind::Char, &[3]).unwrap();
        unsafe {
            raw::store_elem(bytes, ElemKind::Byte, 2, 0x1FF);
            assert_eq!(raw::load_elem(bytes, ElemKind::Byte, 2), 0xFF);
            raw::store_elem(chars, ElemKind::Char, 1, 0x1_0000_0041);
            assert_eq!(raw::load_elem(chars, ElemKind::Char, 1), 0x41);
        }
    }

    #[test]
    fn test_negative_size_rejected() {
        let heap = Heap::new();
        assert!(matches!(
            heap.alloc_array(ElemKind::Int, &[-1]),
            Err(RuntimeError::InvalidArraySize(-1))
        ));
    }

    #[test]
    fn test_object_header() {
        let heap = Heap::new();
        let obj = heap.alloc_object(7, 2).unwrap();
        unsafe {
            assert_eq!(raw::header(obj), 7);
            assert_eq!(raw::slot(obj, 1), 0);
        }
        assert_eq!(heap.allocation_count(), 1);
    }
}
