//! Native frame layout of a compiled method.
//!
//! ```text
//! [rbp + 48]   operand stack capacity in slots (stack argument)
//! [rbp + 40]   locals size pointer
//! [rbp + 32]   locals base pointer
//! [rbp + 24]   call stack position pointer
//! [rbp + 16]   call stack pointer
//! [rbp +  8]   return address
//! [rbp +  0]   saved rbp
//! [rbp -  8]   class id            [rbp - 40]  operand stack base
//! [rbp - 16]   method id           [rbp - 48]  operand stack position pointer
//! [rbp - 24]   class memory        [rbp - 64 .. -120]  float temps
//! [rbp - 32]   instance            [rbp - 128 .. -168] int temps
//! [rbp - 176]  first local, growing down
//! ```

use std::collections::BTreeMap;

use crate::vm::{Method, ops::LocalKind};

use super::JitError;

pub const CLS_ID: i32 = -8;
pub const MTHD_ID: i32 = -16;
pub const CLASS_MEM: i32 = -24;
pub const INSTANCE_MEM: i32 = -32;
pub const OP_STACK: i32 = -40;
pub const STACK_POS: i32 = -48;

pub const CALL_STACK: i32 = 16;
pub const CALL_STACK_POS: i32 = 24;
pub const JIT_MEM: i32 = 32;
pub const JIT_OFFSET: i32 = 40;
pub const STACK_CAPACITY: i32 = 48;

pub const TMP_XMM_SLOTS: usize = 8;
pub const TMP_REG_SLOTS: usize = 6;

/// Bytes below rbp reserved for the fixed slots and temps.
pub const FIXED_SIZE: i32 = 168;

pub const SLOT_SIZE: i32 = 8;

/// Spill slot for float temp `i`.
pub fn tmp_xmm(i: usize) -> i32 {
    debug_assert!(i < TMP_XMM_SLOTS);
    -64 - 8 * i as i32
}

/// Spill slot for integer temp `i`.
pub fn tmp_reg(i: usize) -> i32 {
    debug_assert!(i < TMP_REG_SLOTS);
    -128 - 8 * i as i32
}

/// Byte offset of an instance or class field.
pub fn field_offset(id: u32) -> i32 {
    id as i32 * SLOT_SIZE
}

/// Local id -> frame offset, computed once per method before emission.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    locals: BTreeMap<u32, (i32, LocalKind)>,
    locals_size: i32,
}

impl FrameLayout {
    pub fn compute(method: &Method) -> Result<Self, JitError> {
        let mut kinds: BTreeMap<u32, LocalKind> = BTreeMap::new();
        for instr in &method.instrs {
            if let Some((id, kind)) = instr.local_access() {
                let entry = kinds.entry(id).or_insert(kind);
                *entry = (*entry).max(kind);
            }
        }

        let mut cursor = FIXED_SIZE;
        let mut locals = BTreeMap::new();
        for (id, kind) in kinds {
            cursor = cursor
                .checked_add(kind.slots() as i32 * SLOT_SIZE)
                .ok_or_else(|| JitError::Unsupported("frame too large".to_string()))?;
            locals.insert(id, (-cursor, kind));
        }

        Ok(Self {
            locals,
            locals_size: cursor - FIXED_SIZE,
        })
    }

    /// Frame offset of a local. A function local's second slot is at `offset + 8`.
    pub fn local(&self, id: u32) -> Result<i32, JitError> {
        self.locals
            .get(&id)
            .map(|(offset, _)| *offset)
            .ok_or_else(|| JitError::Internal(format!("local {} has no frame slot", id)))
    }

    pub fn locals_size(&self) -> i32 {
        self.locals_size
    }

    /// Offset of the lowest local byte.
    pub fn locals_base(&self) -> i32 {
        -(FIXED_SIZE + self.locals_size)
    }

    /// `sub rsp` amount so that calls from the body see a 16-byte aligned stack
    /// after the prolog's `push rbx`.
    pub fn stack_reserve(&self) -> i32 {
        let used = FIXED_SIZE + self.locals_size;
        (used + 15) / 16 * 16 + 8
    }

    pub fn len(&self) -> usize {
        self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ops::{Instr, MemoryContext, ReturnKind};

    #[test]
    fn test_ascending_ids() {
        let method = Method::new(
            0,
            0,
            "f",
            0,
            ReturnKind::None,
            vec![
                Instr::StorFloatVar { id: 2, ctx: MemoryContext::Local },
                Instr::StorIntVar { id: 0, ctx: MemoryContext::Local },
                Instr::StorFuncVar { id: 1, ctx: MemoryContext::Local },
                Instr::LoadIntVar { id: 9, ctx: MemoryContext::Instance },
            ],
        );
        let layout = FrameLayout::compute(&method).unwrap();

        assert_eq!(layout.local(0).unwrap(), -176);
        assert_eq!(layout.local(1).unwrap(), -192);
        assert_eq!(layout.local(2).unwrap(), -200);
        assert!(layout.local(9).is_err());
        assert_eq!(layout.locals_size(), 32);
        assert_eq!(layout.locals_base(), -200);
        assert_eq!(layout.len(), 3);
    }

    #[test]
    fn test_stack_reserve_alignment() {
        let empty = Method::new(0, 0, "f", 0, ReturnKind::None, vec![Instr::Rtrn]);
        let layout = FrameLayout::compute(&empty).unwrap();
        let reserve = layout.stack_reserve();
        // push rbp; sub rsp, reserve; push rbx leaves rsp 16-byte aligned.
        assert_eq!((8 + reserve + 8 + 8) % 16, 0);
        assert!(reserve >= FIXED_SIZE);
    }

    #[test]
    fn test_temp_slots() {
        assert_eq!(tmp_xmm(0), -64);
        assert_eq!(tmp_xmm(7), -120);
        assert_eq!(tmp_reg(0), -128);
        assert_eq!(tmp_reg(5), -168);
        assert_eq!(field_offset(3), 24);
    }
}
