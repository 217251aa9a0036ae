//! Inline array element access with nil and bounds checks.

use crate::vm::heap::ARRAY_HEADER_SLOTS;
use crate::vm::ops::ElemKind;

use super::JitError;
use super::compiler::{MethodCompiler, SCRATCH};
use super::fixup::{FixupTarget, Trampoline};
use super::frame::SLOT_SIZE;
use super::regalloc::RegisterHandle;
use super::value::{AbstractValue, SlotKind};
use super::x86_64::{AluOp, Cond, Reg};

/// Byte offset of dimension size `i` from the array address.
fn dim_offset(i: u32) -> i32 {
    (ARRAY_HEADER_SLOTS as i32 + i as i32) * SLOT_SIZE
}

impl MethodCompiler<'_> {
    /// Pop the array and its indices, check them, and leave the element
    /// address minus the returned displacement in a register.
    fn element_address(
        &mut self,
        elem: ElemKind,
        dims: u32,
    ) -> Result<(RegisterHandle<Reg>, i32), JitError> {
        if dims == 0 {
            return Err(JitError::Unsupported("array access without dimensions".to_string()));
        }
        let array = self.pop_object()?;
        let first = self.pop(SlotKind::Int)?;
        let index = self.materialize_general(first)?;
        let (a, i) = (array.reg(), index.reg());

        // Row-major: index = index * dim[d] + next.
        for d in 1..dims {
            self.asm().imul_rm(i, a, dim_offset(d));
            let next = self.pop(SlotKind::Int)?;
            self.apply_alu(AluOp::Add, i, next);
        }

        self.asm().alu_ri(AluOp::Cmp, i, 0);
        self.jump_if(Cond::L, FixupTarget::Trampoline(Trampoline::IndexBelowZero));
        self.asm().alu_rm(AluOp::Cmp, i, a, 0);
        self.jump_if(Cond::Ge, FixupTarget::Trampoline(Trampoline::IndexAboveLength));

        let shift = elem.shift();
        let mut asm = self.asm();
        if shift > 0 {
            asm.shl_ri(i, shift);
        }
        asm.alu_rr(AluOp::Add, i, a);
        self.regs.release_general(array);

        Ok((index, dim_offset(dims)))
    }

    pub(super) fn lower_array_load(&mut self, elem: ElemKind, dims: u32) -> Result<(), JitError> {
        let (address, disp) = self.element_address(elem, dims)?;
        let r = address.reg();
        match elem {
            ElemKind::Byte => self.asm().movzx_rm_byte(r, r, disp),
            ElemKind::Char => self.asm().mov_r32_m(r, r, disp),
            ElemKind::Int => self.asm().mov_rm(r, r, disp),
            ElemKind::Float => {
                let value = self.regs.allocate_float()?;
                self.asm().movsd_rm(value.reg(), r, disp);
                self.regs.release_general(address);
                self.stack.push(AbstractValue::FloatRegister(value));
                return Ok(());
            }
        }
        self.stack.push(AbstractValue::Register(address));
        Ok(())
    }

    pub(super) fn lower_array_store(&mut self, elem: ElemKind, dims: u32) -> Result<(), JitError> {
        let (address, disp) = self.element_address(elem, dims)?;
        let r = address.reg();
        let kind = if elem == ElemKind::Float { SlotKind::Float } else { SlotKind::Int };
        let value = self.pop(kind)?;

        match elem {
            ElemKind::Int | ElemKind::Float => self.store(r, disp, value),
            ElemKind::Byte | ElemKind::Char => {
                let source = match &value {
                    AbstractValue::Register(handle) => handle.reg(),
                    other => {
                        self.load_scratch(SCRATCH, other);
                        SCRATCH
                    }
                };
                if elem == ElemKind::Byte {
                    self.asm().mov_mr_byte(r, disp, source);
                } else {
                    self.asm().mov_m_r32(r, disp, source);
                }
                self.release(value);
            }
        }
        self.regs.release_general(address);
        Ok(())
    }

    /// Length of the first dimension.
    pub(super) fn lower_array_size(&mut self) -> Result<(), JitError> {
        let array = self.pop_object()?;
        let r = array.reg();
        self.asm().mov_rm(r, r, dim_offset(0));
        self.stack.push(AbstractValue::Register(array));
        Ok(())
    }
}
