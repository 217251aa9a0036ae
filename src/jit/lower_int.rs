//! Integer arithmetic, shifts and comparisons.

use crate::vm::int_binary;
use crate::vm::ops::{Instr, JumpCond};

use super::JitError;
use super::compiler::{MethodCompiler, SCRATCH, fused_jump};
use super::fixup::{FixupTarget, Trampoline};
use super::value::{AbstractValue, SlotKind};
use super::x86_64::{AluOp, Cond, Reg, X86_64Assembler};

fn alu_op(instr: &Instr) -> Option<AluOp> {
    match instr {
        Instr::AddInt => Some(AluOp::Add),
        Instr::SubInt => Some(AluOp::Sub),
        Instr::AndInt | Instr::BitAndInt => Some(AluOp::And),
        Instr::OrInt | Instr::BitOrInt => Some(AluOp::Or),
        Instr::BitXorInt => Some(AluOp::Xor),
        _ => None,
    }
}

fn condition(instr: &Instr) -> Option<Cond> {
    match instr {
        Instr::LesInt => Some(Cond::L),
        Instr::GtrInt => Some(Cond::G),
        Instr::LesEqlInt => Some(Cond::Le),
        Instr::GtrEqlInt => Some(Cond::Ge),
        Instr::EqlInt => Some(Cond::E),
        Instr::NeqlInt => Some(Cond::Ne),
        _ => None,
    }
}

impl MethodCompiler<'_> {
    /// Binary integer instruction; the top of stack is the left operand.
    pub(super) fn lower_int_binary(
        &mut self,
        instr: &Instr,
        next: Option<&Instr>,
    ) -> Result<usize, JitError> {
        let left = self.pop(SlotKind::Int)?;
        let right = self.pop(SlotKind::Int)?;

        if let (AbstractValue::ImmediateInt(l), AbstractValue::ImmediateInt(r)) = (&left, &right) {
            // `None` is a constant divide by zero, left to fault at run time.
            if let Some(value) = int_binary(instr, *l, *r) {
                self.stack.push(AbstractValue::ImmediateInt(value));
                return Ok(0);
            }
        }

        if let Some(cond) = condition(instr) {
            return self.lower_int_compare(cond, left, right, next);
        }

        match instr {
            Instr::MulInt => self.lower_multiply(left, right)?,
            Instr::DivInt => self.lower_division(left, right, false)?,
            Instr::ModInt => self.lower_division(left, right, true)?,
            Instr::ShlInt => self.lower_shift(left, right, true)?,
            Instr::ShrInt => self.lower_shift(left, right, false)?,
            other => {
                let op = alu_op(other).ok_or_else(|| {
                    JitError::Internal(format!("{:?} is not an integer operator", other))
                })?;
                let dest = self.materialize_general(left)?;
                self.apply_alu(op, dest.reg(), right);
                self.stack.push(AbstractValue::Register(dest));
            }
        }
        Ok(0)
    }

    /// `dest = dest op right`, consuming `right`.
    pub(super) fn apply_alu(&mut self, op: AluOp, dest: Reg, right: AbstractValue) {
        match right {
            AbstractValue::ImmediateInt(v) if i32::try_from(v).is_ok() => {
                self.asm().alu_ri(op, dest, v as i32)
            }
            AbstractValue::FrameSlot { offset, .. } => {
                self.asm().alu_rm(op, dest, Reg::Rbp, offset)
            }
            AbstractValue::Register(handle) => {
                self.asm().alu_rr(op, dest, handle.reg());
                self.regs.release_general(handle);
            }
            other => {
                self.load_scratch(SCRATCH, &other);
                self.asm().alu_rr(op, dest, SCRATCH);
                self.release(other);
            }
        }
    }

    fn lower_multiply(
        &mut self,
        left: AbstractValue,
        right: AbstractValue,
    ) -> Result<(), JitError> {
        let dest = self.materialize_general(left)?;
        let d = dest.reg();
        match right {
            AbstractValue::ImmediateInt(v) if i32::try_from(v).is_ok() => {
                self.asm().imul_rri32(d, d, v as i32)
            }
            AbstractValue::FrameSlot { offset, .. } => self.asm().imul_rm(d, Reg::Rbp, offset),
            AbstractValue::Register(handle) => {
                self.asm().imul_rr(d, handle.reg());
                self.regs.release_general(handle);
            }
            other => {
                self.load_scratch(SCRATCH, &other);
                self.asm().imul_rr(d, SCRATCH);
                self.release(other);
            }
        }
        self.stack.push(AbstractValue::Register(dest));
        Ok(())
    }

    /// Signed division or remainder. RAX and RDX are borrowed for IDIV and
    /// restored, so `dest` may be either of them.
    fn lower_division(
        &mut self,
        left: AbstractValue,
        right: AbstractValue,
        remainder: bool,
    ) -> Result<(), JitError> {
        let dest = self.materialize_general(left)?;
        let d = dest.reg();
        self.load_scratch(SCRATCH, &right);
        self.release(right);

        self.asm().test_rr(SCRATCH, SCRATCH);
        self.jump_if(Cond::E, FixupTarget::Trampoline(Trampoline::DivideByZero));

        let mut asm = X86_64Assembler::new(&mut self.buf);
        // i64::MIN / -1 traps in hardware; the result wraps instead.
        asm.alu_ri(AluOp::Cmp, SCRATCH, -1);
        let general = asm.jcc_rel8(Cond::Ne, 0);
        if remainder {
            asm.mov_ri32(d, 0);
        } else {
            asm.neg(d);
        }
        let done = asm.jmp_rel8(0);

        asm.bind_rel8(general);
        asm.mov_rr(Reg::R8, Reg::Rax);
        asm.mov_rr(Reg::R9, Reg::Rdx);
        asm.mov_rr(Reg::Rax, d);
        asm.cqo();
        asm.idiv(SCRATCH);
        asm.mov_rr(Reg::R10, if remainder { Reg::Rdx } else { Reg::Rax });
        asm.mov_rr(Reg::Rax, Reg::R8);
        asm.mov_rr(Reg::Rdx, Reg::R9);
        asm.mov_rr(d, Reg::R10);
        asm.bind_rel8(done);

        self.stack.push(AbstractValue::Register(dest));
        Ok(())
    }

    /// Shift left or arithmetic shift right; the count is taken modulo 64.
    fn lower_shift(
        &mut self,
        left: AbstractValue,
        right: AbstractValue,
        shift_left: bool,
    ) -> Result<(), JitError> {
        let dest = self.materialize_general(left)?;
        let d = dest.reg();

        if let AbstractValue::ImmediateInt(count) = right {
            let count = (count & 63) as u8;
            let mut asm = self.asm();
            if shift_left {
                asm.shl_ri(d, count);
            } else {
                asm.sar_ri(d, count);
            }
        } else {
            self.load_scratch(SCRATCH, &right);
            self.release(right);
            // The count has to be in CL, which may itself hold a live value.
            let mut asm = self.asm();
            asm.mov_rr(Reg::R9, d);
            asm.mov_rr(Reg::R10, Reg::Rcx);
            asm.mov_rr(Reg::Rcx, SCRATCH);
            if shift_left {
                asm.shl_cl(Reg::R9);
            } else {
                asm.sar_cl(Reg::R9);
            }
            asm.mov_rr(Reg::Rcx, Reg::R10);
            asm.mov_rr(d, Reg::R9);
        }

        self.stack.push(AbstractValue::Register(dest));
        Ok(())
    }

    fn lower_int_compare(
        &mut self,
        cond: Cond,
        left: AbstractValue,
        right: AbstractValue,
        next: Option<&Instr>,
    ) -> Result<usize, JitError> {
        let fused = fused_jump(next);
        if fused.is_some() {
            self.flush();
        }

        let lhs = self.materialize_general(left)?;
        let l = lhs.reg();
        self.apply_alu(AluOp::Cmp, l, right);

        match fused {
            Some((label, polarity)) => {
                self.regs.release_general(lhs);
                let cond = if polarity == JumpCond::IfTrue { cond } else { cond.invert() };
                self.jump_if(cond, FixupTarget::Label(label));
                Ok(1)
            }
            None => {
                let mut asm = self.asm();
                asm.mov_ri32(l, 0);
                asm.mov_ri32(SCRATCH, 1);
                asm.cmov(cond, l, SCRATCH);
                self.stack.push(AbstractValue::Register(lhs));
                Ok(0)
            }
        }
    }

    pub(super) fn lower_bit_not(&mut self) -> Result<(), JitError> {
        let value = self.pop(SlotKind::Int)?;
        if let AbstractValue::ImmediateInt(v) = value {
            self.stack.push(AbstractValue::ImmediateInt(!v));
            return Ok(());
        }
        let dest = self.materialize_general(value)?;
        self.asm().not(dest.reg());
        self.stack.push(AbstractValue::Register(dest));
        Ok(())
    }
}
