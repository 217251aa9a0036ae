//! Float arithmetic, math calls, comparisons and conversions.

use crate::vm::intrinsics;
use crate::vm::ops::{Instr, JumpCond};

use super::JitError;
use super::compiler::{MethodCompiler, SCRATCH, fused_jump};
use super::fixup::FixupTarget;
use super::value::{AbstractValue, SlotKind};
use super::x86_64::{Cond, Reg, RoundMode, SseOp, Xmm};

const ARG0: Xmm = Xmm(0);
const ARG1: Xmm = Xmm(1);

impl MethodCompiler<'_> {
    pub(super) fn lower_float_binary(&mut self, instr: &Instr) -> Result<(), JitError> {
        let op = match instr {
            Instr::AddFloat => SseOp::Add,
            Instr::SubFloat => SseOp::Sub,
            Instr::MulFloat => SseOp::Mul,
            _ => SseOp::Div,
        };
        let left = self.pop(SlotKind::Float)?;
        let right = self.pop(SlotKind::Float)?;
        let dest = self.materialize_float(left)?;
        let d = dest.reg();

        match right {
            AbstractValue::FrameSlot { offset, .. } => self.asm().sse_rm(op, d, Reg::Rbp, offset),
            AbstractValue::ImmediateFloat(index) => {
                let address = self.constant_address(index);
                let mut asm = self.asm();
                asm.mov_ri64(SCRATCH, address);
                asm.sse_rm(op, d, SCRATCH, 0);
            }
            other => {
                let rhs = self.materialize_float(other)?;
                self.asm().sse_rr(op, d, rhs.reg());
                self.regs.release_float(rhs);
            }
        }

        self.stack.push(AbstractValue::FloatRegister(dest));
        Ok(())
    }

    pub(super) fn lower_float_unary(&mut self, instr: &Instr) -> Result<(), JitError> {
        let value = self.pop(SlotKind::Float)?;
        let dest = self.materialize_float(value)?;
        let d = dest.reg();
        let mut asm = self.asm();
        match instr {
            Instr::FloorFloat => asm.roundsd(d, d, RoundMode::Floor),
            Instr::CeilFloat => asm.roundsd(d, d, RoundMode::Ceil),
            _ => asm.sse_rr(SseOp::Sqrt, d, d),
        }
        self.stack.push(AbstractValue::FloatRegister(dest));
        Ok(())
    }

    /// Math functions without an SSE instruction go through the C ABI.
    pub(super) fn lower_float_call(&mut self, instr: &Instr) -> Result<(), JitError> {
        let (target, binary) = match instr {
            Instr::SinFloat => (intrinsics::sin as usize, false),
            Instr::CosFloat => (intrinsics::cos as usize, false),
            Instr::TanFloat => (intrinsics::tan as usize, false),
            Instr::AsinFloat => (intrinsics::asin as usize, false),
            Instr::AcosFloat => (intrinsics::acos as usize, false),
            Instr::LogFloat => (intrinsics::ln as usize, false),
            Instr::ExpFloat => (intrinsics::exp as usize, false),
            Instr::Atan2Float => (intrinsics::atan2 as usize, true),
            _ => (intrinsics::pow as usize, true),
        };

        let arg = self.pop(SlotKind::Float)?;
        let arg = self.materialize_float(arg)?;
        self.asm().movapd(ARG0, arg.reg());
        self.regs.release_float(arg);
        if binary {
            let second = self.pop(SlotKind::Float)?;
            let second = self.materialize_float(second)?;
            self.asm().movapd(ARG1, second.reg());
            self.regs.release_float(second);
        }

        let spilled = self.spill();
        self.emit_call(target);
        self.restore(&spilled);

        let result = self.regs.allocate_float()?;
        self.asm().movapd(result.reg(), ARG0);
        self.stack.push(AbstractValue::FloatRegister(result));
        Ok(())
    }

    pub(super) fn lower_float_compare(
        &mut self,
        instr: &Instr,
        next: Option<&Instr>,
    ) -> Result<usize, JitError> {
        let left = self.pop(SlotKind::Float)?;
        let right = self.pop(SlotKind::Float)?;
        let fused = fused_jump(next);
        if fused.is_some() {
            self.flush();
        }

        let lhs = self.materialize_float(left)?;
        let rhs = self.materialize_float(right)?;
        let (l, r) = (lhs.reg(), rhs.reg());
        // Unordered sets ZF, PF and CF, so "above" conditions are false on NaN.
        let (a, b, cond) = match instr {
            Instr::LesFloat => (r, l, Cond::A),
            Instr::LesEqlFloat => (r, l, Cond::Ae),
            Instr::GtrFloat => (l, r, Cond::A),
            Instr::GtrEqlFloat => (l, r, Cond::Ae),
            Instr::EqlFloat => (l, r, Cond::E),
            _ => (l, r, Cond::Ne),
        };
        self.asm().ucomisd(a, b);
        self.regs.release_float(lhs);
        self.regs.release_float(rhs);

        match fused {
            Some((label, polarity)) => {
                self.float_branch(cond, polarity == JumpCond::IfTrue, label);
                Ok(1)
            }
            None => {
                let dest = self.regs.allocate_general()?;
                let d = dest.reg();
                let mut asm = self.asm();
                asm.mov_ri32(d, 0);
                asm.mov_ri32(SCRATCH, 1);
                asm.cmov(cond, d, SCRATCH);
                match cond {
                    Cond::E => {
                        asm.mov_ri32(SCRATCH, 0);
                        asm.cmov(Cond::P, d, SCRATCH);
                    }
                    Cond::Ne => asm.cmov(Cond::P, d, SCRATCH),
                    _ => {}
                }
                self.stack.push(AbstractValue::Register(dest));
                Ok(0)
            }
        }
    }

    /// Branch on the flags of a preceding UCOMISD.
    fn float_branch(&mut self, cond: Cond, when_true: bool, label: u32) {
        let target = FixupTarget::Label(label);
        match (cond, when_true) {
            // Equal and ordered.
            (Cond::E, true) | (Cond::Ne, false) => {
                let skip = self.asm().jcc_rel8(Cond::P, 0);
                self.jump_if(Cond::E, target);
                self.asm().bind_rel8(skip);
            }
            // Unequal or unordered.
            (Cond::E, false) | (Cond::Ne, true) => {
                self.jump_if(Cond::P, target);
                self.jump_if(Cond::Ne, target);
            }
            (cond, true) => self.jump_if(cond, target),
            (cond, false) => self.jump_if(cond.invert(), target),
        }
    }

    pub(super) fn lower_int_to_float(&mut self) -> Result<(), JitError> {
        let value = self.pop(SlotKind::Int)?;
        let source = self.materialize_general(value)?;
        let dest = self.regs.allocate_float()?;
        self.asm().cvtsi2sd(dest.reg(), source.reg());
        self.regs.release_general(source);
        self.stack.push(AbstractValue::FloatRegister(dest));
        Ok(())
    }

    pub(super) fn lower_float_to_int(&mut self) -> Result<(), JitError> {
        let value = self.pop(SlotKind::Float)?;
        let source = self.materialize_float(value)?;
        let dest = self.regs.allocate_general()?;
        self.asm().cvttsd2si(dest.reg(), source.reg());
        self.regs.release_float(source);
        self.stack.push(AbstractValue::Register(dest));
        Ok(())
    }
}
