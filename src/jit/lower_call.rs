//! Calls through the runtime bridge.
//!
//! Parameters are moved onto the interpreter operand stack, live registers
//! are parked in the temp slots, and the bridge runs the operation with the
//! interpreter's own code. Results come back on the operand stack.

use crate::vm::ops::{Instr, ReturnKind};

use super::JitError;
use super::bridge::{self, BridgeOp};
use super::compiler::MethodCompiler;
use super::fixup::{FixupTarget, Trampoline};
use super::frame;
use super::value::{AbstractValue, SlotKind};
use super::x86_64::{AluOp, Cond, Reg, X86_64Assembler};

/// Stack arguments pushed for the bridge call.
const STACK_ARGS: i32 = 4;

impl MethodCompiler<'_> {
    /// Operand slots consumed and result produced by a bridged instruction.
    fn bridge_signature(&self, instr: &Instr) -> Result<(usize, ReturnKind), JitError> {
        let signature = match instr {
            Instr::MthdCall { class, method } => {
                let callee = self.program.method(*class, *method).ok_or_else(|| {
                    JitError::Unsupported(format!("call to unknown method {}:{}", class, method))
                })?;
                // Receiver on top of the parameters.
                (callee.params as usize + 1, callee.rtrn)
            }
            Instr::DynMthdCall { params, rtrn } => (*params as usize + 2, *rtrn),
            Instr::NewArray { dims, .. } => (*dims as usize, ReturnKind::Int),
            Instr::NewObjInst(_) => (0, ReturnKind::Int),
            Instr::ObjTypeOf(_) | Instr::ObjInstCast(_) => (1, ReturnKind::Int),
            Instr::ThreadJoin | Instr::ThreadSleep | Instr::CriticalStart | Instr::CriticalEnd => {
                (1, ReturnKind::None)
            }
            Instr::CpyAry(_) => (5, ReturnKind::Int),
            Instr::ZeroAry(_) => (1, ReturnKind::None),
            Instr::RandFloat => (0, ReturnKind::Float),
            Instr::Trap { kind, args } | Instr::TrapRtrn { kind, args } => {
                let rtrn = if kind.returns_value() { ReturnKind::Int } else { ReturnKind::None };
                (*args as usize, rtrn)
            }
            other => return Err(JitError::Unsupported(format!("{:?}", other))),
        };
        Ok(signature)
    }

    pub(super) fn lower_bridge(&mut self, ip: usize) -> Result<(), JitError> {
        let method = self.method;
        let instr = &method.instrs[ip];
        let op = BridgeOp::of(instr).ok_or_else(|| JitError::Unsupported(format!("{:?}", instr)))?;
        let (params, result) = self.bridge_signature(instr)?;
        let ip = i32::try_from(ip)
            .map_err(|_| JitError::Unsupported("method too long".to_string()))?;

        // Parameters still on the abstract stack go to the operand stack;
        // any deeper ones are already there.
        let args = self.stack.split_top(params);
        self.push_operand_stack(args);
        let spilled = self.spill();

        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.mov_ri(Reg::Rdi, op as i64);
        asm.mov_ri64(Reg::Rsi, instr as *const Instr as i64);
        asm.mov_rm(Reg::Rdx, Reg::Rbp, frame::CLS_ID);
        asm.mov_rm(Reg::Rcx, Reg::Rbp, frame::MTHD_ID);
        asm.mov_rm(Reg::R8, Reg::Rbp, frame::INSTANCE_MEM);
        asm.mov_rm(Reg::R9, Reg::Rbp, frame::OP_STACK);
        asm.push_i32(ip);
        asm.push_m(Reg::Rbp, frame::CALL_STACK_POS);
        asm.push_m(Reg::Rbp, frame::CALL_STACK);
        asm.push_m(Reg::Rbp, frame::STACK_POS);
        asm.mov_ri64(Reg::R10, bridge::jit_stack_callback as usize as i64);
        asm.call_r(Reg::R10);
        asm.alu_ri(AluOp::Add, Reg::Rsp, STACK_ARGS * frame::SLOT_SIZE);
        asm.test_rr(Reg::Rax, Reg::Rax);
        self.jump_if(Cond::Ne, FixupTarget::Trampoline(Trampoline::BridgeFailure));

        self.restore(&spilled);

        match result {
            ReturnKind::None => {}
            ReturnKind::Int => {
                let value = self.take_operand(SlotKind::Int)?;
                self.stack.push(value);
            }
            ReturnKind::Float => {
                let value = self.take_operand(SlotKind::Float)?;
                self.stack.push(value);
            }
            ReturnKind::Func => {
                let code = self.take_operand(SlotKind::Int)?;
                let context = self.take_operand(SlotKind::Int)?;
                self.stack.push(context);
                self.stack.push(code);
            }
        }
        Ok(())
    }
}
