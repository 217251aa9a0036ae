//! Method compiler: bytecode to x86-64.
//!
//! A single pass walks the method's instructions, simulating the operand
//! stack with [`AbstractValue`]s and emitting code only when a value has to
//! be materialized. Jumps are recorded in a [`FixupTable`] and patched after
//! the epilogue and trampolines are emitted.
//!
//! Conventions inside compiled code:
//! - RBP is the frame base (see [`super::frame`]).
//! - R8-R11 and XMM0/XMM1 are scratch and never hold an abstract value.
//! - The interpreter operand stack is reached through `[rbp + OP_STACK]`
//!   (slot base) and `[rbp + STACK_POS]` (pointer to the position counter).
//! - At every label and every jump the abstract stack is flushed to the
//!   operand stack, so all paths into a label agree on where values live.
//! - The operand stack capacity is checked against the deepest abstract
//!   stack seen since the last check, before anything that can fault or
//!   touch the operand stack. Reads from the operand stack check for an
//!   empty stack first.
//!
//! Lowering per instruction category lives in the `lower_*` modules.

use std::collections::HashMap;

use crate::vm::ops::{Instr, JumpCond, MemoryContext};
use crate::vm::{Method, Program};

use super::JitError;
use super::codebuf::CodeBuffer;
use super::fixup::{FixupTable, FixupTarget, Trampoline};
use super::frame::{self, FrameLayout};
use super::regalloc::{RegisterFile, RegisterHandle};
use super::value::{AbstractValue, SlotKind, WorkingStack};
use super::x86_64::{AluOp, Cond, Reg, X86_64Assembler, Xmm};

/// Scratch register for immediates and memory-to-memory moves.
pub(super) const SCRATCH: Reg = Reg::R11;

/// Numbers gathered while compiling one method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub instructions: usize,
    /// Pool allocations made (zero when every value stayed immediate or in memory).
    pub register_allocations: usize,
    pub fixups_patched: usize,
    pub code_size: usize,
}

/// Output of [`compile`], ready to be copied into an executable page.
#[derive(Debug)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    /// Constants referenced by absolute address from `code`. Must not be
    /// reallocated while the code can run.
    pub float_constants: Box<[f64]>,
    /// Native offset of each bytecode instruction.
    pub offsets: Vec<usize>,
    pub stats: CompileStats,
}

/// A register value parked in a temp slot across a call.
#[derive(Debug, Clone, Copy)]
pub(super) enum Spilled {
    General(Reg, i32),
    Float(Xmm, i32),
}

pub(super) struct MethodCompiler<'a> {
    pub(super) method: &'a Method,
    pub(super) program: &'a Program,
    pub(super) buf: CodeBuffer,
    pub(super) regs: RegisterFile,
    pub(super) stack: WorkingStack,
    pub(super) layout: FrameLayout,
    pub(super) fixups: FixupTable,
    float_constants: Box<[f64]>,
    float_index: HashMap<u64, usize>,
    /// Deepest abstract stack since the last capacity check.
    peak: usize,
}

/// Compile `method` into position-independent machine code.
pub fn compile(
    method: &Method,
    program: &Program,
    buffer_size: usize,
) -> Result<CompiledCode, JitError> {
    let mut compiler = MethodCompiler::new(method, program, buffer_size)?;
    compiler.emit_prolog();

    let count = method.instrs.len();
    let mut offsets = vec![0; count];
    let mut ip = 0;
    while ip < count {
        let start = compiler.buf.offset();
        let consumed = compiler.lower(ip)?;
        compiler.peak = compiler.peak.max(compiler.stack.len());
        for offset in offsets.iter_mut().skip(ip).take(1 + consumed) {
            *offset = start;
        }
        if !compiler.stack.registers_disjoint() {
            return Err(JitError::Internal(format!(
                "register bound twice after instruction {}",
                ip
            )));
        }
        ip += 1 + consumed;
    }

    // Falling off the end returns like `Rtrn`.
    compiler.flush();
    if !compiler.regs.is_idle() {
        return Err(JitError::Internal("register still held at method end".to_string()));
    }
    compiler.emit_epilogue();

    let register_allocations = compiler.regs.allocations();
    let MethodCompiler {
        mut buf,
        fixups,
        float_constants,
        ..
    } = compiler;
    let fixups_patched = fixups.resolve(&mut buf)?;
    let code = buf.into_code();

    Ok(CompiledCode {
        stats: CompileStats {
            instructions: count,
            register_allocations,
            fixups_patched,
            code_size: code.len(),
        },
        code,
        float_constants,
        offsets,
    })
}

/// Instructions that can raise a checked fault.
fn may_fault(instr: &Instr) -> bool {
    match instr {
        Instr::DivInt
        | Instr::ModInt
        | Instr::LoadAryElm { .. }
        | Instr::StorAryElm { .. }
        | Instr::LoadArySize => true,
        Instr::LoadIntVar { ctx, .. }
        | Instr::LoadFloatVar { ctx, .. }
        | Instr::LoadFuncVar { ctx, .. }
        | Instr::StorIntVar { ctx, .. }
        | Instr::StorFloatVar { ctx, .. }
        | Instr::StorFuncVar { ctx, .. }
        | Instr::CopyIntVar { ctx, .. }
        | Instr::CopyFloatVar { ctx, .. } => *ctx != MemoryContext::Local,
        _ => false,
    }
}

/// A conditional jump that directly consumes a comparison result.
pub(super) fn fused_jump(next: Option<&Instr>) -> Option<(u32, JumpCond)> {
    match next {
        Some(Instr::Jmp { label, cond }) if *cond != JumpCond::Always => Some((*label, *cond)),
        _ => None,
    }
}

impl<'a> MethodCompiler<'a> {
    fn new(method: &'a Method, program: &'a Program, buffer_size: usize) -> Result<Self, JitError> {
        let layout = FrameLayout::compute(method)?;

        // Slot 0 is always 0.0.
        let mut constants = vec![0.0f64];
        let mut float_index = HashMap::new();
        float_index.insert(0.0f64.to_bits(), 0);
        for instr in &method.instrs {
            if let Instr::LoadFloatLit(value) = instr {
                float_index.entry(value.to_bits()).or_insert_with(|| {
                    constants.push(*value);
                    constants.len() - 1
                });
            }
        }

        Ok(Self {
            method,
            program,
            buf: CodeBuffer::with_capacity(buffer_size),
            regs: RegisterFile::new(),
            stack: WorkingStack::new(),
            layout,
            fixups: FixupTable::new(),
            float_constants: constants.into_boxed_slice(),
            float_index,
            peak: 0,
        })
    }

    pub(super) fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    /// Absolute address of a float constant.
    pub(super) fn constant_address(&self, index: usize) -> i64 {
        self.float_constants.as_ptr() as i64 + index as i64 * 8
    }

    fn constant_bits(&self, index: usize) -> i64 {
        self.float_constants.get(index).copied().unwrap_or(0.0).to_bits() as i64
    }

    // ==================== Prolog / Epilogue ====================

    fn emit_prolog(&mut self) {
        let reserve = self.layout.stack_reserve();
        let locals_base = self.layout.locals_base();
        let locals_size = self.layout.locals_size();

        let mut asm = X86_64Assembler::new(&mut self.buf);
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        asm.alu_ri(AluOp::Sub, Reg::Rsp, reserve);
        asm.push(Reg::Rbx);

        for (reg, slot) in [
            (Reg::Rdi, frame::CLS_ID),
            (Reg::Rsi, frame::MTHD_ID),
            (Reg::Rdx, frame::CLASS_MEM),
            (Reg::Rcx, frame::INSTANCE_MEM),
            (Reg::R8, frame::OP_STACK),
            (Reg::R9, frame::STACK_POS),
        ] {
            asm.mov_mr(Reg::Rbp, slot, reg);
        }

        // Publish the locals area so the runtime can scan it.
        asm.mov_rr(Reg::R10, Reg::Rbp);
        asm.alu_ri(AluOp::Add, Reg::R10, locals_base);
        asm.mov_rm(SCRATCH, Reg::Rbp, frame::JIT_MEM);
        asm.mov_mr(SCRATCH, 0, Reg::R10);
        asm.mov_rm(SCRATCH, Reg::Rbp, frame::JIT_OFFSET);
        asm.mov_mi32(SCRATCH, 0, locals_size);

        for offset in (locals_base..-frame::FIXED_SIZE).step_by(frame::SLOT_SIZE as usize) {
            asm.mov_mi32(Reg::Rbp, offset, 0);
        }
    }

    /// Normal exit, shared teardown, then one trampoline per status.
    fn emit_epilogue(&mut self) {
        let used: Vec<_> = Trampoline::ALL
            .into_iter()
            .filter(|t| self.fixups.uses(*t))
            .collect();
        let mut asm = X86_64Assembler::new(&mut self.buf);
        let nominal = asm.offset();
        asm.mov_ri32(Reg::Rax, 0);
        let teardown = asm.offset();
        asm.pop(Reg::Rbx);
        asm.mov_rr(Reg::Rsp, Reg::Rbp);
        asm.pop(Reg::Rbp);
        asm.ret();

        let mut sites = Vec::with_capacity(used.len());
        for trampoline in used {
            let site = asm.offset();
            asm.mov_ri32(Reg::Rax, trampoline.status());
            let at = asm.jmp_rel32(0);
            sites.push((trampoline, site, at));
        }

        self.fixups.bind_epilogue(nominal);
        for (trampoline, site, at) in sites {
            self.fixups.bind_trampoline(trampoline, site);
            self.buf.patch_i32(at, teardown as i32 - at as i32 - 4);
        }
    }

    // ==================== Dispatch ====================

    /// Lower the instruction at `ip`. Returns how many following
    /// instructions were consumed along with it.
    fn lower(&mut self, ip: usize) -> Result<usize, JitError> {
        let method = self.method;
        let instr = &method.instrs[ip];
        let next = method.instrs.get(ip + 1);
        if may_fault(instr) {
            self.check_depth();
        }

        match instr {
            Instr::LoadIntLit(value) => self.stack.push(AbstractValue::ImmediateInt(*value)),
            Instr::LoadFloatLit(value) => {
                let index = self
                    .float_index
                    .get(&value.to_bits())
                    .copied()
                    .ok_or_else(|| JitError::Internal("float constant missing".to_string()))?;
                self.stack.push(AbstractValue::ImmediateFloat(index));
            }
            Instr::LoadInstMem => self.stack.push(AbstractValue::FrameSlot {
                offset: frame::INSTANCE_MEM,
                kind: SlotKind::Int,
            }),
            Instr::LoadClsMem => self.stack.push(AbstractValue::FrameSlot {
                offset: frame::CLASS_MEM,
                kind: SlotKind::Int,
            }),

            Instr::LoadIntVar { id, ctx } => self.load_var(*id, *ctx, SlotKind::Int)?,
            Instr::LoadFloatVar { id, ctx } => self.load_var(*id, *ctx, SlotKind::Float)?,
            Instr::LoadFuncVar { id, ctx } => self.load_func_var(*id, *ctx)?,
            Instr::StorIntVar { id, ctx } => self.store_var(*id, *ctx, SlotKind::Int, false)?,
            Instr::StorFloatVar { id, ctx } => self.store_var(*id, *ctx, SlotKind::Float, false)?,
            Instr::CopyIntVar { id, ctx } => self.store_var(*id, *ctx, SlotKind::Int, true)?,
            Instr::CopyFloatVar { id, ctx } => self.store_var(*id, *ctx, SlotKind::Float, true)?,
            Instr::StorFuncVar { id, ctx } => self.store_func_var(*id, *ctx)?,

            Instr::AddInt
            | Instr::SubInt
            | Instr::MulInt
            | Instr::DivInt
            | Instr::ModInt
            | Instr::AndInt
            | Instr::OrInt
            | Instr::BitAndInt
            | Instr::BitOrInt
            | Instr::BitXorInt
            | Instr::ShlInt
            | Instr::ShrInt
            | Instr::LesInt
            | Instr::GtrInt
            | Instr::LesEqlInt
            | Instr::GtrEqlInt
            | Instr::EqlInt
            | Instr::NeqlInt => return self.lower_int_binary(instr, next),
            Instr::BitNotInt => self.lower_bit_not()?,

            Instr::AddFloat | Instr::SubFloat | Instr::MulFloat | Instr::DivFloat => {
                self.lower_float_binary(instr)?
            }
            Instr::SqrtFloat | Instr::FloorFloat | Instr::CeilFloat => {
                self.lower_float_unary(instr)?
            }
            Instr::SinFloat
            | Instr::CosFloat
            | Instr::TanFloat
            | Instr::LogFloat
            | Instr::ExpFloat
            | Instr::AsinFloat
            | Instr::AcosFloat
            | Instr::PowFloat
            | Instr::Atan2Float => self.lower_float_call(instr)?,
            Instr::LesFloat
            | Instr::GtrFloat
            | Instr::LesEqlFloat
            | Instr::GtrEqlFloat
            | Instr::EqlFloat
            | Instr::NeqlFloat => return self.lower_float_compare(instr, next),
            Instr::I2F => self.lower_int_to_float()?,
            Instr::F2I => self.lower_float_to_int()?,

            Instr::SwapInt => {
                let top = self.pop(SlotKind::Int)?;
                let below = self.pop(SlotKind::Int)?;
                self.stack.push(top);
                self.stack.push(below);
            }
            Instr::PopInt | Instr::PopFloat => self.discard()?,

            Instr::Lbl(label) => {
                self.flush();
                let offset = self.buf.offset();
                self.fixups.bind_label(*label, offset);
            }
            Instr::Jmp { label, cond } => self.lower_jump(*label, *cond)?,
            Instr::Rtrn => {
                self.flush();
                self.jump_to(FixupTarget::Epilogue);
            }

            Instr::LoadAryElm { elem, dims } => self.lower_array_load(*elem, *dims)?,
            Instr::StorAryElm { elem, dims } => self.lower_array_store(*elem, *dims)?,
            Instr::LoadArySize => self.lower_array_size()?,

            _ => self.lower_bridge(ip)?,
        }
        Ok(0)
    }

    // ==================== Abstract stack ====================

    /// Pop an operand. When the abstract stack is empty the value is still
    /// on the interpreter operand stack and is loaded from there.
    pub(super) fn pop(&mut self, kind: SlotKind) -> Result<AbstractValue, JitError> {
        if self.stack.is_empty() {
            self.pop_operand_stack(kind)
        } else {
            self.stack.pop()
        }
    }

    /// Pop the interpreter operand stack into a fresh register, faulting
    /// when it is empty.
    fn pop_operand_stack(&mut self, kind: SlotKind) -> Result<AbstractValue, JitError> {
        self.check_depth();
        self.check_not_empty();
        self.take_operand(kind)
    }

    /// Pop a value the runtime bridge has just pushed.
    pub(super) fn take_operand(&mut self, kind: SlotKind) -> Result<AbstractValue, JitError> {
        let value = match kind {
            SlotKind::Int => {
                let handle = self.regs.allocate_general()?;
                self.emit_operand_top();
                self.asm().mov_rm(handle.reg(), Reg::R8, 0);
                AbstractValue::Register(handle)
            }
            SlotKind::Float => {
                let handle = self.regs.allocate_float()?;
                self.emit_operand_top();
                self.asm().movsd_rm(handle.reg(), Reg::R8, 0);
                AbstractValue::FloatRegister(handle)
            }
        };
        Ok(value)
    }

    /// Fault with `OperandOverflow` when the position plus the deepest
    /// abstract stack since the last check exceeds the capacity.
    pub(super) fn check_depth(&mut self) {
        if self.peak > 0 {
            let peak = i32::try_from(self.peak).unwrap_or(i32::MAX);
            let mut asm = self.asm();
            asm.mov_rm(Reg::R9, Reg::Rbp, frame::STACK_POS);
            asm.mov_rm(Reg::R10, Reg::R9, 0);
            asm.alu_ri(AluOp::Add, Reg::R10, peak);
            asm.alu_rm(AluOp::Cmp, Reg::R10, Reg::Rbp, frame::STACK_CAPACITY);
            self.jump_if(Cond::G, FixupTarget::Trampoline(Trampoline::OperandOverflow));
        }
        self.peak = self.stack.len();
    }

    fn check_not_empty(&mut self) {
        let mut asm = self.asm();
        asm.mov_rm(Reg::R9, Reg::Rbp, frame::STACK_POS);
        asm.alu_mi(AluOp::Cmp, Reg::R9, 0, 0);
        self.jump_if(Cond::Le, FixupTarget::Trampoline(Trampoline::OperandUnderflow));
    }

    /// Decrement the operand stack position; R8 = address of the popped slot.
    fn emit_operand_top(&mut self) {
        let mut asm = self.asm();
        asm.mov_rm(Reg::R8, Reg::Rbp, frame::OP_STACK);
        asm.mov_rm(Reg::R9, Reg::Rbp, frame::STACK_POS);
        asm.alu_mi(AluOp::Sub, Reg::R9, 0, 1);
        asm.mov_rm(Reg::R10, Reg::R9, 0);
        asm.shl_ri(Reg::R10, 3);
        asm.alu_rr(AluOp::Add, Reg::R8, Reg::R10);
    }

    /// R8 = address of the next free operand slot, R9 = position pointer.
    fn emit_operand_cursor(&mut self) {
        let mut asm = self.asm();
        asm.mov_rm(Reg::R8, Reg::Rbp, frame::OP_STACK);
        asm.mov_rm(Reg::R9, Reg::Rbp, frame::STACK_POS);
        asm.mov_rm(Reg::R10, Reg::R9, 0);
        asm.shl_ri(Reg::R10, 3);
        asm.alu_rr(AluOp::Add, Reg::R8, Reg::R10);
    }

    /// Append `values` (bottom first) to the interpreter operand stack.
    pub(super) fn push_operand_stack(&mut self, values: Vec<AbstractValue>) {
        self.check_depth();
        if values.is_empty() {
            return;
        }
        self.emit_operand_cursor();
        for value in values {
            self.store(Reg::R8, 0, value);
            let mut asm = self.asm();
            asm.alu_ri(AluOp::Add, Reg::R8, frame::SLOT_SIZE);
            asm.alu_mi(AluOp::Add, Reg::R9, 0, 1);
        }
    }

    /// Move the whole abstract stack onto the interpreter operand stack.
    pub(super) fn flush(&mut self) {
        let values: Vec<_> = self.stack.drain().collect();
        self.push_operand_stack(values);
    }

    /// Drop the top operand.
    fn discard(&mut self) -> Result<(), JitError> {
        if self.stack.is_empty() {
            self.check_depth();
            self.check_not_empty();
            let mut asm = self.asm();
            asm.mov_rm(Reg::R9, Reg::Rbp, frame::STACK_POS);
            asm.alu_mi(AluOp::Sub, Reg::R9, 0, 1);
        } else {
            let value = self.stack.pop()?;
            self.release(value);
        }
        Ok(())
    }

    pub(super) fn release(&mut self, value: AbstractValue) {
        match value {
            AbstractValue::Register(handle) => self.regs.release_general(handle),
            AbstractValue::FloatRegister(handle) => self.regs.release_float(handle),
            _ => {}
        }
    }

    // ==================== Materialization ====================

    /// Get `value` into an owned general register.
    pub(super) fn materialize_general(
        &mut self,
        value: AbstractValue,
    ) -> Result<RegisterHandle<Reg>, JitError> {
        if let AbstractValue::Register(handle) = value {
            return Ok(handle);
        }
        let handle = self.regs.allocate_general()?;
        self.load_scratch(handle.reg(), &value);
        self.release(value);
        Ok(handle)
    }

    /// Get `value` into an owned float register.
    pub(super) fn materialize_float(
        &mut self,
        value: AbstractValue,
    ) -> Result<RegisterHandle<Xmm>, JitError> {
        let handle = match value {
            AbstractValue::FloatRegister(handle) => return Ok(handle),
            AbstractValue::ImmediateFloat(index) => {
                let handle = self.regs.allocate_float()?;
                let address = self.constant_address(index);
                let mut asm = self.asm();
                asm.mov_ri64(SCRATCH, address);
                asm.movsd_rm(handle.reg(), SCRATCH, 0);
                handle
            }
            AbstractValue::FrameSlot { offset, .. } => {
                let handle = self.regs.allocate_float()?;
                self.asm().movsd_rm(handle.reg(), Reg::Rbp, offset);
                handle
            }
            AbstractValue::Register(general) => {
                let handle = self.regs.allocate_float()?;
                self.asm().movq_xmm_r64(handle.reg(), general.reg());
                self.regs.release_general(general);
                handle
            }
            AbstractValue::ImmediateInt(value) => {
                let handle = self.regs.allocate_float()?;
                let mut asm = self.asm();
                asm.mov_ri(SCRATCH, value);
                asm.movq_xmm_r64(handle.reg(), SCRATCH);
                handle
            }
        };
        Ok(handle)
    }

    /// Copy the bits of `value` into `dst` without consuming it.
    pub(super) fn load_scratch(&mut self, dst: Reg, value: &AbstractValue) {
        match value {
            AbstractValue::ImmediateInt(v) => self.asm().mov_ri(dst, *v),
            AbstractValue::ImmediateFloat(index) => {
                let bits = self.constant_bits(*index);
                self.asm().mov_ri(dst, bits);
            }
            AbstractValue::FrameSlot { offset, .. } => self.asm().mov_rm(dst, Reg::Rbp, *offset),
            AbstractValue::Register(handle) => {
                if handle.reg() != dst {
                    self.asm().mov_rr(dst, handle.reg());
                }
            }
            AbstractValue::FloatRegister(handle) => self.asm().movq_r64_xmm(dst, handle.reg()),
        }
    }

    /// Store the bits of `value` to `[base + disp]` without consuming it.
    pub(super) fn store_ref(&mut self, base: Reg, disp: i32, value: &AbstractValue) {
        match value {
            AbstractValue::ImmediateInt(v) if i32::try_from(*v).is_ok() => {
                self.asm().mov_mi32(base, disp, *v as i32)
            }
            AbstractValue::Register(handle) => self.asm().mov_mr(base, disp, handle.reg()),
            AbstractValue::FloatRegister(handle) => self.asm().movsd_mr(base, disp, handle.reg()),
            other => {
                self.load_scratch(SCRATCH, other);
                self.asm().mov_mr(base, disp, SCRATCH);
            }
        }
    }

    pub(super) fn store(&mut self, base: Reg, disp: i32, value: AbstractValue) {
        self.store_ref(base, disp, &value);
        self.release(value);
    }

    /// Load every deferred read of `[rbp + offset .. offset + width)` before
    /// that memory is overwritten.
    fn materialize_aliases(&mut self, offset: i32, width: i32) -> Result<(), JitError> {
        for index in self.stack.frame_slot_positions(offset, width) {
            let (slot, kind) = match self.stack.get_mut(index) {
                Some(AbstractValue::FrameSlot { offset, kind }) => (*offset, *kind),
                _ => continue,
            };
            let loaded = match kind {
                SlotKind::Int => {
                    let handle = self.regs.allocate_general()?;
                    self.asm().mov_rm(handle.reg(), Reg::Rbp, slot);
                    AbstractValue::Register(handle)
                }
                SlotKind::Float => {
                    let handle = self.regs.allocate_float()?;
                    self.asm().movsd_rm(handle.reg(), Reg::Rbp, slot);
                    AbstractValue::FloatRegister(handle)
                }
            };
            if let Some(entry) = self.stack.get_mut(index) {
                *entry = loaded;
            }
        }
        Ok(())
    }

    // ==================== Calls out of compiled code ====================

    /// Save every register held by the abstract stack into the temp slots.
    pub(super) fn spill(&mut self) -> Vec<Spilled> {
        let mut spilled = Vec::new();
        let (mut general, mut float) = (0, 0);
        for value in self.stack.iter() {
            match value {
                AbstractValue::Register(handle) => {
                    spilled.push(Spilled::General(handle.reg(), frame::tmp_reg(general)));
                    general += 1;
                }
                AbstractValue::FloatRegister(handle) => {
                    spilled.push(Spilled::Float(handle.reg(), frame::tmp_xmm(float)));
                    float += 1;
                }
                _ => {}
            }
        }

        let mut asm = self.asm();
        for spill in &spilled {
            match *spill {
                Spilled::General(reg, slot) => asm.mov_mr(Reg::Rbp, slot, reg),
                Spilled::Float(xmm, slot) => asm.movsd_mr(Reg::Rbp, slot, xmm),
            }
        }
        spilled
    }

    pub(super) fn restore(&mut self, spilled: &[Spilled]) {
        let mut asm = self.asm();
        for spill in spilled {
            match *spill {
                Spilled::General(reg, slot) => asm.mov_rm(reg, Reg::Rbp, slot),
                Spilled::Float(xmm, slot) => asm.movsd_rm(xmm, Reg::Rbp, slot),
            }
        }
    }

    /// `call` an absolute address through R10.
    pub(super) fn emit_call(&mut self, target: usize) {
        let mut asm = self.asm();
        asm.mov_ri64(Reg::R10, target as i64);
        asm.call_r(Reg::R10);
    }

    // ==================== Branches ====================

    pub(super) fn jump_to(&mut self, target: FixupTarget) {
        let at = self.asm().jmp_rel32(0);
        self.fixups.record(at, target);
    }

    pub(super) fn jump_if(&mut self, cond: Cond, target: FixupTarget) {
        let at = self.asm().jcc_rel32(cond, 0);
        self.fixups.record(at, target);
    }

    pub(super) fn nil_check(&mut self, reg: Reg) {
        self.asm().test_rr(reg, reg);
        self.jump_if(Cond::E, FixupTarget::Trampoline(Trampoline::NilDereference));
    }

    fn lower_jump(&mut self, label: u32, cond: JumpCond) -> Result<(), JitError> {
        let target = FixupTarget::Label(label);
        let Some(expected) = cond.expected() else {
            self.flush();
            self.jump_to(target);
            return Ok(());
        };

        let value = self.pop(SlotKind::Int)?;
        // Flushing emits flag-clobbering adds, so it goes before the compare.
        self.flush();
        match value {
            AbstractValue::ImmediateInt(v) => {
                if v == expected {
                    self.jump_to(target);
                }
            }
            AbstractValue::FrameSlot { offset, .. } => {
                self.asm().alu_mi(AluOp::Cmp, Reg::Rbp, offset, expected as i32);
                self.jump_if(Cond::E, target);
            }
            other => {
                let handle = self.materialize_general(other)?;
                self.asm().alu_ri(AluOp::Cmp, handle.reg(), expected as i32);
                self.regs.release_general(handle);
                self.jump_if(Cond::E, target);
            }
        }
        Ok(())
    }

    // ==================== Variables ====================

    /// Pop an object address into a register and nil-check it.
    pub(super) fn pop_object(&mut self) -> Result<RegisterHandle<Reg>, JitError> {
        let value = self.pop(SlotKind::Int)?;
        let handle = self.materialize_general(value)?;
        self.nil_check(handle.reg());
        Ok(handle)
    }

    fn load_var(&mut self, id: u32, ctx: MemoryContext, kind: SlotKind) -> Result<(), JitError> {
        if ctx == MemoryContext::Local {
            let offset = self.layout.local(id)?;
            self.stack.push(AbstractValue::FrameSlot { offset, kind });
            return Ok(());
        }

        let base = self.pop_object()?;
        let disp = frame::field_offset(id);
        match kind {
            SlotKind::Int => {
                let reg = base.reg();
                self.asm().mov_rm(reg, reg, disp);
                self.stack.push(AbstractValue::Register(base));
            }
            SlotKind::Float => {
                let value = self.regs.allocate_float()?;
                self.asm().movsd_rm(value.reg(), base.reg(), disp);
                self.regs.release_general(base);
                self.stack.push(AbstractValue::FloatRegister(value));
            }
        }
        Ok(())
    }

    fn load_func_var(&mut self, id: u32, ctx: MemoryContext) -> Result<(), JitError> {
        if ctx == MemoryContext::Local {
            let offset = self.layout.local(id)?;
            self.stack.push(AbstractValue::FrameSlot {
                offset: offset + frame::SLOT_SIZE,
                kind: SlotKind::Int,
            });
            self.stack.push(AbstractValue::FrameSlot { offset, kind: SlotKind::Int });
            return Ok(());
        }

        let base = self.pop_object()?;
        let context = self.regs.allocate_general()?;
        let disp = frame::field_offset(id);
        let (b, c) = (base.reg(), context.reg());
        let mut asm = self.asm();
        asm.mov_rm(c, b, disp + frame::SLOT_SIZE);
        asm.mov_rm(b, b, disp);
        self.stack.push(AbstractValue::Register(context));
        self.stack.push(AbstractValue::Register(base));
        Ok(())
    }

    fn store_var(
        &mut self,
        id: u32,
        ctx: MemoryContext,
        kind: SlotKind,
        copy: bool,
    ) -> Result<(), JitError> {
        if ctx == MemoryContext::Local {
            let offset = self.layout.local(id)?;
            let value = self.pop(kind)?;
            self.materialize_aliases(offset, frame::SLOT_SIZE)?;
            if copy {
                self.store_ref(Reg::Rbp, offset, &value);
                self.stack.push(value);
            } else {
                self.store(Reg::Rbp, offset, value);
            }
            return Ok(());
        }

        let base = self.pop_object()?;
        let value = self.pop(kind)?;
        let disp = frame::field_offset(id);
        if copy {
            self.store_ref(base.reg(), disp, &value);
            self.stack.push(value);
        } else {
            self.store(base.reg(), disp, value);
        }
        self.regs.release_general(base);
        Ok(())
    }

    fn store_func_var(&mut self, id: u32, ctx: MemoryContext) -> Result<(), JitError> {
        if ctx == MemoryContext::Local {
            let offset = self.layout.local(id)?;
            let code = self.pop(SlotKind::Int)?;
            let context = self.pop(SlotKind::Int)?;
            self.materialize_aliases(offset, 2 * frame::SLOT_SIZE)?;
            self.store(Reg::Rbp, offset, code);
            self.store(Reg::Rbp, offset + frame::SLOT_SIZE, context);
            return Ok(());
        }

        let base = self.pop_object()?;
        let code = self.pop(SlotKind::Int)?;
        let context = self.pop(SlotKind::Int)?;
        let disp = frame::field_offset(id);
        self.store(base.reg(), disp, code);
        self.store(base.reg(), disp + frame::SLOT_SIZE, context);
        self.regs.release_general(base);
        Ok(())
    }
}
