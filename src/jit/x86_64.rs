//! x86-64 instruction encoding for JIT compilation.
//!
//! This module provides functions for encoding x86-64 instructions
//! as machine code bytes. Uses System V AMD64 ABI conventions.

use super::codebuf::CodeBuffer;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,  // Return value
    Rcx = 1,  // 4th argument
    Rdx = 2,  // 3rd argument
    Rbx = 3,  // Callee-saved
    Rsp = 4,  // Stack pointer
    Rbp = 5,  // Frame pointer (callee-saved)
    Rsi = 6,  // 2nd argument
    Rdi = 7,  // 1st argument
    R8 = 8,   // 5th argument
    R9 = 9,   // 6th argument
    R10 = 10, // Caller-saved
    R11 = 11, // Caller-saved
    R12 = 12, // Callee-saved
    R13 = 13, // Callee-saved
    R14 = 14, // Callee-saved
    R15 = 15, // Callee-saved
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Check if this register requires REX.B or REX.R extension.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// SSE register `xmm0`..`xmm15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

impl Xmm {
    pub fn code(self) -> u8 {
        self.0 & 0x7
    }
}

/// x86-64 condition codes (for Jcc, SETcc, CMOVcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,  // Overflow
    No = 0x1, // Not overflow
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    S = 0x8,  // Sign (negative)
    Ns = 0x9, // Not sign (non-negative)
    P = 0xA,  // Parity even
    Np = 0xB, // Parity odd
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        // Condition codes come in complementary pairs differing in bit 0.
        match self as u8 ^ 1 {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Ge,
            0xE => Cond::Le,
            _ => Cond::G,
        }
    }
}

/// Two-operand integer ALU group sharing the `op*8+1` / `0x81 /op` encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Scalar double operations of the form `F2 0F op /r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SseOp {
    Sqrt = 0x51,
    Add = 0x58,
    Mul = 0x59,
    Sub = 0x5C,
    Div = 0x5E,
}

/// ROUNDSD immediate: rounding direction with the precision exception masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoundMode {
    Floor = 0x09,
    Ceil = 0x0A,
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    /// Current write offset of the underlying buffer.
    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    // ==================== REX / ModR/M helpers ====================

    /// Emit a REX prefix. `reg` and `rm` are full 4-bit register numbers.
    /// The prefix is skipped when it would be a bare 0x40, unless `force` is set
    /// (byte operations on SIL/DIL need it).
    fn rex(&mut self, w: bool, reg: u8, rm: u8, force: bool) {
        let rex = 0x40 | ((w as u8) << 3) | (((reg >> 3) & 1) << 2) | ((rm >> 3) & 1);
        if rex != 0x40 || force {
            self.buf.emit_u8(rex);
        }
    }

    /// Encode ModR/M byte.
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit ModR/M (+SIB, +displacement) for `[base + disp]`.
    fn mem(&mut self, reg: u8, base: Reg, disp: i32) {
        let needs_sib = base.code() == Reg::Rsp.code();
        // RBP/R13 with mod=00 means RIP-relative, so they always carry a displacement.
        let mode = if disp == 0 && base.code() != Reg::Rbp.code() {
            0b00
        } else if (-128..=127).contains(&disp) {
            0b01
        } else {
            0b10
        };
        self.buf.emit_u8(Self::modrm(mode, reg, base.code()));
        if needs_sib {
            self.buf.emit_u8(0x24);
        }
        match mode {
            0b01 => self.buf.emit_u8(disp as i8 as u8),
            0b10 => self.buf.emit_u32(disp as u32),
            _ => {}
        }
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src as u8, dst as u8, false);
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex(true, 0, dst as u8, false);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r64, imm32 (sign-extended)
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex(true, 0, dst as u8, false);
        self.buf.emit_u8(0xC7);
        self.buf.emit_u8(Self::modrm(0b11, 0, dst.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// Load an immediate using the shortest encoding. Never touches flags.
    pub fn mov_ri(&mut self, dst: Reg, imm: i64) {
        match i32::try_from(imm) {
            Ok(imm) => self.mov_ri32(dst, imm),
            Err(_) => self.mov_ri64(dst, imm),
        }
    }

    /// MOV r64, [base + disp]
    pub fn mov_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst as u8, base as u8, false);
        self.buf.emit_u8(0x8B);
        self.mem(dst.code(), base, disp);
    }

    /// MOV [base + disp], r64
    pub fn mov_mr(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(true, src as u8, base as u8, false);
        self.buf.emit_u8(0x89);
        self.mem(src.code(), base, disp);
    }

    /// MOV qword [base + disp], imm32 (sign-extended)
    pub fn mov_mi32(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex(true, 0, base as u8, false);
        self.buf.emit_u8(0xC7);
        self.mem(0, base, disp);
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r32, [base + disp] (zero-extends into the full register)
    pub fn mov_r32_m(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(false, dst as u8, base as u8, false);
        self.buf.emit_u8(0x8B);
        self.mem(dst.code(), base, disp);
    }

    /// MOV [base + disp], r32
    pub fn mov_m_r32(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(false, src as u8, base as u8, false);
        self.buf.emit_u8(0x89);
        self.mem(src.code(), base, disp);
    }

    /// MOVZX r64, byte [base + disp]
    pub fn movzx_rm_byte(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst as u8, base as u8, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.mem(dst.code(), base, disp);
    }

    /// MOV byte [base + disp], r8
    pub fn mov_mr_byte(&mut self, base: Reg, disp: i32, src: Reg) {
        // Without REX, codes 4-7 select AH/CH/DH/BH instead of SPL/BPL/SIL/DIL.
        self.rex(false, src as u8, base as u8, true);
        self.buf.emit_u8(0x88);
        self.mem(src.code(), base, disp);
    }

    /// CMOVcc r64, r64
    pub fn cmov(&mut self, cond: Cond, dst: Reg, src: Reg) {
        self.rex(true, dst as u8, src as u8, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x40 + cond as u8);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    // ==================== Arithmetic Operations ====================

    /// `op r64, r64`
    pub fn alu_rr(&mut self, op: AluOp, dst: Reg, src: Reg) {
        self.rex(true, src as u8, dst as u8, false);
        self.buf.emit_u8((op as u8) * 8 + 1);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// `op r64, imm32` (imm8 form when it fits)
    pub fn alu_ri(&mut self, op: AluOp, dst: Reg, imm: i32) {
        self.rex(true, 0, dst as u8, false);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, op as u8, dst.code()));
            self.buf.emit_u8(imm as i8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, op as u8, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// `op r64, [base + disp]`
    pub fn alu_rm(&mut self, op: AluOp, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst as u8, base as u8, false);
        self.buf.emit_u8((op as u8) * 8 + 3);
        self.mem(dst.code(), base, disp);
    }

    /// `op qword [base + disp], imm32`
    pub fn alu_mi(&mut self, op: AluOp, base: Reg, disp: i32, imm: i32) {
        self.rex(true, 0, base as u8, false);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.mem(op as u8, base, disp);
            self.buf.emit_u8(imm as i8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.mem(op as u8, base, disp);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// IMUL r64, r64
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst as u8, src as u8, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// IMUL r64, [base + disp]
    pub fn imul_rm(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst as u8, base as u8, false);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.mem(dst.code(), base, disp);
    }

    /// IMUL r64, r64, imm32
    pub fn imul_rri32(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.rex(true, dst as u8, src as u8, false);
        self.buf.emit_u8(0x69);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// IDIV r64 (RDX:RAX / src)
    pub fn idiv(&mut self, src: Reg) {
        self.rex(true, 0, src as u8, false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 7, src.code()));
    }

    /// CQO (sign-extend RAX into RDX:RAX)
    pub fn cqo(&mut self) {
        self.buf.emit_u8(0x48);
        self.buf.emit_u8(0x99);
    }

    /// NEG r64
    pub fn neg(&mut self, dst: Reg) {
        self.rex(true, 0, dst as u8, false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    /// NOT r64
    pub fn not(&mut self, dst: Reg) {
        self.rex(true, 0, dst as u8, false);
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 2, dst.code()));
    }

    /// TEST r64, r64
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src as u8, dst as u8, false);
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// SHL r64, CL
    pub fn shl_cl(&mut self, dst: Reg) {
        self.rex(true, 0, dst as u8, false);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
    }

    /// SAR r64, CL
    pub fn sar_cl(&mut self, dst: Reg) {
        self.rex(true, 0, dst as u8, false);
        self.buf.emit_u8(0xD3);
        self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
    }

    /// SHL r64, imm8
    pub fn shl_ri(&mut self, dst: Reg, imm: u8) {
        self.rex(true, 0, dst as u8, false);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, 4, dst.code()));
        self.buf.emit_u8(imm);
    }

    /// SAR r64, imm8
    pub fn sar_ri(&mut self, dst: Reg, imm: u8) {
        self.rex(true, 0, dst as u8, false);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(Self::modrm(0b11, 7, dst.code()));
        self.buf.emit_u8(imm);
    }

    // ==================== Stack Operations ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        self.rex(false, 0, reg as u8, false);
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        self.rex(false, 0, reg as u8, false);
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// PUSH qword [base + disp]
    pub fn push_m(&mut self, base: Reg, disp: i32) {
        self.rex(false, 0, base as u8, false);
        self.buf.emit_u8(0xFF);
        self.mem(6, base, disp);
    }

    /// PUSH imm32 (sign-extended to 64 bits)
    pub fn push_i32(&mut self, imm: i32) {
        self.buf.emit_u8(0x68);
        self.buf.emit_u32(imm as u32);
    }

    // ==================== Control Flow ====================

    /// JMP rel32. Returns the offset of the displacement field.
    pub fn jmp_rel32(&mut self, offset: i32) -> usize {
        self.buf.emit_u8(0xE9);
        let at = self.buf.offset();
        self.buf.emit_u32(offset as u32);
        at
    }

    /// JMP rel8. Returns the offset of the displacement byte.
    pub fn jmp_rel8(&mut self, offset: i8) -> usize {
        self.buf.emit_u8(0xEB);
        let at = self.buf.offset();
        self.buf.emit_u8(offset as u8);
        at
    }

    /// Jcc rel32. Returns the offset of the displacement field.
    pub fn jcc_rel32(&mut self, cond: Cond, offset: i32) -> usize {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        let at = self.buf.offset();
        self.buf.emit_u32(offset as u32);
        at
    }

    /// Jcc rel8. Returns the offset of the displacement byte.
    pub fn jcc_rel8(&mut self, cond: Cond, offset: i8) -> usize {
        self.buf.emit_u8(0x70 + cond as u8);
        let at = self.buf.offset();
        self.buf.emit_u8(offset as u8);
        at
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        self.rex(false, 0, reg as u8, false);
        self.buf.emit_u8(0xFF);
        self.buf.emit_u8(Self::modrm(0b11, 2, reg.code()));
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    /// Patch a short jump emitted earlier so that it lands at the current offset.
    pub fn bind_rel8(&mut self, at: usize) {
        let rel = self.buf.offset() as i64 - (at as i64 + 1);
        debug_assert!((-128..=127).contains(&rel), "short jump out of range");
        self.buf.patch_i8(at, rel as i8);
    }

    // ==================== SSE2 Floating Point ====================

    fn sse_prefix(&mut self, prefix: u8, w: bool, reg: u8, rm: u8) {
        self.buf.emit_u8(prefix);
        self.rex(w, reg, rm, false);
        self.buf.emit_u8(0x0F);
    }

    /// MOVSD xmm, [base + disp]
    pub fn movsd_rm(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.sse_prefix(0xF2, false, dst.0, base as u8);
        self.buf.emit_u8(0x10);
        self.mem(dst.code(), base, disp);
    }

    /// MOVSD [base + disp], xmm
    pub fn movsd_mr(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.sse_prefix(0xF2, false, src.0, base as u8);
        self.buf.emit_u8(0x11);
        self.mem(src.code(), base, disp);
    }

    /// MOVAPD xmm, xmm (full register copy)
    pub fn movapd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_prefix(0x66, false, dst.0, src.0);
        self.buf.emit_u8(0x28);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// `ADDSD/SUBSD/MULSD/DIVSD/SQRTSD xmm, xmm`
    pub fn sse_rr(&mut self, op: SseOp, dst: Xmm, src: Xmm) {
        self.sse_prefix(0xF2, false, dst.0, src.0);
        self.buf.emit_u8(op as u8);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// `ADDSD/SUBSD/MULSD/DIVSD xmm, [base + disp]`
    pub fn sse_rm(&mut self, op: SseOp, dst: Xmm, base: Reg, disp: i32) {
        self.sse_prefix(0xF2, false, dst.0, base as u8);
        self.buf.emit_u8(op as u8);
        self.mem(dst.code(), base, disp);
    }

    /// UCOMISD xmm, xmm
    pub fn ucomisd(&mut self, a: Xmm, b: Xmm) {
        self.sse_prefix(0x66, false, a.0, b.0);
        self.buf.emit_u8(0x2E);
        self.buf.emit_u8(Self::modrm(0b11, a.code(), b.code()));
    }

    /// ROUNDSD xmm, xmm, imm8 (SSE4.1)
    pub fn roundsd(&mut self, dst: Xmm, src: Xmm, mode: RoundMode) {
        self.buf.emit_u8(0x66);
        self.rex(false, dst.0, src.0, false);
        self.buf.emit_bytes(&[0x0F, 0x3A, 0x0B]);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
        self.buf.emit_u8(mode as u8);
    }

    /// CVTSI2SD xmm, r64
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg) {
        self.sse_prefix(0xF2, true, dst.0, src as u8);
        self.buf.emit_u8(0x2A);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// CVTTSD2SI r64, xmm (truncate toward zero)
    pub fn cvttsd2si(&mut self, dst: Reg, src: Xmm) {
        self.sse_prefix(0xF2, true, dst as u8, src.0);
        self.buf.emit_u8(0x2C);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOVQ xmm, r64
    pub fn movq_xmm_r64(&mut self, dst: Xmm, src: Reg) {
        self.sse_prefix(0x66, true, dst.0, src as u8);
        self.buf.emit_u8(0x6E);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// MOVQ r64, xmm
    pub fn movq_r64_xmm(&mut self, dst: Reg, src: Xmm) {
        self.sse_prefix(0x66, true, src.0, dst as u8);
        self.buf.emit_u8(0x7E);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        f(&mut asm);
        buf.into_code()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RAX, RBX = 48 89 D8
        assert_eq!(encode(|a| a.mov_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
        // MOV R9, R8 = 4D 89 C1
        assert_eq!(encode(|a| a.mov_rr(Reg::R9, Reg::R8)), [0x4D, 0x89, 0xC1]);
    }

    #[test]
    fn test_mov_ri() {
        // MOV RAX, imm64 = 48 B8 F0 DE BC 9A 78 56 34 12
        assert_eq!(
            encode(|a| a.mov_ri(Reg::Rax, 0x123456789ABCDEF0u64 as i64)),
            [0x48, 0xB8, 0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );
        // MOV R11, -1 = 49 C7 C3 FF FF FF FF
        assert_eq!(
            encode(|a| a.mov_ri(Reg::R11, -1)),
            [0x49, 0xC7, 0xC3, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_frame_slot_access() {
        // MOV RAX, [RBP-8] = 48 8B 45 F8
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::Rbp, -8)), [0x48, 0x8B, 0x45, 0xF8]);
        // MOV [RBP-16], RCX = 48 89 4D F0
        assert_eq!(encode(|a| a.mov_mr(Reg::Rbp, -16, Reg::Rcx)), [0x48, 0x89, 0x4D, 0xF0]);
        // MOV RAX, [RBP-200] = 48 8B 85 38 FF FF FF
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rax, Reg::Rbp, -200)),
            [0x48, 0x8B, 0x85, 0x38, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_special_bases() {
        // MOV RAX, [R12] = 49 8B 04 24
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::R12, 0)), [0x49, 0x8B, 0x04, 0x24]);
        // MOV RAX, [R13] = 49 8B 45 00
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Reg::R13, 0)), [0x49, 0x8B, 0x45, 0x00]);
        // MOV RDX, [RSP+8] = 48 8B 54 24 08
        assert_eq!(
            encode(|a| a.mov_rm(Reg::Rdx, Reg::Rsp, 8)),
            [0x48, 0x8B, 0x54, 0x24, 0x08]
        );
    }

    #[test]
    fn test_mov_mi32() {
        // MOV QWORD [RBP-8], 5 = 48 C7 45 F8 05 00 00 00
        assert_eq!(
            encode(|a| a.mov_mi32(Reg::Rbp, -8, 5)),
            [0x48, 0xC7, 0x45, 0xF8, 0x05, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_narrow_memory_ops() {
        // MOV EAX, [RBX+8] = 8B 43 08
        assert_eq!(encode(|a| a.mov_r32_m(Reg::Rax, Reg::Rbx, 8)), [0x8B, 0x43, 0x08]);
        // MOV [RBX+8], EAX = 89 43 08
        assert_eq!(encode(|a| a.mov_m_r32(Reg::Rbx, 8, Reg::Rax)), [0x89, 0x43, 0x08]);
        // MOVZX RAX, BYTE [RBX] = 48 0F B6 03
        assert_eq!(encode(|a| a.movzx_rm_byte(Reg::Rax, Reg::Rbx, 0)), [0x48, 0x0F, 0xB6, 0x03]);
        // MOV [RAX+16], SIL = 40 88 70 10
        assert_eq!(
            encode(|a| a.mov_mr_byte(Reg::Rax, 16, Reg::Rsi)),
            [0x40, 0x88, 0x70, 0x10]
        );
    }

    #[test]
    fn test_alu() {
        // ADD RAX, RBX = 48 01 D8
        assert_eq!(encode(|a| a.alu_rr(AluOp::Add, Reg::Rax, Reg::Rbx)), [0x48, 0x01, 0xD8]);
        // SUB RCX, 1 = 48 83 E9 01
        assert_eq!(encode(|a| a.alu_ri(AluOp::Sub, Reg::Rcx, 1)), [0x48, 0x83, 0xE9, 0x01]);
        // CMP RAX, 1000 = 48 81 F8 E8 03 00 00
        assert_eq!(
            encode(|a| a.alu_ri(AluOp::Cmp, Reg::Rax, 1000)),
            [0x48, 0x81, 0xF8, 0xE8, 0x03, 0x00, 0x00]
        );
        // ADD RDX, [RBP-24] = 48 03 55 E8
        assert_eq!(
            encode(|a| a.alu_rm(AluOp::Add, Reg::Rdx, Reg::Rbp, -24)),
            [0x48, 0x03, 0x55, 0xE8]
        );
        // ADD QWORD [R9], 1 = 49 83 01 01
        assert_eq!(encode(|a| a.alu_mi(AluOp::Add, Reg::R9, 0, 1)), [0x49, 0x83, 0x01, 0x01]);
    }

    #[test]
    fn test_mul_div() {
        // IMUL RAX, RCX = 48 0F AF C1
        assert_eq!(encode(|a| a.imul_rr(Reg::Rax, Reg::Rcx)), [0x48, 0x0F, 0xAF, 0xC1]);
        // IDIV R11 = 49 F7 FB
        assert_eq!(encode(|a| a.idiv(Reg::R11)), [0x49, 0xF7, 0xFB]);
        // CQO = 48 99
        assert_eq!(encode(|a| a.cqo()), [0x48, 0x99]);
        // NEG RAX = 48 F7 D8, NOT RAX = 48 F7 D0
        assert_eq!(encode(|a| a.neg(Reg::Rax)), [0x48, 0xF7, 0xD8]);
        assert_eq!(encode(|a| a.not(Reg::Rax)), [0x48, 0xF7, 0xD0]);
    }

    #[test]
    fn test_shifts() {
        // SHL R11, CL = 49 D3 E3
        assert_eq!(encode(|a| a.shl_cl(Reg::R11)), [0x49, 0xD3, 0xE3]);
        // SAR R11, CL = 49 D3 FB
        assert_eq!(encode(|a| a.sar_cl(Reg::R11)), [0x49, 0xD3, 0xFB]);
        // SHL R10, 3 = 49 C1 E2 03
        assert_eq!(encode(|a| a.shl_ri(Reg::R10, 3)), [0x49, 0xC1, 0xE2, 0x03]);
    }

    #[test]
    fn test_cmov() {
        // CMOVL RAX, R11 = 49 0F 4C C3
        assert_eq!(encode(|a| a.cmov(Cond::L, Reg::Rax, Reg::R11)), [0x49, 0x0F, 0x4C, 0xC3]);
    }

    #[test]
    fn test_stack_ops() {
        // PUSH RBP = 55, PUSH R12 = 41 54
        assert_eq!(encode(|a| a.push(Reg::Rbp)), [0x55]);
        assert_eq!(encode(|a| a.push(Reg::R12)), [0x41, 0x54]);
        // PUSH QWORD [RBP+24] = FF 75 18
        assert_eq!(encode(|a| a.push_m(Reg::Rbp, 24)), [0xFF, 0x75, 0x18]);
        // PUSH 7 = 68 07 00 00 00
        assert_eq!(encode(|a| a.push_i32(7)), [0x68, 0x07, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_control_flow() {
        // JE rel32 = 0F 84 xx xx xx xx
        assert_eq!(
            encode(|a| {
                assert_eq!(a.jcc_rel32(Cond::E, 0), 2);
            }),
            [0x0F, 0x84, 0, 0, 0, 0]
        );
        // CALL R10 = 41 FF D2
        assert_eq!(encode(|a| a.call_r(Reg::R10)), [0x41, 0xFF, 0xD2]);
    }

    #[test]
    fn test_bind_rel8() {
        let code = encode(|a| {
            let at = a.jcc_rel8(Cond::Ne, 0);
            a.neg(Reg::Rax);
            a.bind_rel8(at);
        });
        // JNE +3 ; NEG RAX
        assert_eq!(code, [0x75, 0x03, 0x48, 0xF7, 0xD8]);
    }

    #[test]
    fn test_sse() {
        // MOVSD XMM8, [RBP-64] = F2 44 0F 10 45 C0
        assert_eq!(
            encode(|a| a.movsd_rm(Xmm(8), Reg::Rbp, -64)),
            [0xF2, 0x44, 0x0F, 0x10, 0x45, 0xC0]
        );
        // ADDSD XMM8, XMM9 = F2 45 0F 58 C1
        assert_eq!(
            encode(|a| a.sse_rr(SseOp::Add, Xmm(8), Xmm(9))),
            [0xF2, 0x45, 0x0F, 0x58, 0xC1]
        );
        // UCOMISD XMM0, XMM1 = 66 0F 2E C1
        assert_eq!(encode(|a| a.ucomisd(Xmm(0), Xmm(1))), [0x66, 0x0F, 0x2E, 0xC1]);
        // ROUNDSD XMM0, XMM1, 9 = 66 0F 3A 0B C1 09
        assert_eq!(
            encode(|a| a.roundsd(Xmm(0), Xmm(1), RoundMode::Floor)),
            [0x66, 0x0F, 0x3A, 0x0B, 0xC1, 0x09]
        );
    }

    #[test]
    fn test_conversions() {
        // CVTSI2SD XMM0, RAX = F2 48 0F 2A C0
        assert_eq!(encode(|a| a.cvtsi2sd(Xmm(0), Reg::Rax)), [0xF2, 0x48, 0x0F, 0x2A, 0xC0]);
        // CVTTSD2SI RAX, XMM0 = F2 48 0F 2C C0
        assert_eq!(encode(|a| a.cvttsd2si(Reg::Rax, Xmm(0))), [0xF2, 0x48, 0x0F, 0x2C, 0xC0]);
        // MOVQ XMM8, R11 = 66 4D 0F 6E C3
        assert_eq!(
            encode(|a| a.movq_xmm_r64(Xmm(8), Reg::R11)),
            [0x66, 0x4D, 0x0F, 0x6E, 0xC3]
        );
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::L.invert(), Cond::Ge);
        assert_eq!(Cond::A.invert(), Cond::Be);
        assert_eq!(Cond::P.invert(), Cond::Np);
    }
}
