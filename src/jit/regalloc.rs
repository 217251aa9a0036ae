//! Physical register pools for one method compilation.
//!
//! Every register that holds a live abstract value is represented by exactly
//! one [`RegisterHandle`]. Handles are move-only and are consumed when the
//! register is released, so a released register can no longer be named.

use super::JitError;
use super::x86_64::{Reg, Xmm};

/// General-purpose registers handed out first.
pub const PRIMARY_GENERAL: [Reg; 4] = [Reg::Rax, Reg::Rbx, Reg::Rcx, Reg::Rdx];

/// Overflow registers, used only when the primary pool is empty.
pub const AUX_GENERAL: [Reg; 2] = [Reg::Rsi, Reg::Rdi];

/// Float registers.
pub const FLOAT: [Xmm; 8] = [
    Xmm(8),
    Xmm(9),
    Xmm(10),
    Xmm(11),
    Xmm(12),
    Xmm(13),
    Xmm(14),
    Xmm(15),
];

/// Ownership of one allocated register.
#[derive(Debug, PartialEq, Eq)]
pub struct RegisterHandle<R> {
    reg: R,
}

impl<R: Copy> RegisterHandle<R> {
    pub fn reg(&self) -> R {
        self.reg
    }
}

/// Free and in-use lists of one register class.
#[derive(Debug)]
struct Pool<R> {
    available: Vec<R>,
    in_use: Vec<R>,
}

impl<R: Copy + PartialEq> Pool<R> {
    fn new(regs: &[R]) -> Self {
        // Allocation pops from the back; keep the listed order.
        let mut available = regs.to_vec();
        available.reverse();
        Self {
            available,
            in_use: Vec::with_capacity(regs.len()),
        }
    }

    fn allocate(&mut self) -> Option<RegisterHandle<R>> {
        let reg = self.available.pop()?;
        self.in_use.push(reg);
        Some(RegisterHandle { reg })
    }

    fn owns(&self, reg: R) -> bool {
        self.in_use.contains(&reg) || self.available.contains(&reg)
    }

    fn release(&mut self, handle: RegisterHandle<R>) {
        let position = self.in_use.iter().position(|r| *r == handle.reg);
        debug_assert!(position.is_some(), "released a register that is not in use");
        if let Some(position) = position {
            self.in_use.swap_remove(position);
            self.available.push(handle.reg);
        }
    }
}

/// All register pools for a single compilation.
#[derive(Debug)]
pub struct RegisterFile {
    primary: Pool<Reg>,
    aux: Pool<Reg>,
    float: Pool<Xmm>,
    allocations: usize,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            primary: Pool::new(&PRIMARY_GENERAL),
            aux: Pool::new(&AUX_GENERAL),
            float: Pool::new(&FLOAT),
            allocations: 0,
        }
    }

    /// Allocate a general-purpose register, falling back to the auxiliary pool.
    pub fn allocate_general(&mut self) -> Result<RegisterHandle<Reg>, JitError> {
        let handle = self
            .primary
            .allocate()
            .or_else(|| self.aux.allocate())
            .ok_or(JitError::RegisterExhausted)?;
        self.allocations += 1;
        Ok(handle)
    }

    pub fn allocate_float(&mut self) -> Result<RegisterHandle<Xmm>, JitError> {
        let handle = self.float.allocate().ok_or(JitError::RegisterExhausted)?;
        self.allocations += 1;
        Ok(handle)
    }

    pub fn release_general(&mut self, handle: RegisterHandle<Reg>) {
        if self.aux.owns(handle.reg) {
            self.aux.release(handle);
        } else {
            self.primary.release(handle);
        }
    }

    pub fn release_float(&mut self, handle: RegisterHandle<Xmm>) {
        self.float.release(handle);
    }

    /// General registers currently handed out.
    pub fn general_in_use(&self) -> impl Iterator<Item = Reg> + '_ {
        self.primary.in_use.iter().chain(self.aux.in_use.iter()).copied()
    }

    pub fn float_in_use(&self) -> impl Iterator<Item = Xmm> + '_ {
        self.float.in_use.iter().copied()
    }

    /// Total successful allocations so far.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// True when no register is held.
    pub fn is_idle(&self) -> bool {
        self.general_in_use().next().is_none() && self.float_in_use().next().is_none()
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_then_aux() {
        let mut regs = RegisterFile::new();
        let handles: Vec<_> = (0..6).map(|_| regs.allocate_general().unwrap()).collect();
        let order: Vec<Reg> = handles.iter().map(|h| h.reg()).collect();
        assert_eq!(
            order,
            vec![Reg::Rax, Reg::Rbx, Reg::Rcx, Reg::Rdx, Reg::Rsi, Reg::Rdi]
        );
        assert!(matches!(regs.allocate_general(), Err(JitError::RegisterExhausted)));
        assert_eq!(regs.allocations(), 6);
    }

    #[test]
    fn test_release_returns_register() {
        let mut regs = RegisterFile::new();
        let a = regs.allocate_general().unwrap();
        let b = regs.allocate_general().unwrap();
        assert_eq!(b.reg(), Reg::Rbx);
        regs.release_general(a);

        let c = regs.allocate_general().unwrap();
        assert_eq!(c.reg(), Reg::Rax);
        assert_eq!(regs.general_in_use().count(), 2);

        regs.release_general(b);
        regs.release_general(c);
        assert!(regs.is_idle());
    }

    #[test]
    fn test_aux_release_goes_back_to_aux() {
        let mut regs = RegisterFile::new();
        let primary: Vec<_> = (0..4).map(|_| regs.allocate_general().unwrap()).collect();
        let aux = regs.allocate_general().unwrap();
        assert_eq!(aux.reg(), Reg::Rsi);
        regs.release_general(aux);
        for h in primary {
            regs.release_general(h);
        }
        // Primary registers are preferred again once free.
        assert_eq!(regs.allocate_general().unwrap().reg(), Reg::Rax);
    }

    #[test]
    fn test_float_pool() {
        let mut regs = RegisterFile::new();
        let handles: Vec<_> = (0..8).map(|_| regs.allocate_float().unwrap()).collect();
        assert_eq!(handles[0].reg(), Xmm(8));
        assert_eq!(handles[7].reg(), Xmm(15));
        assert!(regs.allocate_float().is_err());
        assert_eq!(regs.float_in_use().count(), 8);
    }
}
