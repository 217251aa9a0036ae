//! Compile-time shadow of the operand stack.

use std::collections::HashSet;

use super::JitError;
use super::regalloc::RegisterHandle;
use super::x86_64::{Reg, Xmm};

/// How a frame slot's bits are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Int,
    Float,
}

/// Where an operand currently lives.
#[derive(Debug, PartialEq)]
pub enum AbstractValue {
    /// Integer constant, not yet materialized.
    ImmediateInt(i64),
    /// Index into the method's float constant table.
    ImmediateFloat(usize),
    /// Value still sitting in the frame at `[rbp + offset]`.
    FrameSlot { offset: i32, kind: SlotKind },
    Register(RegisterHandle<Reg>),
    FloatRegister(RegisterHandle<Xmm>),
}

/// The abstract operand stack. Bottom of the stack is index 0.
#[derive(Debug, Default)]
pub struct WorkingStack {
    values: Vec<AbstractValue>,
}

impl WorkingStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: AbstractValue) {
        self.values.push(value);
    }

    pub fn pop(&mut self) -> Result<AbstractValue, JitError> {
        self.values
            .pop()
            .ok_or_else(|| JitError::Internal("abstract stack underflow".to_string()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values bottom to top.
    pub fn iter(&self) -> impl Iterator<Item = &AbstractValue> {
        self.values.iter()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut AbstractValue> {
        self.values.get_mut(index)
    }

    /// Remove the top `n` values (or all of them), bottom first.
    pub fn split_top(&mut self, n: usize) -> Vec<AbstractValue> {
        let at = self.values.len().saturating_sub(n);
        self.values.split_off(at)
    }

    /// Remove every value, bottom first.
    pub fn drain(&mut self) -> std::vec::Drain<'_, AbstractValue> {
        self.values.drain(..)
    }

    /// Indices of deferred loads from `[rbp + offset]`.
    pub fn frame_slot_positions(&self, offset: i32, width: i32) -> Vec<usize> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| match v {
                AbstractValue::FrameSlot { offset: o, .. }
                    if *o >= offset && *o < offset + width =>
                {
                    Some(i)
                }
                _ => None,
            })
            .collect()
    }

    /// No physical register is held by two entries.
    pub fn registers_disjoint(&self) -> bool {
        let mut general = HashSet::new();
        let mut float = HashSet::new();
        self.values.iter().all(|v| match v {
            AbstractValue::Register(h) => general.insert(h.reg()),
            AbstractValue::FloatRegister(h) => float.insert(h.reg()),
            _ => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::regalloc::RegisterFile;

    #[test]
    fn test_disjoint_registers() {
        let mut regs = RegisterFile::new();
        let mut stack = WorkingStack::new();
        stack.push(AbstractValue::ImmediateInt(1));
        stack.push(AbstractValue::Register(regs.allocate_general().unwrap()));
        stack.push(AbstractValue::Register(regs.allocate_general().unwrap()));
        stack.push(AbstractValue::FloatRegister(regs.allocate_float().unwrap()));
        assert!(stack.registers_disjoint());
        assert_eq!(stack.len(), 4);
        assert!(matches!(stack.pop(), Ok(AbstractValue::FloatRegister(_))));
    }

    #[test]
    fn test_frame_slot_positions() {
        let mut stack = WorkingStack::new();
        stack.push(AbstractValue::FrameSlot { offset: -176, kind: SlotKind::Int });
        stack.push(AbstractValue::ImmediateInt(3));
        stack.push(AbstractValue::FrameSlot { offset: -168, kind: SlotKind::Float });
        stack.push(AbstractValue::FrameSlot { offset: -176, kind: SlotKind::Int });

        assert_eq!(stack.frame_slot_positions(-176, 8), vec![0, 3]);
        assert_eq!(stack.frame_slot_positions(-176, 16), vec![0, 2, 3]);
    }

    #[test]
    fn test_underflow_is_internal_error() {
        let mut stack = WorkingStack::new();
        assert!(matches!(stack.pop(), Err(JitError::Internal(_))));
    }
}
