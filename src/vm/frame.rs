//! Operand stack and call stack shared by the interpreter and compiled code.
//!
//! Compiled code addresses the operand stack through two raw pointers (the
//! slot base and the position counter), so both representations here expose
//! exactly that pair.

use super::error::RuntimeError;

/// Owned operand stack with a fixed number of 64-bit slots.
pub struct OperandStack {
    slots: Box<[i64]>,
    pos: i64,
}

impl OperandStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity].into_boxed_slice(),
            pos: 0,
        }
    }

    /// Raw view used by the interpreter and the runtime bridge.
    pub fn view(&mut self) -> StackRef {
        StackRef {
            base: self.slots.as_mut_ptr(),
            pos: &mut self.pos,
            capacity: self.slots.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.pos as usize
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Live slots, bottom first.
    pub fn as_slice(&self) -> &[i64] {
        &self.slots[..self.pos as usize]
    }
}

/// Pointer pair over an operand stack.
///
/// Valid while the owning [`OperandStack`] is alive and not moved.
pub struct StackRef {
    base: *mut i64,
    pos: *mut i64,
    capacity: usize,
}

impl StackRef {
    /// # Safety
    /// `base` must point to `capacity` slots and `pos` to the live position
    /// counter of the same stack, both outliving the returned view.
    pub unsafe fn from_raw(base: *mut i64, pos: *mut i64, capacity: usize) -> Self {
        Self { base, pos, capacity }
    }

    pub fn base_ptr(&self) -> *mut i64 {
        self.base
    }

    pub fn pos_ptr(&self) -> *mut i64 {
        self.pos
    }

    pub fn pos(&self) -> usize {
        unsafe { *self.pos as usize }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, value: i64) -> Result<(), RuntimeError> {
        let pos = self.pos();
        if pos >= self.capacity {
            return Err(RuntimeError::OperandOverflow);
        }
        unsafe {
            *self.base.add(pos) = value;
            *self.pos += 1;
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Result<i64, RuntimeError> {
        let pos = self.pos();
        if pos == 0 || pos > self.capacity {
            return Err(RuntimeError::OperandUnderflow);
        }
        unsafe {
            *self.pos -= 1;
            Ok(*self.base.add(pos - 1))
        }
    }

    pub fn peek(&self) -> Result<i64, RuntimeError> {
        let pos = self.pos();
        if pos == 0 || pos > self.capacity {
            return Err(RuntimeError::OperandUnderflow);
        }
        Ok(unsafe { *self.base.add(pos - 1) })
    }

    pub fn push_float(&mut self, value: f64) -> Result<(), RuntimeError> {
        self.push(value.to_bits() as i64)
    }

    pub fn pop_float(&mut self) -> Result<f64, RuntimeError> {
        Ok(f64::from_bits(self.pop()? as u64))
    }
}

/// Bookkeeping for one method activation.
#[derive(Debug, Clone, Default)]
pub struct StackFrame {
    pub class_id: u32,
    pub method_id: u32,
    pub instance: i64,
    /// Address of the compiled method's locals area (written by its prolog).
    pub jit_mem: i64,
    /// Size in bytes of that locals area.
    pub jit_offset: i64,
}

/// Stack of active method frames.
pub struct CallStack {
    frames: Vec<StackFrame>,
    pos: i64,
    max_depth: usize,
}

impl CallStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::with_capacity(max_depth.min(256)),
            pos: 0,
            max_depth,
        }
    }

    pub fn push(&mut self, frame: StackFrame) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.max_depth {
            return Err(RuntimeError::StackOverflow(self.frames.len()));
        }
        self.frames.push(frame);
        self.pos = self.frames.len() as i64;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<StackFrame> {
        let frame = self.frames.pop();
        self.pos = self.frames.len() as i64;
        frame
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn top_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn pos_ptr(&mut self) -> *mut i64 {
        &mut self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut stack = OperandStack::new(4);
        let mut view = stack.view();
        view.push(1).unwrap();
        view.push_float(2.5).unwrap();

        assert_eq!(view.pop_float().unwrap(), 2.5);
        assert_eq!(view.peek().unwrap(), 1);
        assert_eq!(stack.as_slice(), &[1]);
    }

    #[test]
    fn test_bounds() {
        let mut stack = OperandStack::new(1);
        let mut view = stack.view();
        assert!(matches!(view.pop(), Err(RuntimeError::OperandUnderflow)));
        view.push(1).unwrap();
        assert!(matches!(view.push(2), Err(RuntimeError::OperandOverflow)));
    }

    #[test]
    fn test_call_depth() {
        let mut calls = CallStack::new(2);
        calls.push(StackFrame::default()).unwrap();
        calls.push(StackFrame::default()).unwrap();
        assert!(matches!(
            calls.push(StackFrame::default()),
            Err(RuntimeError::StackOverflow(2))
        ));
        calls.pop();
        assert_eq!(calls.depth(), 1);
        assert_eq!(unsafe { *calls.pos_ptr() }, 1);
    }
}
