//! Deferred rel32 jump displacements.
//!
//! Jumps are emitted with a zero displacement and recorded here. Once the
//! whole method, its epilogue and its trampolines are in the buffer,
//! [`FixupTable::resolve`] patches every entry exactly once.

use std::collections::HashMap;

use super::JitError;
use super::codebuf::CodeBuffer;

/// Fault and status sites after the method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trampoline {
    NilDereference,
    IndexBelowZero,
    IndexAboveLength,
    DivideByZero,
    BridgeFailure,
    OperandOverflow,
    OperandUnderflow,
}

impl Trampoline {
    pub const ALL: [Trampoline; 7] = [
        Trampoline::NilDereference,
        Trampoline::IndexBelowZero,
        Trampoline::IndexAboveLength,
        Trampoline::DivideByZero,
        Trampoline::BridgeFailure,
        Trampoline::OperandOverflow,
        Trampoline::OperandUnderflow,
    ];

    /// Value the trampoline leaves in RAX.
    pub const fn status(self) -> i32 {
        match self {
            Trampoline::NilDereference => -1,
            Trampoline::IndexBelowZero => -2,
            Trampoline::IndexAboveLength => -3,
            Trampoline::DivideByZero => -4,
            Trampoline::BridgeFailure => -5,
            Trampoline::OperandOverflow => -6,
            Trampoline::OperandUnderflow => -7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupTarget {
    Label(u32),
    Trampoline(Trampoline),
    /// Normal return path.
    Epilogue,
}

#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    /// Offset of the 4-byte displacement field.
    pub at: usize,
    pub target: FixupTarget,
}

#[derive(Debug, Default)]
pub struct FixupTable {
    fixups: Vec<Fixup>,
    labels: HashMap<u32, usize>,
    trampolines: HashMap<Trampoline, usize>,
    epilogue: Option<usize>,
}

impl FixupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, at: usize, target: FixupTarget) {
        self.fixups.push(Fixup { at, target });
    }

    pub fn bind_label(&mut self, label: u32, offset: usize) {
        self.labels.insert(label, offset);
    }

    pub fn bind_trampoline(&mut self, trampoline: Trampoline, offset: usize) {
        self.trampolines.insert(trampoline, offset);
    }

    pub fn bind_epilogue(&mut self, offset: usize) {
        self.epilogue = Some(offset);
    }

    pub fn label(&self, label: u32) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Whether any recorded jump targets `trampoline`.
    pub fn uses(&self, trampoline: Trampoline) -> bool {
        self.fixups
            .iter()
            .any(|f| f.target == FixupTarget::Trampoline(trampoline))
    }

    pub fn len(&self) -> usize {
        self.fixups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixups.is_empty()
    }

    fn target_offset(&self, target: FixupTarget) -> Result<usize, JitError> {
        match target {
            FixupTarget::Label(label) => self.label(label).ok_or(JitError::UndefinedLabel(label)),
            FixupTarget::Trampoline(t) => self
                .trampolines
                .get(&t)
                .copied()
                .ok_or_else(|| JitError::Internal(format!("trampoline {:?} not emitted", t))),
            FixupTarget::Epilogue => self
                .epilogue
                .ok_or_else(|| JitError::Internal("epilogue not emitted".to_string())),
        }
    }

    /// Patch every recorded jump. Returns the number of entries patched.
    pub fn resolve(self, buf: &mut CodeBuffer) -> Result<usize, JitError> {
        for fixup in &self.fixups {
            let target = self.target_offset(fixup.target)?;
            let rel = target as i64 - fixup.at as i64 - 4;
            let rel = i32::try_from(rel)
                .map_err(|_| JitError::Internal(format!("jump at {} out of range", fixup.at)))?;
            buf.patch_i32(fixup.at, rel);
        }
        Ok(self.fixups.len())
    }
}
