//! Baseline JIT for x86-64.
//!
//! Methods are compiled in one pass once their call count passes the
//! configured threshold:
//! - [`compiler`] lowers bytecode to machine code over an abstract stack
//! - [`regalloc`] hands out the fixed register pools
//! - [`fixup`] patches forward branches once labels are known
//! - [`memory`] copies finished code into executable pages
//! - [`bridge`] lets compiled code call back into the VM
//!
//! This module is only compiled when the `jit` feature is enabled on x86-64.

pub mod bridge;
mod codebuf;
pub mod compiler;
pub mod fixup;
pub mod frame;
mod lower_array;
mod lower_call;
mod lower_float;
mod lower_int;
pub mod memory;
pub mod regalloc;
mod runtime;
pub mod value;
pub mod x86_64;

use thiserror::Error;

pub use codebuf::CodeBuffer;
pub use compiler::{CompileStats, CompiledCode, compile};
pub use fixup::Trampoline;
pub use memory::{CodeHandle, MemoryError, PageManager};
pub use runtime::{
    BRIDGE_FAILURE, CompiledMethod, JitRuntime, JitSlot, OPERAND_OVERFLOW, OPERAND_UNDERFLOW,
};

/// Reasons a method could not be compiled. None of these are fatal: the
/// method is interpreted instead.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("register pool exhausted")]
    RegisterExhausted,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("jump to undefined label {0}")]
    UndefinedLabel(u32),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("internal compiler error: {0}")]
    Internal(String),
}
