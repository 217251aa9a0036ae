//! stackjit - a stack-bytecode virtual machine with a baseline x86-64 JIT.
//!
//! Programs are built from [`vm::Class`]es and [`vm::Method`]s and run on a
//! [`VM`]. Hot methods are compiled to native code when the `jit` feature is
//! enabled on x86-64; everything else is interpreted.

pub mod config;
#[cfg(all(target_arch = "x86_64", feature = "jit"))]
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{JitMode, RuntimeConfig};
pub use vm::{Fault, Instr, Program, RuntimeError, VM};
