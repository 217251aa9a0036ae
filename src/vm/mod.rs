mod error;
mod frame;
pub mod heap;
pub mod intrinsics;
pub mod ops;
mod program;
mod vm;

pub use error::{Fault, RuntimeError};
pub use frame::{CallStack, OperandStack, StackFrame, StackRef};
pub use heap::Heap;
pub use ops::Instr;
pub use program::{Class, Method, Program};
pub use vm::VM;

pub(crate) use vm::int_binary;
