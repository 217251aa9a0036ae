//! Runtime errors raised while executing bytecode, interpreted or compiled.

use thiserror::Error;

/// Checked faults. Compiled code reports these as negative status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NilDereference,
    IndexBelowZero,
    IndexAboveLength,
    DivideByZero,
}

impl Fault {
    /// Status returned by compiled code for this fault.
    pub fn status(self) -> i32 {
        match self {
            Fault::NilDereference => -1,
            Fault::IndexBelowZero => -2,
            Fault::IndexAboveLength => -3,
            Fault::DivideByZero => -4,
        }
    }

    pub fn from_status(status: i32) -> Option<Self> {
        match status {
            -1 => Some(Fault::NilDereference),
            -2 => Some(Fault::IndexBelowZero),
            -3 => Some(Fault::IndexAboveLength),
            -4 => Some(Fault::DivideByZero),
            _ => None,
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Fault::NilDereference => "attempting to dereference a nil memory instance",
            Fault::IndexBelowZero => "index out of bounds (below zero)",
            Fault::IndexAboveLength => "index out of bounds (at or above length)",
            Fault::DivideByZero => "attempting to divide by zero",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{fault} in method '{method}'")]
    Fault { fault: Fault, method: String },
    #[error("call stack overflow (depth {0})")]
    StackOverflow(usize),
    #[error("operand stack overflow")]
    OperandOverflow,
    #[error("operand stack underflow")]
    OperandUnderflow,
    #[error("invalid array size: {0}")]
    InvalidArraySize(i64),
    #[error("invalid cast of instance of class {from} to class {to}")]
    InvalidCast { from: i64, to: u32 },
    #[error("unknown method {class}:{method}")]
    UnknownMethod { class: u32, method: u32 },
    #[error("unknown class {0}")]
    UnknownClass(u32),
    #[error("undefined label {label} in method '{method}'")]
    UndefinedLabel { label: u32, method: String },
    #[error("program aborted with code {0}")]
    Abort(i64),
    #[error("runtime bridge failure: {0}")]
    Bridge(String),
    #[error("thread failure: {0}")]
    Thread(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// The checked fault behind this error, if any.
    pub fn fault(&self) -> Option<Fault> {
        match self {
            RuntimeError::Fault { fault, .. } => Some(*fault),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for fault in [
            Fault::NilDereference,
            Fault::IndexBelowZero,
            Fault::IndexAboveLength,
            Fault::DivideByZero,
        ] {
            assert_eq!(Fault::from_status(fault.status()), Some(fault));
        }
        assert_eq!(Fault::from_status(0), None);
    }

    #[test]
    fn test_message_names_method() {
        let err = RuntimeError::Fault {
            fault: Fault::IndexBelowZero,
            method: "Foo:bar".to_string(),
        };
        assert_eq!(err.to_string(), "index out of bounds (below zero) in method 'Foo:bar'");
    }
}
