//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use stackjit::config::{JitMode, RuntimeConfig};
use stackjit::vm::ops::{Instr, MemoryContext, ReturnKind};
use stackjit::vm::{Class, Method, Program, RuntimeError, VM};

/// Compile every method on its first call.
pub fn jit_config() -> RuntimeConfig {
    RuntimeConfig {
        jit_mode: JitMode::On,
        jit_threshold: 0,
        ..RuntimeConfig::default()
    }
}

/// Output sink the test can read back.
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn vm(program: Program, config: RuntimeConfig) -> (VM, Capture) {
    let capture = Capture::default();
    let vm = VM::with_output(program, config, Box::new(capture.clone())).unwrap();
    (vm, capture)
}

/// Outcome of one run: the operand stack left behind plus printed output.
pub type Outcome = (Result<Vec<i64>, RuntimeError>, String);

/// Run `Main:name` once interpreted and once compiled.
pub fn run_both(build: impl Fn() -> Program, name: &str, args: &[i64]) -> (Outcome, Outcome) {
    let (interp, interp_out) = vm(build(), RuntimeConfig::interpreter());
    let interpreted = interp.run("Main", name, args);

    let (jit, jit_out) = vm(build(), jit_config());
    let compiled = jit.run("Main", name, args);
    #[cfg(all(target_arch = "x86_64", feature = "jit"))]
    {
        let runtime = jit.jit().expect("jit runtime");
        assert!(runtime.compile_count() > 0, "Main:{} was not compiled", name);
    }

    ((interpreted, interp_out.contents()), (compiled, jit_out.contents()))
}

/// Both runs succeed with the same stack and output; returns the stack.
pub fn assert_same(build: impl Fn() -> Program, name: &str, args: &[i64]) -> Vec<i64> {
    let ((interpreted, interp_out), (compiled, jit_out)) = run_both(build, name, args);
    let interpreted = interpreted.unwrap();
    let compiled = compiled.unwrap();
    assert_eq!(interpreted, compiled, "Main:{} with {:?}", name, args);
    assert_eq!(interp_out, jit_out);
    compiled
}

pub fn main_class(methods: Vec<Method>) -> Class {
    methods
        .into_iter()
        .fold(Class::new(0, "Main"), |class, method| class.with_method(method))
}

pub fn method(id: u32, name: &str, params: u32, rtrn: ReturnKind, instrs: Vec<Instr>) -> Method {
    Method::new(id, 0, name, params, rtrn, instrs)
}

pub fn load_int(id: u32) -> Instr {
    Instr::LoadIntVar { id, ctx: MemoryContext::Local }
}

pub fn store_int(id: u32) -> Instr {
    Instr::StorIntVar { id, ctx: MemoryContext::Local }
}

pub fn load_float(id: u32) -> Instr {
    Instr::LoadFloatVar { id, ctx: MemoryContext::Local }
}

pub fn store_float(id: u32) -> Instr {
    Instr::StorFloatVar { id, ctx: MemoryContext::Local }
}

pub fn bits(value: f64) -> i64 {
    value.to_bits() as i64
}

pub fn float(bits: i64) -> f64 {
    f64::from_bits(bits as u64)
}
