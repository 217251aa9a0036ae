//! Interpreter vs compiled code on the same bytecode.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;

use stackjit::config::{JitMode, RuntimeConfig};
use stackjit::vm::ops::{Instr, JumpCond, MemoryContext, ReturnKind};
use stackjit::vm::{Class, Method, Program, VM};

fn local(id: u32) -> Instr {
    Instr::LoadIntVar { id, ctx: MemoryContext::Local }
}

fn set_local(id: u32) -> Instr {
    Instr::StorIntVar { id, ctx: MemoryContext::Local }
}

/// `sum_to(n)`: loop with a fused compare and two locals.
fn sum_loop() -> Method {
    Method::new(
        0,
        0,
        "sum_to",
        1,
        ReturnKind::Int,
        vec![
            set_local(0),
            Instr::LoadIntLit(0),
            set_local(1),
            Instr::Lbl(0),
            Instr::LoadIntLit(0),
            local(0),
            Instr::GtrInt,
            Instr::Jmp { label: 1, cond: JumpCond::IfFalse },
            local(1),
            local(0),
            Instr::AddInt,
            set_local(1),
            Instr::LoadIntLit(1),
            local(0),
            Instr::SubInt,
            set_local(0),
            Instr::Jmp { label: 0, cond: JumpCond::Always },
            Instr::Lbl(1),
            local(1),
            Instr::Rtrn,
        ],
    )
}

/// `fib(n)`: recursive calls through the runtime bridge.
fn fibonacci() -> Method {
    Method::new(
        1,
        0,
        "fib",
        1,
        ReturnKind::Int,
        vec![
            set_local(0),
            Instr::LoadIntLit(2),
            local(0),
            Instr::LesInt,
            Instr::Jmp { label: 1, cond: JumpCond::IfFalse },
            local(0),
            Instr::Rtrn,
            Instr::Lbl(1),
            Instr::LoadIntLit(1),
            local(0),
            Instr::SubInt,
            Instr::LoadIntLit(0),
            Instr::MthdCall { class: 0, method: 1 },
            Instr::LoadIntLit(2),
            local(0),
            Instr::SubInt,
            Instr::LoadIntLit(0),
            Instr::MthdCall { class: 0, method: 1 },
            Instr::AddInt,
            Instr::Rtrn,
        ],
    )
}

fn vm(mode: JitMode) -> VM {
    let program = Program::new(vec![
        Class::new(0, "Bench")
            .with_method(sum_loop())
            .with_method(fibonacci()),
    ]);
    let config = RuntimeConfig {
        jit_mode: mode,
        jit_threshold: 0,
        ..RuntimeConfig::default()
    };
    VM::with_output(program, config, Box::new(std::io::sink())).unwrap()
}

fn bench_modes(c: &mut Criterion, group: &str, method: &str, inputs: &[i64]) {
    let mut group = c.benchmark_group(group);
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    for (label, mode) in [("interpreter", JitMode::Off), ("jit", JitMode::On)] {
        let vm = vm(mode);
        for &n in inputs {
            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, &n| {
                b.iter(|| vm.run("Bench", method, &[black_box(n)]).unwrap())
            });
        }
    }

    group.finish();
}

fn bench_sum_loop(c: &mut Criterion) {
    bench_modes(c, "sum_loop", "sum_to", &[100_000, 1_000_000]);
}

fn bench_fibonacci(c: &mut Criterion) {
    bench_modes(c, "fibonacci", "fib", &[20, 25]);
}

criterion_group!(benches, bench_sum_loop, bench_fibonacci);
criterion_main!(benches);
