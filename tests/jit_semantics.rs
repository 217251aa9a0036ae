//! Compiled code must leave the same operand stack and print the same output
//! as the interpreter.

mod common;

use common::*;
use stackjit::vm::ops::{ElemKind, Instr, JumpCond, MemoryContext, ReturnKind, TrapKind};
use stackjit::vm::{Class, Program};

fn program(methods: Vec<stackjit::vm::Method>) -> Program {
    Program::new(vec![main_class(methods)])
}

fn int_ops() -> Vec<Instr> {
    vec![
        Instr::AddInt,
        Instr::SubInt,
        Instr::MulInt,
        Instr::DivInt,
        Instr::ModInt,
        Instr::AndInt,
        Instr::OrInt,
        Instr::BitAndInt,
        Instr::BitOrInt,
        Instr::BitXorInt,
        Instr::ShlInt,
        Instr::ShrInt,
        Instr::LesInt,
        Instr::GtrInt,
        Instr::LesEqlInt,
        Instr::GtrEqlInt,
        Instr::EqlInt,
        Instr::NeqlInt,
    ]
}

/// `ops(a, b)`: every integer operator applied as `a op b`, one result each.
fn int_ops_program() -> Program {
    let mut instrs = vec![store_int(0), store_int(1)];
    for (i, op) in int_ops().into_iter().enumerate() {
        instrs.extend([load_int(0), load_int(1), op, Instr::Lbl(i as u32)]);
    }
    instrs.push(Instr::Rtrn);
    program(vec![method(0, "ops", 2, ReturnKind::None, instrs)])
}

#[test]
fn test_int_operators_on_locals() {
    for (a, b) in [(7, 3), (-7, 2), (7, -3), (i64::MIN, -1), (1, 65), (-16, 2), (0, 5)] {
        let out = assert_same(int_ops_program, "ops", &[a, b]);
        assert_eq!(out.len(), int_ops().len());
        assert_eq!(out[0], a.wrapping_add(b));
        assert_eq!(out[1], a.wrapping_sub(b));
        assert_eq!(out[3], a.wrapping_div(b));
        assert_eq!(out[4], a.wrapping_rem(b));
        assert_eq!(out[10], a.wrapping_shl(b as u32));
        assert_eq!(out[11], a.wrapping_shr(b as u32));
        assert_eq!(out[12], (a < b) as i64);
    }
}

#[test]
fn test_int_operators_on_constants() {
    for (a, b) in [(7, 3), (-7, 2), (i64::MIN, -1), (1, 65), (1 << 40, 3)] {
        let build = move || {
            let mut instrs = Vec::new();
            for (i, op) in int_ops().into_iter().enumerate() {
                instrs.extend([
                    Instr::LoadIntLit(b),
                    Instr::LoadIntLit(a),
                    op,
                    Instr::Lbl(i as u32),
                ]);
            }
            instrs.push(Instr::Rtrn);
            program(vec![method(0, "ops", 0, ReturnKind::None, instrs)])
        };
        let folded = assert_same(build, "ops", &[]);
        let registers = assert_same(int_ops_program, "ops", &[a, b]);
        assert_eq!(folded, registers);
    }
}

#[test]
fn test_loop_with_fused_compare() {
    let build = || {
        program(vec![method(
            0,
            "sum_to",
            1,
            ReturnKind::Int,
            vec![
                store_int(0),
                Instr::LoadIntLit(0),
                store_int(1),
                Instr::Lbl(0),
                Instr::LoadIntLit(0),
                load_int(0),
                Instr::GtrInt,
                Instr::Jmp { label: 1, cond: JumpCond::IfFalse },
                load_int(1),
                load_int(0),
                Instr::AddInt,
                store_int(1),
                Instr::LoadIntLit(1),
                load_int(0),
                Instr::SubInt,
                store_int(0),
                Instr::Jmp { label: 0, cond: JumpCond::Always },
                Instr::Lbl(1),
                load_int(1),
                Instr::Rtrn,
            ],
        )])
    };
    assert_eq!(assert_same(build, "sum_to", &[10]), vec![55]);
    assert_eq!(assert_same(build, "sum_to", &[0]), vec![0]);
    assert_eq!(assert_same(build, "sum_to", &[1000]), vec![500500]);
}

/// `floats(a, b)`: arithmetic, math calls, comparisons and conversions.
fn float_ops_program() -> Program {
    let mut instrs = vec![store_float(0), store_float(1)];
    let mut label = 0;
    let mut emit = |instrs: &mut Vec<Instr>, body: Vec<Instr>| {
        instrs.extend(body);
        instrs.push(Instr::Lbl(label));
        label += 1;
    };

    for op in [
        Instr::AddFloat,
        Instr::SubFloat,
        Instr::MulFloat,
        Instr::DivFloat,
        Instr::PowFloat,
        Instr::LesFloat,
        Instr::GtrFloat,
        Instr::LesEqlFloat,
        Instr::GtrEqlFloat,
        Instr::EqlFloat,
        Instr::NeqlFloat,
    ] {
        emit(&mut instrs, vec![load_float(0), load_float(1), op]);
    }
    for op in [
        Instr::SqrtFloat,
        Instr::FloorFloat,
        Instr::CeilFloat,
        Instr::SinFloat,
        Instr::CosFloat,
        Instr::TanFloat,
        Instr::LogFloat,
        Instr::ExpFloat,
        Instr::F2I,
    ] {
        emit(&mut instrs, vec![load_float(1), op]);
    }
    emit(&mut instrs, vec![Instr::LoadFloatLit(0.5), load_float(1), Instr::AddFloat]);
    emit(&mut instrs, vec![load_float(1), Instr::LoadFloatLit(0.5), Instr::MulFloat]);
    emit(&mut instrs, vec![Instr::LoadIntLit(-3), Instr::I2F]);
    instrs.push(Instr::Rtrn);
    program(vec![method(0, "floats", 2, ReturnKind::None, instrs)])
}

#[test]
fn test_float_operators() {
    for (a, b) in [
        (2.5, -1.25),
        (1.0, 1.0),
        (f64::NAN, 1.0),
        (1.0, f64::NAN),
        (-0.0, 0.0),
        (1e308, 1e308),
        (-7.75, 3.0),
    ] {
        let out = assert_same(float_ops_program, "floats", &[bits(a), bits(b)]);
        assert_eq!(float(out[0]).to_bits(), (a + b).to_bits());
        // Comparisons are false on NaN except for inequality.
        assert_eq!(out[5], (a < b) as i64, "{} < {}", a, b);
        assert_eq!(out[9], (a == b) as i64, "{} == {}", a, b);
        assert_eq!(out[10], (a != b) as i64, "{} != {}", a, b);
        assert_eq!(float(out[out.len() - 1]), -3.0);
    }
}

/// `inverse_trig(x)`: asin x, acos x, atan2(x, 2), atan2(-1, x).
fn inverse_trig_program() -> Program {
    program(vec![method(
        0,
        "inverse_trig",
        1,
        ReturnKind::None,
        vec![
            store_float(0),
            load_float(0),
            Instr::AsinFloat,
            load_float(0),
            Instr::AcosFloat,
            Instr::LoadFloatLit(2.0),
            load_float(0),
            Instr::Atan2Float,
            load_float(0),
            Instr::LoadFloatLit(-1.0),
            Instr::Atan2Float,
            Instr::Rtrn,
        ],
    )])
}

#[test]
fn test_inverse_trig() {
    fn same(actual: i64, expected: f64) {
        let actual = float(actual);
        if expected.is_nan() {
            assert!(actual.is_nan(), "expected NaN, got {}", actual);
        } else {
            assert_eq!(actual.to_bits(), expected.to_bits(), "{} != {}", actual, expected);
        }
    }

    for x in [0.5, -1.0, 1.0, 0.0, -0.0, 2.0, -3.5, f64::NAN, f64::INFINITY] {
        let out = assert_same(inverse_trig_program, "inverse_trig", &[bits(x)]);
        assert_eq!(out.len(), 4);
        same(out[0], x.asin());
        same(out[1], x.acos());
        same(out[2], x.atan2(2.0));
        same(out[3], (-1.0f64).atan2(x));
    }
}

fn branch_program(op: Instr, cond: JumpCond) -> Program {
    program(vec![method(
        0,
        "branch",
        2,
        ReturnKind::Int,
        vec![
            store_float(0),
            store_float(1),
            load_float(0),
            load_float(1),
            op,
            Instr::Jmp { label: 0, cond },
            Instr::LoadIntLit(0),
            Instr::Jmp { label: 1, cond: JumpCond::Always },
            Instr::Lbl(0),
            Instr::LoadIntLit(1),
            Instr::Lbl(1),
            Instr::Rtrn,
        ],
    )])
}

#[test]
fn test_fused_float_branches() {
    let ops: [(Instr, fn(f64, f64) -> bool); 6] = [
        (Instr::LesFloat, |a, b| a < b),
        (Instr::GtrFloat, |a, b| a > b),
        (Instr::LesEqlFloat, |a, b| a <= b),
        (Instr::GtrEqlFloat, |a, b| a >= b),
        (Instr::EqlFloat, |a, b| a == b),
        (Instr::NeqlFloat, |a, b| a != b),
    ];
    for (op, reference) in ops {
        for cond in [JumpCond::IfTrue, JumpCond::IfFalse] {
            for (a, b) in [(1.0, 2.0), (2.0, 1.0), (1.5, 1.5), (f64::NAN, 1.0), (1.0, f64::NAN)] {
                let build = || branch_program(op.clone(), cond);
                let out = assert_same(build, "branch", &[bits(a), bits(b)]);
                let taken = reference(a, b) == (cond == JumpCond::IfTrue);
                assert_eq!(out, vec![taken as i64], "{:?} {:?} on ({}, {})", op, cond, a, b);
            }
        }
    }
}

#[test]
fn test_stack_shuffles_and_copies() {
    let build = || {
        program(vec![
            method(
                0,
                "swap",
                0,
                ReturnKind::Int,
                vec![
                    Instr::LoadIntLit(1),
                    Instr::LoadIntLit(2),
                    Instr::SwapInt,
                    Instr::PopInt,
                    Instr::Rtrn,
                ],
            ),
            method(1, "sub", 2, ReturnKind::Int, vec![Instr::SubInt, Instr::Rtrn]),
            method(
                2,
                "copy",
                0,
                ReturnKind::Int,
                vec![
                    Instr::LoadIntLit(9),
                    Instr::CopyIntVar { id: 0, ctx: MemoryContext::Local },
                    load_int(0),
                    Instr::AddInt,
                    Instr::Rtrn,
                ],
            ),
            method(
                3,
                "overwrite",
                0,
                ReturnKind::None,
                vec![
                    Instr::LoadIntLit(1),
                    store_int(0),
                    load_int(0),
                    Instr::LoadIntLit(5),
                    store_int(0),
                    load_int(0),
                    Instr::Rtrn,
                ],
            ),
        ])
    };
    assert_eq!(assert_same(build, "swap", &[]), vec![2]);
    // Operands still on the interpreter stack are popped from there.
    assert_eq!(assert_same(build, "sub", &[3, 10]), vec![7]);
    assert_eq!(assert_same(build, "copy", &[]), vec![18]);
    // A read deferred past a store to the same local keeps the old value.
    assert_eq!(assert_same(build, "overwrite", &[]), vec![1, 5]);
}

fn array_program() -> Program {
    let mut fill = vec![
        store_int(0),
        Instr::LoadIntLit(5),
        Instr::NewArray { elem: ElemKind::Int, dims: 1 },
        store_int(1),
    ];
    for k in 0..5 {
        fill.extend([
            Instr::LoadIntLit(k * 10),
            Instr::LoadIntLit(k),
            load_int(1),
            Instr::StorAryElm { elem: ElemKind::Int, dims: 1 },
        ]);
    }
    fill.extend([
        load_int(0),
        load_int(1),
        Instr::LoadAryElm { elem: ElemKind::Int, dims: 1 },
        Instr::Rtrn,
    ]);

    let grid = vec![
        // 2 x 3 grid; the outermost size is popped first.
        Instr::LoadIntLit(3),
        Instr::LoadIntLit(2),
        Instr::NewArray { elem: ElemKind::Int, dims: 2 },
        store_int(0),
        Instr::LoadIntLit(7),
        Instr::LoadIntLit(2),
        Instr::LoadIntLit(1),
        load_int(0),
        Instr::StorAryElm { elem: ElemKind::Int, dims: 2 },
        Instr::LoadIntLit(2),
        Instr::LoadIntLit(1),
        load_int(0),
        Instr::LoadAryElm { elem: ElemKind::Int, dims: 2 },
        load_int(0),
        Instr::LoadArySize,
        Instr::Rtrn,
    ];

    let narrow = vec![
        Instr::LoadIntLit(4),
        Instr::NewArray { elem: ElemKind::Byte, dims: 1 },
        store_int(0),
        Instr::LoadIntLit(300),
        Instr::LoadIntLit(3),
        load_int(0),
        Instr::StorAryElm { elem: ElemKind::Byte, dims: 1 },
        Instr::LoadIntLit(3),
        load_int(0),
        Instr::LoadAryElm { elem: ElemKind::Byte, dims: 1 },
        Instr::LoadIntLit(2),
        Instr::NewArray { elem: ElemKind::Char, dims: 1 },
        store_int(1),
        Instr::LoadIntLit(0x1F600),
        Instr::LoadIntLit(1),
        load_int(1),
        Instr::StorAryElm { elem: ElemKind::Char, dims: 1 },
        Instr::LoadIntLit(1),
        load_int(1),
        Instr::LoadAryElm { elem: ElemKind::Char, dims: 1 },
        Instr::LoadIntLit(2),
        Instr::NewArray { elem: ElemKind::Float, dims: 1 },
        store_int(2),
        Instr::LoadFloatLit(1.5),
        Instr::LoadIntLit(0),
        load_int(2),
        Instr::StorAryElm { elem: ElemKind::Float, dims: 1 },
        Instr::LoadIntLit(0),
        load_int(2),
        Instr::LoadAryElm { elem: ElemKind::Float, dims: 1 },
        Instr::Rtrn,
    ];

    program(vec![
        method(0, "element", 1, ReturnKind::Int, fill),
        method(1, "grid", 0, ReturnKind::None, grid),
        method(2, "narrow", 0, ReturnKind::None, narrow),
    ])
}

#[test]
fn test_array_access() {
    for i in 0..5 {
        assert_eq!(assert_same(array_program, "element", &[i]), vec![i * 10]);
    }
    assert_eq!(assert_same(array_program, "grid", &[]), vec![7, 2]);
    assert_eq!(
        assert_same(array_program, "narrow", &[]),
        vec![300 & 0xff, 0x1F600, bits(1.5)]
    );
}

fn call_program() -> Program {
    let fib = method(
        1,
        "fib",
        1,
        ReturnKind::Int,
        vec![
            store_int(0),
            Instr::LoadIntLit(2),
            load_int(0),
            Instr::LesInt,
            Instr::Jmp { label: 1, cond: JumpCond::IfFalse },
            load_int(0),
            Instr::Rtrn,
            Instr::Lbl(1),
            Instr::LoadIntLit(1),
            load_int(0),
            Instr::SubInt,
            Instr::LoadIntLit(0),
            Instr::MthdCall { class: 0, method: 1 },
            Instr::LoadIntLit(2),
            load_int(0),
            Instr::SubInt,
            Instr::LoadIntLit(0),
            Instr::MthdCall { class: 0, method: 1 },
            Instr::AddInt,
            Instr::Rtrn,
        ],
    );
    let double = method(
        2,
        "double",
        1,
        ReturnKind::Int,
        vec![store_int(0), load_int(0), load_int(0), Instr::AddInt, Instr::Rtrn],
    );
    let code = (0i64 << 32) | 2;
    let dynamic = method(
        3,
        "dynamic",
        0,
        ReturnKind::None,
        vec![
            Instr::LoadIntLit(21),
            Instr::LoadIntLit(0),
            Instr::LoadIntLit(code),
            Instr::DynMthdCall { params: 1, rtrn: ReturnKind::Int },
            Instr::LoadIntLit(0),
            Instr::LoadIntLit(code),
            Instr::StorFuncVar { id: 0, ctx: MemoryContext::Local },
            Instr::LoadIntLit(5),
            Instr::LoadFuncVar { id: 0, ctx: MemoryContext::Local },
            Instr::DynMthdCall { params: 1, rtrn: ReturnKind::Int },
            Instr::Rtrn,
        ],
    );
    let virtual_call = method(
        4,
        "virtual",
        0,
        ReturnKind::None,
        vec![
            Instr::NewObjInst(2),
            Instr::MthdCall { class: 1, method: 0 },
            Instr::NewObjInst(1),
            Instr::MthdCall { class: 1, method: 0 },
            Instr::Rtrn,
        ],
    );
    let value = |n| Instr::LoadIntLit(n);

    Program::new(vec![
        main_class(vec![fib, double, dynamic, virtual_call]),
        Class::new(1, "Base")
            .with_method(method(0, "value", 0, ReturnKind::Int, vec![value(1), Instr::Rtrn])),
        Class::new(2, "Derived")
            .with_parent(1)
            .with_method(method(0, "value", 0, ReturnKind::Int, vec![value(2), Instr::Rtrn])),
    ])
}

#[test]
fn test_method_calls() {
    assert_eq!(assert_same(call_program, "fib", &[15]), vec![610]);
    assert_eq!(assert_same(call_program, "dynamic", &[]), vec![42, 10]);
    assert_eq!(assert_same(call_program, "virtual", &[]), vec![2, 1]);
}

#[test]
fn test_fields_and_statics() {
    let build = || {
        let field = |id| Instr::LoadIntVar { id, ctx: MemoryContext::Instance };
        let set_field = |id| Instr::StorIntVar { id, ctx: MemoryContext::Instance };
        Program::new(vec![
            main_class(vec![method(
                0,
                "fields",
                0,
                ReturnKind::None,
                vec![
                    Instr::NewObjInst(1),
                    store_int(0),
                    Instr::LoadIntLit(3),
                    load_int(0),
                    set_field(0),
                    Instr::LoadIntLit(4),
                    load_int(0),
                    set_field(1),
                    load_int(0),
                    field(0),
                    load_int(0),
                    field(1),
                    Instr::MulInt,
                    Instr::Lbl(0),
                    load_int(0),
                    Instr::ObjTypeOf(1),
                    Instr::Lbl(1),
                    load_int(0),
                    Instr::ObjTypeOf(0),
                    Instr::Lbl(2),
                    Instr::LoadIntLit(5),
                    Instr::LoadClsMem,
                    Instr::StorIntVar { id: 0, ctx: MemoryContext::Class },
                    Instr::LoadClsMem,
                    Instr::LoadIntVar { id: 0, ctx: MemoryContext::Class },
                    Instr::Rtrn,
                ],
            )])
            .with_statics(1),
            Class::new(1, "Point").with_fields(2),
        ])
    };
    assert_eq!(assert_same(build, "fields", &[]), vec![12, 1, 0, 5]);
}

#[test]
fn test_traps_print_and_keep_live_values() {
    let build = || {
        program(vec![
            method(
                0,
                "print",
                0,
                ReturnKind::None,
                vec![
                    Instr::LoadIntLit(42),
                    Instr::Trap { kind: TrapKind::PrintInt, args: 1 },
                    Instr::LoadFloatLit(1.5),
                    Instr::Trap { kind: TrapKind::PrintFloat, args: 1 },
                    Instr::LoadIntLit('h' as i64),
                    Instr::Trap { kind: TrapKind::PrintChar, args: 1 },
                    Instr::Rtrn,
                ],
            ),
            method(
                1,
                "square_plus_one",
                1,
                ReturnKind::Int,
                vec![
                    store_int(0),
                    load_int(0),
                    load_int(0),
                    Instr::MulInt,
                    Instr::LoadIntLit(7),
                    Instr::Trap { kind: TrapKind::PrintInt, args: 1 },
                    Instr::LoadIntLit(1),
                    Instr::AddInt,
                    Instr::Rtrn,
                ],
            ),
        ])
    };

    let ((_, interp_out), (compiled, jit_out)) = run_both(build, "print", &[]);
    assert_eq!(compiled.unwrap(), Vec::<i64>::new());
    assert_eq!(jit_out, "42\n1.5\nh");
    assert_eq!(interp_out, jit_out);

    let ((_, _), (compiled, jit_out)) = run_both(build, "square_plus_one", &[6]);
    assert_eq!(compiled.unwrap(), vec![37]);
    assert_eq!(jit_out, "7\n");
}
