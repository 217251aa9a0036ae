/// Bytecode instructions for the stack VM.
///
/// The operand stack holds 64-bit slots. Integers and object/array references
/// take one slot, floats take one slot holding the IEEE bit pattern, and
/// function values take two slots (method reference on top, context below).
///
/// Binary operators pop the *left* operand first: the value on top of the
/// stack is the left-hand side.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    // ========================================
    // Literals and frame roots
    // ========================================
    LoadIntLit(i64),
    LoadFloatLit(f64),
    /// Push the current instance pointer.
    LoadInstMem,
    /// Push the current class's static memory pointer.
    LoadClsMem,

    // ========================================
    // Variables
    // ========================================
    LoadIntVar { id: u32, ctx: MemoryContext },
    LoadFloatVar { id: u32, ctx: MemoryContext },
    LoadFuncVar { id: u32, ctx: MemoryContext },
    StorIntVar { id: u32, ctx: MemoryContext },
    StorFloatVar { id: u32, ctx: MemoryContext },
    StorFuncVar { id: u32, ctx: MemoryContext },
    /// Store without popping.
    CopyIntVar { id: u32, ctx: MemoryContext },
    CopyFloatVar { id: u32, ctx: MemoryContext },

    // ========================================
    // Integer arithmetic
    // ========================================
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    AndInt,
    OrInt,
    BitAndInt,
    BitOrInt,
    BitXorInt,
    ShlInt,
    ShrInt,
    BitNotInt,

    // ========================================
    // Integer comparison (push 0 or 1)
    // ========================================
    LesInt,
    GtrInt,
    LesEqlInt,
    GtrEqlInt,
    EqlInt,
    NeqlInt,

    // ========================================
    // Float arithmetic
    // ========================================
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    SqrtFloat,
    FloorFloat,
    CeilFloat,
    SinFloat,
    CosFloat,
    TanFloat,
    AsinFloat,
    AcosFloat,
    Atan2Float,
    LogFloat,
    ExpFloat,
    PowFloat,

    // ========================================
    // Float comparison (push 0 or 1)
    // ========================================
    LesFloat,
    GtrFloat,
    LesEqlFloat,
    GtrEqlFloat,
    EqlFloat,
    NeqlFloat,

    // ========================================
    // Conversion and stack shuffling
    // ========================================
    I2F,
    F2I,
    SwapInt,
    PopInt,
    PopFloat,

    // ========================================
    // Control flow
    // ========================================
    Lbl(u32),
    Jmp { label: u32, cond: JumpCond },
    Rtrn,

    // ========================================
    // Calls
    // ========================================
    /// Pops the receiver, then the callee consumes its parameters.
    MthdCall { class: u32, method: u32 },
    /// Pops a function value (two slots), then `params` parameter slots.
    DynMthdCall { params: u32, rtrn: ReturnKind },

    // ========================================
    // Objects and arrays
    // ========================================
    NewArray { elem: ElemKind, dims: u32 },
    NewObjInst(u32),
    LoadAryElm { elem: ElemKind, dims: u32 },
    StorAryElm { elem: ElemKind, dims: u32 },
    LoadArySize,
    CpyAry(ElemKind),
    ZeroAry(ElemKind),
    ObjTypeOf(u32),
    ObjInstCast(u32),

    // ========================================
    // Threads and library
    // ========================================
    ThreadJoin,
    ThreadSleep,
    CriticalStart,
    CriticalEnd,
    RandFloat,
    Trap { kind: TrapKind, args: u32 },
    TrapRtrn { kind: TrapKind, args: u32 },
}

/// Where a variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryContext {
    Local,
    Instance,
    Class,
}

/// Jump polarity. Conditional jumps pop a value and branch when it equals 1
/// (`IfTrue`) or 0 (`IfFalse`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCond {
    Always,
    IfTrue,
    IfFalse,
}

impl JumpCond {
    /// The value a conditional jump compares against.
    pub fn expected(self) -> Option<i64> {
        match self {
            JumpCond::Always => None,
            JumpCond::IfTrue => Some(1),
            JumpCond::IfFalse => Some(0),
        }
    }
}

/// Declared result of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnKind {
    #[default]
    None,
    Int,
    Float,
    Func,
}

impl ReturnKind {
    /// Operand stack slots the result occupies.
    pub fn slots(self) -> usize {
        match self {
            ReturnKind::None => 0,
            ReturnKind::Int | ReturnKind::Float => 1,
            ReturnKind::Func => 2,
        }
    }
}

/// Array element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    Byte,
    Char,
    Int,
    Float,
}

impl ElemKind {
    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            ElemKind::Byte => 1,
            ElemKind::Char => 4,
            ElemKind::Int | ElemKind::Float => 8,
        }
    }

    /// log2 of the element size.
    pub fn shift(self) -> u8 {
        match self {
            ElemKind::Byte => 0,
            ElemKind::Char => 2,
            ElemKind::Int | ElemKind::Float => 3,
        }
    }

    /// Header tag stored in front of arrays of this kind.
    pub fn tag(self) -> i64 {
        match self {
            ElemKind::Byte => -1,
            ElemKind::Char => -2,
            ElemKind::Int => -3,
            ElemKind::Float => -4,
        }
    }
}

/// Library traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Print the integer on top of the stack.
    PrintInt,
    /// Print the float on top of the stack.
    PrintFloat,
    /// Print the character code on top of the stack.
    PrintChar,
    /// Abort with the integer on top of the stack as the code.
    Abort,
    /// Push the wall clock in milliseconds.
    ClockMillis,
}

impl TrapKind {
    /// Whether the trap leaves an integer on the stack.
    pub fn returns_value(self) -> bool {
        matches!(self, TrapKind::ClockMillis)
    }
}

impl Instr {
    /// Local variable id and width in slots, if this touches a local.
    pub fn local_access(&self) -> Option<(u32, LocalKind)> {
        use Instr::*;
        match *self {
            LoadIntVar { id, ctx: MemoryContext::Local }
            | StorIntVar { id, ctx: MemoryContext::Local }
            | CopyIntVar { id, ctx: MemoryContext::Local } => Some((id, LocalKind::Int)),
            LoadFloatVar { id, ctx: MemoryContext::Local }
            | StorFloatVar { id, ctx: MemoryContext::Local }
            | CopyFloatVar { id, ctx: MemoryContext::Local } => Some((id, LocalKind::Float)),
            LoadFuncVar { id, ctx: MemoryContext::Local }
            | StorFuncVar { id, ctx: MemoryContext::Local } => Some((id, LocalKind::Func)),
            _ => None,
        }
    }
}

/// Kind of a local variable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocalKind {
    Int,
    Float,
    Func,
}

impl LocalKind {
    pub fn slots(self) -> u32 {
        match self {
            LocalKind::Int | LocalKind::Float => 1,
            LocalKind::Func => 2,
        }
    }
}
