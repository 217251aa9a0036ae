//! Runtime bridge: the single entry point compiled code uses to reach the
//! VM for operations it does not inline.
//!
//! Compiled code calls [`jit_stack_callback`] with the operation id, the
//! instruction, and the pointers it received in its own prolog. The callback
//! rebuilds the interpreter's view of the operand stack and runs the same
//! code path the interpreter uses.
//!
//! The VM is found through a thread-local pointer installed by [`enter`] for
//! the duration of a native call. A failing operation parks its error in a
//! thread-local slot and reports a nonzero status; the VM picks it up with
//! [`take_pending`] once native code has unwound to the epilogue.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};

use crate::vm::ops::Instr;
use crate::vm::{CallStack, RuntimeError, StackRef, VM};

thread_local! {
    static ACTIVE_VM: Cell<*const VM> = const { Cell::new(std::ptr::null()) };
    static PENDING: RefCell<Option<RuntimeError>> = const { RefCell::new(None) };
}

/// Operations reachable through the bridge. The discriminant is passed in
/// the first argument register.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOp {
    MethodCall = 0,
    DynamicCall,
    NewArray,
    NewObject,
    TypeOf,
    InstanceCast,
    ThreadJoin,
    ThreadSleep,
    CriticalStart,
    CriticalEnd,
    CopyArray,
    ZeroArray,
    RandomFloat,
    Trap,
    TrapReturn,
}

impl BridgeOp {
    const ALL: [BridgeOp; 15] = [
        BridgeOp::MethodCall,
        BridgeOp::DynamicCall,
        BridgeOp::NewArray,
        BridgeOp::NewObject,
        BridgeOp::TypeOf,
        BridgeOp::InstanceCast,
        BridgeOp::ThreadJoin,
        BridgeOp::ThreadSleep,
        BridgeOp::CriticalStart,
        BridgeOp::CriticalEnd,
        BridgeOp::CopyArray,
        BridgeOp::ZeroArray,
        BridgeOp::RandomFloat,
        BridgeOp::Trap,
        BridgeOp::TrapReturn,
    ];

    pub fn of(instr: &Instr) -> Option<Self> {
        let op = match instr {
            Instr::MthdCall { .. } => BridgeOp::MethodCall,
            Instr::DynMthdCall { .. } => BridgeOp::DynamicCall,
            Instr::NewArray { .. } => BridgeOp::NewArray,
            Instr::NewObjInst(_) => BridgeOp::NewObject,
            Instr::ObjTypeOf(_) => BridgeOp::TypeOf,
            Instr::ObjInstCast(_) => BridgeOp::InstanceCast,
            Instr::ThreadJoin => BridgeOp::ThreadJoin,
            Instr::ThreadSleep => BridgeOp::ThreadSleep,
            Instr::CriticalStart => BridgeOp::CriticalStart,
            Instr::CriticalEnd => BridgeOp::CriticalEnd,
            Instr::CpyAry(_) => BridgeOp::CopyArray,
            Instr::ZeroAry(_) => BridgeOp::ZeroArray,
            Instr::RandFloat => BridgeOp::RandomFloat,
            Instr::Trap { .. } => BridgeOp::Trap,
            Instr::TrapRtrn { .. } => BridgeOp::TrapReturn,
            _ => return None,
        };
        Some(op)
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as i64 == id)
    }
}

/// Restores the previously active VM when dropped, so nested native calls
/// from bridged method invocations keep the right pointer.
pub struct ActiveGuard {
    previous: *const VM,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_VM.with(|vm| vm.set(self.previous));
    }
}

/// Make `vm` the target of bridge calls on this thread.
pub fn enter(vm: &VM) -> ActiveGuard {
    let previous = ACTIVE_VM.with(|active| active.replace(vm as *const VM));
    ActiveGuard { previous }
}

/// Error left behind by the last failing bridge call on this thread.
pub fn take_pending() -> Option<RuntimeError> {
    PENDING.with(|pending| pending.borrow_mut().take())
}

fn set_pending(error: RuntimeError) {
    PENDING.with(|pending| *pending.borrow_mut() = Some(error));
}

/// Called from compiled code. Returns 0 on success and 1 when the operation
/// failed; the error is then available from [`take_pending`].
///
/// # Safety
/// Only compiled code calls this, with pointers taken from a live frame set
/// up by `VM::invoke` and an `instr` borrowed from the method being run.
#[allow(clippy::too_many_arguments)]
pub extern "C" fn jit_stack_callback(
    op: i64,
    instr: *const Instr,
    cls_id: i64,
    mthd_id: i64,
    inst: i64,
    op_stack: *mut i64,
    stack_pos: *mut i64,
    call_stack: *mut CallStack,
    call_stack_pos: *mut i64,
    ip: i64,
) -> i64 {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        dispatch(
            op,
            instr,
            cls_id,
            mthd_id,
            inst,
            op_stack,
            stack_pos,
            call_stack,
            call_stack_pos,
            ip,
        )
    }));

    match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            log::debug!("bridge op {} at ip {} failed: {}", op, ip, e);
            set_pending(e);
            1
        }
        Err(_) => {
            set_pending(RuntimeError::Bridge(format!("panic in bridge op {} at ip {}", op, ip)));
            1
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    op: i64,
    instr: *const Instr,
    cls_id: i64,
    mthd_id: i64,
    inst: i64,
    op_stack: *mut i64,
    stack_pos: *mut i64,
    call_stack: *mut CallStack,
    call_stack_pos: *mut i64,
    ip: i64,
) -> Result<(), RuntimeError> {
    let vm = ACTIVE_VM.with(Cell::get);
    if vm.is_null() || instr.is_null() || call_stack.is_null() {
        return Err(RuntimeError::Bridge("bridge called outside a native invocation".to_string()));
    }
    let vm = unsafe { &*vm };
    let instr = unsafe { &*instr };
    let calls = unsafe { &mut *call_stack };

    let op = BridgeOp::from_id(op)
        .ok_or_else(|| RuntimeError::Bridge(format!("unknown bridge op {}", op)))?;
    if BridgeOp::of(instr) != Some(op) {
        return Err(RuntimeError::Bridge(format!("bridge op {:?} does not match {:?}", op, instr)));
    }

    let (class, id) = (cls_id as u32, mthd_id as u32);
    let program = vm.program();
    let method = program
        .method(class, id)
        .ok_or(RuntimeError::UnknownMethod { class, method: id })?;

    debug_assert_eq!(
        unsafe { *call_stack_pos },
        calls.depth() as i64,
        "call stack position out of sync"
    );
    log::trace!(
        "bridge {:?} from {} ip {} (instance {:#x})",
        op,
        method.qualified_name(program),
        ip,
        inst
    );

    let mut stack = unsafe { StackRef::from_raw(op_stack, stack_pos, vm.config().stack_size) };
    vm.exec_runtime_op(instr, method, &mut stack, calls)
}
