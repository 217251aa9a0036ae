use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[cfg(all(target_arch = "x86_64", feature = "jit"))]
use crate::jit::{self, CompiledMethod, JitRuntime};

use crate::config::RuntimeConfig;

use super::error::{Fault, RuntimeError};
use super::frame::{CallStack, OperandStack, StackFrame, StackRef};
use super::heap::{Heap, NIL, raw};
use super::intrinsics;
use super::ops::{ElemKind, Instr, MemoryContext, TrapKind};
use super::program::{Method, Program};

/// The virtual machine: program, heap and (optionally) the JIT.
///
/// Every method invocation goes through [`VM::invoke`], which runs compiled
/// code when the JIT has produced it and interprets otherwise. The JIT's
/// runtime bridge calls back into the same entry points, so both paths share
/// one implementation of every non-inlined operation.
pub struct VM {
    program: Arc<Program>,
    heap: Heap,
    /// Class id -> static memory.
    statics: HashMap<u32, i64>,
    config: RuntimeConfig,
    #[cfg(all(target_arch = "x86_64", feature = "jit"))]
    jit: Option<JitRuntime>,
    threads: Mutex<HashMap<i64, JoinHandle<Result<(), RuntimeError>>>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl VM {
    pub fn new(program: Program, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_output(program, config, Box::new(io::stdout()))
    }

    /// Create a VM with a custom output stream.
    pub fn with_output(
        program: Program,
        config: RuntimeConfig,
        output: Box<dyn Write + Send>,
    ) -> Result<Self, RuntimeError> {
        let heap = Heap::new();
        let mut statics = HashMap::new();
        for class in program.classes() {
            statics.insert(class.id, heap.alloc_statics(class.id, class.statics)?);
        }

        #[cfg(all(target_arch = "x86_64", feature = "jit"))]
        let jit = if config.jit_mode.is_enabled() {
            match JitRuntime::new(&config) {
                Ok(runtime) => Some(runtime),
                Err(e) => {
                    log::warn!("JIT unavailable, interpreting only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            program: Arc::new(program),
            heap,
            statics,
            config,
            #[cfg(all(target_arch = "x86_64", feature = "jit"))]
            jit,
            threads: Mutex::new(HashMap::new()),
            output: Mutex::new(output),
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[cfg(all(target_arch = "x86_64", feature = "jit"))]
    pub fn jit(&self) -> Option<&JitRuntime> {
        self.jit.as_ref()
    }

    /// Static memory of a class.
    pub fn class_memory(&self, class_id: u32) -> Result<i64, RuntimeError> {
        self.statics
            .get(&class_id)
            .copied()
            .ok_or(RuntimeError::UnknownClass(class_id))
    }

    /// Run `Class:method` with `args` pushed in order and no receiver.
    /// Returns the operand stack left behind (the method's results).
    pub fn run(&self, class: &str, method: &str, args: &[i64]) -> Result<Vec<i64>, RuntimeError> {
        let program = Arc::clone(&self.program);
        let method = program
            .find_method(class, method)
            .ok_or_else(|| RuntimeError::Bridge(format!("no method {}:{}", class, method)))?;
        self.call(method, NIL, args)
    }

    /// Invoke `method` on a fresh operand stack.
    pub fn call(
        &self,
        method: &Arc<Method>,
        instance: i64,
        args: &[i64],
    ) -> Result<Vec<i64>, RuntimeError> {
        let mut stack = OperandStack::new(self.config.stack_size);
        let mut calls = CallStack::new(self.config.max_call_depth);
        let mut view = stack.view();
        for &arg in args {
            view.push(arg)?;
        }
        self.invoke(method, instance, &mut view, &mut calls)?;
        Ok(stack.as_slice().to_vec())
    }

    /// Run `method` on another thread. Bytecode joins it with `ThreadJoin`
    /// on the same `instance`.
    pub fn spawn(self: &Arc<Self>, method: &Arc<Method>, instance: i64) {
        let vm = Arc::clone(self);
        let method = Arc::clone(method);
        let handle = std::thread::spawn(move || vm.call(&method, instance, &[]).map(|_| ()));
        lock(&self.threads).insert(instance, handle);
    }

    /// Invoke a method with its parameters already on `stack`.
    pub fn invoke(
        &self,
        method: &Arc<Method>,
        instance: i64,
        stack: &mut StackRef,
        calls: &mut CallStack,
    ) -> Result<(), RuntimeError> {
        calls.push(StackFrame {
            class_id: method.class_id,
            method_id: method.id,
            instance,
            ..StackFrame::default()
        })?;
        let result = self.dispatch(method, instance, stack, calls);
        calls.pop();
        result
    }

    fn dispatch(
        &self,
        method: &Arc<Method>,
        instance: i64,
        stack: &mut StackRef,
        calls: &mut CallStack,
    ) -> Result<(), RuntimeError> {
        method.record_call();

        #[cfg(all(target_arch = "x86_64", feature = "jit"))]
        if let Some(compiled) =
            self.jit.as_ref().and_then(|jit| jit.prepare(method, &self.program))
        {
            return self.run_compiled(&compiled, method, instance, stack, calls);
        }

        self.interpret(method, instance, stack, calls)
    }

    /// Call into native code and turn its status into a `Result`.
    #[cfg(all(target_arch = "x86_64", feature = "jit"))]
    fn run_compiled(
        &self,
        compiled: &CompiledMethod,
        method: &Method,
        instance: i64,
        stack: &mut StackRef,
        calls: &mut CallStack,
    ) -> Result<(), RuntimeError> {
        let class_mem = self.class_memory(method.class_id)?;
        let frame = calls
            .top_mut()
            .ok_or_else(|| RuntimeError::Bridge("missing call frame".to_string()))?;
        let gc_root: *mut i64 = &mut frame.jit_mem;
        let gc_root_offset: *mut i64 = &mut frame.jit_offset;
        let call_stack_pos = calls.pos_ptr();
        let call_stack: *mut CallStack = calls;

        let _active = jit::bridge::enter(self);
        let status = unsafe {
            compiled.execute(
                method,
                class_mem,
                instance,
                stack,
                call_stack,
                call_stack_pos,
                gc_root,
                gc_root_offset,
            )
        };

        match status {
            0 => Ok(()),
            jit::OPERAND_OVERFLOW => Err(RuntimeError::OperandOverflow),
            jit::OPERAND_UNDERFLOW => Err(RuntimeError::OperandUnderflow),
            jit::BRIDGE_FAILURE => Err(jit::bridge::take_pending().unwrap_or_else(|| {
                RuntimeError::Bridge(format!(
                    "runtime bridge failed in '{}'",
                    method.qualified_name(&self.program)
                ))
            })),
            status => match Fault::from_status(status) {
                Some(fault) => Err(RuntimeError::Fault {
                    fault,
                    method: method.qualified_name(&self.program),
                }),
                None => Err(RuntimeError::Bridge(format!("unexpected native status {}", status))),
            },
        }
    }

    fn fault(&self, method: &Method, fault: Fault) -> RuntimeError {
        RuntimeError::Fault {
            fault,
            method: method.qualified_name(&self.program),
        }
    }

    /// Pop an object address for a field access.
    fn pop_base(&self, method: &Method, stack: &mut StackRef) -> Result<i64, RuntimeError> {
        let base = stack.pop()?;
        if base == NIL {
            return Err(self.fault(method, Fault::NilDereference));
        }
        Ok(base)
    }

    /// Pop an array and its indices; returns the array and flat element index.
    fn pop_element(
        &self,
        method: &Method,
        dims: u32,
        stack: &mut StackRef,
    ) -> Result<(i64, usize), RuntimeError> {
        let array = self.pop_base(method, stack)?;
        let mut index = stack.pop()?;
        for i in 1..dims as usize {
            let dim = unsafe { raw::array_dim(array, i) };
            index = index.wrapping_mul(dim).wrapping_add(stack.pop()?);
        }
        if index < 0 {
            return Err(self.fault(method, Fault::IndexBelowZero));
        }
        if index >= unsafe { raw::array_size(array) } {
            return Err(self.fault(method, Fault::IndexAboveLength));
        }
        Ok((array, index as usize))
    }

    /// Reference interpreter.
    fn interpret(
        &self,
        method: &Arc<Method>,
        instance: i64,
        stack: &mut StackRef,
        calls: &mut CallStack,
    ) -> Result<(), RuntimeError> {
        let mut locals = vec![0i64; method.local_slots()];
        let class_mem = self.class_memory(method.class_id)?;
        let mut ip = 0usize;

        while let Some(instr) = method.instrs.get(ip) {
            ip += 1;
            match instr {
                Instr::LoadIntLit(v) => stack.push(*v)?,
                Instr::LoadFloatLit(f) => stack.push_float(*f)?,
                Instr::LoadInstMem => stack.push(instance)?,
                Instr::LoadClsMem => stack.push(class_mem)?,

                Instr::LoadIntVar { id, ctx } | Instr::LoadFloatVar { id, ctx } => {
                    let id = *id as usize;
                    let value = match ctx {
                        MemoryContext::Local => locals[id],
                        _ => {
                            let base = self.pop_base(method, stack)?;
                            unsafe { raw::slot(base, id) }
                        }
                    };
                    stack.push(value)?;
                }
                Instr::LoadFuncVar { id, ctx } => {
                    let id = *id as usize;
                    let (code, context) = match ctx {
                        MemoryContext::Local => (locals[id], locals[id + 1]),
                        _ => {
                            let base = self.pop_base(method, stack)?;
                            unsafe { (raw::slot(base, id), raw::slot(base, id + 1)) }
                        }
                    };
                    stack.push(context)?;
                    stack.push(code)?;
                }
                Instr::StorIntVar { id, ctx } | Instr::StorFloatVar { id, ctx } => {
                    let id = *id as usize;
                    match ctx {
                        MemoryContext::Local => locals[id] = stack.pop()?,
                        _ => {
                            let base = self.pop_base(method, stack)?;
                            let value = stack.pop()?;
                            unsafe { raw::set_slot(base, id, value) };
                        }
                    }
                }
                Instr::StorFuncVar { id, ctx } => {
                    let id = *id as usize;
                    match ctx {
                        MemoryContext::Local => {
                            locals[id] = stack.pop()?;
                            locals[id + 1] = stack.pop()?;
                        }
                        _ => {
                            let base = self.pop_base(method, stack)?;
                            let code = stack.pop()?;
                            let context = stack.pop()?;
                            unsafe {
                                raw::set_slot(base, id, code);
                                raw::set_slot(base, id + 1, context);
                            }
                        }
                    }
                }
                Instr::CopyIntVar { id, ctx } | Instr::CopyFloatVar { id, ctx } => {
                    let id = *id as usize;
                    match ctx {
                        MemoryContext::Local => locals[id] = stack.peek()?,
                        _ => {
                            let base = self.pop_base(method, stack)?;
                            let value = stack.peek()?;
                            unsafe { raw::set_slot(base, id, value) };
                        }
                    }
                }

                Instr::AddInt
                | Instr::SubInt
                | Instr::MulInt
                | Instr::DivInt
                | Instr::ModInt
                | Instr::AndInt
                | Instr::OrInt
                | Instr::BitAndInt
                | Instr::BitOrInt
                | Instr::BitXorInt
                | Instr::ShlInt
                | Instr::ShrInt
                | Instr::LesInt
                | Instr::GtrInt
                | Instr::LesEqlInt
                | Instr::GtrEqlInt
                | Instr::EqlInt
                | Instr::NeqlInt => {
                    let left = stack.pop()?;
                    let right = stack.pop()?;
                    let value = int_binary(instr, left, right)
                        .ok_or_else(|| self.fault(method, Fault::DivideByZero))?;
                    stack.push(value)?;
                }
                Instr::BitNotInt => {
                    let value = stack.pop()?;
                    stack.push(!value)?;
                }

                Instr::AddFloat
                | Instr::SubFloat
                | Instr::MulFloat
                | Instr::DivFloat
                | Instr::PowFloat
                | Instr::Atan2Float => {
                    let left = stack.pop_float()?;
                    let right = stack.pop_float()?;
                    let value = match instr {
                        Instr::AddFloat => left + right,
                        Instr::SubFloat => left - right,
                        Instr::MulFloat => left * right,
                        Instr::DivFloat => left / right,
                        Instr::Atan2Float => intrinsics::atan2(left, right),
                        _ => intrinsics::pow(left, right),
                    };
                    stack.push_float(value)?;
                }
                Instr::SqrtFloat
                | Instr::FloorFloat
                | Instr::CeilFloat
                | Instr::SinFloat
                | Instr::CosFloat
                | Instr::TanFloat
                | Instr::AsinFloat
                | Instr::AcosFloat
                | Instr::LogFloat
                | Instr::ExpFloat => {
                    let x = stack.pop_float()?;
                    let value = match instr {
                        Instr::SqrtFloat => x.sqrt(),
                        Instr::FloorFloat => x.floor(),
                        Instr::CeilFloat => x.ceil(),
                        Instr::SinFloat => intrinsics::sin(x),
                        Instr::CosFloat => intrinsics::cos(x),
                        Instr::TanFloat => intrinsics::tan(x),
                        Instr::AsinFloat => intrinsics::asin(x),
                        Instr::AcosFloat => intrinsics::acos(x),
                        Instr::LogFloat => intrinsics::ln(x),
                        _ => intrinsics::exp(x),
                    };
                    stack.push_float(value)?;
                }
                Instr::LesFloat
                | Instr::GtrFloat
                | Instr::LesEqlFloat
                | Instr::GtrEqlFloat
                | Instr::EqlFloat
                | Instr::NeqlFloat => {
                    let left = stack.pop_float()?;
                    let right = stack.pop_float()?;
                    let result = match instr {
                        Instr::LesFloat => left < right,
                        Instr::GtrFloat => left > right,
                        Instr::LesEqlFloat => left <= right,
                        Instr::GtrEqlFloat => left >= right,
                        Instr::EqlFloat => left == right,
                        _ => left != right,
                    };
                    stack.push(result as i64)?;
                }

                Instr::I2F => {
                    let value = stack.pop()?;
                    stack.push_float(value as f64)?;
                }
                Instr::F2I => {
                    let value = stack.pop_float()?;
                    stack.push(intrinsics::truncate(value))?;
                }
                Instr::SwapInt => {
                    let a = stack.pop()?;
                    let b = stack.pop()?;
                    stack.push(a)?;
                    stack.push(b)?;
                }
                Instr::PopInt | Instr::PopFloat => {
                    stack.pop()?;
                }

                Instr::Lbl(_) => {}
                Instr::Jmp { label, cond } => {
                    let taken = match cond.expected() {
                        None => true,
                        Some(expected) => stack.pop()? == expected,
                    };
                    if taken {
                        ip = method.label_index(*label).ok_or_else(|| RuntimeError::UndefinedLabel {
                            label: *label,
                            method: method.qualified_name(&self.program),
                        })?;
                    }
                }
                Instr::Rtrn => return Ok(()),

                Instr::LoadAryElm { elem, dims } => {
                    let (array, index) = self.pop_element(method, *dims, stack)?;
                    stack.push(unsafe { raw::load_elem(array, *elem, index) })?;
                }
                Instr::StorAryElm { elem, dims } => {
                    let (array, index) = self.pop_element(method, *dims, stack)?;
                    let value = stack.pop()?;
                    unsafe { raw::store_elem(array, *elem, index, value) };
                }
                Instr::LoadArySize => {
                    let array = self.pop_base(method, stack)?;
                    stack.push(unsafe { raw::array_dim(array, 0) })?;
                }

                _ => self.exec_runtime_op(instr, method, stack, calls)?,
            }
        }

        Ok(())
    }

    /// Operations the JIT never inlines. Compiled code reaches these through
    /// the runtime bridge with the operand stack in the same state the
    /// interpreter would have it.
    pub(crate) fn exec_runtime_op(
        &self,
        instr: &Instr,
        method: &Method,
        stack: &mut StackRef,
        calls: &mut CallStack,
    ) -> Result<(), RuntimeError> {
        match instr {
            Instr::MthdCall { class, method: id } => {
                let program = Arc::clone(&self.program);
                let callee = program.method(*class, *id).ok_or(RuntimeError::UnknownMethod {
                    class: *class,
                    method: *id,
                })?;
                let receiver = stack.pop()?;
                let target = if receiver != NIL {
                    match unsafe { raw::header(receiver) } {
                        class_id if class_id >= 0 => {
                            program.resolve_virtual(class_id as u32, callee)
                        }
                        _ => callee,
                    }
                } else {
                    callee
                };
                self.invoke(target, receiver, stack, calls)
            }
            Instr::DynMthdCall { .. } => {
                let code = stack.pop()?;
                let context = stack.pop()?;
                let (class, id) = ((code >> 32) as u32, code as u32);
                let program = Arc::clone(&self.program);
                let callee = program
                    .method(class, id)
                    .ok_or(RuntimeError::UnknownMethod { class, method: id })?;
                self.invoke(callee, context, stack, calls)
            }

            Instr::NewArray { elem, dims } => {
                let mut sizes = Vec::with_capacity(*dims as usize);
                for _ in 0..*dims {
                    sizes.push(stack.pop()?);
                }
                let array = self.heap.alloc_array(*elem, &sizes)?;
                stack.push(array)
            }
            Instr::NewObjInst(class) => {
                let fields = self
                    .program
                    .class(*class)
                    .ok_or(RuntimeError::UnknownClass(*class))?
                    .fields;
                let object = self.heap.alloc_object(*class, fields)?;
                stack.push(object)
            }
            Instr::ObjTypeOf(class) => {
                let object = stack.pop()?;
                let result = object != NIL && {
                    let header = unsafe { raw::header(object) };
                    header >= 0 && self.program.is_a(header as u32, *class)
                };
                stack.push(result as i64)
            }
            Instr::ObjInstCast(class) => {
                let object = stack.pop()?;
                if object != NIL {
                    let header = unsafe { raw::header(object) };
                    if header < 0 || !self.program.is_a(header as u32, *class) {
                        return Err(RuntimeError::InvalidCast { from: header, to: *class });
                    }
                }
                stack.push(object)
            }
            Instr::CpyAry(elem) => {
                let length = stack.pop()?;
                let src_offset = stack.pop()?;
                let src = stack.pop()?;
                let dest_offset = stack.pop()?;
                let dest = stack.pop()?;
                if src == NIL || dest == NIL {
                    return Err(self.fault(method, Fault::NilDereference));
                }
                let copied = copy_array(*elem, src, src_offset, dest, dest_offset, length);
                stack.push(copied as i64)
            }
            Instr::ZeroAry(elem) => {
                let array = self.pop_base(method, stack)?;
                unsafe {
                    let bytes = raw::array_size(array) as usize * elem.size();
                    std::ptr::write_bytes(raw::array_data(array), 0, bytes);
                }
                Ok(())
            }

            Instr::ThreadJoin => {
                let target = stack.pop()?;
                let handle = lock(&self.threads).remove(&target);
                match handle {
                    Some(handle) => handle
                        .join()
                        .map_err(|_| RuntimeError::Thread("joined thread panicked".to_string()))?,
                    None => Ok(()),
                }
            }
            Instr::ThreadSleep => {
                let millis = stack.pop()?;
                std::thread::sleep(Duration::from_millis(millis.max(0) as u64));
                Ok(())
            }
            Instr::CriticalStart => {
                let target = self.pop_base(method, stack)?;
                self.heap.critical_start(target);
                Ok(())
            }
            Instr::CriticalEnd => {
                let target = self.pop_base(method, stack)?;
                self.heap.critical_end(target);
                Ok(())
            }
            Instr::RandFloat => stack.push_float(rand::random::<f64>()),
            Instr::Trap { kind, .. } | Instr::TrapRtrn { kind, .. } => self.trap(*kind, stack),

            other => Err(RuntimeError::Bridge(format!(
                "instruction {:?} is not a runtime operation",
                other
            ))),
        }
    }

    fn trap(&self, kind: TrapKind, stack: &mut StackRef) -> Result<(), RuntimeError> {
        match kind {
            TrapKind::PrintInt => {
                let value = stack.pop()?;
                writeln!(lock(&self.output), "{}", value)?;
            }
            TrapKind::PrintFloat => {
                let value = stack.pop_float()?;
                writeln!(lock(&self.output), "{}", value)?;
            }
            TrapKind::PrintChar => {
                let code = stack.pop()?;
                let ch = char::from_u32(code as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
                write!(lock(&self.output), "{}", ch)?;
            }
            TrapKind::Abort => return Err(RuntimeError::Abort(stack.pop()?)),
            TrapKind::ClockMillis => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                stack.push(millis)?;
            }
        }
        Ok(())
    }
}

/// Integer binary operators and comparisons. `None` means divide by zero.
pub(crate) fn int_binary(instr: &Instr, left: i64, right: i64) -> Option<i64> {
    let value = match instr {
        Instr::AddInt => left.wrapping_add(right),
        Instr::SubInt => left.wrapping_sub(right),
        Instr::MulInt => left.wrapping_mul(right),
        Instr::DivInt if right == 0 => return None,
        Instr::DivInt => left.wrapping_div(right),
        Instr::ModInt if right == 0 => return None,
        Instr::ModInt => left.wrapping_rem(right),
        Instr::AndInt | Instr::BitAndInt => left & right,
        Instr::OrInt | Instr::BitOrInt => left | right,
        Instr::BitXorInt => left ^ right,
        Instr::ShlInt => left.wrapping_shl(right as u32),
        Instr::ShrInt => left.wrapping_shr(right as u32),
        Instr::LesInt => (left < right) as i64,
        Instr::GtrInt => (left > right) as i64,
        Instr::LesEqlInt => (left <= right) as i64,
        Instr::GtrEqlInt => (left >= right) as i64,
        Instr::EqlInt => (left == right) as i64,
        Instr::NeqlInt => (left != right) as i64,
        _ => return None,
    };
    Some(value)
}

/// Bounds-checked element copy; `false` when the range does not fit.
fn copy_array(
    elem: ElemKind,
    src: i64,
    src_offset: i64,
    dest: i64,
    dest_offset: i64,
    length: i64,
) -> bool {
    let (src_len, dest_len) = unsafe { (raw::array_size(src), raw::array_size(dest)) };
    let fits = length > 0
        && src_offset >= 0
        && dest_offset >= 0
        && src_offset.checked_add(length).is_some_and(|end| end <= src_len)
        && dest_offset.checked_add(length).is_some_and(|end| end <= dest_len);
    if !fits {
        return false;
    }
    let size = elem.size();
    unsafe {
        // Source and destination may be the same array.
        std::ptr::copy(
            raw::array_data(src).add(src_offset as usize * size),
            raw::array_data(dest).add(dest_offset as usize * size),
            length as usize * size,
        );
    }
    true
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
