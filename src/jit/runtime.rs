//! Compile cache and native entry.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::config::RuntimeConfig;
use crate::vm::{CallStack, Method, Program, StackRef};

use super::JitError;
use super::compiler::{self, CompileStats};
use super::fixup::Trampoline;
use super::memory::{CodeHandle, PageManager};

/// Status returned when a bridge call failed. The error itself is held by
/// the bridge until the VM collects it.
pub const BRIDGE_FAILURE: i32 = -5;

/// Status returned when a push would exceed the operand stack capacity.
pub const OPERAND_OVERFLOW: i32 = -6;

/// Status returned when a pop finds the operand stack empty.
pub const OPERAND_UNDERFLOW: i32 = -7;

const _: () = assert!(Trampoline::BridgeFailure.status() == BRIDGE_FAILURE);
const _: () = assert!(Trampoline::OperandOverflow.status() == OPERAND_OVERFLOW);
const _: () = assert!(Trampoline::OperandUnderflow.status() == OPERAND_UNDERFLOW);

/// Native signature of a compiled method.
///
/// Arguments: class id, method id, class memory, instance memory, operand
/// stack base, operand stack position, call stack, call stack position,
/// locals base slot, locals size slot, operand stack capacity.
type NativeEntry = unsafe extern "C" fn(
    i64,
    i64,
    i64,
    i64,
    *mut i64,
    *mut i64,
    *mut CallStack,
    *mut i64,
    *mut i64,
    *mut i64,
    i64,
) -> i32;

/// Per-method compile state. Lives in [`Method`].
#[derive(Default)]
pub struct JitSlot {
    compiled: OnceLock<Arc<CompiledMethod>>,
    lock: Mutex<()>,
    failed: AtomicBool,
}

impl JitSlot {
    pub fn get(&self) -> Option<&Arc<CompiledMethod>> {
        self.compiled.get()
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// Machine code for one method, resident in an executable page.
pub struct CompiledMethod {
    code: CodeHandle,
    float_constants: Box<[f64]>,
    offsets: Vec<usize>,
    stats: CompileStats,
}

impl CompiledMethod {
    pub fn entry(&self) -> *const u8 {
        self.code.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code(&self) -> &[u8] {
        self.code.bytes()
    }

    pub fn float_constants(&self) -> &[f64] {
        &self.float_constants
    }

    pub fn stats(&self) -> CompileStats {
        self.stats
    }

    /// Native offset of bytecode instruction `ip`.
    pub fn native_offset(&self, ip: usize) -> Option<usize> {
        self.offsets.get(ip).copied()
    }

    /// Run the method. Returns 0 or a negative status.
    ///
    /// # Safety
    /// `method` must be the method this code was compiled from, `stack` must
    /// be a live operand stack, and `call_stack` must point to the call stack
    /// whose top frame owns `jit_mem` and `jit_offset`. The caller must have
    /// entered the bridge for the running VM.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn execute(
        &self,
        method: &Method,
        class_mem: i64,
        instance: i64,
        stack: &mut StackRef,
        call_stack: *mut CallStack,
        call_stack_pos: *mut i64,
        jit_mem: *mut i64,
        jit_offset: *mut i64,
    ) -> i32 {
        unsafe {
            let entry: NativeEntry = std::mem::transmute::<*const u8, NativeEntry>(self.entry());
            entry(
                method.class_id as i64,
                method.id as i64,
                class_mem,
                instance,
                stack.base_ptr(),
                stack.pos_ptr(),
                call_stack,
                call_stack_pos,
                jit_mem,
                jit_offset,
                stack.capacity() as i64,
            )
        }
    }
}

impl fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethod")
            .field("entry", &self.entry())
            .field("len", &self.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Compiles hot methods and hands out their native code.
pub struct JitRuntime {
    pages: Mutex<PageManager>,
    buffer_size: usize,
    threshold: u32,
    trace: bool,
    compile_count: AtomicUsize,
}

impl JitRuntime {
    pub fn new(config: &RuntimeConfig) -> Result<Self, JitError> {
        Ok(Self {
            pages: Mutex::new(PageManager::new(config.initial_pages)?),
            buffer_size: config.code_buffer_size,
            threshold: config.jit_threshold,
            trace: config.trace_jit,
            compile_count: AtomicUsize::new(0),
        })
    }

    /// Calls a method must exceed before it is compiled.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Compile `method`, or return the code compiled earlier.
    ///
    /// Concurrent callers for the same method block on its slot lock; the
    /// first one compiles and the rest see its result.
    pub fn compile(
        &self,
        method: &Method,
        program: &Program,
    ) -> Result<Arc<CompiledMethod>, JitError> {
        let slot = &method.jit;
        if let Some(compiled) = slot.compiled.get() {
            return Ok(Arc::clone(compiled));
        }

        let _guard = lock(&slot.lock);
        if let Some(compiled) = slot.compiled.get() {
            return Ok(Arc::clone(compiled));
        }

        let result = self.compile_uncached(method, program);
        match result {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                let stored = slot.compiled.get_or_init(|| Arc::clone(&compiled));
                Ok(Arc::clone(stored))
            }
            Err(e) => {
                slot.failed.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    fn compile_uncached(
        &self,
        method: &Method,
        program: &Program,
    ) -> Result<CompiledMethod, JitError> {
        let name = method.qualified_name(program);
        let output = compiler::compile(method, program, self.buffer_size)?;
        let code = lock(&self.pages).get_page(&output.code)?;
        self.compile_count.fetch_add(1, Ordering::Relaxed);

        let stats = output.stats;
        if self.trace {
            log::info!(
                "compiled '{}': {} instructions, {} bytes, {} register allocations",
                name,
                stats.instructions,
                stats.code_size,
                stats.register_allocations
            );
        } else {
            log::debug!("compiled '{}' ({} bytes)", name, stats.code_size);
        }

        let compiled = CompiledMethod {
            code,
            float_constants: output.float_constants,
            offsets: output.offsets,
            stats,
        };
        if self.trace {
            for (ip, instr) in method.instrs.iter().enumerate() {
                if let Some(offset) = compiled.native_offset(ip) {
                    log::trace!("  {:#06x} {:>4}: {:?}", offset, ip, instr);
                }
            }
        }
        Ok(compiled)
    }

    /// Native code for `method` if it is hot enough and compiles.
    ///
    /// A method that failed to compile is interpreted from then on.
    pub fn prepare(&self, method: &Method, program: &Program) -> Option<Arc<CompiledMethod>> {
        if let Some(compiled) = method.jit.get() {
            return Some(Arc::clone(compiled));
        }
        if method.jit.has_failed() || method.call_count() <= self.threshold {
            return None;
        }
        match self.compile(method, program) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                log::warn!(
                    "'{}' stays interpreted: {}",
                    method.qualified_name(program),
                    e
                );
                None
            }
        }
    }

    /// Methods compiled so far.
    pub fn compile_count(&self) -> usize {
        self.compile_count.load(Ordering::Relaxed)
    }

    pub fn page_count(&self) -> usize {
        lock(&self.pages).page_count()
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
