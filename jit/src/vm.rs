//! The VM handle: loaded program, helper table, and the compiled
//! entry point.

use std::ffi::c_void;
use std::os::raw::{c_char, c_int};

use log::{debug, trace};
use ubpf_core::{Insn, MAX_EXT_FUNCS, MAX_INSTS};

use crate::error::Error;
use crate::exec_mem::ExecMem;
use crate::x86_64::{translate_program, RegisterMap};

/// Entry point of a compiled program: `fn(ctx, ctx_len) -> r0`. The
/// context pointer is delivered in eBPF r1.
pub type JitFn = unsafe extern "C" fn(*mut c_void, usize) -> u64;

/// External helper callable from eBPF via `call imm`.
pub type ExtFunc = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;

/// Diagnostic sink for runtime traps. Receives the stream captured at
/// translation time, a printf-style format, and the offending pc.
pub type ErrorPrintf = unsafe extern "C" fn(*mut c_void, *const c_char, u64) -> c_int;

/// Default trap reporter: forward to fprintf on the captured stream.
unsafe extern "C" fn default_error_printf(
    stream: *mut c_void,
    fmt: *const c_char,
    pc: u64,
) -> c_int {
    unsafe { libc::fprintf(stream as *mut libc::FILE, fmt, pc as libc::c_uint) }
}

/// An eBPF virtual machine holding one verified program and the
/// helpers it may call.
pub struct Vm {
    insts: Vec<Insn>,
    ext_funcs: [Option<ExtFunc>; MAX_EXT_FUNCS],
    unwind_stack_extension_index: Option<usize>,
    error_printf: ErrorPrintf,
    jitted: Option<ExecMem>,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            insts: Vec::new(),
            ext_funcs: [None; MAX_EXT_FUNCS],
            unwind_stack_extension_index: None,
            error_printf: default_error_printf,
            jitted: None,
        }
    }

    /// Load a verified instruction stream. Replaces any previous
    /// program and drops the compiled entry.
    pub fn load(&mut self, insts: Vec<Insn>) -> Result<(), Error> {
        if insts.len() > MAX_INSTS {
            return Err(Error::TooManyInsts(insts.len()));
        }
        self.insts = insts;
        self.jitted = None;
        Ok(())
    }

    /// Register an external helper in slot `idx`.
    pub fn register(&mut self, idx: usize, func: ExtFunc) -> Result<(), Error> {
        if idx >= MAX_EXT_FUNCS {
            return Err(Error::ExtFuncOutOfRange(idx));
        }
        self.ext_funcs[idx] = Some(func);
        Ok(())
    }

    /// Mark slot `idx` as the stack-unwinding helper: when it returns
    /// zero the program exits immediately with r0 = 0.
    pub fn set_unwind_function_index(&mut self, idx: usize) {
        self.unwind_stack_extension_index = Some(idx);
    }

    /// Replace the trap diagnostic callback.
    pub fn set_error_printf(&mut self, f: ErrorPrintf) {
        self.error_printf = f;
    }

    pub(crate) fn insts(&self) -> &[Insn] {
        &self.insts
    }

    pub(crate) fn ext_func(&self, idx: usize) -> Option<ExtFunc> {
        self.ext_funcs.get(idx).copied().flatten()
    }

    pub(crate) fn unwind_index(&self) -> Option<usize> {
        self.unwind_stack_extension_index
    }

    pub(crate) fn error_printf_addr(&self) -> u64 {
        self.error_printf as usize as u64
    }

    /// Translate the loaded program with the default register map and
    /// return the machine code bytes.
    pub fn translate(&self) -> Result<Vec<u8>, Error> {
        self.translate_with_map(RegisterMap::host())
    }

    /// Translate with an explicit register assignment. Test harnesses
    /// reshuffle the map to shake out encoding assumptions.
    pub fn translate_with_map(&self, regs: RegisterMap) -> Result<Vec<u8>, Error> {
        if self.insts.is_empty() {
            return Err(Error::NotLoaded);
        }
        let state = translate_program(self, regs)?;
        trace!(
            "jit: {} fixups over {} bytes",
            state.jumps.len(),
            state.buf.len()
        );
        Ok(state.buf)
    }

    /// Compile and install the loaded program, caching the entry
    /// point. Subsequent calls return the cached entry.
    pub fn compile(&mut self) -> Result<JitFn, Error> {
        if let Some(ref mem) = self.jitted {
            return Ok(mem.entry());
        }
        let code = self.translate()?;
        let mem = ExecMem::install(&code)?;
        debug!(
            "jit: compiled {} instructions into {} bytes",
            self.insts.len(),
            code.len()
        );
        let entry = mem.entry();
        self.jitted = Some(mem);
        Ok(entry)
    }

    /// Size of the installed code, if compiled.
    pub fn jitted_size(&self) -> Option<usize> {
        self.jitted.as_ref().map(|m| m.code_len())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
