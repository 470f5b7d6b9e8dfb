//! x86-64 JIT backend for eBPF programs.
//!
//! Translates a verified instruction stream into position-dependent
//! machine code, installs the bytes in an executable mapping, and hands
//! back a plain function pointer obeying the host C calling convention.
//! The first argument of the compiled entry point arrives in eBPF r1.
//!
//! Translation is two-pass: the per-instruction lowering emits every
//! jump and call with a 32-bit displacement placeholder and records a
//! fixup against a symbolic target; once all byte offsets are known,
//! the resolver rewrites the placeholders in place.

pub mod error;
pub mod exec_mem;
pub mod vm;
pub mod x86_64;

pub use error::Error;
pub use exec_mem::ExecMem;
pub use vm::{ErrorPrintf, ExtFunc, JitFn, Vm};
