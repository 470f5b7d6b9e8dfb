//! eBPF data model shared by the JIT backend and by embedders that
//! assemble programs directly: the instruction record, its wire format,
//! the opcode byte constants, and the ISA limits.

pub mod insn;
pub mod opcode;

pub use insn::Insn;

/// Maximum number of instructions in a loaded program.
pub const MAX_INSTS: usize = 65536;

/// Stack space reserved for an eBPF program, in bytes.
pub const STACK_SIZE: usize = 512;

/// Number of external helper function slots.
pub const MAX_EXT_FUNCS: usize = 64;
