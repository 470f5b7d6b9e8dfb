//! x86-64 translation backend: register mapping, instruction encoding,
//! and the per-opcode lowering driver.

pub mod emit;
pub mod regs;
pub mod translate;

pub use regs::{Abi, Reg, RegisterMap};
pub use translate::{resolve_jumps, translate, translate_program};

/// Staging buffer reservation. The verifier bounds program size; a
/// translation that outgrows this indicates a bug upstream.
pub const JIT_BUF_SIZE: usize = 65536;

/// Symbolic target of a pending displacement patch: a source program
/// counter or one of the two well-known labels emitted after the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The first byte emitted for a source pc.
    Pc(usize),
    /// The shared epilogue.
    Exit,
    /// The divide-by-zero trampoline.
    DivByZero,
}

/// A pending 32-bit displacement patch.
///
/// `offset_loc` addresses the disp32 field inside an already-emitted
/// jump; the resolver rewrites it once all byte offsets are known.
#[derive(Debug, Clone, Copy)]
pub struct Jump {
    pub offset_loc: usize,
    pub target: Target,
}

/// Per-compilation emission state. Owns the staging buffer, the source
/// pc to byte offset table, and the fixup list; exclusively owned by
/// one compilation.
pub struct JitState {
    pub buf: Vec<u8>,
    pub pc_locs: Vec<usize>,
    pub jumps: Vec<Jump>,
    pub exit_loc: usize,
    pub div_by_zero_loc: usize,
    pub abi: &'static Abi,
    pub regs: RegisterMap,
}

impl JitState {
    pub fn new(num_insts: usize, abi: &'static Abi, regs: RegisterMap) -> Self {
        Self {
            buf: Vec::with_capacity(JIT_BUF_SIZE),
            pc_locs: vec![0; num_insts + 1],
            jumps: Vec::new(),
            exit_loc: 0,
            div_by_zero_loc: 0,
            abi,
            regs,
        }
    }

    /// Current write offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    // -- Emit sinks --

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        self.buf.push(val);
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.buf.extend_from_slice(&val.to_le_bytes());
    }

    /// Overwrite four bytes at `loc` (jump resolution).
    #[inline]
    pub fn patch_u32(&mut self, loc: usize, val: u32) {
        self.buf[loc..loc + 4].copy_from_slice(&val.to_le_bytes());
    }

    /// Record a fixup for the displacement field about to be emitted
    /// and reserve its four bytes.
    pub fn register_jump(&mut self, target: Target) {
        self.jumps.push(Jump {
            offset_loc: self.offset(),
            target,
        });
        self.emit_u32(0);
    }
}
