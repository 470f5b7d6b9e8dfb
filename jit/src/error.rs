use std::fmt;
use std::io;

/// Errors produced while translating or installing a program.
#[derive(Debug)]
pub enum Error {
    /// Compilation was requested before any code was loaded.
    NotLoaded,
    /// The program exceeds the instruction count limit.
    TooManyInsts(usize),
    /// The translator met an opcode byte it cannot lower.
    UnknownOpcode { pc: usize, opcode: u8 },
    /// An `LDDW` in the last slot has no second half.
    TruncatedLddw { pc: usize },
    /// A `CALL` names a helper slot with no registered function.
    UnresolvedCall { pc: usize, imm: i32 },
    /// Helper registration outside the slot table.
    ExtFuncOutOfRange(usize),
    /// The executable mapping could not be created.
    Map(io::Error),
    /// The mapping could not be flipped to read-execute.
    Protect(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLoaded => {
                write!(f, "code has not been loaded into this VM")
            }
            Self::TooManyInsts(n) => {
                write!(f, "too many instructions: {n}")
            }
            Self::UnknownOpcode { pc, opcode } => {
                write!(f, "unknown instruction at PC {pc}: opcode {opcode:#04x}")
            }
            Self::TruncatedLddw { pc } => {
                write!(f, "lddw at PC {pc} is missing its second slot")
            }
            Self::UnresolvedCall { pc, imm } => {
                write!(f, "call at PC {pc} references unregistered function {imm}")
            }
            Self::ExtFuncOutOfRange(idx) => {
                write!(f, "external function index {idx} out of range")
            }
            Self::Map(e) => write!(f, "mmap failed: {e}"),
            Self::Protect(e) => write!(f, "mprotect failed: {e}"),
        }
    }
}

impl std::error::Error for Error {}
