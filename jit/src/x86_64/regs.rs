//! Register numbering, calling-convention profiles, and the fixed
//! eBPF-to-host register map.

/// x86-64 general-purpose register indices.
///
/// Encoding matches the ModR/M and REX register numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding (for ModR/M).
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register requires a REX prefix (R8-R15).
    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }
}

/// Calling-convention profile for the generated code.
///
/// The two common x86-64 conventions differ in the non-volatile set
/// saved by the prologue and in the parameter register sequence used
/// for external calls and the divide-by-zero trampoline.
pub struct Abi {
    /// Registers the prologue saves and the epilogue restores, in
    /// push order.
    pub nonvolatile: &'static [Reg],
    /// Parameter registers in argument order.
    pub params: &'static [Reg],
    /// Stand-in for RCX while RCX is reserved for shift counts.
    pub rcx_alt: Reg,
}

/// System V AMD64 profile (Linux, macOS, BSDs).
pub const SYSTEM_V: Abi = Abi {
    nonvolatile: &[Reg::Rbp, Reg::Rbx, Reg::R13, Reg::R14, Reg::R15],
    params: &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
    rcx_alt: Reg::R9,
};

/// Windows x64 profile.
pub const WINDOWS_X64: Abi = Abi {
    nonvolatile: &[
        Reg::Rbp,
        Reg::Rbx,
        Reg::Rdi,
        Reg::Rsi,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ],
    params: &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
    rcx_alt: Reg::R10,
};

impl Abi {
    /// Profile of the build target.
    pub const fn host() -> &'static Abi {
        #[cfg(windows)]
        {
            &WINDOWS_X64
        }
        #[cfg(not(windows))]
        {
            &SYSTEM_V
        }
    }
}

pub const REGISTER_MAP_SIZE: usize = 11;

// eBPF r0..r10 onto host registers. Volatile eBPF registers land on
// ABI-volatile hosts and non-volatile on callee-saved, with r1 on the
// first parameter register and r10 on RBP. R12 never appears: its
// ModR/M encoding demands a SIB byte the encoder does not produce.
#[cfg(not(windows))]
const DEFAULT_MAP: [Reg; REGISTER_MAP_SIZE] = [
    Reg::Rax,
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rdx,
    Reg::R9,
    Reg::R8,
    Reg::Rbx,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::Rbp,
];
#[cfg(windows)]
const DEFAULT_MAP: [Reg; REGISTER_MAP_SIZE] = [
    Reg::Rax,
    Reg::R10,
    Reg::Rdx,
    Reg::R8,
    Reg::R9,
    Reg::R14,
    Reg::R15,
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rbx,
    Reg::Rbp,
];

/// Permutation assigning a host register to each eBPF register.
///
/// Owned by a single compilation. The reshuffling constructors exist
/// so test harnesses can exercise the translator over alternative
/// assignments; production callers use [`RegisterMap::host`].
#[derive(Debug, Clone, Copy)]
pub struct RegisterMap([Reg; REGISTER_MAP_SIZE]);

impl RegisterMap {
    /// The default assignment for the build target's ABI.
    pub const fn host() -> Self {
        Self(DEFAULT_MAP)
    }

    /// The default assignment rotated by `n` places.
    pub fn rotated(n: usize) -> Self {
        let mut map = DEFAULT_MAP;
        for (i, slot) in map.iter_mut().enumerate() {
            *slot = DEFAULT_MAP[(i + n) % REGISTER_MAP_SIZE];
        }
        Self(map)
    }

    /// The default assignment shuffled by a deterministic PRNG.
    pub fn shuffled(seed: u32) -> Self {
        let mut map = DEFAULT_MAP;
        let mut state = seed;
        for i in 0..REGISTER_MAP_SIZE - 1 {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            let j = i + (state >> 16) as usize % (REGISTER_MAP_SIZE - i);
            map.swap(i, j);
        }
        Self(map)
    }

    /// Host register for eBPF register `r`.
    #[inline]
    pub fn get(&self, r: u8) -> Reg {
        self.0[r as usize % REGISTER_MAP_SIZE]
    }
}
