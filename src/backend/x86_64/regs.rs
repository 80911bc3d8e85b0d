//! x86-64 Register File
//!
//! Physical register ids used in machine-IR operands. `Return` is a
//! synthetic placeholder marking values that must end up in the ABI
//! return register; register allocation replaces it with the real one.

use std::fmt;

/// x86-64 registers, plus the pre-RA `Return` placeholder
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RegisterId {
    Rax = 1,
    Rbx,
    Rcx,
    Rdx,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    Rip,
    /// Synthetic: "whatever the return register is"
    Return,
}

impl RegisterId {
    pub fn from_u32(value: u32) -> Option<RegisterId> {
        use RegisterId::*;
        const TABLE: &[RegisterId] = &[
            Rax, Rbx, Rcx, Rdx, R8, R9, R10, R11, R12, R13, R14, R15, Rdi, Rsi, Rbp, Rsp, Rip,
            Return,
        ];
        if value == 0 {
            return None;
        }
        TABLE.get(value as usize - 1).copied()
    }

    /// The encoding used in ModR/M and SIB bytes
    pub fn encoding(self) -> u8 {
        match self {
            RegisterId::Rax => 0,
            RegisterId::Rcx => 1,
            RegisterId::Rdx => 2,
            RegisterId::Rbx => 3,
            RegisterId::Rsp => 4,
            RegisterId::Rbp => 5,
            RegisterId::Rsi => 6,
            RegisterId::Rdi => 7,
            RegisterId::R8 => 8,
            RegisterId::R9 => 9,
            RegisterId::R10 => 10,
            RegisterId::R11 => 11,
            RegisterId::R12 => 12,
            RegisterId::R13 => 13,
            RegisterId::R14 => 14,
            RegisterId::R15 => 15,
            RegisterId::Rip | RegisterId::Return => {
                crate::ice!("register {:?} has no hardware encoding", self)
            }
        }
    }

    /// Whether the register needs a REX extension bit
    pub fn needs_rex(self) -> bool {
        self.encoding() >= 8
    }

    /// Low three encoding bits
    pub fn reg3(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Spelling at a given access width
    pub fn name(self, bits: u16) -> &'static str {
        use RegisterId::*;
        let bits = if bits == 0 { 64 } else { bits };
        match (self, bits) {
            (Rax, 64) => "rax",
            (Rax, 32) => "eax",
            (Rax, 16) => "ax",
            (Rax, 8) => "al",
            (Rbx, 64) => "rbx",
            (Rbx, 32) => "ebx",
            (Rbx, 16) => "bx",
            (Rbx, 8) => "bl",
            (Rcx, 64) => "rcx",
            (Rcx, 32) => "ecx",
            (Rcx, 16) => "cx",
            (Rcx, 8) => "cl",
            (Rdx, 64) => "rdx",
            (Rdx, 32) => "edx",
            (Rdx, 16) => "dx",
            (Rdx, 8) => "dl",
            (R8, 64) => "r8",
            (R8, 32) => "r8d",
            (R8, 16) => "r8w",
            (R8, 8) => "r8b",
            (R9, 64) => "r9",
            (R9, 32) => "r9d",
            (R9, 16) => "r9w",
            (R9, 8) => "r9b",
            (R10, 64) => "r10",
            (R10, 32) => "r10d",
            (R10, 16) => "r10w",
            (R10, 8) => "r10b",
            (R11, 64) => "r11",
            (R11, 32) => "r11d",
            (R11, 16) => "r11w",
            (R11, 8) => "r11b",
            (R12, 64) => "r12",
            (R12, 32) => "r12d",
            (R12, 16) => "r12w",
            (R12, 8) => "r12b",
            (R13, 64) => "r13",
            (R13, 32) => "r13d",
            (R13, 16) => "r13w",
            (R13, 8) => "r13b",
            (R14, 64) => "r14",
            (R14, 32) => "r14d",
            (R14, 16) => "r14w",
            (R14, 8) => "r14b",
            (R15, 64) => "r15",
            (R15, 32) => "r15d",
            (R15, 16) => "r15w",
            (R15, 8) => "r15b",
            (Rdi, 64) => "rdi",
            (Rdi, 32) => "edi",
            (Rdi, 16) => "di",
            (Rdi, 8) => "dil",
            (Rsi, 64) => "rsi",
            (Rsi, 32) => "esi",
            (Rsi, 16) => "si",
            (Rsi, 8) => "sil",
            (Rbp, 64) => "rbp",
            (Rbp, 32) => "ebp",
            (Rbp, 16) => "bp",
            (Rsp, 64) => "rsp",
            (Rsp, 32) => "esp",
            (Rsp, 16) => "sp",
            (Rip, 64) => "rip",
            (Rip, 32) => "eip",
            (Rip, 16) => "ip",
            (Return, _) => "x86_64.RETURN",
            (reg, bits) => crate::ice!("register {:?} has no {}-bit name", reg, bits),
        }
    }

    /// Argument registers for the sysv C convention, in order
    pub const SYSV_ARGS: &'static [RegisterId] = &[
        RegisterId::Rdi,
        RegisterId::Rsi,
        RegisterId::Rdx,
        RegisterId::Rcx,
        RegisterId::R8,
        RegisterId::R9,
    ];

    /// Argument registers for the win64 convention, in order
    pub const WIN64_ARGS: &'static [RegisterId] = &[
        RegisterId::Rcx,
        RegisterId::Rdx,
        RegisterId::R8,
        RegisterId::R9,
    ];
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name(64))
    }
}
