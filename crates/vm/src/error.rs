//! VM errors.
//!
//! A single enum covers both loader failures (surfaced to the caller of
//! `load`/`reset`) and runtime faults (caught inside `step`, where the
//! Display string becomes the CPU's `last_error` text).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("Bad magic {found:02x?}, expected \"KL27\"")]
    BadMagic { found: [u8; 4] },

    #[error("Unsupported K27 version {version} (expected 1)")]
    BadVersion { version: u8 },

    #[error("Compressed body (LZMA) is not supported")]
    Unsupported,

    #[error("Malformed K27 file: {0}")]
    BadFile(String),

    #[error("Body checksum mismatch: header {expected:#010x}, body {computed:#010x}")]
    Checksum { expected: u32, computed: u32 },

    #[error("Memory fault at {addr:#09x}")]
    MemoryFault { addr: u32 },

    #[error("Stack overflow")]
    Overflow,

    #[error("Stack underflow")]
    Underflow,

    #[error("Bad register index {index}")]
    BadRegister { index: u16 },

    #[error("Register {index} is write-protected")]
    Protected { index: u16 },

    #[error("divide by zero")]
    DivideByZero,

    #[error("Unknown opcode {opcode:#04X}")]
    UnknownOpcode { opcode: u16 },

    #[error("CPU is not running or debugging")]
    BadState,

    #[error("Register width {width} out of range (1..=32)")]
    Config { width: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
