//! kl27-vm: the KL27 virtual CPU core.
//!
//! This crate provides:
//! - A loader for the K27 binary container
//! - A 16 MiB byte-addressable memory unit with big-endian accessors
//! - The fetch-execute interpreter with its bounded stack and register file
//! - Bounded diagnostic rings (recent instructions and side-effects) for an
//!   external front-end to poll
//!
//! The core is single-threaded and synchronous. A front-end drives it
//! through `Cpu::load` / `reset` / `step` / `run_until_idle` / `halt` and
//! reads everything else back by value.

pub mod cpu;
pub mod decode;
pub mod error;
pub mod k27;
pub mod mmu;
pub mod register;
pub mod trace;

pub use cpu::{Cpu, CpuSnapshot, State, StepResult};
pub use decode::Instruction;
pub use error::VmError;
pub use k27::K27Loader;
pub use mmu::Mmu;
pub use register::Register;
pub use trace::{DiagRing, TraceEvent};
