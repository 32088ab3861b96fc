//! The KL27 CPU: register file, stack, state machine and interpreter.
//!
//! # Execution model
//!
//! The CPU is single-threaded and synchronous; `step` is atomic from the
//! caller's perspective. A step increments the cycle counter, fetches the
//! 4-byte instruction at PC, advances PC *before* dispatch, logs the
//! instruction, and dispatches on the opcode. Runtime faults do not
//! propagate out of `step`: the dispatch helper returns `Err` to shorten
//! the cycle, `step` converts that into the `errored` state (recording
//! `last_error` and a sentinel log entry) and returns `Ok`. The only error
//! `step` surfaces directly is `BadState`.
//!
//! # Registers
//!
//! Eight 16-bit general registers `R0..R7`, then three 32-bit specials:
//! MAR (8), MVR (9) and PC (10). All are readable by index; PC is
//! write-protected. `R7` doubles as the link register for `jmpr`/`ret`.

use crate::decode::{opcode, Instruction};
use crate::error::VmError;
use crate::k27::K27Loader;
use crate::mmu::{Mmu, CODE_BASE};
use crate::register::Register;
use crate::trace::{DiagRing, TraceEvent, INSTR_LOG_CAP, TRACE_LOG_CAP};
use log::error;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Index of the memory address register.
pub const REG_MAR: u16 = 8;
/// Index of the memory value register.
pub const REG_MVR: u16 = 9;
/// Index of the program counter.
pub const REG_PC: u16 = 10;

/// Link register written by `jmpr` and consumed by `ret`.
const LINK_REG: u16 = 7;

/// Width and writability per register index: R0..R7, MAR, MVR, PC.
const REG_LAYOUT: [(u32, bool); 11] = [
    (16, true),
    (16, true),
    (16, true),
    (16, true),
    (16, true),
    (16, true),
    (16, true),
    (16, true),
    (32, true),
    (32, true),
    (32, false),
];

/// CPU execution state. `Errored` is terminal until `reset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Halted,
    Running,
    Debugging,
    Errored,
}

/// Outcome of a single `step`.
///
/// `instruction` is `None` only when the fetch itself faulted. `faulted`
/// reports whether this step left the CPU in `Errored`.
#[derive(Clone, Copy, Debug)]
pub struct StepResult {
    pub instruction: Option<Instruction>,
    pub faulted: bool,
}

/// By-value view of the CPU for a polling front-end.
#[derive(Clone, Debug, Serialize)]
pub struct CpuSnapshot {
    pub registers: [i32; 8],
    pub mar: i32,
    pub mvr: i32,
    pub pc: u32,
    pub stack: Vec<i32>,
    pub state: State,
    pub cycle_count: u64,
    pub last_error: Option<String>,
}

/// The virtual CPU. Owns its MMU, registers, stack and diagnostics.
pub struct Cpu {
    image: Vec<u8>,
    loader: K27Loader,
    mmu: Mmu,
    regs: [Register; 10],
    pc: u32,
    stack: Vec<i32>,
    stack_capacity: usize,
    state: State,
    cycle_count: u64,
    instr_log: DiagRing<Instruction>,
    trace_log: DiagRing<TraceEvent>,
    last_error: Option<String>,
}

impl Cpu {
    /// Construct a CPU from a K27 image and install it.
    ///
    /// The raw bytes are retained so `reset` can re-parse and reinstall
    /// without going back to the byte source.
    pub fn new(image: Vec<u8>) -> Result<Self, VmError> {
        let loader = K27Loader::parse(&image)?;

        let mut regs = [Register::new(REG_LAYOUT[0].0)?; 10];
        for (i, reg) in regs.iter_mut().enumerate() {
            *reg = Register::new(REG_LAYOUT[i].0)?;
        }

        let capacity = loader.stack_size() as usize;
        let mut cpu = Self {
            image,
            loader,
            mmu: Mmu::new(),
            regs,
            pc: 0,
            stack: Vec::with_capacity(capacity),
            stack_capacity: capacity,
            state: State::Halted,
            cycle_count: 0,
            instr_log: DiagRing::new(INSTR_LOG_CAP),
            trace_log: DiagRing::new(TRACE_LOG_CAP),
            last_error: None,
        };
        cpu.pc = cpu.loader.install(&mut cpu.mmu)?;
        Ok(cpu)
    }

    /// Read a K27 file and construct a CPU from it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VmError> {
        Self::new(std::fs::read(path)?)
    }

    /// Re-parse the image, zero memory, reinstall, and return to `Halted`
    /// with empty stack, cleared diagnostics and PC at the entry point.
    pub fn reset(&mut self) -> Result<(), VmError> {
        self.loader = K27Loader::parse(&self.image)?;
        self.mmu.clear();
        self.stack.clear();
        self.stack_capacity = self.loader.stack_size() as usize;
        for reg in &mut self.regs {
            reg.clear();
        }
        self.cycle_count = 0;
        self.instr_log.clear();
        self.trace_log.clear();
        self.last_error = None;
        self.state = State::Halted;
        self.pc = self.loader.install(&mut self.mmu)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_running(&mut self) {
        if self.state == State::Halted {
            self.state = State::Running;
        }
    }

    pub fn set_halted(&mut self) {
        if matches!(self.state, State::Running | State::Debugging) {
            self.state = State::Halted;
        }
    }

    /// Alias for `set_halted`, matching the front-end command surface.
    pub fn halt(&mut self) {
        self.set_halted();
    }

    pub fn set_debugging(&mut self) {
        if matches!(self.state, State::Halted | State::Running) {
            self.state = State::Debugging;
        }
    }

    /// Swap between halted and non-halted. Debugging counts as
    /// non-halted, so toggling it lands on `Halted`.
    pub fn toggle(&mut self) {
        match self.state {
            State::Halted => self.state = State::Running,
            State::Running | State::Debugging => self.state = State::Halted,
            State::Errored => {}
        }
    }

    /// Transition to `Errored`: record the message and append the
    /// sentinel entry for the instruction at `at`.
    fn raise(&mut self, at: u32, err: VmError) {
        let msg = err.to_string();
        error!("cpu errored at {at:#09x}: {msg}");
        self.instr_log.push(Instruction::sentinel(at));
        self.last_error = Some(msg);
        self.state = State::Errored;
    }

    // ------------------------------------------------------------------
    // Fetch-execute
    // ------------------------------------------------------------------

    /// Execute one instruction.
    ///
    /// # Errors
    /// `BadState` unless the CPU is `Running` or `Debugging`. Runtime
    /// faults are caught and reported through the state machine instead.
    pub fn step(&mut self) -> Result<StepResult, VmError> {
        if !matches!(self.state, State::Running | State::Debugging) {
            return Err(VmError::BadState);
        }

        self.cycle_count += 1;
        let at = self.pc;

        let instr = match self.mmu.fetch(at) {
            Ok(instr) => instr,
            Err(err) => {
                self.raise(at, err);
                return Ok(StepResult {
                    instruction: None,
                    faulted: true,
                });
            }
        };

        // PC points at the next instruction before dispatch runs, so
        // jumps overwrite it and everything else falls through.
        self.pc = at.wrapping_add(4);
        self.instr_log.push(instr);

        if let Err(err) = self.dispatch(instr) {
            self.raise(at, err);
        }

        Ok(StepResult {
            instruction: Some(instr),
            faulted: self.state == State::Errored,
        })
    }

    /// Drive `step` until the state leaves `Running`.
    ///
    /// Termination comes from the program itself (`hlt`) or an error
    /// transition; a front-end that wants to interrupt drives `step`
    /// directly instead.
    pub fn run_until_idle(&mut self) -> Result<(), VmError> {
        while self.state == State::Running {
            self.step()?;
        }
        Ok(())
    }

    fn dispatch(&mut self, instr: Instruction) -> Result<(), VmError> {
        let at = instr.address;
        match instr.opcode {
            opcode::NOP => {}
            opcode::HLT => self.set_halted(),
            opcode::SL => self.push_val(instr.operand as i32)?,
            opcode::SPOP => {
                for _ in 0..instr.operand {
                    self.stack.pop().ok_or(VmError::Underflow)?;
                }
                if instr.operand > 0 {
                    self.trace_log.push(TraceEvent::Pop {
                        count: instr.operand,
                    });
                }
            }
            opcode::LLBL => {
                let offset = self.label_lookup(instr.operand)?;
                self.push_val(offset as i32)?;
            }
            opcode::RGW => {
                let value = self.pop_val()?;
                self.reg_write(instr.operand, value)?;
            }
            opcode::RGR => {
                let value = self.reg_read(instr.operand)?;
                self.push_val(value)?;
            }
            opcode::JMPL => {
                let target = jump_target(self.label_lookup(instr.operand)?);
                self.jump(at, target);
            }
            opcode::JMPR => {
                let link = self.pc as i32;
                self.reg_write(LINK_REG, link)?;
                let target = jump_target(self.label_lookup(instr.operand)?);
                self.jump(at, target);
            }
            opcode::RET => {
                let target = jump_target(self.reg_read(LINK_REG)? as u32);
                self.jump(at, target);
            }
            opcode::JMPA => {
                let target = jump_target(self.pop_val()? as u32);
                self.jump(at, target);
            }
            opcode::ADD | opcode::SUB | opcode::MUL | opcode::DIV => {
                self.arith(instr.opcode, instr.operand)?;
            }
            other => {
                // Unknown opcodes leave the CPU errored but do not abort
                // the cycle; there is nothing after dispatch to skip.
                self.raise(at, VmError::UnknownOpcode { opcode: other });
            }
        }
        Ok(())
    }

    /// Arithmetic ops share one shape: the right-hand side is the
    /// sign-extended immediate, or the top of the stack when the operand
    /// is zero; the left-hand side is the next pop.
    fn arith(&mut self, op: u16, operand: u16) -> Result<(), VmError> {
        let rhs = if operand == 0 {
            self.pop_val()?
        } else {
            operand as i16 as i32
        };
        let lhs = self.pop_val()?;

        let result = match op {
            opcode::ADD => lhs.wrapping_add(rhs),
            opcode::SUB => lhs.wrapping_sub(rhs),
            opcode::MUL => lhs.wrapping_mul(rhs),
            opcode::DIV => {
                if rhs == 0 {
                    return Err(VmError::DivideByZero);
                }
                lhs.wrapping_div(rhs)
            }
            _ => return Err(VmError::UnknownOpcode { opcode: op }),
        };
        self.push_val(result)
    }

    // ------------------------------------------------------------------
    // Traced primitive operations
    // ------------------------------------------------------------------

    fn push_val(&mut self, value: i32) -> Result<(), VmError> {
        if self.stack.len() == self.stack_capacity {
            return Err(VmError::Overflow);
        }
        self.stack.push(value);
        self.trace_log.push(TraceEvent::Push { value });
        Ok(())
    }

    fn pop_val(&mut self) -> Result<i32, VmError> {
        let value = self.stack.pop().ok_or(VmError::Underflow)?;
        self.trace_log.push(TraceEvent::Pop { count: 1 });
        Ok(value)
    }

    fn reg_read(&mut self, index: u16) -> Result<i32, VmError> {
        if index as usize >= REG_LAYOUT.len() {
            return Err(VmError::BadRegister { index });
        }
        let value = if index == REG_PC {
            self.pc as i32
        } else {
            self.regs[index as usize].read()
        };
        self.trace_log.push(TraceEvent::RegRead { index });
        Ok(value)
    }

    fn reg_write(&mut self, index: u16, value: i32) -> Result<(), VmError> {
        let (_, writable) = *REG_LAYOUT
            .get(index as usize)
            .ok_or(VmError::BadRegister { index })?;
        if !writable {
            return Err(VmError::Protected { index });
        }
        self.regs[index as usize].write(value);
        self.trace_log.push(TraceEvent::RegWrite { index, value });
        Ok(())
    }

    fn label_lookup(&mut self, id: u16) -> Result<u32, VmError> {
        let offset = self.mmu.label_offset(id)?;
        self.trace_log.push(TraceEvent::MemRead {
            addr: Mmu::label_slot(id) + 2,
        });
        Ok(offset)
    }

    fn jump(&mut self, from: u32, to: u32) {
        self.trace_log.push(TraceEvent::Jump { from, to });
        self.pc = to;
    }

    // ------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------

    /// The eight general registers, sign-extended to their width.
    pub fn registers(&self) -> [i32; 8] {
        let mut out = [0; 8];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.regs[i].read();
        }
        out
    }

    pub fn mar(&self) -> i32 {
        self.regs[REG_MAR as usize].read()
    }

    pub fn mvr(&self) -> i32 {
        self.regs[REG_MVR as usize].read()
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// The stack, bottom first.
    pub fn stack(&self) -> Vec<i32> {
        self.stack.clone()
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack_capacity
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Recent decoded instructions, oldest first. Errored cycles appear
    /// as the `0xFFFF` sentinel.
    pub fn instruction_log(&self) -> Vec<Instruction> {
        self.instr_log.snapshot()
    }

    /// Recent side-effect events, oldest first.
    pub fn trace_log(&self) -> Vec<TraceEvent> {
        self.trace_log.snapshot()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Header fields of the loaded file.
    pub fn loader(&self) -> &K27Loader {
        &self.loader
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            registers: self.registers(),
            mar: self.mar(),
            mvr: self.mvr(),
            pc: self.pc,
            stack: self.stack.clone(),
            state: self.state,
            cycle_count: self.cycle_count,
            last_error: self.last_error.clone(),
        }
    }
}

/// Clamp a jump destination into the program region: anything below
/// `CODE_BASE` is a label-relative offset and gets biased up.
#[inline]
pub fn jump_target(addr: u32) -> u32 {
    if addr < CODE_BASE {
        addr + CODE_BASE
    } else {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k27::{build_test_k27, pack_label_table};

    fn program(words: &[(u16, u16)]) -> Vec<u8> {
        words
            .iter()
            .flat_map(|&(op, operand)| {
                let mut w = op.to_be_bytes().to_vec();
                w.extend_from_slice(&operand.to_be_bytes());
                w
            })
            .collect()
    }

    fn boot_with(words: &[(u16, u16)], stack_size: u8, labels: &[(u16, u32)]) -> Cpu {
        let (count, table) = pack_label_table(labels);
        let image = build_test_k27(0, stack_size, count, &table, &program(words), false);
        let mut cpu = Cpu::new(image).unwrap();
        cpu.set_running();
        cpu
    }

    fn boot(words: &[(u16, u16)]) -> Cpu {
        boot_with(words, 16, &[])
    }

    #[test]
    fn test_nop_then_halt() {
        let mut cpu = boot(&[(opcode::NOP, 0), (opcode::HLT, 0)]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.cycle_count(), 2);
        assert_eq!(cpu.state(), State::Halted);
        assert!(cpu.trace_log().is_empty());
        assert_eq!(cpu.pc(), CODE_BASE + 8);
    }

    #[test]
    fn test_push_and_spop() {
        let mut cpu = boot(&[(opcode::SL, 7), (opcode::SPOP, 1), (opcode::HLT, 0)]);
        cpu.step().unwrap();
        assert_eq!(cpu.stack(), vec![7]);
        assert_eq!(cpu.trace_log().last(), Some(&TraceEvent::Push { value: 7 }));

        cpu.step().unwrap();
        assert!(cpu.stack().is_empty());
        assert_eq!(cpu.trace_log().last(), Some(&TraceEvent::Pop { count: 1 }));
    }

    #[test]
    fn test_spop_many_is_one_event() {
        let mut cpu = boot(&[
            (opcode::SL, 1),
            (opcode::SL, 2),
            (opcode::SL, 3),
            (opcode::SPOP, 3),
            (opcode::HLT, 0),
        ]);
        cpu.run_until_idle().unwrap();
        assert!(cpu.stack().is_empty());
        let trace = cpu.trace_log();
        assert_eq!(trace.last(), Some(&TraceEvent::Pop { count: 3 }));
        // Three pushes, one aggregated pop.
        assert_eq!(trace.len(), 4);
    }

    #[test]
    fn test_spop_underflow() {
        let mut cpu = boot(&[(opcode::SPOP, 2)]);
        let result = cpu.step().unwrap();
        assert!(result.faulted);
        assert_eq!(cpu.state(), State::Errored);
        assert_eq!(cpu.last_error(), Some("Stack underflow"));
    }

    #[test]
    fn test_stack_overflow_sentinel() {
        let words: Vec<(u16, u16)> = std::iter::repeat((opcode::SL, 1)).take(5).collect();
        let mut cpu = boot_with(&words, 4, &[]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.state(), State::Errored);
        assert_eq!(cpu.last_error(), Some("Stack overflow"));
        let log = cpu.instruction_log();
        assert!(log.last().unwrap().is_sentinel());
        // Four pushes landed before the fifth overflowed.
        assert_eq!(cpu.stack().len(), 4);
    }

    #[test]
    fn test_add_immediate_sign_extends() {
        // 0xFFFF sign-extends to -1.
        let mut cpu = boot(&[(opcode::SL, 10), (opcode::ADD, 0xFFFF), (opcode::HLT, 0)]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.stack(), vec![9]);
    }

    #[test]
    fn test_add_from_stack() {
        let mut cpu = boot(&[
            (opcode::SL, 3),
            (opcode::SL, 4),
            (opcode::ADD, 0),
            (opcode::HLT, 0),
        ]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.stack(), vec![7]);
    }

    #[test]
    fn test_sub_operand_order() {
        // rhs comes off the top, lhs is the next pop: 10 - 4.
        let mut cpu = boot(&[
            (opcode::SL, 10),
            (opcode::SL, 4),
            (opcode::SUB, 0),
            (opcode::HLT, 0),
        ]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.stack(), vec![6]);
    }

    #[test]
    fn test_mul_wraps() {
        let mut cpu = boot(&[
            (opcode::SL, 0x7FFF),
            (opcode::MUL, 0x7FFF),
            (opcode::MUL, 0x7FFF),
            (opcode::MUL, 0x7FFF),
            (opcode::HLT, 0),
        ]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.state(), State::Halted);
        let expected = 32767i32
            .wrapping_mul(32767)
            .wrapping_mul(32767)
            .wrapping_mul(32767);
        assert_eq!(cpu.stack(), vec![expected]);
    }

    #[test]
    fn test_divide() {
        let mut cpu = boot(&[(opcode::SL, 100), (opcode::DIV, 7), (opcode::HLT, 0)]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.stack(), vec![14]);
    }

    #[test]
    fn test_divide_by_zero() {
        let mut cpu = boot(&[(opcode::SL, 10), (opcode::SL, 0), (opcode::DIV, 0)]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.state(), State::Errored);
        assert!(cpu.last_error().unwrap().contains("divide"));
    }

    #[test]
    fn test_unknown_opcode_advances_pc() {
        let mut cpu = boot(&[(0xFE, 0)]);
        let result = cpu.step().unwrap();
        assert!(result.faulted);
        assert_eq!(cpu.state(), State::Errored);
        assert_eq!(cpu.pc(), CODE_BASE + 4);
        assert_eq!(cpu.last_error(), Some("Unknown opcode 0xFE"));
        assert!(cpu.instruction_log().last().unwrap().is_sentinel());
    }

    #[test]
    fn test_reserved_opcode_high_byte() {
        // 0x0100 is not nop: the high byte is reserved.
        let mut cpu = boot(&[(0x0100, 0)]);
        cpu.step().unwrap();
        assert_eq!(cpu.state(), State::Errored);
    }

    #[test]
    fn test_register_write_read_sign_extends() {
        let mut cpu = boot(&[
            (opcode::SL, 0x8000),
            (opcode::RGW, 2),
            (opcode::RGR, 2),
            (opcode::HLT, 0),
        ]);
        cpu.run_until_idle().unwrap();
        // The 16-bit register sign-extends bit 15 on read.
        assert_eq!(cpu.stack(), vec![-32768]);
        assert_eq!(cpu.registers()[2], -32768);
        let trace = cpu.trace_log();
        assert!(trace.contains(&TraceEvent::RegWrite {
            index: 2,
            value: 0x8000
        }));
        assert!(trace.contains(&TraceEvent::RegRead { index: 2 }));
    }

    #[test]
    fn test_pc_read_through_rgr() {
        let mut cpu = boot(&[(opcode::RGR, REG_PC), (opcode::HLT, 0)]);
        cpu.step().unwrap();
        // PC was already advanced past the rgr when it was read.
        assert_eq!(cpu.stack(), vec![(CODE_BASE + 4) as i32]);
    }

    #[test]
    fn test_pc_write_protected() {
        let mut cpu = boot(&[(opcode::SL, 0), (opcode::RGW, REG_PC)]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.state(), State::Errored);
        assert_eq!(cpu.last_error(), Some("Register 10 is write-protected"));
    }

    #[test]
    fn test_bad_register_index() {
        let mut cpu = boot(&[(opcode::RGR, 11)]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.state(), State::Errored);
        assert_eq!(cpu.last_error(), Some("Bad register index 11"));
    }

    #[test]
    fn test_mar_mvr_are_32_bit() {
        let mut cpu = boot(&[
            (opcode::SL, 0x7FFF),
            (opcode::MUL, 0x7FFF),
            (opcode::RGW, REG_MAR),
            (opcode::RGR, REG_MAR),
            (opcode::HLT, 0),
        ]);
        cpu.run_until_idle().unwrap();
        // A 32-bit special register holds the full product.
        assert_eq!(cpu.stack(), vec![32767 * 32767]);
        assert_eq!(cpu.mar(), 32767 * 32767);
    }

    #[test]
    fn test_llbl_pushes_offset() {
        let mut cpu = boot_with(
            &[(opcode::LLBL, 1), (opcode::HLT, 0)],
            16,
            &[(0, 0), (1, 0x40)],
        );
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.stack(), vec![0x40]);
        let trace = cpu.trace_log();
        // The table read is traced before the push.
        assert_eq!(trace[trace.len() - 2], TraceEvent::MemRead { addr: 0x108 });
    }

    #[test]
    fn test_jmpl_biases_short_offsets() {
        // Label 3 at raw offset 0x20 resolves to 0x1020; the landing pad
        // there halts.
        let mut body = program(&[(opcode::JMPL, 3)]);
        body.resize(0x20, 0);
        body.extend_from_slice(&program(&[(opcode::HLT, 0)]));
        let (count, table) = pack_label_table(&[(0, 0), (1, 4), (2, 8), (3, 0x20)]);
        let image = build_test_k27(0, 16, count, &table, &body, false);
        let mut cpu = Cpu::new(image).unwrap();
        cpu.set_running();

        cpu.step().unwrap();
        assert_eq!(cpu.pc(), 0x1020);
        assert_eq!(
            cpu.trace_log().last(),
            Some(&TraceEvent::Jump {
                from: CODE_BASE,
                to: 0x1020
            })
        );
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.state(), State::Halted);
    }

    #[test]
    fn test_jmpr_and_ret() {
        // jmpr to label 0 (offset 0x10), the target returns, and the main
        // path halts.
        let mut body = program(&[(opcode::JMPR, 0), (opcode::HLT, 0)]);
        body.resize(0x10, 0);
        body.extend_from_slice(&program(&[(opcode::NOP, 0), (opcode::RET, 0)]));
        let (count, table) = pack_label_table(&[(0, 0x10)]);
        let image = build_test_k27(0, 16, count, &table, &body, false);
        let mut cpu = Cpu::new(image).unwrap();
        cpu.set_running();

        cpu.step().unwrap();
        assert_eq!(cpu.pc(), 0x1010);
        // R7 links to the instruction after the jmpr.
        assert_eq!(cpu.registers()[7], (CODE_BASE + 4) as i32);

        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.state(), State::Halted);
        let jumps: Vec<_> = cpu
            .trace_log()
            .into_iter()
            .filter(|e| matches!(e, TraceEvent::Jump { .. }))
            .collect();
        assert_eq!(jumps.len(), 2);
        assert_eq!(
            jumps[1],
            TraceEvent::Jump {
                from: 0x1014,
                to: CODE_BASE + 4
            }
        );
    }

    #[test]
    fn test_jmpa_from_stack() {
        let mut body = program(&[(opcode::SL, 0x0C), (opcode::JMPA, 0)]);
        body.resize(0x0C, 0);
        body.extend_from_slice(&program(&[(opcode::HLT, 0)]));
        let image = build_test_k27(0, 16, 0, &[], &body, false);
        let mut cpu = Cpu::new(image).unwrap();
        cpu.set_running();
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.state(), State::Halted);
        assert_eq!(cpu.pc(), 0x1010);
    }

    #[test]
    fn test_step_requires_running_or_debugging() {
        let mut cpu = boot(&[(opcode::NOP, 0)]);
        cpu.set_halted();
        assert!(matches!(cpu.step(), Err(VmError::BadState)));

        cpu.set_debugging();
        assert!(cpu.step().is_ok());
    }

    #[test]
    fn test_toggle() {
        let mut cpu = boot(&[(opcode::NOP, 0)]);
        assert_eq!(cpu.state(), State::Running);
        cpu.toggle();
        assert_eq!(cpu.state(), State::Halted);
        cpu.toggle();
        assert_eq!(cpu.state(), State::Running);
        cpu.set_debugging();
        cpu.toggle();
        assert_eq!(cpu.state(), State::Halted);
    }

    #[test]
    fn test_errored_is_terminal_until_reset() {
        let mut cpu = boot(&[(0xFE, 0)]);
        cpu.step().unwrap();
        assert_eq!(cpu.state(), State::Errored);

        cpu.set_running();
        cpu.set_debugging();
        cpu.toggle();
        assert_eq!(cpu.state(), State::Errored);
        assert!(matches!(cpu.step(), Err(VmError::BadState)));

        cpu.reset().unwrap();
        assert_eq!(cpu.state(), State::Halted);
        assert_eq!(cpu.cycle_count(), 0);
        assert!(cpu.last_error().is_none());
        assert!(cpu.instruction_log().is_empty());
        assert_eq!(cpu.pc(), CODE_BASE);
    }

    #[test]
    fn test_reset_restores_program() {
        let mut cpu = boot(&[(opcode::SL, 5), (opcode::HLT, 0)]);
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.stack(), vec![5]);

        cpu.reset().unwrap();
        assert!(cpu.stack().is_empty());
        cpu.set_running();
        cpu.run_until_idle().unwrap();
        assert_eq!(cpu.stack(), vec![5]);
        assert_eq!(cpu.cycle_count(), 2);
    }

    #[test]
    fn test_instruction_log_capacity() {
        let words: Vec<(u16, u16)> = std::iter::repeat((opcode::NOP, 0))
            .take(30)
            .chain(std::iter::once((opcode::HLT, 0)))
            .collect();
        let mut cpu = boot(&words);
        cpu.run_until_idle().unwrap();
        let log = cpu.instruction_log();
        assert_eq!(log.len(), INSTR_LOG_CAP);
        // Oldest entries were discarded; the tail is the hlt.
        assert_eq!(log.last().unwrap().opcode, opcode::HLT);
        assert_eq!(log[0].address, CODE_BASE + 4 * 11);
    }

    #[test]
    fn test_snapshot() {
        let mut cpu = boot(&[(opcode::SL, 9), (opcode::HLT, 0)]);
        cpu.run_until_idle().unwrap();
        let snap = cpu.snapshot();
        assert_eq!(snap.state, State::Halted);
        assert_eq!(snap.stack, vec![9]);
        assert_eq!(snap.cycle_count, 2);
        assert_eq!(snap.pc, CODE_BASE + 8);
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn test_fetch_fault_errors_cpu() {
        // An empty body with entry pointing at the very end of memory:
        // the first fetch straddles the boundary.
        let image = build_test_k27(crate::mmu::MEM_SIZE - CODE_BASE - 2, 8, 0, &[], &[], false);
        let mut cpu = Cpu::new(image).unwrap();
        cpu.set_running();
        let result = cpu.step().unwrap();
        assert!(result.faulted);
        assert!(result.instruction.is_none());
        assert_eq!(cpu.state(), State::Errored);
        assert!(cpu.last_error().unwrap().contains("Memory fault"));
    }
}
