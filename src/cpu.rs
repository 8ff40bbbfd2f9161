/*!
Small word-machine CPU: fetch/decode/execute, privileged-mode enforcement
and interrupt acceptance.

Interrupt protocol
- On acceptance the CPU writes its six registers (X, A, PC, error,
  complement, mode) to the interrupt frame at physical words 0..=5, loads
  the IRQ code into A, clears the live error register, enters supervisor
  mode and jumps to the trampoline at physical word 10.
- Word 10 holds `ENTER_KERNEL`; executing it surfaces a
  [`StepOutcome::KernelEntry`] carrying A (the IRQ code) so the machine can
  run the kernel dispatcher. Word 11 holds `RET_FROM_INTERRUPT`, which
  restores the frame and resumes whatever the kernel left there.
- A restored error register of `CpuHalted` stops the machine; that is how
  the kernel says "nothing left to run".

Errors raised by user code (illegal opcode, translation fault, privileged
instruction) do not stop the machine: the CPU records error + complement
and immediately accepts a `CpuErr` interrupt so the kernel can kill the
offending process. The same fault in supervisor mode means the trampoline
or the kernel-written frame is corrupt, and the CPU stops.

Memory accesses go through the MMU; user mode translates through the
current page table, supervisor mode is physical.
*/

use log::{trace, warn};

use crate::isa;
use crate::memory::{Memory, Word};
use crate::mmu::{Mmu, MmuError};

/// Interrupt-frame slots, in physical memory words 0..=5.
pub const IRQ_FRAME_X: Word = 0;
pub const IRQ_FRAME_A: Word = 1;
pub const IRQ_FRAME_PC: Word = 2;
pub const IRQ_FRAME_ERR: Word = 3;
pub const IRQ_FRAME_COMPL: Word = 4;
pub const IRQ_FRAME_MODE: Word = 5;

/// Trampoline addresses the kernel must populate at boot.
pub const TRAMPOLINE_ENTRY: Word = 10;
pub const TRAMPOLINE_RETURN: Word = 11;

/// Execution modes, as opaque machine words (never a Rust enum on the wire).
pub const MODE_SUPERVISOR: Word = 0;
pub const MODE_USER: Word = 1;

/// Interrupt causes, encoded into register A on kernel entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Irq {
    Reset,
    CpuErr,
    Syscall,
    Clock,
}

impl Irq {
    pub fn as_word(self) -> Word {
        match self {
            Irq::Reset => 0,
            Irq::CpuErr => 1,
            Irq::Syscall => 2,
            Irq::Clock => 3,
        }
    }

    pub fn from_word(w: Word) -> Option<Self> {
        match w {
            0 => Some(Irq::Reset),
            1 => Some(Irq::CpuErr),
            2 => Some(Irq::Syscall),
            3 => Some(Irq::Clock),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Irq::Reset => "reset",
            Irq::CpuErr => "cpu error",
            Irq::Syscall => "syscall",
            Irq::Clock => "clock",
        }
    }
}

/// CPU error register values, word-encoded for the interrupt frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuErr {
    Ok,
    /// Read back on interrupt-return, stops the machine.
    CpuHalted,
    InvalidInstruction,
    InvalidAddress,
    PrivilegedInstruction,
    /// Complement register carries the faulting virtual address.
    PageFault,
    DeviceError,
}

impl CpuErr {
    pub fn as_word(self) -> Word {
        match self {
            CpuErr::Ok => 0,
            CpuErr::CpuHalted => 1,
            CpuErr::InvalidInstruction => 2,
            CpuErr::InvalidAddress => 3,
            CpuErr::PrivilegedInstruction => 4,
            CpuErr::PageFault => 5,
            CpuErr::DeviceError => 6,
        }
    }

    pub fn from_word(w: Word) -> Option<Self> {
        match w {
            0 => Some(CpuErr::Ok),
            1 => Some(CpuErr::CpuHalted),
            2 => Some(CpuErr::InvalidInstruction),
            3 => Some(CpuErr::InvalidAddress),
            4 => Some(CpuErr::PrivilegedInstruction),
            5 => Some(CpuErr::PageFault),
            6 => Some(CpuErr::DeviceError),
            _ => None,
        }
    }

    /// Diagnostic name for a frame error word.
    pub fn name_of(w: Word) -> &'static str {
        match Self::from_word(w) {
            Some(CpuErr::Ok) => "ok",
            Some(CpuErr::CpuHalted) => "cpu halted",
            Some(CpuErr::InvalidInstruction) => "invalid instruction",
            Some(CpuErr::InvalidAddress) => "invalid address",
            Some(CpuErr::PrivilegedInstruction) => "privileged instruction",
            Some(CpuErr::PageFault) => "page fault",
            Some(CpuErr::DeviceError) => "device error",
            None => "unknown error",
        }
    }
}

/// Result of one [`Cpu::step`].
#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// One instruction retired, nothing for the machine owner to do.
    Executed,
    /// `ENTER_KERNEL` executed; payload is register A (the IRQ code).
    /// The owner must invoke the kernel dispatcher before stepping again.
    KernelEntry(Word),
    /// The CPU stopped (HALT in supervisor mode, halt error restored on
    /// interrupt-return, or a fault inside the kernel trampoline).
    Halted,
}

// Fault bundles the error register value with its complement (usually the
// offending address).
struct Fault {
    err: CpuErr,
    complement: Word,
}

impl From<MmuError> for Fault {
    fn from(e: MmuError) -> Self {
        let complement = e.addr();
        let err = match e {
            MmuError::Physical(_) => CpuErr::InvalidAddress,
            _ => CpuErr::PageFault,
        };
        Fault { err, complement }
    }
}

/// The processor. Registers are public the way the rest of the machine's
/// device state is; tests poke them directly.
#[derive(Debug)]
pub struct Cpu {
    pub x: Word,
    pub a: Word,
    pub pc: Word,
    pub err: CpuErr,
    pub complement: Word,
    pub mode: Word,
    halted: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    /// Power-up state: registers zeroed, supervisor mode, not halted.
    pub fn new() -> Self {
        Self {
            x: 0,
            a: 0,
            pc: 0,
            err: CpuErr::Ok,
            complement: 0,
            mode: MODE_SUPERVISOR,
            halted: false,
        }
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Stop the machine. Used by the owner when the kernel reports halt.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Accept an interrupt: save the register file into the frame, load the
    /// IRQ code into A and enter the kernel trampoline in supervisor mode.
    pub fn accept_irq(&mut self, irq: Irq, mem: &mut Memory) {
        self.save_frame(mem);
        self.a = irq.as_word();
        self.err = CpuErr::Ok;
        self.complement = 0;
        self.mode = MODE_SUPERVISOR;
        self.pc = TRAMPOLINE_ENTRY;
    }

    /// Execute one instruction.
    pub fn step(&mut self, mem: &mut Memory, mmu: &Mmu) -> StepOutcome {
        if self.halted {
            return StepOutcome::Halted;
        }

        let op = match self.load(mem, mmu, self.pc) {
            Ok(w) => w,
            Err(fault) => return self.take_fault(fault, mem),
        };
        let arg = if isa::has_arg(op) {
            match self.load(mem, mmu, self.pc + 1) {
                Ok(w) => w,
                Err(fault) => return self.take_fault(fault, mem),
            }
        } else {
            0
        };
        trace!(
            "cpu: pc={} {} {}",
            self.pc,
            isa::mnemonic(op),
            if isa::has_arg(op) { arg } else { 0 }
        );

        let next_pc = self.pc + if isa::has_arg(op) { 2 } else { 1 };
        let result: Result<StepOutcome, Fault> = match op {
            isa::OP_NOP => {
                self.pc = next_pc;
                Ok(StepOutcome::Executed)
            }
            isa::OP_HALT => {
                if self.mode == MODE_SUPERVISOR {
                    self.halted = true;
                    Ok(StepOutcome::Halted)
                } else {
                    Err(Fault {
                        err: CpuErr::PrivilegedInstruction,
                        complement: self.pc,
                    })
                }
            }
            isa::OP_LOADI => {
                self.a = arg;
                self.pc = next_pc;
                Ok(StepOutcome::Executed)
            }
            isa::OP_LOADM => self.load(mem, mmu, arg).map(|v| {
                self.a = v;
                self.pc = next_pc;
                StepOutcome::Executed
            }),
            isa::OP_STOREM => self.store(mem, mmu, arg, self.a).map(|()| {
                self.pc = next_pc;
                StepOutcome::Executed
            }),
            isa::OP_ADDM => self.load(mem, mmu, arg).map(|v| {
                self.a = self.a.wrapping_add(v);
                self.pc = next_pc;
                StepOutcome::Executed
            }),
            isa::OP_SUBM => self.load(mem, mmu, arg).map(|v| {
                self.a = self.a.wrapping_sub(v);
                self.pc = next_pc;
                StepOutcome::Executed
            }),
            isa::OP_LOADX => self.load(mem, mmu, arg.wrapping_add(self.x)).map(|v| {
                self.a = v;
                self.pc = next_pc;
                StepOutcome::Executed
            }),
            isa::OP_STOREX => self
                .store(mem, mmu, arg.wrapping_add(self.x), self.a)
                .map(|()| {
                    self.pc = next_pc;
                    StepOutcome::Executed
                }),
            isa::OP_TAX => {
                self.x = self.a;
                self.pc = next_pc;
                Ok(StepOutcome::Executed)
            }
            isa::OP_TXA => {
                self.a = self.x;
                self.pc = next_pc;
                Ok(StepOutcome::Executed)
            }
            isa::OP_JMP => {
                self.pc = arg;
                Ok(StepOutcome::Executed)
            }
            isa::OP_JMPZ => {
                self.pc = if self.a == 0 { arg } else { next_pc };
                Ok(StepOutcome::Executed)
            }
            isa::OP_JMPN => {
                self.pc = if self.a < 0 { arg } else { next_pc };
                Ok(StepOutcome::Executed)
            }
            isa::OP_TRAP => {
                if self.mode == MODE_USER {
                    // Resume after the trap once the syscall completes.
                    self.pc = next_pc;
                    self.accept_irq(Irq::Syscall, mem);
                    Ok(StepOutcome::Executed)
                } else {
                    Err(Fault {
                        err: CpuErr::InvalidInstruction,
                        complement: self.pc,
                    })
                }
            }
            isa::OP_ENTER_KERNEL => {
                if self.mode == MODE_SUPERVISOR {
                    self.pc = next_pc;
                    Ok(StepOutcome::KernelEntry(self.a))
                } else {
                    Err(Fault {
                        err: CpuErr::PrivilegedInstruction,
                        complement: self.pc,
                    })
                }
            }
            isa::OP_RET_FROM_INTERRUPT => {
                if self.mode == MODE_SUPERVISOR {
                    Ok(self.return_from_interrupt(mem))
                } else {
                    Err(Fault {
                        err: CpuErr::PrivilegedInstruction,
                        complement: self.pc,
                    })
                }
            }
            _ => Err(Fault {
                err: CpuErr::InvalidInstruction,
                complement: op,
            }),
        };

        match result {
            Ok(outcome) => outcome,
            Err(fault) => self.take_fault(fault, mem),
        }
    }

    // -------------------------------------------------------------------
    // Interrupt frame
    // -------------------------------------------------------------------

    fn save_frame(&self, mem: &mut Memory) {
        // Frame addresses sit inside the reserved low region; memory is
        // always at least that large (enforced at machine construction).
        let _ = mem.write(IRQ_FRAME_X, self.x);
        let _ = mem.write(IRQ_FRAME_A, self.a);
        let _ = mem.write(IRQ_FRAME_PC, self.pc);
        let _ = mem.write(IRQ_FRAME_ERR, self.err.as_word());
        let _ = mem.write(IRQ_FRAME_COMPL, self.complement);
        let _ = mem.write(IRQ_FRAME_MODE, self.mode);
    }

    fn return_from_interrupt(&mut self, mem: &Memory) -> StepOutcome {
        self.x = mem.read(IRQ_FRAME_X).unwrap_or(0);
        self.a = mem.read(IRQ_FRAME_A).unwrap_or(0);
        self.pc = mem.read(IRQ_FRAME_PC).unwrap_or(0);
        self.complement = mem.read(IRQ_FRAME_COMPL).unwrap_or(0);
        self.mode = mem.read(IRQ_FRAME_MODE).unwrap_or(MODE_SUPERVISOR);
        let err_word = mem.read(IRQ_FRAME_ERR).unwrap_or(0);
        match CpuErr::from_word(err_word) {
            Some(CpuErr::Ok) => {
                self.err = CpuErr::Ok;
                StepOutcome::Executed
            }
            Some(CpuErr::CpuHalted) => {
                self.halted = true;
                StepOutcome::Halted
            }
            other => {
                warn!(
                    "cpu: interrupt-return restored error {} ({err_word}); stopping",
                    CpuErr::name_of(err_word)
                );
                self.err = other.unwrap_or(CpuErr::InvalidInstruction);
                self.halted = true;
                StepOutcome::Halted
            }
        }
    }

    fn take_fault(&mut self, fault: Fault, mem: &mut Memory) -> StepOutcome {
        if self.mode == MODE_USER {
            self.err = fault.err;
            self.complement = fault.complement;
            self.accept_irq(Irq::CpuErr, mem);
            StepOutcome::Executed
        } else {
            // Faulting in supervisor mode means the trampoline or the frame
            // the kernel wrote is broken. Nothing can recover that.
            warn!(
                "cpu: fault in supervisor mode at pc={}: {} (complement {})",
                self.pc,
                CpuErr::name_of(fault.err.as_word()),
                fault.complement
            );
            self.err = fault.err;
            self.complement = fault.complement;
            self.halted = true;
            StepOutcome::Halted
        }
    }

    // -------------------------------------------------------------------
    // Mode-aware memory access
    // -------------------------------------------------------------------

    #[inline]
    fn load(&self, mem: &Memory, mmu: &Mmu, addr: Word) -> Result<Word, Fault> {
        mmu.read(mem, addr, self.mode).map_err(Fault::from)
    }

    #[inline]
    fn store(&self, mem: &mut Memory, mmu: &Mmu, addr: Word, value: Word) -> Result<(), Fault> {
        mmu.write(mem, addr, value, self.mode).map_err(Fault::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::PageTable;

    fn supervisor_cpu_at(pc: Word) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.pc = pc;
        cpu
    }

    // Lay a program down in physical memory starting at `base`.
    fn write_program(mem: &mut Memory, base: Word, words: &[Word]) {
        for (i, w) in words.iter().enumerate() {
            mem.write(base + i as Word, *w).unwrap();
        }
    }

    #[test]
    fn arithmetic_and_store_in_supervisor_mode() {
        let mut mem = Memory::new(512);
        let mmu = Mmu::new();
        // A = 40; A += mem[300] (2); store to 301; halt
        mem.write(300, 2).unwrap();
        write_program(
            &mut mem,
            200,
            &[
                isa::OP_LOADI,
                40,
                isa::OP_ADDM,
                300,
                isa::OP_STOREM,
                301,
                isa::OP_HALT,
            ],
        );
        let mut cpu = supervisor_cpu_at(200);
        while cpu.step(&mut mem, &mmu) == StepOutcome::Executed {}
        assert!(cpu.is_halted());
        assert_eq!(mem.read(301).unwrap(), 42);
    }

    #[test]
    fn conditional_jumps() {
        let mut mem = Memory::new(512);
        let mmu = Mmu::new();
        // A = 0; JMPZ 206; (skipped LOADI 99); HALT at 206
        write_program(
            &mut mem,
            200,
            &[isa::OP_LOADI, 0, isa::OP_JMPZ, 206, isa::OP_NOP, isa::OP_NOP, isa::OP_HALT],
        );
        let mut cpu = supervisor_cpu_at(200);
        while cpu.step(&mut mem, &mmu) == StepOutcome::Executed {}
        assert_eq!(cpu.pc, 206);
    }

    #[test]
    fn user_fault_enters_kernel_trampoline() {
        let mut mem = Memory::new(512);
        let mut mmu = Mmu::new();
        let mut pt = PageTable::new();
        pt.map(0, 20); // virtual 0..10 -> physical 200..210
        mmu.set_page_table(pt);

        // Illegal opcode at virtual 0.
        mem.write(200, 77).unwrap();
        let mut cpu = Cpu::new();
        cpu.mode = MODE_USER;
        cpu.pc = 0;

        assert_eq!(cpu.step(&mut mem, &mmu), StepOutcome::Executed);
        // CPU accepted the CpuErr interrupt: supervisor mode, trampoline PC,
        // IRQ code in A, fault recorded in the frame.
        assert_eq!(cpu.mode, MODE_SUPERVISOR);
        assert_eq!(cpu.pc, TRAMPOLINE_ENTRY);
        assert_eq!(cpu.a, Irq::CpuErr.as_word());
        assert_eq!(
            mem.read(IRQ_FRAME_ERR).unwrap(),
            CpuErr::InvalidInstruction.as_word()
        );
        assert_eq!(mem.read(IRQ_FRAME_MODE).unwrap(), MODE_USER);
    }

    #[test]
    fn trap_saves_resume_pc_and_syscall_id() {
        let mut mem = Memory::new(512);
        let mut mmu = Mmu::new();
        let mut pt = PageTable::new();
        pt.map(0, 20);
        mmu.set_page_table(pt);

        // virtual 0: LOADI 9; TRAP
        mem.write(200, isa::OP_LOADI).unwrap();
        mem.write(201, 9).unwrap();
        mem.write(202, isa::OP_TRAP).unwrap();

        let mut cpu = Cpu::new();
        cpu.mode = MODE_USER;
        cpu.pc = 0;
        assert_eq!(cpu.step(&mut mem, &mmu), StepOutcome::Executed); // LOADI
        assert_eq!(cpu.step(&mut mem, &mmu), StepOutcome::Executed); // TRAP

        assert_eq!(cpu.pc, TRAMPOLINE_ENTRY);
        assert_eq!(cpu.a, Irq::Syscall.as_word());
        // Frame holds the syscall id in A and the post-trap resume PC.
        assert_eq!(mem.read(IRQ_FRAME_A).unwrap(), 9);
        assert_eq!(mem.read(IRQ_FRAME_PC).unwrap(), 3);
    }

    #[test]
    fn enter_kernel_and_return_roundtrip() {
        let mut mem = Memory::new(512);
        let mmu = Mmu::new();
        mem.write(TRAMPOLINE_ENTRY, isa::OP_ENTER_KERNEL).unwrap();
        mem.write(TRAMPOLINE_RETURN, isa::OP_RET_FROM_INTERRUPT)
            .unwrap();

        let mut cpu = Cpu::new();
        cpu.a = 55; // pretend user state
        cpu.pc = 7;
        cpu.mode = MODE_USER;
        cpu.accept_irq(Irq::Clock, &mut mem);

        assert_eq!(
            cpu.step(&mut mem, &mmu),
            StepOutcome::KernelEntry(Irq::Clock.as_word())
        );
        // Kernel does nothing; frame untouched. Return restores user state.
        assert_eq!(cpu.step(&mut mem, &mmu), StepOutcome::Executed);
        assert_eq!(cpu.a, 55);
        assert_eq!(cpu.pc, 7);
        assert_eq!(cpu.mode, MODE_USER);
    }

    #[test]
    fn halt_error_in_frame_stops_on_return() {
        let mut mem = Memory::new(512);
        let mmu = Mmu::new();
        mem.write(TRAMPOLINE_RETURN, isa::OP_RET_FROM_INTERRUPT)
            .unwrap();
        mem.write(IRQ_FRAME_ERR, CpuErr::CpuHalted.as_word()).unwrap();

        let mut cpu = Cpu::new();
        cpu.pc = TRAMPOLINE_RETURN;
        assert_eq!(cpu.step(&mut mem, &mmu), StepOutcome::Halted);
        assert!(cpu.is_halted());
    }

    #[test]
    fn indexed_load_and_store() {
        let mut mem = Memory::new(512);
        let mmu = Mmu::new();
        mem.write(310, 11).unwrap();
        mem.write(311, 22).unwrap();
        // X = 1; A = mem[310 + X]; mem[320 + X] = A; halt
        write_program(
            &mut mem,
            200,
            &[
                isa::OP_LOADI,
                1,
                isa::OP_TAX,
                isa::OP_LOADX,
                310,
                isa::OP_STOREX,
                320,
                isa::OP_HALT,
            ],
        );
        let mut cpu = supervisor_cpu_at(200);
        while cpu.step(&mut mem, &mmu) == StepOutcome::Executed {}
        assert_eq!(cpu.a, 22);
        assert_eq!(mem.read(321).unwrap(), 22);
    }

    #[test]
    fn user_mode_halt_is_privileged() {
        let mut mem = Memory::new(512);
        let mut mmu = Mmu::new();
        let mut pt = PageTable::new();
        pt.map(0, 20);
        mmu.set_page_table(pt);
        mem.write(200, isa::OP_HALT).unwrap();

        let mut cpu = Cpu::new();
        cpu.mode = MODE_USER;
        cpu.pc = 0;
        cpu.step(&mut mem, &mmu);
        assert_eq!(
            mem.read(IRQ_FRAME_ERR).unwrap(),
            CpuErr::PrivilegedInstruction.as_word()
        );
        assert!(!cpu.is_halted());
    }
}
