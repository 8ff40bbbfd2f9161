/*!
Machine façade: one CPU, its hardware, and the kernel, wired together.

Step orchestration, in order, once per instruction:
1. Let the CPU execute one instruction.
2. Tick the clock (instruction counter / countdown) and the console (busy
   terminals drain toward ready).
3. If the instruction was `ENTER_KERNEL`, run the kernel dispatcher with
   the IRQ code the CPU surfaced; a halt status stops the machine.
4. Deliver a pending clock interrupt, but only at a user-mode boundary —
   the kernel (trampoline included) is never re-entered.

The kernel never calls back into the machine; it sees only [`Hardware`].
This is the ownership-friendly realization of the "install a kernel entry
callback in the CPU" contract: the CPU reports kernel entry as a step
outcome and the owner routes it.
*/

use log::info;

use crate::clock::Clock;
use crate::console::{Console, SLOTS_DEFAULT};
use crate::cpu::{Cpu, Irq, MODE_USER, StepOutcome};
use crate::kernel::{Kernel, KernelStatus};
use crate::memory::{MEM_SIZE_DEFAULT, Memory, RESERVED_LOW_WORDS};
use crate::mmu::Mmu;
use crate::program::Program;

/// The devices the kernel and CPU operate on.
pub struct Hardware {
    pub mem: Memory,
    pub mmu: Mmu,
    pub console: Console,
    pub clock: Clock,
}

#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Primary memory size in words.
    pub mem_words: usize,
    /// Terminal slots (one per process slot).
    pub terminal_slots: usize,
    /// Ticks a terminal stays busy after an accepted write.
    pub write_delay: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            mem_words: MEM_SIZE_DEFAULT,
            terminal_slots: SLOTS_DEFAULT,
            write_delay: 0,
        }
    }
}

/// Why [`Machine::run`] returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The CPU halted (kernel said nothing left to run, or a supervisor
    /// fault).
    Halted,
    /// The instruction budget ran out first.
    BudgetExhausted,
}

pub struct Machine {
    cpu: Cpu,
    hw: Hardware,
    kernel: Kernel,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        // The interrupt frame and trampoline must exist.
        let mem_words = config.mem_words.max(RESERVED_LOW_WORDS);
        Self {
            cpu: Cpu::new(),
            hw: Hardware {
                mem: Memory::new(mem_words),
                mmu: Mmu::new(),
                console: Console::with_write_delay(config.terminal_slots, config.write_delay),
                clock: Clock::new(),
            },
            kernel: Kernel::new(),
        }
    }

    /// Preload an executable into the kernel's program registry.
    pub fn register_program<S: Into<String>>(&mut self, name: S, program: Program) {
        self.kernel.register_program(name, program);
    }

    /// Install the kernel and raise the reset interrupt. The first steps
    /// will run the trampoline, load `init` and dispatch it.
    pub fn boot(&mut self) {
        info!("machine: booting");
        self.kernel.install(&mut self.hw);
        self.cpu.accept_irq(Irq::Reset, &mut self.hw.mem);
    }

    /// Execute one instruction. Returns false once the machine has stopped.
    pub fn step(&mut self) -> bool {
        let Machine { cpu, hw, kernel } = self;
        if cpu.is_halted() {
            return false;
        }

        let outcome = cpu.step(&mut hw.mem, &hw.mmu);
        hw.clock.tick();
        hw.console.tick();

        match outcome {
            StepOutcome::Halted => return false,
            StepOutcome::KernelEntry(irq_word) => {
                if kernel.on_interrupt(hw, irq_word) == KernelStatus::Halt {
                    info!("machine: kernel requested halt");
                    cpu.halt();
                    return false;
                }
            }
            StepOutcome::Executed => {}
        }

        // Clock interrupts are held while in supervisor mode and delivered
        // at the next user-mode instruction boundary.
        if hw.clock.irq_pending() && cpu.mode == MODE_USER {
            cpu.accept_irq(Irq::Clock, &mut hw.mem);
        }
        true
    }

    /// Run until the CPU halts or `budget` instructions have executed.
    pub fn run(&mut self, budget: u64) -> StopReason {
        for _ in 0..budget {
            if !self.step() {
                return StopReason::Halted;
            }
        }
        StopReason::BudgetExhausted
    }

    // -------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn hardware(&self) -> &Hardware {
        &self.hw
    }

    pub fn console(&self) -> &Console {
        &self.hw.console
    }

    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.hw.console
    }
}
