/*!
The kernel: interrupt-driven process management over the virtual hardware.

Structure
- `process`: descriptor (state machine, saved context, owned page table).
- `table`: insertion-ordered process table and PID allocation.
- `context`: interrupt-frame save/restore.
- `syscall`: system-call decode and the five calls (read, write, spawn,
  exit, wait).
- `pending`: per-interrupt sweep unblocking satisfied waiters.
- `scheduler`: round-robin dispatch with a fixed quantum.
- `loader`: program load into freshly allocated frames.

The kernel executes entirely inside the interrupt entry
[`Kernel::on_interrupt`]; the CPU is stopped while it runs, so all kernel
state is plain owned data with no locking. Every invocation follows the
same strict sequence: save the interrupted context, handle the specific
IRQ, sweep pendencies, schedule, restore the chosen context.
*/

pub mod context;
pub mod loader;
pub mod pending;
pub mod process;
pub mod scheduler;
pub mod syscall;
pub mod table;

#[cfg(test)]
mod tests;

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::clock::{REG_IRQ_FLAG, REG_TIMER};
use crate::console::{Console, channel};
use crate::cpu::{CpuErr, IRQ_FRAME_ERR, Irq, TRAMPOLINE_ENTRY, TRAMPOLINE_RETURN};
use crate::isa::{OP_ENTER_KERNEL, OP_RET_FROM_INTERRUPT};
use crate::machine::Hardware;
use crate::memory::{RESERVED_LOW_WORDS, Word};
use crate::mmu::PAGE_SIZE;
use crate::program::Program;

pub use process::{BlockReason, CpuContext, Pid, Process, ProcessState, QUANTUM_INITIAL};
pub use table::ProcessTable;

/// Instructions between clock interrupts.
pub const CLOCK_INTERVAL: Word = 50;

/// Executable loaded by the reset handler.
pub const INIT_PROGRAM: &str = "init.maq";

/// What the interrupt entry tells the CPU: keep going, or stop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelStatus {
    Ok,
    Halt,
}

pub struct Kernel {
    pub(crate) table: ProcessTable,
    pub(crate) running: Option<Pid>,
    pub(crate) next_free_frame: usize,
    programs: HashMap<String, Program>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            table: ProcessTable::new(),
            running: None,
            // First frame past the reserved low region (interrupt frame +
            // trampoline); user programs never map below it.
            next_free_frame: RESERVED_LOW_WORDS / PAGE_SIZE,
            programs: HashMap::new(),
        }
    }

    /// Preload an executable image under `name`, shadowing the filesystem.
    pub fn register_program<S: Into<String>>(&mut self, name: S, program: Program) {
        self.programs.insert(name.into(), program);
    }

    /// Bootstrap: install the trampoline words and arm the timer. The CPU's
    /// reset interrupt does the rest (loading `init`).
    pub fn install(&mut self, hw: &mut Hardware) {
        let _ = hw.mem.write(TRAMPOLINE_ENTRY, OP_ENTER_KERNEL);
        let _ = hw.mem.write(TRAMPOLINE_RETURN, OP_RET_FROM_INTERRUPT);
        hw.clock.write_reg(REG_TIMER, CLOCK_INTERVAL);
        info!("kernel: trampoline installed, timer armed every {CLOCK_INTERVAL} instructions");
    }

    /// Interrupt entry, invoked by the machine when the CPU executes
    /// `ENTER_KERNEL`. `irq_word` is the IRQ code the CPU left in A.
    pub fn on_interrupt(&mut self, hw: &mut Hardware, irq_word: Word) -> KernelStatus {
        let irq = Irq::from_word(irq_word);
        debug!(
            "kernel: irq {irq_word} ({})",
            irq.map(Irq::name).unwrap_or("unknown")
        );
        self.save_running_context(hw);
        let status = match irq {
            Some(Irq::Reset) => self.irq_reset(hw),
            Some(Irq::CpuErr) => self.irq_cpu_error(hw),
            Some(Irq::Syscall) => self.handle_syscall(hw),
            Some(Irq::Clock) => self.irq_clock(hw),
            None => {
                warn!("kernel: cannot handle irq {irq_word}");
                KernelStatus::Halt
            }
        };
        self.resolve_pending(hw);
        self.schedule(hw);
        self.restore_context(hw);
        status
    }

    // -------------------------------------------------------------------
    // IRQ handlers
    // -------------------------------------------------------------------

    /// Reset: create and load `init`; its saved context (user mode, PC at
    /// the entry address) is dispatched like any other process.
    fn irq_reset(&mut self, hw: &mut Hardware) -> KernelStatus {
        let pid = self.table.create(INIT_PROGRAM);
        match self.load_program(hw, INIT_PROGRAM, pid) {
            Ok(entry) => {
                if let Some(proc) = self.table.get_mut(pid) {
                    proc.context.pc = entry;
                }
                info!("kernel: '{INIT_PROGRAM}' is pid {pid}, entry {entry}");
                KernelStatus::Ok
            }
            Err(e) => {
                warn!("kernel: failed to load '{INIT_PROGRAM}': {e}");
                self.table.remove(pid);
                KernelStatus::Halt
            }
        }
    }

    /// CPU error: the offending process dies; the kernel carries on. With
    /// no process to blame the machine stops.
    fn irq_cpu_error(&mut self, hw: &Hardware) -> KernelStatus {
        if let Some(pid) = self.running {
            if let Some(proc) = self.table.get(pid) {
                let err = proc.context.error;
                if err != CpuErr::Ok.as_word() {
                    info!(
                        "kernel: '{}' (pid {pid}) died of {} (complement {})",
                        proc.name(),
                        CpuErr::name_of(err),
                        proc.context.complement
                    );
                    self.kill_process(pid);
                    return KernelStatus::Ok;
                }
                warn!("kernel: cpu-error irq with no error recorded");
                return KernelStatus::Halt;
            }
        }
        let err = hw.mem.read(IRQ_FRAME_ERR).unwrap_or(0);
        warn!(
            "kernel: unattributed cpu error: {} ({err})",
            CpuErr::name_of(err)
        );
        KernelStatus::Halt
    }

    /// Clock: acknowledge and re-arm the timer, then charge the running
    /// process one tick of quantum.
    fn irq_clock(&mut self, hw: &mut Hardware) -> KernelStatus {
        hw.clock.write_reg(REG_IRQ_FLAG, 0);
        hw.clock.write_reg(REG_TIMER, CLOCK_INTERVAL);
        if let Some(proc) = self.running.and_then(|pid| self.table.get_mut(pid)) {
            proc.quantum -= 1;
            if proc.quantum <= 0 {
                debug!("kernel: quantum of '{}' expired", proc.name());
                proc.state = ProcessState::Ready;
                proc.quantum = QUANTUM_INITIAL;
            }
        }
        KernelStatus::Ok
    }

    // -------------------------------------------------------------------
    // Shared helpers
    // -------------------------------------------------------------------

    /// Remove a descriptor. Its page table goes with it (the frames leak in
    /// the bump allocator); waiters are released by the pendency sweep.
    pub(crate) fn kill_process(&mut self, pid: Pid) {
        match self.table.remove(pid) {
            Some(proc) => {
                info!("kernel: removed '{}' (pid {pid})", proc.name());
                if self.running == Some(pid) {
                    self.running = None;
                }
            }
            None => debug!("kernel: kill of absent pid {pid} ignored"),
        }
    }

    // -------------------------------------------------------------------
    // Introspection (tests, the binary's final report)
    // -------------------------------------------------------------------

    pub fn running_pid(&self) -> Option<Pid> {
        self.running
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.table
    }

    pub fn process_count(&self) -> usize {
        self.table.len()
    }
}

/// Console read with device errors demoted to "not ready"; a process whose
/// PID has no terminal slot simply never sees an open gate.
pub(crate) fn term_read(console: &mut Console, slot: usize, kind: usize) -> Word {
    match console.read_channel(channel(slot, kind)) {
        Ok(v) => v,
        Err(e) => {
            debug!("kernel: terminal read failed: {e}");
            0
        }
    }
}

/// Console write; failures are logged and swallowed (the kernel never
/// propagates device errors out of the interrupt entry).
pub(crate) fn term_write(console: &mut Console, slot: usize, kind: usize, value: Word) {
    if let Err(e) = console.write_channel(channel(slot, kind), value) {
        debug!("kernel: terminal write failed: {e}");
    }
}
