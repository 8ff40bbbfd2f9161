/*!
Context save/restore against the interrupt frame.

On every kernel entry the frame at physical 0..=5 holds the interrupted
CPU's registers; `save_running_context` copies them into the running
descriptor (skipped when nothing was running: first entry, or the running
process was just killed). After scheduling, `restore_context` writes the
selected descriptor's registers back. With nothing selected it writes the
halt error into the frame's error slot so the CPU stops on interrupt-return.
*/

use log::{debug, info};

use crate::cpu::{
    CpuErr, IRQ_FRAME_A, IRQ_FRAME_COMPL, IRQ_FRAME_ERR, IRQ_FRAME_MODE, IRQ_FRAME_PC, IRQ_FRAME_X,
};
use crate::machine::Hardware;
use crate::memory::Memory;

use super::Kernel;
use super::process::CpuContext;

impl Kernel {
    /// Capture the interrupt frame into the running descriptor, if any.
    pub(crate) fn save_running_context(&mut self, hw: &Hardware) {
        let Some(pid) = self.running else { return };
        let Some(proc) = self.table.get_mut(pid) else {
            return;
        };
        proc.context = read_frame(&hw.mem);
        debug!("kernel: saved cpu state of '{}' (pid {pid})", proc.name());
    }

    /// Write the selected descriptor's context into the frame, or the halt
    /// error when nothing was selected.
    pub(crate) fn restore_context(&mut self, hw: &mut Hardware) {
        match self.running.and_then(|pid| self.table.get(pid)) {
            Some(proc) => {
                debug!(
                    "kernel: restoring '{}' (pid {}) at pc {}",
                    proc.name(),
                    proc.pid(),
                    proc.context.pc
                );
                write_frame(&mut hw.mem, &proc.context);
            }
            None => {
                info!("kernel: nothing to run, stopping the cpu");
                let _ = hw.mem.write(IRQ_FRAME_ERR, CpuErr::CpuHalted.as_word());
            }
        }
    }
}

// Frame slots sit inside the reserved low region, which the machine
// guarantees exists; a read/write there cannot go out of range.
fn read_frame(mem: &Memory) -> CpuContext {
    CpuContext {
        x: mem.read(IRQ_FRAME_X).unwrap_or(0),
        a: mem.read(IRQ_FRAME_A).unwrap_or(0),
        pc: mem.read(IRQ_FRAME_PC).unwrap_or(0),
        error: mem.read(IRQ_FRAME_ERR).unwrap_or(0),
        complement: mem.read(IRQ_FRAME_COMPL).unwrap_or(0),
        mode: mem.read(IRQ_FRAME_MODE).unwrap_or(0),
    }
}

fn write_frame(mem: &mut Memory, ctx: &CpuContext) {
    let _ = mem.write(IRQ_FRAME_X, ctx.x);
    let _ = mem.write(IRQ_FRAME_A, ctx.a);
    let _ = mem.write(IRQ_FRAME_PC, ctx.pc);
    let _ = mem.write(IRQ_FRAME_ERR, ctx.error);
    let _ = mem.write(IRQ_FRAME_COMPL, ctx.complement);
    let _ = mem.write(IRQ_FRAME_MODE, ctx.mode);
}
