/*!
Round-robin scheduler with a fixed quantum.

Run on every kernel entry, after the IRQ handler and the pendency sweep:

1. If the previously running process is gone (killed, or first dispatch),
   pick the first READY descriptor in table order.
2. If it is still RUNNING (no preemption, no block), it continues.
3. If it went READY (quantum expired) or BLOCKED, rotate it to the tail of
   the table and pick the first READY. The rotation is what makes table
   order a FIFO among ready processes and defers a just-blocked process
   behind everyone else.

Dispatch is also the only place the MMU's current page table changes; it
always becomes the table of the process about to run. When nothing is
ready the MMU table is dropped and the restore step will halt the CPU.
*/

use log::debug;

use crate::machine::Hardware;

use super::Kernel;
use super::process::ProcessState;

impl Kernel {
    pub(crate) fn schedule(&mut self, hw: &mut Hardware) {
        let current = self.running.filter(|&pid| self.table.contains(pid));
        let Some(pid) = current else {
            self.dispatch_next(hw);
            return;
        };

        // State is read fresh from the table: syscall handlers and the
        // clock handler may have changed it this interrupt.
        match self.table.get(pid).map(|p| p.state()) {
            Some(ProcessState::Running) => {
                // Keep running; the MMU already holds this table.
            }
            Some(ProcessState::Ready) | Some(ProcessState::Blocked(_)) => {
                debug!("kernel: rotating pid {pid} to the tail");
                self.table.rotate_to_tail(pid);
                self.running = None;
                self.dispatch_next(hw);
            }
            None => self.dispatch_next(hw),
        }
    }

    fn dispatch_next(&mut self, hw: &mut Hardware) {
        match self.table.first_ready() {
            Some(next) => {
                let table = {
                    // Mark running and grab the page table for the MMU.
                    let proc = match self.table.get_mut(next) {
                        Some(p) => p,
                        None => return,
                    };
                    proc.state = ProcessState::Running;
                    debug!("kernel: dispatching '{}' (pid {next})", proc.name());
                    proc.page_table.clone()
                };
                self.running = Some(next);
                hw.mmu.set_page_table(table);
            }
            None => {
                debug!("kernel: no ready process");
                self.running = None;
                hw.mmu.clear_page_table();
            }
        }
    }
}
