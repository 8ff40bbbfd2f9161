/*!
Pendency sweep: convert satisfied block conditions into READY transitions.

Runs once per kernel entry, between the IRQ handler and the scheduler. For
every blocked descriptor:

- `IoRead`: when the process's read-ready register is non-zero, pop the
  word into its saved A and unblock.
- `IoWrite`: when its write-ready register is non-zero, perform the write
  from its saved X, store 0 (success) in its saved A, and unblock.
- `WaitProc(target)`: when the target has left the table, unblock.

Each gate is consulted against the blocked process's own terminal slot.
The sweep is O(table) and idempotent: a process whose gate stays closed is
simply revisited on the next interrupt.
*/

use log::debug;

use crate::console::{CH_READ_DATA, CH_READ_READY, CH_WRITE_DATA, CH_WRITE_READY};
use crate::machine::Hardware;

use super::process::BlockReason;
use super::{Kernel, term_read, term_write};

impl Kernel {
    pub(crate) fn resolve_pending(&mut self, hw: &mut Hardware) {
        for pid in self.table.blocked_pids() {
            let Some(reason) = self.table.get(pid).and_then(|p| p.block_reason()) else {
                continue;
            };
            let slot = pid as usize;
            match reason {
                BlockReason::IoRead => {
                    if term_read(&mut hw.console, slot, CH_READ_READY) != 0 {
                        let data = term_read(&mut hw.console, slot, CH_READ_DATA);
                        if let Some(proc) = self.table.get_mut(pid) {
                            proc.context.a = data;
                            proc.unblock();
                            debug!("kernel: pid {pid} read {data}, unblocked");
                        }
                    }
                }
                BlockReason::IoWrite => {
                    if term_read(&mut hw.console, slot, CH_WRITE_READY) != 0 {
                        let Some(proc) = self.table.get_mut(pid) else {
                            continue;
                        };
                        let value = proc.context.x;
                        proc.context.a = 0;
                        proc.unblock();
                        term_write(&mut hw.console, slot, CH_WRITE_DATA, value);
                        debug!("kernel: pid {pid} wrote {value}, unblocked");
                    }
                }
                BlockReason::WaitProc(target) => {
                    if !self.table.contains(target) {
                        if let Some(proc) = self.table.get_mut(pid) {
                            proc.unblock();
                            debug!("kernel: pid {pid} done waiting for pid {target}");
                        }
                    }
                }
            }
        }
    }
}
