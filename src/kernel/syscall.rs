/*!
System-call dispatcher.

The syscall id arrives in the saved A register of the running descriptor
(the CPU stored the register file into the interrupt frame on the TRAP, and
the dispatcher's save step moved it into the descriptor); the argument, if
any, is in the saved X.

Register conventions, both on the immediate path here and on the deferred
path in the pendency sweep:

- read: the data word lands in A.
- write: the word comes from X; A gets 0 on success.
- spawn: A gets the child PID, or -1 on any failure.
- wait on an absent target: returns immediately, A untouched.

A syscall that cannot proceed (device gate closed) blocks the caller; the
scheduler then rotates it out and the pendency sweep finishes the transfer
once the gate opens.
*/

use log::{debug, info, warn};

use crate::console::{CH_READ_DATA, CH_READ_READY, CH_WRITE_DATA, CH_WRITE_READY};
use crate::cpu::MODE_USER;
use crate::machine::Hardware;
use crate::memory::Word;

use super::process::{BlockReason, NAME_MAX, Pid};
use super::{Kernel, KernelStatus, term_read, term_write};

/// Read one word from the process's read terminal into A.
pub const SYS_READ: Word = 1;
/// Write X to the process's write terminal; A gets 0 on success.
pub const SYS_WRITE: Word = 2;
/// Spawn the program whose name is the NUL-terminated string at virtual
/// address X in the caller; A gets the child PID or -1.
pub const SYS_SPAWN: Word = 3;
/// Exit: X = 0 kills the caller, otherwise kills PID X.
pub const SYS_EXIT: Word = 4;
/// Wait for the process with PID X to terminate.
pub const SYS_WAIT: Word = 5;

pub fn syscall_name(id: Word) -> &'static str {
    match id {
        SYS_READ => "read",
        SYS_WRITE => "write",
        SYS_SPAWN => "spawn",
        SYS_EXIT => "exit",
        SYS_WAIT => "wait",
        _ => "???",
    }
}

impl Kernel {
    pub(crate) fn handle_syscall(&mut self, hw: &mut Hardware) -> KernelStatus {
        let Some(pid) = self.running else {
            warn!("kernel: syscall with no running process");
            return KernelStatus::Halt;
        };
        let Some(id) = self.table.get(pid).map(|p| p.context.a) else {
            return KernelStatus::Halt;
        };
        debug!("kernel: pid {pid} syscall {id} ({})", syscall_name(id));
        match id {
            SYS_READ => self.sys_read(hw, pid),
            SYS_WRITE => self.sys_write(hw, pid),
            SYS_SPAWN => self.sys_spawn(hw, pid),
            SYS_EXIT => self.sys_exit(pid),
            SYS_WAIT => self.sys_wait(pid),
            _ => {
                warn!("kernel: pid {pid} made unknown syscall {id}, killing it");
                self.kill_process(pid);
            }
        }
        KernelStatus::Ok
    }

    fn sys_read(&mut self, hw: &mut Hardware, pid: Pid) {
        let slot = pid as usize;
        if term_read(&mut hw.console, slot, CH_READ_READY) != 0 {
            let data = term_read(&mut hw.console, slot, CH_READ_DATA);
            if let Some(proc) = self.table.get_mut(pid) {
                proc.context.a = data;
            }
        } else if let Some(proc) = self.table.get_mut(pid) {
            debug!("kernel: pid {pid} blocked on read");
            proc.block(BlockReason::IoRead);
        }
    }

    fn sys_write(&mut self, hw: &mut Hardware, pid: Pid) {
        let slot = pid as usize;
        if term_read(&mut hw.console, slot, CH_WRITE_READY) != 0 {
            let Some(proc) = self.table.get_mut(pid) else {
                return;
            };
            let value = proc.context.x;
            proc.context.a = 0;
            term_write(&mut hw.console, slot, CH_WRITE_DATA, value);
        } else if let Some(proc) = self.table.get_mut(pid) {
            debug!("kernel: pid {pid} blocked on write");
            proc.block(BlockReason::IoWrite);
        }
    }

    fn sys_spawn(&mut self, hw: &mut Hardware, pid: Pid) {
        let Some(name_addr) = self.table.get(pid).map(|p| p.context.x) else {
            return;
        };
        let Some(name) = copy_user_string(hw, name_addr) else {
            debug!("kernel: pid {pid} passed an unreadable program name");
            self.fail_spawn(pid);
            return;
        };

        let child = self.table.create(&name);
        match self.load_program(hw, &name, child) {
            Ok(entry) => {
                if let Some(proc) = self.table.get_mut(child) {
                    proc.context.pc = entry;
                }
                if let Some(caller) = self.table.get_mut(pid) {
                    caller.context.a = child;
                }
                info!("kernel: pid {pid} spawned '{name}' as pid {child}");
            }
            Err(e) => {
                warn!("kernel: load of '{name}' failed: {e}");
                self.table.remove(child);
                self.fail_spawn(pid);
            }
        }
    }

    fn fail_spawn(&mut self, pid: Pid) {
        if let Some(caller) = self.table.get_mut(pid) {
            caller.context.a = -1;
        }
    }

    fn sys_exit(&mut self, pid: Pid) {
        let target = self.table.get(pid).map(|p| p.context.x).unwrap_or(0);
        let victim = if target == 0 { pid } else { target };
        self.kill_process(victim);
    }

    fn sys_wait(&mut self, pid: Pid) {
        let Some(target) = self.table.get(pid).map(|p| p.context.x) else {
            return;
        };
        if !self.table.contains(target) {
            info!("kernel: pid {pid} waited for pid {target}, already gone");
            return;
        }
        if let Some(proc) = self.table.get_mut(pid) {
            info!("kernel: pid {pid} waiting for pid {target}");
            proc.block(BlockReason::WaitProc(target));
        }
    }
}

/// Copy a NUL-terminated byte string out of the caller's address space,
/// translating through the current (caller's) page table. Fails on a
/// translation fault, a word outside 0..=255, or a missing terminator
/// within the name limit.
fn copy_user_string(hw: &Hardware, addr: Word) -> Option<String> {
    let mut bytes = Vec::new();
    for i in 0..NAME_MAX as Word {
        let word = hw.mmu.read(&hw.mem, addr + i, MODE_USER).ok()?;
        if word == 0 {
            return String::from_utf8(bytes).ok();
        }
        if !(0..=255).contains(&word) {
            return None;
        }
        bytes.push(word as u8);
    }
    // Ran past the name limit without a terminator.
    None
}
