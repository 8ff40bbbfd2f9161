/*!
Process descriptor: the kernel's bookkeeping record for one user process.

The state machine is encoded so the "blocked implies a reason, a reason
implies blocked" invariant cannot be violated: a descriptor is `Ready`,
`Running`, or `Blocked(reason)`, and the wait target lives inside the
`WaitProc` reason. Descriptors are identified by PID everywhere; nothing in
the kernel holds a pointer or index across a table mutation.
*/

use crate::cpu::{CpuErr, MODE_USER};
use crate::memory::Word;
use crate::mmu::PageTable;

/// Process identifier. Dense, non-negative, allocated monotonically; -1 is
/// never a PID (it is the failure value user code sees in register A).
pub type Pid = i32;

/// Clock ticks a process runs before preemption.
pub const QUANTUM_INITIAL: Word = 5;

/// Name capacity: 99 bytes plus terminator in the user-memory encoding.
pub const NAME_MAX: usize = 100;

/// Why a blocked process is blocked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockReason {
    /// Read syscall waiting for the read-ready gate of its terminal.
    IoRead,
    /// Write syscall waiting for the write-ready gate.
    IoWrite,
    /// Waiting for the target process to leave the table.
    WaitProc(Pid),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked(BlockReason),
}

/// Saved CPU register file, written back into the interrupt frame when the
/// process is dispatched. All six words, mode included, are opaque to the
/// kernel except A and X (syscall id / argument) and PC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuContext {
    pub x: Word,
    pub a: Word,
    pub pc: Word,
    pub error: Word,
    pub complement: Word,
    pub mode: Word,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self {
            x: 0,
            a: 0,
            pc: 0,
            error: CpuErr::Ok.as_word(),
            complement: 0,
            mode: MODE_USER,
        }
    }
}

#[derive(Debug)]
pub struct Process {
    pid: Pid,
    name: String,
    pub(crate) state: ProcessState,
    pub(crate) quantum: Word,
    pub(crate) context: CpuContext,
    pub(crate) page_table: PageTable,
}

impl Process {
    /// Fresh descriptor: ready, full quantum, user-mode context at PC 0,
    /// empty page table. The loader fills the table and the caller sets PC.
    pub fn new(pid: Pid, name: &str) -> Self {
        Self {
            pid,
            name: truncate_name(name),
            state: ProcessState::Ready,
            quantum: QUANTUM_INITIAL,
            context: CpuContext::default(),
            page_table: PageTable::new(),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    #[inline]
    pub fn quantum(&self) -> Word {
        self.quantum
    }

    #[inline]
    pub fn context(&self) -> &CpuContext {
        &self.context
    }

    #[inline]
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == ProcessState::Ready
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    #[inline]
    pub fn is_blocked(&self) -> bool {
        matches!(self.state, ProcessState::Blocked(_))
    }

    #[inline]
    pub fn block_reason(&self) -> Option<BlockReason> {
        match self.state {
            ProcessState::Blocked(r) => Some(r),
            _ => None,
        }
    }

    /// Block with `reason`. Blocking forfeits the rest of the quantum.
    pub fn block(&mut self, reason: BlockReason) {
        self.state = ProcessState::Blocked(reason);
        self.quantum = QUANTUM_INITIAL;
    }

    /// Satisfied gate: back to the ready queue.
    pub fn unblock(&mut self) {
        self.state = ProcessState::Ready;
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() < NAME_MAX {
        return name.to_string();
    }
    let mut end = NAME_MAX - 1;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
