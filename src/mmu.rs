/*!
MMU and per-process page tables.

Virtual addresses are split into `page = virt / PAGE_SIZE` and
`offset = virt % PAGE_SIZE`; a page table maps pages to physical frames of
the same size. Translation rules:

- user mode: every access goes through the current page table; a missing
  table or an unmapped page is a translation fault carrying the virtual
  address.
- supervisor mode: addresses are physical and pass straight through. The
  interrupt frame and the trampoline live in low physical memory and must
  stay reachable no matter which process table is current.

The current table is swapped only by the scheduler when it dispatches a
process; each descriptor owns its table and the MMU keeps a copy of the one
belonging to the process on the CPU.
*/

use thiserror::Error;

use crate::cpu::{MODE_SUPERVISOR, MODE_USER};
use crate::memory::{Memory, MemoryError, Word};

/// Words per page (and per frame).
pub const PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MmuError {
    #[error("no page table loaded (virtual address {virt})")]
    NoPageTable { virt: Word },
    #[error("page {page} unmapped (virtual address {virt})")]
    Unmapped { virt: Word, page: usize },
    #[error("negative virtual address {virt}")]
    Negative { virt: Word },
    #[error("unknown access mode {mode}")]
    BadMode { mode: Word },
    #[error(transparent)]
    Physical(#[from] MemoryError),
}

impl MmuError {
    /// Virtual (or physical, for pass-through faults) address involved.
    pub fn addr(&self) -> Word {
        match self {
            MmuError::NoPageTable { virt }
            | MmuError::Unmapped { virt, .. }
            | MmuError::Negative { virt } => *virt,
            MmuError::BadMode { .. } => 0,
            MmuError::Physical(MemoryError::OutOfRange { addr, .. }) => *addr,
        }
    }
}

/// Dense page -> frame mapping owned by one process descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTable {
    frames: Vec<Option<usize>>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the mapping for `page`.
    pub fn map(&mut self, page: usize, frame: usize) {
        if page >= self.frames.len() {
            self.frames.resize(page + 1, None);
        }
        self.frames[page] = Some(frame);
    }

    /// Frame backing `page`, if mapped.
    #[inline]
    pub fn frame_of(&self, page: usize) -> Option<usize> {
        self.frames.get(page).copied().flatten()
    }

    #[inline]
    pub fn is_mapped(&self, page: usize) -> bool {
        self.frame_of(page).is_some()
    }

    /// Highest mapped page + 1 (0 for an empty table).
    pub fn span(&self) -> usize {
        self.frames.len()
    }
}

/// Translation unit. Holds a copy of the running process's page table.
#[derive(Debug, Default)]
pub struct Mmu {
    current: Option<PageTable>,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `table` the current translation table. Scheduler-only call site.
    pub fn set_page_table(&mut self, table: PageTable) {
        self.current = Some(table);
    }

    /// Drop the current table; user-mode accesses fault until the next dispatch.
    pub fn clear_page_table(&mut self) {
        self.current = None;
    }

    pub fn has_page_table(&self) -> bool {
        self.current.is_some()
    }

    /// Translate a user-mode virtual address to a physical one.
    pub fn translate(&self, virt: Word) -> Result<Word, MmuError> {
        if virt < 0 {
            return Err(MmuError::Negative { virt });
        }
        let table = self.current.as_ref().ok_or(MmuError::NoPageTable { virt })?;
        let page = virt as usize / PAGE_SIZE;
        let offset = virt as usize % PAGE_SIZE;
        let frame = table
            .frame_of(page)
            .ok_or(MmuError::Unmapped { virt, page })?;
        Ok((frame * PAGE_SIZE + offset) as Word)
    }

    /// Mode-aware read: user addresses translate, supervisor addresses are physical.
    pub fn read(&self, mem: &Memory, addr: Word, mode: Word) -> Result<Word, MmuError> {
        let phys = self.resolve(addr, mode)?;
        Ok(mem.read(phys)?)
    }

    /// Mode-aware write; same resolution rules as [`Mmu::read`].
    pub fn write(&self, mem: &mut Memory, addr: Word, value: Word, mode: Word) -> Result<(), MmuError> {
        let phys = self.resolve(addr, mode)?;
        mem.write(phys, value)?;
        Ok(())
    }

    #[inline]
    fn resolve(&self, addr: Word, mode: Word) -> Result<Word, MmuError> {
        match mode {
            MODE_SUPERVISOR => Ok(addr),
            MODE_USER => self.translate(addr),
            _ => Err(MmuError::BadMode { mode }),
        }
    }
}
