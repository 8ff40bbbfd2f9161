/*!
Program loader: maps a fresh process's pages onto physical frames and
copies the image in.

Frames come from a bump allocator (`Kernel::next_free_frame`), initialized
past the reserved low region at boot. Allocation is append-only; frames of
a dead process leak. Reclamation is the natural extension point once the
kernel tracks a free list.

The loader writes physical memory directly and never touches the MMU's
current table; only the scheduler decides what the MMU translates with.
*/

use log::info;

use thiserror::Error;

use crate::machine::Hardware;
use crate::memory::{MemoryError, Word};
use crate::mmu::PAGE_SIZE;
use crate::program::{Program, ProgramError};

use super::Kernel;
use super::process::Pid;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no descriptor for pid {0}")]
    NoSuchProcess(Pid),
    #[error("image loads at negative address {0}")]
    BadLoadAddress(Word),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl Kernel {
    /// Load `name` into the address space of process `pid`.
    ///
    /// Allocates one frame per touched page, installs the mappings in the
    /// descriptor's page table and copies the words into physical memory.
    /// Returns the virtual entry address.
    pub(crate) fn load_program(
        &mut self,
        hw: &mut Hardware,
        name: &str,
        pid: Pid,
    ) -> Result<Word, LoadError> {
        let program = self.lookup_program(name)?;
        let virt_ini = program.load_addr();
        if virt_ini < 0 {
            return Err(LoadError::BadLoadAddress(virt_ini));
        }
        if program.is_empty() {
            return Ok(virt_ini);
        }
        let virt_fim = virt_ini + program.len() as Word - 1;
        let page_ini = virt_ini as usize / PAGE_SIZE;
        let page_fim = virt_fim as usize / PAGE_SIZE;

        let frame_ini = self.next_free_frame;
        {
            let proc = self
                .table
                .get_mut(pid)
                .ok_or(LoadError::NoSuchProcess(pid))?;
            for page in page_ini..=page_fim {
                proc.page_table.map(page, self.next_free_frame);
                self.next_free_frame += 1;
            }
        }

        for (i, word) in program.words().iter().enumerate() {
            let virt = virt_ini as usize + i;
            let frame = frame_ini + (virt / PAGE_SIZE - page_ini);
            let phys = (frame * PAGE_SIZE + virt % PAGE_SIZE) as Word;
            hw.mem.write(phys, *word)?;
        }

        info!(
            "kernel: loaded '{name}' V{virt_ini}-{virt_fim} F{frame_ini}-{}",
            frame_ini + (page_fim - page_ini)
        );
        Ok(virt_ini)
    }

    /// Resolve an executable name: preloaded registry first, then the
    /// filesystem.
    fn lookup_program(&self, name: &str) -> Result<Program, ProgramError> {
        if let Some(p) = self.programs.get(name) {
            return Ok(p.clone());
        }
        Program::from_file(name)
    }
}
