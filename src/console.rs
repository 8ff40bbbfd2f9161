/*!
Console: per-process terminal slots behind a flat channel address space.

Each process slot owns one paired read/write terminal exposed as four
logical channels, addressed as `slot * 4 + k`:

- k = 0: read data. Reading pops the next queued input word (0 when empty).
- k = 1: read ready. Non-zero when input is queued.
- k = 2: write data. Writing appends the word to the slot's output and, when
  a write delay is configured, makes the terminal busy for that many ticks.
- k = 3: write ready. Non-zero when the terminal can take a write now.

Ready registers are the blocking gates the kernel consults: a syscall that
finds its gate at zero blocks the process, and the pendency sweep performs
the deferred transfer once the gate opens.

Input is scripted by the host/test harness via `feed_input`; output is
captured per slot and can be inspected or drained. The write delay exists
so write-blocking paths are actually exercisable: with a delay of zero a
terminal is always ready.
*/

use std::collections::VecDeque;

use thiserror::Error;

use crate::memory::Word;

/// Logical channels per terminal slot.
pub const CHANNELS_PER_SLOT: usize = 4;

pub const CH_READ_DATA: usize = 0;
pub const CH_READ_READY: usize = 1;
pub const CH_WRITE_DATA: usize = 2;
pub const CH_WRITE_READY: usize = 3;

/// Default number of terminal slots.
pub const SLOTS_DEFAULT: usize = 4;

/// Channel index for `(slot, kind)`.
#[inline]
pub fn channel(slot: usize, kind: usize) -> usize {
    slot * CHANNELS_PER_SLOT + kind
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsoleError {
    #[error("channel {channel} out of range ({slots} slots)")]
    BadChannel { channel: usize, slots: usize },
    #[error("channel {channel} does not support this direction")]
    BadDirection { channel: usize },
}

#[derive(Debug, Default)]
struct Terminal {
    input: VecDeque<Word>,
    output: Vec<Word>,
    busy_ticks: u32,
}

/// The console device.
#[derive(Debug)]
pub struct Console {
    slots: Vec<Terminal>,
    write_delay: u32,
}

impl Default for Console {
    fn default() -> Self {
        Self::new(SLOTS_DEFAULT)
    }
}

impl Console {
    /// Console with `slots` terminals and no write delay (always ready).
    pub fn new(slots: usize) -> Self {
        Self::with_write_delay(slots, 0)
    }

    /// Console whose terminals stay busy for `write_delay` ticks after each
    /// accepted write.
    pub fn with_write_delay(slots: usize, write_delay: u32) -> Self {
        Self {
            slots: (0..slots).map(|_| Terminal::default()).collect(),
            write_delay,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Device read.
    pub fn read_channel(&mut self, ch: usize) -> Result<Word, ConsoleError> {
        let (slot, kind) = self.split(ch)?;
        let term = &mut self.slots[slot];
        match kind {
            CH_READ_DATA => Ok(term.input.pop_front().unwrap_or(0)),
            CH_READ_READY => Ok(if term.input.is_empty() { 0 } else { 1 }),
            CH_WRITE_READY => Ok(if term.busy_ticks == 0 { 1 } else { 0 }),
            _ => Err(ConsoleError::BadDirection { channel: ch }),
        }
    }

    /// Device write.
    pub fn write_channel(&mut self, ch: usize, value: Word) -> Result<(), ConsoleError> {
        let (slot, kind) = self.split(ch)?;
        if kind != CH_WRITE_DATA {
            return Err(ConsoleError::BadDirection { channel: ch });
        }
        let delay = self.write_delay;
        let term = &mut self.slots[slot];
        term.output.push(value);
        term.busy_ticks = delay;
        Ok(())
    }

    /// Advance device time by one tick; busy terminals drain toward ready.
    pub fn tick(&mut self) {
        for term in &mut self.slots {
            if term.busy_ticks > 0 {
                term.busy_ticks -= 1;
            }
        }
    }

    // -------------------------------------------------------------------
    // Host-side access (tests, the binary's output dump)
    // -------------------------------------------------------------------

    /// Queue input words on a slot's read terminal.
    pub fn feed_input<I: IntoIterator<Item = Word>>(&mut self, slot: usize, words: I) {
        if let Some(term) = self.slots.get_mut(slot) {
            term.input.extend(words);
        }
    }

    /// Words written to a slot so far.
    pub fn output(&self, slot: usize) -> &[Word] {
        self.slots.get(slot).map(|t| t.output.as_slice()).unwrap_or(&[])
    }

    /// Drain and return a slot's captured output.
    pub fn take_output(&mut self, slot: usize) -> Vec<Word> {
        self.slots
            .get_mut(slot)
            .map(|t| std::mem::take(&mut t.output))
            .unwrap_or_default()
    }

    #[inline]
    fn split(&self, ch: usize) -> Result<(usize, usize), ConsoleError> {
        let slot = ch / CHANNELS_PER_SLOT;
        if slot >= self.slots.len() {
            return Err(ConsoleError::BadChannel {
                channel: ch,
                slots: self.slots.len(),
            });
        }
        Ok((slot, ch % CHANNELS_PER_SLOT))
    }
}
