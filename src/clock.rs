/*!
Clock device: instruction counter, programmable countdown, interrupt flag.

Register interface (unknown registers are ignored on write and read as 0):

- 0: instructions executed since power-up (read-only).
- 2: countdown programming (write-only): "raise the clock interrupt after
  N more instructions".
- 3: interrupt-pending flag (read; writing 0 acknowledges).

The machine calls [`Clock::tick`] once per executed instruction. When an
armed countdown reaches zero the pending flag latches; it stays set until
the kernel acknowledges by writing 0 to register 3 and re-arms register 2.
*/

use log::debug;

use crate::memory::Word;

pub const REG_INSTRUCTIONS: Word = 0;
pub const REG_TIMER: Word = 2;
pub const REG_IRQ_FLAG: Word = 3;

#[derive(Debug, Default)]
pub struct Clock {
    instructions: Word,
    countdown: Option<Word>,
    irq_pending: bool,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// One instruction retired.
    pub fn tick(&mut self) {
        self.instructions = self.instructions.wrapping_add(1);
        if let Some(remaining) = self.countdown {
            if remaining <= 1 {
                self.countdown = None;
                self.irq_pending = true;
            } else {
                self.countdown = Some(remaining - 1);
            }
        }
    }

    #[inline]
    pub fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    pub fn instructions(&self) -> Word {
        self.instructions
    }

    /// Register read.
    pub fn read_reg(&self, reg: Word) -> Word {
        match reg {
            REG_INSTRUCTIONS => self.instructions,
            REG_IRQ_FLAG => {
                if self.irq_pending {
                    1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    /// Register write. `REG_TIMER` arms the countdown, `REG_IRQ_FLAG`
    /// with 0 acknowledges the interrupt.
    pub fn write_reg(&mut self, reg: Word, value: Word) {
        match reg {
            REG_TIMER => {
                if value > 0 {
                    self.countdown = Some(value);
                } else {
                    self.countdown = None;
                }
            }
            REG_IRQ_FLAG => {
                if value == 0 {
                    self.irq_pending = false;
                }
            }
            _ => {
                debug!("clock: ignoring write to register {reg}");
            }
        }
    }
}
