//! Transmit-side reply buffer, drained one byte at a time.

use crate::protocol::CommandFrame;

pub struct ReplyCursor {
    empty: bool,
    /// Index of the next byte to send
    cursor: usize,
    end: usize,
    frame: CommandFrame,
}

impl ReplyCursor {
    pub const fn new() -> Self {
        Self {
            empty: true,
            cursor: 0,
            end: 0,
            frame: CommandFrame::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Bytes still waiting to be sent
    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }

    /// Queue a reply for transmission.
    ///
    /// Returns the frame back if a previous reply has not yet drained.
    pub fn fill(&mut self, frame: CommandFrame) -> Result<(), CommandFrame> {
        if !self.empty {
            return Err(frame);
        }

        self.end = frame.len();
        self.cursor = 0;
        self.frame = frame;
        self.empty = self.end == 0;

        Ok(())
    }

    /// The next byte to transmit, left in place
    pub fn peek(&self) -> Option<u8> {
        if self.empty {
            None
        } else {
            self.frame.get(self.cursor)
        }
    }

    /// Take the next byte to transmit, clearing the buffer once the last byte is out
    pub fn pop(&mut self) -> Option<u8> {
        if self.empty {
            return None;
        }

        let b = self.frame.get(self.cursor);
        self.cursor += 1;

        if self.cursor >= self.end {
            self.clear();
        }

        b
    }

    fn clear(&mut self) {
        self.empty = true;
        self.cursor = 0;
        self.end = 0;
        self.frame.clear();
    }
}

impl Default for ReplyCursor {
    fn default() -> Self {
        Self::new()
    }
}
