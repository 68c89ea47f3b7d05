//! Application image validation and control transfer.

use embedded_hal::blocking::delay::DelayUs;

use crate::flash::{FlashDriver, FlashLayout};
use crate::protocol::CMD_MAX_LEN;

/// SRAM1 start address
pub const SRAM1_BASE: u32 = 0x2000_0000;

/// SRAM1 size
pub const SRAM1_SIZE: u32 = 0x0004_0000;

/// Bits on the line per byte (start, 8 data, stop)
const BITS_PER_BYTE: u64 = 10;

/// Whether the bootloader is running and whether a jump has been requested.
///
/// The dispatcher sets the pending jump, the boot controller clears both
/// flags as it hands over to the application.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootState {
    in_bootloader: bool,
    jump_pending: bool,
}

impl BootState {
    /// State at bootloader start-up
    pub const fn bootloader() -> Self {
        Self {
            in_bootloader: true,
            jump_pending: false,
        }
    }

    /// State when the same core is serving commands from the application
    pub const fn application() -> Self {
        Self {
            in_bootloader: false,
            jump_pending: false,
        }
    }

    pub fn in_bootloader(&self) -> bool {
        self.in_bootloader
    }

    pub fn jump_pending(&self) -> bool {
        self.jump_pending
    }

    pub(crate) fn request_jump(&mut self) {
        self.jump_pending = true;
    }

    pub(crate) fn abort_jump(&mut self) {
        self.jump_pending = false;
    }

    fn enter_application(&mut self) {
        self.jump_pending = false;
        self.in_bootloader = false;
    }
}

impl Default for BootState {
    fn default() -> Self {
        Self::bootloader()
    }
}

/// RAM range an application's initial stack pointer must fall in
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RamRegion {
    pub base: u32,
    pub size: u32,
}

impl Default for RamRegion {
    fn default() -> Self {
        Self {
            base: SRAM1_BASE,
            size: SRAM1_SIZE,
        }
    }
}

impl RamRegion {
    /// Full-descending stacks start one past the top of RAM, so the end address is accepted
    pub fn holds_stack(&self, sp: u32) -> bool {
        match sp.checked_sub(self.base) {
            Some(offset) => offset <= self.size,
            None => false,
        }
    }
}

/// Line time needed for queued bytes to leave the UART shift register
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlushDelay {
    pub baud: u32,
    /// Number of maximum-length frames worth of line time to wait
    pub frames: u32,
}

impl FlushDelay {
    pub fn micros(&self) -> u32 {
        if self.baud == 0 {
            return 0;
        }

        let bits = self.frames as u64 * CMD_MAX_LEN as u64 * BITS_PER_BYTE;
        let us = bits * 1_000_000 / self.baud as u64;

        us.min(u32::MAX as u64) as u32
    }
}

/// Hands control to the application image
pub trait Jumper {
    /// Point the vector table at `base`, load the main stack pointer from
    /// `base` and branch to the reset handler stored at `base + 4`.
    ///
    /// # Safety
    /// `base` must hold a vector table for an image built to run there.
    unsafe fn jump(&mut self, base: u32) -> !;
}

pub struct BootController<J> {
    layout: FlashLayout,
    ram: RamRegion,
    flush: FlushDelay,
    jumper: J,
}

impl<J: Jumper> BootController<J> {
    pub fn new(layout: FlashLayout, ram: RamRegion, flush: FlushDelay, jumper: J) -> Self {
        Self {
            layout,
            ram,
            flush,
            jumper,
        }
    }

    /// Does the first word of the image look like an initial stack pointer in RAM?
    ///
    /// This is the only check made, the image itself is not checksummed.
    pub fn app_looks_valid<F: FlashDriver + ?Sized>(&self, flash: &F) -> bool {
        let mut word = [0u8; 4];
        if let Err(e) = flash.read(self.layout.app_base, &mut word) {
            error!("Reading application header failed: {:?}", e);
            return false;
        }

        let sp = u32::from_le_bytes(word);
        let valid = self.ram.holds_stack(sp);
        if !valid {
            debug!("Application stack pointer 0x{:08x} is outside RAM", sp);
        }

        valid
    }

    /// Busy-wait long enough for the UART to finish shifting out the last reply
    pub fn flush<D: DelayUs<u32>>(&self, delay: &mut D) {
        delay.delay_us(self.flush.micros());
    }

    /// Clear the boot flags and jump into the application. Never returns.
    ///
    /// The caller must have drained the reply and flushed the UART first.
    pub fn transfer(&mut self, state: &mut BootState) -> ! {
        state.enter_application();

        info!("Jumping to application at 0x{:08x}", self.layout.app_base);

        unsafe { self.jumper.jump(self.layout.app_base) }
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }
}
