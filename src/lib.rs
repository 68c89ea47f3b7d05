//! TAOLST payload bootloader core.
//!
//! Frames arrive byte by byte from a UART, are assembled and dispatched to
//! flash, clock and boot handlers, and every command is answered with one
//! reply frame drained back out through the same UART.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::fmt::Debug;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

pub mod assembler;
pub mod boot;
pub mod dispatch;
pub mod flash;
pub mod protocol;
pub mod reply;
pub mod rtc;

pub mod client;

#[cfg(feature = "cortex-m")]
pub mod hw;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

use assembler::FrameAssembler;
use boot::{BootController, BootState, FlushDelay, Jumper, RamRegion};
use dispatch::{DestPolicy, DispatchOptions, Dispatcher, EraseMode};
use flash::{FlashDriver, FlashError, FlashLayout};
use reply::ReplyCursor;
use rtc::{RtcCodec, RtcDriver};

/// Serial port usable by the bootloader and the ground client
pub trait Uart<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> Uart<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

#[derive(Clone, PartialEq, Debug)]
pub enum Error<SerialError> {
    Serial(SerialError),
    /// Command refused, carries the NACK opcode received
    Nack(u8),
    ResponseTimeout,
    InvalidResponse,
    Flash(FlashError),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[cfg(feature = "std")]
impl<SerialError: Debug> std::fmt::Display for Error<SerialError> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Serial(e) => write!(f, "serial error: {:?}", e),
            Error::Nack(op) => write!(f, "command refused (opcode 0x{:02x})", op),
            Error::ResponseTimeout => write!(f, "timeout waiting for reply"),
            Error::InvalidResponse => write!(f, "invalid reply"),
            Error::Flash(e) => write!(f, "flash error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl<SerialError: Debug> std::error::Error for Error<SerialError> {}

/// Bootloader configuration
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Reply destination id policy (fixed, swap-nibbles)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "fixed"))]
    pub dest_policy: DestPolicy,

    /// Destination id written to replies under the fixed policy
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub ground_id: u8,

    /// Erase command behaviour (full, validate-only)
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "full"))]
    pub erase_mode: EraseMode,

    /// UART baud rate, sizes the flush delay before a jump
    #[cfg_attr(feature = "structopt", structopt(skip = 115_200u32))]
    pub baud: u32,

    /// Maximum-length frames of line time to wait before a jump
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2"))]
    pub flush_frames: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dest_policy: DestPolicy::Fixed,
            ground_id: protocol::LST,
            erase_mode: EraseMode::Full,
            baud: 115_200,
            flush_frames: 2,
        }
    }
}

impl Options {
    pub fn dispatch(&self) -> DispatchOptions {
        DispatchOptions {
            dest_policy: self.dest_policy,
            ground_id: self.ground_id,
            erase_mode: self.erase_mode,
        }
    }

    pub fn flush_delay(&self) -> FlushDelay {
        FlushDelay {
            baud: self.baud,
            frames: self.flush_frames,
        }
    }
}

/// Bootloader main cycle, owning the UART, drivers and protocol state.
///
/// Each call to [`Bootloader::poll`] moves received bytes into the frame
/// assembler, answers a complete frame once the previous reply has left,
/// transmits what the UART will accept and, when a jump was requested and
/// its acknowledgement has drained, hands over to the application.
pub struct Bootloader<P, F, R, J, D, E> {
    port: P,
    flash: F,
    clock: RtcCodec<R>,
    delay: D,

    assembler: FrameAssembler,
    cursor: ReplyCursor,
    dispatcher: Dispatcher,
    boot: BootController<J>,
    state: BootState,

    _err: PhantomData<E>,
}

impl<P, F, R, J, D, E> Bootloader<P, F, R, J, D, E>
where
    P: Uart<E>,
    F: FlashDriver,
    R: RtcDriver,
    J: Jumper,
    D: DelayUs<u32>,
    E: Debug,
{
    /// Create a bootloader with the default flash layout and RAM region
    pub fn new(port: P, flash: F, rtc: R, delay: D, jumper: J, options: Options) -> Self {
        let layout = FlashLayout::default();

        Self {
            port,
            flash,
            clock: RtcCodec::new(rtc),
            delay,
            assembler: FrameAssembler::new(),
            cursor: ReplyCursor::new(),
            dispatcher: Dispatcher::new(options.dispatch(), layout),
            boot: BootController::new(layout, RamRegion::default(), options.flush_delay(), jumper),
            state: BootState::bootloader(),
            _err: PhantomData,
        }
    }

    /// Replace the boot state, e.g. to serve commands from the application
    pub fn with_state(mut self, state: BootState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &BootState {
        &self.state
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn clock(&self) -> &RtcCodec<R> {
        &self.clock
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Whether a reply is still waiting to be transmitted
    pub fn reply_pending(&self) -> bool {
        !self.cursor.is_empty()
    }

    /// Run one pass of the main cycle
    pub fn poll(&mut self) -> Result<(), Error<E>> {
        self.receive();

        self.dispatcher.service(
            &mut self.assembler,
            &mut self.cursor,
            &mut self.flash,
            &mut self.clock,
            &mut self.state,
        );

        self.transmit()?;

        if self.state.jump_pending() {
            self.boot_cycle()?;
        }

        Ok(())
    }

    /// Execute the main cycle forever, returning only on a transmit error
    pub fn run(&mut self) -> Result<(), Error<E>> {
        loop {
            self.poll()?;
        }
    }

    /// Feed available bytes to the assembler.
    ///
    /// Bytes are left in the UART while a complete frame awaits dispatch.
    /// A receive error (framing, noise, overrun) drops the partial frame.
    fn receive(&mut self) {
        while !self.assembler.is_complete() {
            match self.port.read() {
                Ok(b) => self.assembler.push(b),
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    warn!("UART receive error {:?}, resyncing", e);
                    self.assembler.reset();
                    break;
                }
            }
        }
    }

    /// Send reply bytes until the UART stops accepting them
    fn transmit(&mut self) -> Result<(), Error<E>> {
        while let Some(b) = self.cursor.peek() {
            match self.port.write(b) {
                Ok(()) => {
                    self.cursor.pop();
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Block until the whole reply has been handed to the UART
    fn drain(&mut self) -> Result<(), Error<E>> {
        while let Some(b) = self.cursor.peek() {
            block!(self.port.write(b))?;
            self.cursor.pop();
        }

        block!(self.port.flush())?;

        Ok(())
    }

    /// Complete a requested jump, or abandon it if the image is not runnable.
    ///
    /// Returns only when the jump was aborted.
    pub fn boot_cycle(&mut self) -> Result<(), Error<E>> {
        self.drain()?;

        if !self.boot.app_looks_valid(&self.flash) {
            warn!("No valid application image, jump aborted");
            self.state.abort_jump();
            return Ok(());
        }

        self.boot.flush(&mut self.delay);
        self.boot.transfer(&mut self.state)
    }
}
