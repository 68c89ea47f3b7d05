use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Instant;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::boot::Jumper;
use crate::client::{Client, ClientOptions};
use crate::flash::RamFlash;
use crate::rtc::{RtcDriver, RtcError, RtcSample};
use crate::{Bootloader, Options};

/// Open a serial port at 8N1 without flow control
fn open<P: AsRef<Path>>(port: P, baud: usize) -> Result<Serial, SerialError> {
    // Open port
    let mut port = Serial::open(port.as_ref())?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)?;

    Ok(port)
}

impl Client<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port client instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: ClientOptions,
    ) -> Result<Self, SerialError> {
        let port = open(port, baud)?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}

/// Emulated board, serving the bootloader over a host serial port
pub type Emulator = Bootloader<Serial, RamFlash, HostRtc, HostJumper, Delay, IoErrorKind>;

impl Emulator {
    /// Create a bootloader instance over a linux serial port, backed by `flash`
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
        flash: RamFlash,
    ) -> Result<Self, SerialError> {
        let port = open(port, baud)?;

        let options = Options {
            baud: baud as u32,
            ..options
        };

        Ok(Self::new(port, flash, HostRtc::new(), Delay {}, HostJumper, options))
    }
}

/// Ends the emulation in place of starting the application
pub struct HostJumper;

impl Jumper for HostJumper {
    unsafe fn jump(&mut self, base: u32) -> ! {
        info!("Application at 0x{:08x} would start here, exiting", base);
        std::process::exit(0)
    }
}

/// Calendar that runs from the host monotonic clock once set
#[derive(Debug, Default)]
pub struct HostRtc {
    base: Option<(u32, Instant)>,
}

impl HostRtc {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RtcDriver for HostRtc {
    fn write_calendar(&mut self, date: u32, time: u32) -> Result<(), RtcError> {
        let seconds = RtcSample::from_registers(date, time)?.to_epoch_seconds()?;
        self.base = Some((seconds, Instant::now()));
        Ok(())
    }

    fn read_calendar(&mut self) -> Result<(u32, u32), RtcError> {
        let (seconds, at) = self.base.ok_or(RtcError::Driver)?;

        let elapsed = at.elapsed().as_secs();
        let now = (seconds as u64)
            .checked_add(elapsed)
            .filter(|s| *s <= u32::MAX as u64)
            .ok_or(RtcError::OutOfRange)?;

        Ok(RtcSample::from_epoch_seconds(now as u32)?.to_registers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::{RtcCodec, NS_BIAS};

    #[test]
    fn host_rtc_holds_time() {
        let mut rtc = RtcCodec::new(HostRtc::new());
        assert_eq!(rtc.get(), Err(RtcError::Unset));

        rtc.set(653978532, 265936000).unwrap();
        let (s, ns) = rtc.get().unwrap();

        assert!(s >= 653978532 && s <= 653978533);
        assert_eq!(ns, NS_BIAS);
    }
}
