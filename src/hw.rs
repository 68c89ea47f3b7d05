//! STM32L4 register-level drivers and the Cortex-M application jump.

use crate::boot::Jumper;
use crate::flash::{FlashDriver, FlashError};
use crate::rtc::{RtcDriver, RtcError};

/// Busy-wait iterations before a hardware flag poll gives up
const SPIN_LIMIT: u32 = 1_000_000;

const FLASH_REGS: u32 = 0x4002_2000;
const FLASH_KEYR: *mut u32 = (FLASH_REGS + 0x08) as *mut u32;
const FLASH_SR: *mut u32 = (FLASH_REGS + 0x10) as *mut u32;
const FLASH_CR: *mut u32 = (FLASH_REGS + 0x14) as *mut u32;

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xCDEF_89AB;

const SR_EOP: u32 = 1 << 0;
const SR_BSY: u32 = 1 << 16;
/// OPERR, PROGERR through FASTERR, RDERR and OPTVERR
const SR_ERRORS: u32 = (1 << 1) | (0x7f << 3) | (1 << 14) | (1 << 15);

const CR_PG: u32 = 1 << 0;
const CR_PER: u32 = 1 << 1;
const CR_PNB_SHIFT: u32 = 3;
const CR_PNB_MASK: u32 = 0xff << CR_PNB_SHIFT;
const CR_BKER: u32 = 1 << 11;
const CR_STRT: u32 = 1 << 16;
const CR_LOCK: u32 = 1 << 31;

/// Pages per bank on dual-bank parts
const PAGES_PER_BANK: u32 = 256;

/// Embedded flash controller
pub struct Stm32l4Flash {
    _private: (),
}

impl Stm32l4Flash {
    /// # Safety
    /// Only one instance may exist, nothing else may touch the flash controller.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    fn sr(&self) -> u32 {
        unsafe { FLASH_SR.read_volatile() }
    }

    fn modify_cr<F: FnOnce(u32) -> u32>(&mut self, f: F) {
        unsafe { FLASH_CR.write_volatile(f(FLASH_CR.read_volatile())) }
    }

    fn wait_not_busy(&mut self) -> Result<(), FlashError> {
        for _ in 0..SPIN_LIMIT {
            if self.sr() & SR_BSY == 0 {
                return Ok(());
            }
        }

        error!("Flash controller busy timeout (SR 0x{:08x})", self.sr());
        Err(FlashError::Timeout)
    }
}

impl FlashDriver for Stm32l4Flash {
    fn unlock(&mut self) -> Result<(), FlashError> {
        unsafe {
            if FLASH_CR.read_volatile() & CR_LOCK != 0 {
                FLASH_KEYR.write_volatile(FLASH_KEY1);
                FLASH_KEYR.write_volatile(FLASH_KEY2);
            }

            if FLASH_CR.read_volatile() & CR_LOCK != 0 {
                return Err(FlashError::Locked);
            }
        }

        Ok(())
    }

    fn lock(&mut self) -> Result<(), FlashError> {
        self.modify_cr(|cr| cr | CR_LOCK);
        Ok(())
    }

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        let bank = if page >= PAGES_PER_BANK { CR_BKER } else { 0 };
        let pnb = ((page % PAGES_PER_BANK) << CR_PNB_SHIFT) & CR_PNB_MASK;

        self.modify_cr(|cr| (cr & !(CR_PNB_MASK | CR_BKER | CR_PG)) | CR_PER | pnb | bank);
        self.modify_cr(|cr| cr | CR_STRT);

        let res = self.wait_not_busy();
        self.modify_cr(|cr| cr & !(CR_PER | CR_PNB_MASK | CR_BKER));
        res?;

        if self.sr() & SR_ERRORS != 0 {
            error!("Erasing page {} failed (SR 0x{:08x})", page, self.sr());
            return Err(FlashError::Erase);
        }

        Ok(())
    }

    fn wait_ready(&mut self) -> Result<(), FlashError> {
        self.wait_not_busy()
    }

    fn program_double_word(&mut self, addr: u32, value: u64) -> Result<(), FlashError> {
        if addr % 8 != 0 {
            return Err(FlashError::Misaligned(addr));
        }

        self.modify_cr(|cr| cr | CR_PG);

        // Both words must be written back to back
        unsafe {
            (addr as *mut u32).write_volatile(value as u32);
            ((addr + 4) as *mut u32).write_volatile((value >> 32) as u32);
        }

        let res = self.wait_not_busy();
        self.modify_cr(|cr| cr & !CR_PG);
        res?;

        if self.sr() & SR_ERRORS != 0 {
            error!("Programming 0x{:08x} failed (SR 0x{:08x})", addr, self.sr());
            return Err(FlashError::Program);
        }

        Ok(())
    }

    fn clear_status(&mut self) {
        // Write one to clear
        unsafe { FLASH_SR.write_volatile(SR_EOP | SR_ERRORS) }
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = unsafe { ((addr as usize + i) as *const u8).read_volatile() };
        }
        Ok(())
    }
}

const RTC_REGS: u32 = 0x4000_2800;
const RTC_TR: *mut u32 = RTC_REGS as *mut u32;
const RTC_DR: *mut u32 = (RTC_REGS + 0x04) as *mut u32;
const RTC_CR: *mut u32 = (RTC_REGS + 0x08) as *mut u32;
const RTC_ISR: *mut u32 = (RTC_REGS + 0x0c) as *mut u32;
const RTC_PRER: *mut u32 = (RTC_REGS + 0x10) as *mut u32;
const RTC_WPR: *mut u32 = (RTC_REGS + 0x24) as *mut u32;

const PWR_CR1: *mut u32 = 0x4000_7000 as *mut u32;
const PWR_CR1_DBP: u32 = 1 << 8;

const ISR_RSF: u32 = 1 << 5;
const ISR_INITF: u32 = 1 << 6;
const ISR_INIT: u32 = 1 << 7;

const CR_BYPSHAD: u32 = 1 << 5;
const CR_FMT: u32 = 1 << 6;

/// Prescalers for a 32 kHz LSI: 32000 / (127 + 1) / (249 + 1) = 1 Hz
const PREDIV_A: u32 = 127;
const PREDIV_S: u32 = 249;

/// Calendar peripheral, clocked from the LSI.
///
/// The RTC clock source must already be selected and enabled.
pub struct Stm32l4Rtc {
    _private: (),
}

impl Stm32l4Rtc {
    /// # Safety
    /// Only one instance may exist, nothing else may touch the RTC or PWR_CR1.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    fn spin_until<F: Fn() -> bool>(ready: F) -> Result<(), RtcError> {
        for _ in 0..SPIN_LIMIT {
            if ready() {
                return Ok(());
            }
        }
        Err(RtcError::Driver)
    }

    unsafe fn init_mode(&mut self) -> Result<(), RtcError> {
        PWR_CR1.write_volatile(PWR_CR1_DBP | PWR_CR1.read_volatile());
        RTC_WPR.write_volatile(0xca);
        RTC_WPR.write_volatile(0x53);

        RTC_ISR.write_volatile(RTC_ISR.read_volatile() | ISR_INIT);
        Self::spin_until(|| RTC_ISR.read_volatile() & ISR_INITF != 0)
    }

    unsafe fn leave_init_mode(&mut self) {
        RTC_ISR.write_volatile(RTC_ISR.read_volatile() & !ISR_INIT);
        RTC_WPR.write_volatile(0xff);
        PWR_CR1.write_volatile(PWR_CR1.read_volatile() & !PWR_CR1_DBP);
    }
}

impl RtcDriver for Stm32l4Rtc {
    fn write_calendar(&mut self, date: u32, time: u32) -> Result<(), RtcError> {
        unsafe {
            // Wait for shadow register synchronisation
            RTC_ISR.write_volatile(RTC_ISR.read_volatile() & !ISR_RSF);
            Self::spin_until(|| RTC_ISR.read_volatile() & ISR_RSF != 0)?;

            if let Err(e) = self.init_mode() {
                self.leave_init_mode();
                return Err(e);
            }

            RTC_PRER.write_volatile((PREDIV_A << 16) | PREDIV_S);
            RTC_CR.write_volatile((RTC_CR.read_volatile() & !CR_FMT) | CR_BYPSHAD);
            RTC_TR.write_volatile(time);
            RTC_DR.write_volatile(date);

            self.leave_init_mode();
        }

        Ok(())
    }

    fn read_calendar(&mut self) -> Result<(u32, u32), RtcError> {
        // Shadow registers are bypassed, re-read if the seconds rolled between reads
        for _ in 0..3 {
            let (t0, date, t1) = unsafe {
                (RTC_TR.read_volatile(), RTC_DR.read_volatile(), RTC_TR.read_volatile())
            };

            if t0 == t1 {
                return Ok((date, t0));
            }
        }

        Err(RtcError::Driver)
    }
}

/// Branches into an application image on the same core
pub struct CortexMJumper;

const SCB_VTOR: *mut u32 = 0xE000_ED08 as *mut u32;

impl Jumper for CortexMJumper {
    unsafe fn jump(&mut self, base: u32) -> ! {
        cortex_m::interrupt::disable();

        SCB_VTOR.write_volatile(base);

        cortex_m::asm::dsb();
        cortex_m::asm::isb();

        // Loads MSP from base and branches to the reset handler at base + 4
        cortex_m::asm::bootload(base as *const u32)
    }
}
