//! Application flash region and sub-page programming.
//!
//! The application image is written as 128-byte sub-pages. Sixteen
//! sub-pages fill one 2048-byte physical page, which must be erased before
//! any of its sub-pages are programmed; writing sub-page 0 of a page
//! triggers that erase.

use crate::protocol::SUBPAGE_SIZE;

/// Start of the on-chip flash
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Start of the application image (page 16)
pub const APP_ADDR: u32 = 0x0800_8000;

/// Physical erase granule
pub const BYTES_PER_PAGE: u32 = 2048;

/// Number of sub-page slots addressable by the protocol
pub const SUBPAGE_SLOTS: u16 = 255;

/// Bytes programmed per flash controller operation
pub const BYTES_PER_DWORD: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum FlashError {
    #[cfg_attr(feature = "std", error("flash controller did not become ready"))]
    Timeout,
    #[cfg_attr(feature = "std", error("flash programming failed"))]
    Program,
    #[cfg_attr(feature = "std", error("flash page erase failed"))]
    Erase,
    #[cfg_attr(feature = "std", error("flash is locked"))]
    Locked,
    #[cfg_attr(feature = "std", error("address 0x{0:08x} is outside the flash region"))]
    OutOfRange(u32),
    #[cfg_attr(feature = "std", error("address 0x{0:08x} is not double-word aligned"))]
    Misaligned(u32),
}

/// Low level flash controller operations
pub trait FlashDriver {
    /// Unlock the controller for erase and program operations
    fn unlock(&mut self) -> Result<(), FlashError>;

    /// Re-lock the controller
    fn lock(&mut self) -> Result<(), FlashError>;

    /// Erase one physical page, by index from the start of flash
    fn erase_page(&mut self, page: u32) -> Result<(), FlashError>;

    /// Spin until the controller is no longer busy
    fn wait_ready(&mut self) -> Result<(), FlashError>;

    /// Program one aligned double word
    fn program_double_word(&mut self, addr: u32, value: u64) -> Result<(), FlashError>;

    /// Clear the controller status flags
    fn clear_status(&mut self);

    /// Read back flash contents
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

/// Placement of the application image in flash
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashLayout {
    pub flash_base: u32,
    pub app_base: u32,
    pub page_size: u32,
    pub subpage_slots: u16,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            flash_base: FLASH_BASE,
            app_base: APP_ADDR,
            page_size: BYTES_PER_PAGE,
            subpage_slots: SUBPAGE_SLOTS,
        }
    }
}

impl FlashLayout {
    /// Byte offset of a sub-page from the application base
    pub fn subpage_offset(&self, subpage_id: u8) -> u32 {
        subpage_id as u32 * SUBPAGE_SIZE as u32
    }

    pub fn subpage_addr(&self, subpage_id: u8) -> u32 {
        self.app_base + self.subpage_offset(subpage_id)
    }

    /// Whether writing this sub-page must first erase its physical page
    pub fn starts_page(&self, subpage_id: u8) -> bool {
        self.subpage_offset(subpage_id) % self.page_size == 0
    }

    /// Physical page index (from the start of flash) holding `addr`
    pub fn page_index(&self, addr: u32) -> u32 {
        (addr - self.flash_base) / self.page_size
    }

    /// Number of physical pages spanned by every sub-page slot
    pub fn app_pages(&self) -> u32 {
        let bytes = self.subpage_slots as u32 * SUBPAGE_SIZE as u32;
        (bytes + self.page_size - 1) / self.page_size
    }

    pub fn app_size(&self) -> u32 {
        self.app_pages() * self.page_size
    }
}

/// Erases and writes sub-pages of the application image
#[derive(Copy, Clone, Debug)]
pub struct FlashProgrammer {
    layout: FlashLayout,
}

impl FlashProgrammer {
    pub fn new(layout: FlashLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// Write one sub-page, erasing its physical page first when it is the
    /// first sub-page of that page.
    ///
    /// Sub-pages within a page must be written in ascending order, a later
    /// write of the first sub-page wipes its fifteen neighbours.
    pub fn write_subpage<F: FlashDriver + ?Sized>(
        &self,
        flash: &mut F,
        subpage_id: u8,
        data: &[u8; SUBPAGE_SIZE],
    ) -> Result<(), FlashError> {
        flash.unlock()?;
        let res = self.program_subpage(flash, subpage_id, data);
        let locked = flash.lock();
        res.and(locked)
    }

    /// Erase every physical page covered by the sub-page slots, each exactly once.
    ///
    /// Returns the number of pages erased.
    pub fn erase<F: FlashDriver + ?Sized>(&self, flash: &mut F) -> Result<u32, FlashError> {
        flash.unlock()?;
        let res = self.erase_all(flash);
        let locked = flash.lock();
        let erased = res?;
        locked?;

        info!("Erased {} application pages", erased);
        Ok(erased)
    }

    fn erase_all<F: FlashDriver + ?Sized>(&self, flash: &mut F) -> Result<u32, FlashError> {
        let mut erased = 0;

        for subpage_id in 0..self.layout.subpage_slots {
            let subpage_id = subpage_id as u8;
            if self.layout.starts_page(subpage_id) {
                let page = self.layout.page_index(self.layout.subpage_addr(subpage_id));
                self.erase_page(flash, page)?;
                erased += 1;
            }
        }

        Ok(erased)
    }

    fn erase_page<F: FlashDriver + ?Sized>(&self, flash: &mut F, page: u32) -> Result<(), FlashError> {
        debug!("Erasing flash page {}", page);

        flash.wait_ready()?;
        flash.erase_page(page)?;
        flash.wait_ready()?;
        flash.clear_status();

        Ok(())
    }

    fn program_subpage<F: FlashDriver + ?Sized>(
        &self,
        flash: &mut F,
        subpage_id: u8,
        data: &[u8; SUBPAGE_SIZE],
    ) -> Result<(), FlashError> {
        let start = self.layout.subpage_addr(subpage_id);

        if self.layout.starts_page(subpage_id) {
            self.erase_page(flash, self.layout.page_index(start))?;
        }

        debug!("Writing sub-page {} at 0x{:08x}", subpage_id, start);

        for (i, chunk) in data.chunks_exact(BYTES_PER_DWORD).enumerate() {
            let mut dword = [0u8; BYTES_PER_DWORD];
            dword.copy_from_slice(chunk);

            let addr = start + (i * BYTES_PER_DWORD) as u32;

            flash.wait_ready()?;
            flash.program_double_word(addr, u64::from_le_bytes(dword))?;
            flash.wait_ready()?;
            flash.clear_status();
        }

        Ok(())
    }
}

/// RAM-backed flash covering the application region.
///
/// Behaves like NOR flash: erased bytes read `0xff`, a double word may only
/// be programmed while erased, and the controller must be unlocked first.
/// Every page erase is recorded.
#[cfg(any(test, feature = "std"))]
pub struct RamFlash {
    layout: FlashLayout,
    mem: Vec<u8>,
    locked: bool,
    erases: Vec<u32>,
}

#[cfg(any(test, feature = "std"))]
impl RamFlash {
    /// Create an erased flash region
    pub fn new(layout: FlashLayout) -> Self {
        Self::filled(layout, 0xff)
    }

    /// Create a flash region with every byte set to `fill`
    pub fn filled(layout: FlashLayout, fill: u8) -> Self {
        Self {
            mem: vec![fill; layout.app_size() as usize],
            layout,
            locked: true,
            erases: vec![],
        }
    }

    /// Page indices erased so far, in order
    pub fn erased_pages(&self) -> &[u32] {
        &self.erases
    }

    pub fn clear_erase_log(&mut self) {
        self.erases.clear();
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The full application region
    pub fn image(&self) -> &[u8] {
        &self.mem
    }

    /// Overwrite the region directly, bypassing erase rules
    pub fn load(&mut self, offset: usize, data: &[u8]) -> Result<(), FlashError> {
        let end = offset + data.len();
        if end > self.mem.len() {
            return Err(FlashError::OutOfRange(self.layout.app_base + end as u32));
        }
        self.mem[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn offset(&self, addr: u32, len: usize) -> Result<usize, FlashError> {
        let offset = addr
            .checked_sub(self.layout.app_base)
            .ok_or(FlashError::OutOfRange(addr))? as usize;
        if offset + len > self.mem.len() {
            return Err(FlashError::OutOfRange(addr));
        }
        Ok(offset)
    }
}

#[cfg(any(test, feature = "std"))]
impl FlashDriver for RamFlash {
    fn unlock(&mut self) -> Result<(), FlashError> {
        self.locked = false;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), FlashError> {
        self.locked = true;
        Ok(())
    }

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        if self.locked {
            return Err(FlashError::Locked);
        }

        let addr = self.layout.flash_base + page * self.layout.page_size;
        let size = self.layout.page_size as usize;
        let offset = self.offset(addr, size)?;

        self.mem[offset..offset + size].iter_mut().for_each(|b| *b = 0xff);
        self.erases.push(page);

        Ok(())
    }

    fn wait_ready(&mut self) -> Result<(), FlashError> {
        Ok(())
    }

    fn program_double_word(&mut self, addr: u32, value: u64) -> Result<(), FlashError> {
        if self.locked {
            return Err(FlashError::Locked);
        }
        if addr as usize % BYTES_PER_DWORD != 0 {
            return Err(FlashError::Misaligned(addr));
        }

        let offset = self.offset(addr, BYTES_PER_DWORD)?;
        let target = &mut self.mem[offset..offset + BYTES_PER_DWORD];

        if target.iter().any(|b| *b != 0xff) {
            return Err(FlashError::Program);
        }

        target.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn clear_status(&mut self) {}

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let offset = self.offset(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[offset..offset + buf.len()]);
        Ok(())
    }
}
