//! TAOLST serial command protocol.
//!
//! Every frame on the link shares one layout (all multi-byte fields are
//! little-endian):
//!
//! ```text
//! 0      1      2        3..5   5..7    7       8       9..
//! 0x22   0x69   bodyLen  hwId   msgId   destId  opcode  data[bodyLen - 6]
//! ```
//!
//! The total length on the wire is `bodyLen + 3`.

use core::fmt;

pub const START_BYTE_0: u8 = 0x22;
pub const START_BYTE_1: u8 = 0x69;

/// Capacity of a frame buffer, large enough for the maximum `bodyLen` of 255
pub const CMD_MAX_LEN: usize = 258;

/// Maximum number of data bytes carried by one frame
pub const DATA_MAX_LEN: usize = 249;

/// Body length of a frame carrying no data (hwId + msgId + destId + opcode)
pub const HEADER_BODY_LEN: u8 = 6;

/// Bytes preceding the body (two start bytes and the length byte)
pub const PREAMBLE_LEN: usize = 3;

pub const START_BYTE_0_INDEX: usize = 0;
pub const START_BYTE_1_INDEX: usize = 1;
pub const MSG_LEN_INDEX: usize = 2;
pub const HWID_LSB_INDEX: usize = 3;
pub const HWID_MSB_INDEX: usize = 4;
pub const MSG_ID_LSB_INDEX: usize = 5;
pub const MSG_ID_MSB_INDEX: usize = 6;
pub const DEST_ID_INDEX: usize = 7;
pub const OPCODE_INDEX: usize = 8;
pub const DATA_START_INDEX: usize = 9;

/// Bytes of image data carried by one `WRITE_PAGE` command
pub const SUBPAGE_SIZE: usize = 128;

/// Terminal (ground) destination
pub const DEST_TERM: u8 = 0x00;
/// Communications board, the LST radio
pub const DEST_COMM: u8 = 0x01;
/// Ground-facing LST radio, where replies go under the fixed policy
pub const LST: u8 = DEST_COMM;
/// Experiment board
pub const DEST_EXPT: u8 = 0x02;
/// Control board
pub const DEST_CTRL: u8 = 0x0a;
/// Relayed via the communications board
pub const DEST_COMM_RELAY: u8 = 0x11;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Liveness check, answered with a PONG acknowledgement
    BootloaderPing = 0x00,

    /// Positive bootloader acknowledgement, carries a one byte reason
    BootloaderAck = 0x01,

    /// Writes one 128-byte sub-page of the application image
    BootloaderWritePage = 0x02,

    /// Requests a jump into the application image
    BootloaderJump = 0x0b,

    /// Erases the whole application region
    BootloaderErase = 0x0c,

    /// Negative bootloader acknowledgement
    BootloaderNack = 0x0f,

    /// Generic positive acknowledgement
    CommonAck = 0x10,

    /// Free-form ASCII payload
    CommonAscii = 0x11,

    /// Application reboot request
    AppReboot = 0x12,

    /// Reads the real-time clock
    AppGetTime = 0x13,

    /// Programs the real-time clock, also used as the reply to `AppGetTime`
    AppSetTime = 0x14,

    /// Requests a telemetry frame
    AppGetTelem = 0x17,

    /// Telemetry frame
    AppTelem = 0x18,

    /// Generic negative acknowledgement
    CommonNack = 0xff,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Opcode::*;

        let o = match v {
            0x00 => BootloaderPing,
            0x01 => BootloaderAck,
            0x02 => BootloaderWritePage,
            0x0b => BootloaderJump,
            0x0c => BootloaderErase,
            0x0f => BootloaderNack,
            0x10 => CommonAck,
            0x11 => CommonAscii,
            0x12 => AppReboot,
            0x13 => AppGetTime,
            0x14 => AppSetTime,
            0x17 => AppGetTelem,
            0x18 => AppTelem,
            0xff => CommonNack,
            _ => return None,
        };

        Some(o)
    }
}

/// Reason byte carried by a `BOOTLOADER_ACK`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckReason {
    Pong,
    Erased,
    Jump,
    /// Echo of the sub-page id written by `WRITE_PAGE`
    Subpage(u8),
}

impl AckReason {
    pub fn as_u8(&self) -> u8 {
        match self {
            AckReason::Pong => 0x00,
            AckReason::Erased => 0x01,
            AckReason::Jump => 0xff,
            AckReason::Subpage(id) => *id,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ProtocolError {
    #[cfg_attr(feature = "std", error("payload of {0} bytes exceeds the frame capacity"))]
    TooLong(usize),
}

/// One protocol frame, request or reply, held in a fixed-capacity buffer.
///
/// Accessors never index past the buffer; a frame whose length byte claims
/// more than the buffer holds simply reports the bytes that are present.
#[derive(Clone)]
pub struct CommandFrame {
    buf: [u8; CMD_MAX_LEN],
}

/// Replies share the request layout
pub type ReplyFrame = CommandFrame;

impl CommandFrame {
    pub const fn empty() -> Self {
        Self {
            buf: [0u8; CMD_MAX_LEN],
        }
    }

    pub fn body_len(&self) -> u8 {
        self.buf[MSG_LEN_INDEX]
    }

    /// Total length on the wire, bounded by the buffer capacity
    pub fn len(&self) -> usize {
        (self.body_len() as usize + PREAMBLE_LEN).min(CMD_MAX_LEN)
    }

    pub fn is_empty(&self) -> bool {
        self.body_len() < HEADER_BODY_LEN
    }

    pub fn hw_id(&self) -> u16 {
        u16::from_le_bytes([self.buf[HWID_LSB_INDEX], self.buf[HWID_MSB_INDEX]])
    }

    pub fn msg_id(&self) -> u16 {
        u16::from_le_bytes([self.buf[MSG_ID_LSB_INDEX], self.buf[MSG_ID_MSB_INDEX]])
    }

    pub fn dest_id(&self) -> u8 {
        self.buf[DEST_ID_INDEX]
    }

    pub fn opcode_byte(&self) -> u8 {
        self.buf[OPCODE_INDEX]
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode_byte())
    }

    /// Data bytes following the opcode
    pub fn data(&self) -> &[u8] {
        let end = self.len().max(DATA_START_INDEX);
        &self.buf[DATA_START_INDEX..end]
    }

    /// The frame as it appears on the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len()]
    }

    /// Fetch a raw byte, `None` past the buffer capacity
    pub fn get(&self, index: usize) -> Option<u8> {
        self.buf.get(index).copied()
    }

    /// Store a raw byte, returning false if `index` is past the buffer capacity
    pub(crate) fn set(&mut self, index: usize, b: u8) -> bool {
        match self.buf.get_mut(index) {
            Some(v) => {
                *v = b;
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.buf = [0u8; CMD_MAX_LEN];
    }
}

impl Default for CommandFrame {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for CommandFrame {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFrame")
            .field("body_len", &self.body_len())
            .field("hw_id", &self.hw_id())
            .field("msg_id", &self.msg_id())
            .field("dest_id", &self.dest_id())
            .field("opcode", &self.opcode_byte())
            .field("data", &self.data())
            .finish()
    }
}

/// Incrementally constructs a frame, keeping the length byte in step with
/// the data written.
pub struct FrameBuilder {
    frame: CommandFrame,
    cursor: usize,
}

impl FrameBuilder {
    pub fn new(hw_id: u16, msg_id: u16, dest_id: u8, opcode: u8) -> Self {
        let mut frame = CommandFrame::empty();
        let hw = hw_id.to_le_bytes();
        let msg = msg_id.to_le_bytes();

        frame.buf[START_BYTE_0_INDEX] = START_BYTE_0;
        frame.buf[START_BYTE_1_INDEX] = START_BYTE_1;
        frame.buf[MSG_LEN_INDEX] = HEADER_BODY_LEN;
        frame.buf[HWID_LSB_INDEX] = hw[0];
        frame.buf[HWID_MSB_INDEX] = hw[1];
        frame.buf[MSG_ID_LSB_INDEX] = msg[0];
        frame.buf[MSG_ID_MSB_INDEX] = msg[1];
        frame.buf[DEST_ID_INDEX] = dest_id;
        frame.buf[OPCODE_INDEX] = opcode;

        Self {
            frame,
            cursor: DATA_START_INDEX,
        }
    }

    /// Append data bytes, failing if they would not fit in one frame
    pub fn extend(mut self, data: &[u8]) -> Result<Self, ProtocolError> {
        let written = self.cursor - DATA_START_INDEX;
        if written + data.len() > DATA_MAX_LEN {
            return Err(ProtocolError::TooLong(written + data.len()));
        }

        for b in data {
            self.put(*b);
        }

        Ok(self)
    }

    pub fn byte(mut self, b: u8) -> Self {
        self.put(b);
        self
    }

    pub fn u32_le(mut self, v: u32) -> Self {
        for b in v.to_le_bytes().iter() {
            self.put(*b);
        }
        self
    }

    pub fn build(self) -> CommandFrame {
        self.frame
    }

    // Fixed-size callers stay within DATA_MAX_LEN, bytes past capacity are dropped
    fn put(&mut self, b: u8) {
        if self.frame.set(self.cursor, b) {
            self.cursor += 1;
            self.frame.buf[MSG_LEN_INDEX] = (self.cursor - PREAMBLE_LEN) as u8;
        }
    }
}

/// Generate a `BOOTLOADER_PING` command
pub fn ping(hw_id: u16, msg_id: u16, dest_id: u8) -> CommandFrame {
    FrameBuilder::new(hw_id, msg_id, dest_id, Opcode::BootloaderPing as u8).build()
}

/// Generate a `BOOTLOADER_ERASE` command
pub fn erase(hw_id: u16, msg_id: u16, dest_id: u8) -> CommandFrame {
    FrameBuilder::new(hw_id, msg_id, dest_id, Opcode::BootloaderErase as u8).build()
}

/// Generate a `BOOTLOADER_WRITE_PAGE` command for one sub-page
pub fn write_page(
    hw_id: u16,
    msg_id: u16,
    dest_id: u8,
    subpage_id: u8,
    data: &[u8; SUBPAGE_SIZE],
) -> CommandFrame {
    let mut b = FrameBuilder::new(hw_id, msg_id, dest_id, Opcode::BootloaderWritePage as u8)
        .byte(subpage_id);
    for v in data.iter() {
        b.put(*v);
    }
    b.build()
}

/// Generate a `BOOTLOADER_JUMP` command
pub fn jump(hw_id: u16, msg_id: u16, dest_id: u8) -> CommandFrame {
    FrameBuilder::new(hw_id, msg_id, dest_id, Opcode::BootloaderJump as u8).build()
}

/// Generate an `APP_GET_TIME` command
pub fn get_time(hw_id: u16, msg_id: u16, dest_id: u8) -> CommandFrame {
    FrameBuilder::new(hw_id, msg_id, dest_id, Opcode::AppGetTime as u8).build()
}

/// Generate an `APP_SET_TIME` command, time is seconds and nanoseconds since J2000
pub fn set_time(hw_id: u16, msg_id: u16, dest_id: u8, seconds: u32, nanoseconds: u32) -> CommandFrame {
    FrameBuilder::new(hw_id, msg_id, dest_id, Opcode::AppSetTime as u8)
        .u32_le(seconds)
        .u32_le(nanoseconds)
        .build()
}

/// Generate a `COMMON_ACK`
pub fn common_ack(hw_id: u16, msg_id: u16, dest_id: u8) -> CommandFrame {
    FrameBuilder::new(hw_id, msg_id, dest_id, Opcode::CommonAck as u8).build()
}

/// Generate a `COMMON_NACK`
pub fn common_nack(hw_id: u16, msg_id: u16, dest_id: u8) -> CommandFrame {
    FrameBuilder::new(hw_id, msg_id, dest_id, Opcode::CommonNack as u8).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_matches_wire_layout() {
        let f = ping(0x0012, 1, DEST_COMM);
        assert_eq!(
            f.as_bytes(),
            &[0x22, 0x69, 0x06, 0x12, 0x00, 0x01, 0x00, 0x01, 0x00]
        );
        assert_eq!(f.opcode(), Some(Opcode::BootloaderPing));
        assert!(f.data().is_empty());
    }

    #[test]
    fn set_time_encodes_little_endian() {
        let f = set_time(0x0012, 0x0203, DEST_COMM, 653978532, 265936000);
        assert_eq!(f.body_len(), 14);
        assert_eq!(f.len(), 17);
        assert_eq!(f.msg_id(), 0x0203);
        assert_eq!(&f.data()[..4], &653978532u32.to_le_bytes());
        assert_eq!(&f.data()[4..], &265936000u32.to_le_bytes());
    }

    #[test]
    fn write_page_carries_subpage_and_data() {
        let f = write_page(1, 2, DEST_COMM, 0x10, &[0xa5; SUBPAGE_SIZE]);
        assert_eq!(f.body_len() as usize, 6 + 1 + SUBPAGE_SIZE);
        assert_eq!(f.data()[0], 0x10);
        assert!(f.data()[1..].iter().all(|b| *b == 0xa5));
    }

    #[test]
    fn builder_rejects_oversized_payload() {
        let data = [0u8; DATA_MAX_LEN + 1];
        let r = FrameBuilder::new(0, 0, 0, Opcode::CommonAscii as u8).extend(&data);
        assert_eq!(r.err(), Some(ProtocolError::TooLong(DATA_MAX_LEN + 1)));

        let f = FrameBuilder::new(0, 0, 0, Opcode::CommonAscii as u8)
            .extend(&data[..DATA_MAX_LEN])
            .unwrap()
            .build();
        assert_eq!(f.body_len(), 255);
        assert_eq!(f.len(), CMD_MAX_LEN);
    }

    #[test]
    fn opcode_lookup() {
        assert_eq!(Opcode::from_u8(0x0b), Some(Opcode::BootloaderJump));
        assert_eq!(Opcode::from_u8(0xff), Some(Opcode::CommonNack));
        assert_eq!(Opcode::from_u8(0x42), None);
        assert_eq!(AckReason::Jump.as_u8(), 0xff);
        assert_eq!(AckReason::Subpage(7).as_u8(), 7);
    }
}
