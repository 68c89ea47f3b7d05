//! Receive-side frame assembly.
//!
//! Bytes are pushed one at a time; the assembler tracks where it is in the
//! frame and resynchronises silently on a bad start or length byte.

use crate::protocol::{
    CommandFrame, DEST_ID_INDEX, HEADER_BODY_LEN, HWID_LSB_INDEX, HWID_MSB_INDEX, MSG_ID_LSB_INDEX,
    MSG_ID_MSB_INDEX, MSG_LEN_INDEX, OPCODE_INDEX, PREAMBLE_LEN, START_BYTE_0, START_BYTE_0_INDEX,
    START_BYTE_1, START_BYTE_1_INDEX, DATA_START_INDEX,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RxState {
    AwaitingStart0,
    AwaitingStart1,
    MsgLen,
    HwIdLsb,
    HwIdMsb,
    MsgIdLsb,
    MsgIdMsb,
    DestId,
    OpcodeByte,
    Data,
    Complete,
}

pub struct FrameAssembler {
    state: RxState,
    /// Index of the next data byte to store
    cursor: usize,
    /// Data bytes are valid for indices below `end`
    end: usize,
    frame: CommandFrame,
}

impl FrameAssembler {
    pub const fn new() -> Self {
        Self {
            state: RxState::AwaitingStart0,
            cursor: 0,
            end: 0,
            frame: CommandFrame::empty(),
        }
    }

    pub fn state(&self) -> RxState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == RxState::Complete
    }

    /// The assembled frame, once complete
    pub fn frame(&self) -> Option<&CommandFrame> {
        if self.is_complete() {
            Some(&self.frame)
        } else {
            None
        }
    }

    /// Discard any partial or complete frame and wait for a new start byte
    pub fn reset(&mut self) {
        self.state = RxState::AwaitingStart0;
        self.cursor = 0;
        self.end = 0;
        self.frame.clear();
    }

    /// Push one received byte through the state machine
    pub fn push(&mut self, b: u8) {
        use RxState::*;

        match self.state {
            // Sync scan, anything other than the first start byte is line noise
            AwaitingStart0 => {
                if b == START_BYTE_0 {
                    self.frame.set(START_BYTE_0_INDEX, b);
                    self.state = AwaitingStart1;
                }
            }
            AwaitingStart1 => {
                if b == START_BYTE_1 {
                    self.frame.set(START_BYTE_1_INDEX, b);
                    self.state = MsgLen;
                } else {
                    debug!("Bad second start byte 0x{:02x}, resyncing", b);
                    self.reset();
                }
            }
            MsgLen => {
                if b >= HEADER_BODY_LEN {
                    self.frame.set(MSG_LEN_INDEX, b);
                    self.cursor = DATA_START_INDEX;
                    self.end = b as usize + PREAMBLE_LEN;
                    self.state = HwIdLsb;
                } else {
                    debug!("Body length {} below header size, resyncing", b);
                    self.reset();
                }
            }
            HwIdLsb => self.store(HWID_LSB_INDEX, b, HwIdMsb),
            HwIdMsb => self.store(HWID_MSB_INDEX, b, MsgIdLsb),
            MsgIdLsb => self.store(MSG_ID_LSB_INDEX, b, MsgIdMsb),
            MsgIdMsb => self.store(MSG_ID_MSB_INDEX, b, DestId),
            DestId => self.store(DEST_ID_INDEX, b, OpcodeByte),
            OpcodeByte => {
                let next = if self.cursor < self.end { Data } else { Complete };
                self.store(OPCODE_INDEX, b, next);
            }
            Data => {
                if self.cursor < self.end {
                    // Bytes past the buffer capacity are counted but not stored
                    self.frame.set(self.cursor, b);
                    self.cursor += 1;
                }

                // Complete as soon as the last byte lands
                if self.cursor == self.end {
                    self.state = Complete;
                }
            }
            // Hold the frame until the dispatcher has replied to it
            Complete => (),
        }
    }

    fn store(&mut self, index: usize, b: u8, next: RxState) {
        self.frame.set(index, b);
        self.state = next;
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CMD_MAX_LEN, DATA_MAX_LEN};

    const PING: [u8; 9] = [0x22, 0x69, 0x06, 0x12, 0x00, 0x01, 0x00, 0x01, 0x00];

    fn feed(a: &mut FrameAssembler, bytes: &[u8]) -> usize {
        let mut completions = 0;
        for b in bytes {
            let was_complete = a.is_complete();
            a.push(*b);
            if !was_complete && a.is_complete() {
                completions += 1;
            }
        }
        completions
    }

    #[test]
    fn zero_data_frame_completes_on_opcode() {
        let mut a = FrameAssembler::new();
        feed(&mut a, &PING[..8]);
        assert_eq!(a.state(), RxState::OpcodeByte);
        a.push(PING[8]);
        assert!(a.is_complete());

        let f = a.frame().unwrap();
        assert_eq!(f.hw_id(), 0x0012);
        assert_eq!(f.msg_id(), 1);
        assert_eq!(f.dest_id(), 1);
        assert_eq!(f.as_bytes(), &PING);
    }

    #[test]
    fn data_frame_completes_on_last_byte() {
        let mut a = FrameAssembler::new();
        let frame = [0x22, 0x69, 0x08, 0x01, 0x00, 0x02, 0x00, 0x01, 0x11, b'h', b'i'];
        feed(&mut a, &frame[..10]);
        assert_eq!(a.state(), RxState::Data);
        a.push(frame[10]);
        assert!(a.is_complete());
        assert_eq!(a.frame().unwrap().data(), b"hi");
    }

    #[test]
    fn leading_noise_is_skipped() {
        let mut a = FrameAssembler::new();
        let mut stream = vec![0x00, 0xff, 0x69, 0x13, 0x06];
        stream.extend_from_slice(&PING);
        assert_eq!(feed(&mut a, &stream), 1);
        assert_eq!(a.frame().unwrap().as_bytes(), &PING);
    }

    #[test]
    fn bad_second_start_byte_resets() {
        let mut a = FrameAssembler::new();
        feed(&mut a, &[0x22, 0x22]);
        assert_eq!(a.state(), RxState::AwaitingStart0);
    }

    #[test]
    fn short_body_length_never_completes() {
        for len in 0..HEADER_BODY_LEN {
            let mut a = FrameAssembler::new();
            let mut stream = vec![0x22, 0x69, len];
            stream.extend_from_slice(&[0x01; 16]);
            assert_eq!(feed(&mut a, &stream), 0, "len {}", len);
            assert_eq!(a.state(), RxState::AwaitingStart0);
        }
    }

    #[test]
    fn complete_frame_ignores_further_bytes() {
        let mut a = FrameAssembler::new();
        feed(&mut a, &PING);
        feed(&mut a, &[0x22, 0x69, 0x07, 0xaa]);
        assert_eq!(a.frame().unwrap().as_bytes(), &PING);

        a.reset();
        assert_eq!(a.state(), RxState::AwaitingStart0);
        assert!(a.frame().is_none());
    }

    #[test]
    fn maximum_body_length_fits() {
        let mut a = FrameAssembler::new();
        let mut stream = vec![0x22, 0x69, 0xff, 0, 0, 0, 0, 0, 0x11];
        stream.extend_from_slice(&[0x5a; DATA_MAX_LEN]);
        assert_eq!(feed(&mut a, &stream), 1);
        assert_eq!(a.frame().unwrap().len(), CMD_MAX_LEN);
        assert_eq!(a.frame().unwrap().data().len(), DATA_MAX_LEN);
    }
}
