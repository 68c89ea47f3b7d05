//! Ground-side client, issuing commands to a bootloader over a serial link.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::assembler::FrameAssembler;
use crate::flash::{FlashError, APP_ADDR, SUBPAGE_SLOTS};
use crate::protocol::{self, AckReason, CommandFrame, FrameBuilder, Opcode, ReplyFrame, SUBPAGE_SIZE};
use crate::{Error, Uart};

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct ClientOptions {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Hardware id sent with each command
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x0012", parse(try_from_str = parse_u16)))]
    pub hw_id: u16,

    /// Destination id of the board running the bootloader
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "0x01", parse(try_from_str = parse_u8)))]
    pub dest_id: u8,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            hw_id: 0x0012,
            dest_id: protocol::DEST_COMM,
        }
    }
}

/// Parse a decimal or `0x` prefixed hexadecimal u16
pub fn parse_u16(s: &str) -> Result<u16, core::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u16::from_str_radix(h, 16),
        None => s.parse(),
    }
}

/// Parse a decimal or `0x` prefixed hexadecimal u8
pub fn parse_u8(s: &str) -> Result<u8, core::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(h) => u8::from_str_radix(h, 16),
        None => s.parse(),
    }
}

pub struct Client<P, D, E> {
    options: ClientOptions,
    port: P,
    delay: D,
    msg_id: u16,
    assembler: FrameAssembler,
    _err: PhantomData<E>,
}

impl<P, D, E> Client<P, D, E>
where
    P: Uart<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new client instance
    pub fn new(port: P, delay: D, options: ClientOptions) -> Self {
        Self {
            options,
            port,
            delay,
            msg_id: 0,
            assembler: FrameAssembler::new(),
            _err: PhantomData,
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Check the bootloader is alive
    pub fn ping(&mut self) -> Result<(), Error<E>> {
        let reply = self.transact(protocol::ping)?;
        expect_ack(&reply, AckReason::Pong)
    }

    /// Erase the application region
    pub fn erase(&mut self) -> Result<(), Error<E>> {
        let reply = self.transact(protocol::erase)?;
        expect_ack(&reply, AckReason::Erased)
    }

    /// Write one 128-byte sub-page of the application image
    pub fn write_subpage(&mut self, subpage_id: u8, data: &[u8; SUBPAGE_SIZE]) -> Result<(), Error<E>> {
        let reply = self.transact(|hw, msg, dest| protocol::write_page(hw, msg, dest, subpage_id, data))?;
        expect_ack(&reply, AckReason::Subpage(subpage_id))
    }

    /// Write a whole image in ascending sub-page order, padding the tail with `0xff`.
    ///
    /// `progress` is called with the number of bytes written after each sub-page.
    /// Returns the number of sub-pages written.
    pub fn write_image<F: FnMut(usize)>(&mut self, image: &[u8], mut progress: F) -> Result<usize, Error<E>> {
        let count = (image.len() + SUBPAGE_SIZE - 1) / SUBPAGE_SIZE;
        if count > SUBPAGE_SLOTS as usize {
            let end = APP_ADDR as usize + image.len();
            return Err(Error::Flash(FlashError::OutOfRange(end as u32)));
        }

        for (i, chunk) in image.chunks(SUBPAGE_SIZE).enumerate() {
            let mut subpage = [0xffu8; SUBPAGE_SIZE];
            subpage[..chunk.len()].copy_from_slice(chunk);

            self.write_subpage(i as u8, &subpage)?;

            progress(i * SUBPAGE_SIZE + chunk.len());
        }

        Ok(count)
    }

    /// Request a jump into the application
    pub fn jump(&mut self) -> Result<(), Error<E>> {
        let reply = self.transact(protocol::jump)?;
        expect_ack(&reply, AckReason::Jump)
    }

    /// Read the clock, as seconds and nanoseconds since J2000
    pub fn get_time(&mut self) -> Result<(u32, u32), Error<E>> {
        let reply = self.transact(protocol::get_time)?;

        match reply.opcode() {
            Some(Opcode::AppSetTime) if reply.data().len() >= 8 => {
                let d = reply.data();
                let seconds = u32::from_le_bytes([d[0], d[1], d[2], d[3]]);
                let nanoseconds = u32::from_le_bytes([d[4], d[5], d[6], d[7]]);
                Ok((seconds, nanoseconds))
            }
            _ => Err(refusal(&reply)),
        }
    }

    /// Set the clock, as seconds and nanoseconds since J2000
    pub fn set_time(&mut self, seconds: u32, nanoseconds: u32) -> Result<(), Error<E>> {
        let reply = self.transact(|hw, msg, dest| protocol::set_time(hw, msg, dest, seconds, nanoseconds))?;

        match reply.opcode() {
            Some(Opcode::CommonAck) => Ok(()),
            _ => Err(refusal(&reply)),
        }
    }

    /// Send an arbitrary opcode and payload, returning the reply unchecked
    pub fn send_raw(&mut self, opcode: u8, data: &[u8]) -> Result<ReplyFrame, Error<E>> {
        let (hw, msg, dest) = (self.options.hw_id, self.next_msg_id(), self.options.dest_id);

        let frame = FrameBuilder::new(hw, msg, dest, opcode)
            .extend(data)
            .map_err(|_| Error::InvalidResponse)?
            .build();

        self.send(&frame)?;
        self.await_reply(msg)
    }

    fn next_msg_id(&mut self) -> u16 {
        self.msg_id = self.msg_id.wrapping_add(1);
        self.msg_id
    }

    fn transact<G>(&mut self, generate: G) -> Result<ReplyFrame, Error<E>>
    where
        G: FnOnce(u16, u16, u8) -> CommandFrame,
    {
        let msg_id = self.next_msg_id();
        let frame = generate(self.options.hw_id, msg_id, self.options.dest_id);

        self.send(&frame)?;
        self.await_reply(msg_id)
    }

    fn send(&mut self, frame: &CommandFrame) -> Result<(), Error<E>> {
        trace!("Sending {:02x?}", frame.as_bytes());

        for b in frame.as_bytes() {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    fn await_reply(&mut self, msg_id: u16) -> Result<ReplyFrame, Error<E>> {
        let mut t = 0;
        self.assembler.reset();

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(b) => {
                    self.assembler.push(b);

                    if let Some(f) = self.assembler.frame() {
                        let reply = f.clone();
                        self.assembler.reset();

                        if reply.msg_id() == msg_id {
                            trace!("Received {:02x?}", reply.as_bytes());
                            return Ok(reply);
                        }

                        debug!("Ignoring reply to message {} (awaiting {})", reply.msg_id(), msg_id);
                    }

                    continue;
                }
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms;

            if t > self.options.response_timeout_ms {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }
}

fn expect_ack<E>(reply: &ReplyFrame, reason: AckReason) -> Result<(), Error<E>> {
    match reply.opcode() {
        Some(Opcode::BootloaderAck) if reply.data().first() == Some(&reason.as_u8()) => Ok(()),
        _ => Err(refusal(reply)),
    }
}

fn refusal<E>(reply: &ReplyFrame) -> Error<E> {
    match reply.opcode() {
        Some(Opcode::BootloaderNack) | Some(Opcode::CommonNack) => {
            debug!("Received nack (msg {})", reply.msg_id());
            Error::Nack(reply.opcode_byte())
        }
        _ => {
            debug!("Received unexpected reply: {:?}", reply);
            Error::InvalidResponse
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEST_TERM;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockPort {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl embedded_hal::serial::Read<u8> for MockPort {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            self.rx.pop_front().ok_or(nb::Error::WouldBlock)
        }
    }

    impl embedded_hal::serial::Write<u8> for MockPort {
        type Error = ();

        fn write(&mut self, b: u8) -> nb::Result<(), ()> {
            self.tx.push(b);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayMs<u32> for NoDelay {
        fn delay_ms(&mut self, _ms: u32) {}
    }

    fn client(replies: &[ReplyFrame]) -> Client<MockPort, NoDelay, ()> {
        let mut port = MockPort::default();
        for r in replies {
            port.rx.extend(r.as_bytes());
        }
        Client::new(port, NoDelay, ClientOptions::default())
    }

    fn ack(msg_id: u16, reason: AckReason) -> ReplyFrame {
        FrameBuilder::new(0x0012, msg_id, DEST_TERM, Opcode::BootloaderAck as u8)
            .byte(reason.as_u8())
            .build()
    }

    #[test]
    fn ping_sends_frame_and_accepts_pong() {
        let mut c = client(&[ack(1, AckReason::Pong)]);
        c.ping().unwrap();

        assert_eq!(c.port.tx, &[0x22, 0x69, 0x06, 0x12, 0x00, 0x01, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn stale_replies_are_skipped() {
        let mut c = client(&[ack(7, AckReason::Pong), ack(1, AckReason::Pong)]);
        c.ping().unwrap();
    }

    #[test]
    fn missing_reply_times_out() {
        let mut c = client(&[ack(9, AckReason::Pong)]);
        assert_eq!(c.ping(), Err(Error::ResponseTimeout));
    }

    #[test]
    fn nack_is_reported() {
        let mut c = client(&[protocol::common_nack(0x0012, 1, DEST_TERM)]);
        assert_eq!(c.erase(), Err(Error::Nack(0xff)));

        let mut c = client(&[ack(1, AckReason::Erased)]);
        assert_eq!(c.ping(), Err(Error::InvalidResponse));
    }

    #[test]
    fn get_time_decodes_reply() {
        let reply = FrameBuilder::new(0x0012, 1, DEST_TERM, Opcode::AppSetTime as u8)
            .u32_le(653978532)
            .u32_le(184_000_000)
            .build();
        let mut c = client(&[reply]);

        assert_eq!(c.get_time(), Ok((653978532, 184_000_000)));
    }

    #[test]
    fn write_image_pads_last_subpage() {
        let mut c = client(&[ack(1, AckReason::Subpage(0)), ack(2, AckReason::Subpage(1))]);
        let image = [0x11u8; SUBPAGE_SIZE + 4];
        let mut written = vec![];

        assert_eq!(c.write_image(&image, |n| written.push(n)), Ok(2));
        assert_eq!(written, &[SUBPAGE_SIZE, SUBPAGE_SIZE + 4]);

        // Second frame carries the sub-page id, four image bytes, then padding
        let second = &c.port.tx[SUBPAGE_SIZE + 10..];
        assert_eq!(second[8], 0x02);
        assert_eq!(second[9], 1);
        assert_eq!(&second[10..14], &[0x11; 4]);
        assert!(second[14..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn oversized_image_rejected() {
        let mut c = client(&[]);
        let image = vec![0u8; SUBPAGE_SIZE * 256];
        assert!(matches!(c.write_image(&image, |_| ()), Err(Error::Flash(_))));
        assert!(c.port.tx.is_empty());
    }

    #[test]
    fn hex_or_decimal_ids() {
        assert_eq!(parse_u16("0x0012"), Ok(0x12));
        assert_eq!(parse_u16("18"), Ok(18));
        assert_eq!(parse_u8("0x0a"), Ok(10));
    }
}
