//! End-to-end exchanges with a bootloader over a scripted UART.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::serial::{Read, Write};

use taolst_boot::assembler::FrameAssembler;
use taolst_boot::boot::{BootState, Jumper};
use taolst_boot::dispatch::{DestPolicy, EraseMode};
use taolst_boot::flash::{FlashDriver, FlashLayout, RamFlash, APP_ADDR};
use taolst_boot::protocol::{self, CommandFrame, Opcode, DEST_COMM, DEST_COMM_RELAY, SUBPAGE_SIZE};
use taolst_boot::rtc::{SoftRtc, NS_BIAS};
use taolst_boot::{Bootloader, Options};

/// In-memory UART; optionally refuses every other write to exercise back-pressure
#[derive(Default)]
struct ScriptedUart {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    stall: bool,
    stalled: bool,
    /// Receive errors reported when `rx` reaches these lengths
    rx_errors: Vec<usize>,
}

impl Read<u8> for ScriptedUart {
    type Error = ();

    fn read(&mut self) -> nb::Result<u8, ()> {
        let remaining = self.rx.len();
        if let Some(i) = self.rx_errors.iter().position(|n| *n == remaining) {
            self.rx_errors.remove(i);
            return Err(nb::Error::Other(()));
        }

        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for ScriptedUart {
    type Error = ();

    fn write(&mut self, b: u8) -> nb::Result<(), ()> {
        if self.stall {
            self.stalled = !self.stalled;
            if self.stalled {
                return Err(nb::Error::WouldBlock);
            }
        }

        self.tx.push(b);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), ()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingDelay {
    us: u32,
}

impl DelayUs<u32> for RecordingDelay {
    fn delay_us(&mut self, us: u32) {
        self.us += us;
    }
}

struct PanicJumper;

impl Jumper for PanicJumper {
    unsafe fn jump(&mut self, base: u32) -> ! {
        panic!("jumped to 0x{:08x}", base)
    }
}

type Board = Bootloader<ScriptedUart, RamFlash, SoftRtc, PanicJumper, RecordingDelay, ()>;

fn board_with(flash: RamFlash, options: Options) -> Board {
    Bootloader::new(
        ScriptedUart::default(),
        flash,
        SoftRtc::new(),
        RecordingDelay::default(),
        PanicJumper,
        options,
    )
}

fn board() -> Board {
    board_with(RamFlash::new(FlashLayout::default()), Options::default())
}

/// Feed `bytes` to the board, run it until idle and collect the replies
fn exchange(b: &mut Board, bytes: &[u8]) -> Vec<CommandFrame> {
    b.port_mut().rx.extend(bytes);

    let mut idle = 0;
    while idle < 4 {
        b.poll().unwrap();

        if b.port().rx.is_empty() && !b.reply_pending() {
            idle += 1;
        }
    }

    let mut replies = vec![];
    let mut assembler = FrameAssembler::new();

    for v in std::mem::take(&mut b.port_mut().tx) {
        assembler.push(v);
        if let Some(f) = assembler.frame() {
            replies.push(f.clone());
            assembler.reset();
        }
    }

    replies
}

fn send(b: &mut Board, frame: &CommandFrame) -> CommandFrame {
    let mut replies = exchange(b, frame.as_bytes());
    assert_eq!(replies.len(), 1, "expected exactly one reply");
    replies.remove(0)
}

#[test]
fn ping_is_answered_with_pong() {
    let mut b = board();

    let replies = exchange(&mut b, &[0x22, 0x69, 0x06, 0x12, 0x00, 0x01, 0x00, 0x01, 0x00]);

    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].as_bytes(),
        &[0x22, 0x69, 0x07, 0x12, 0x00, 0x01, 0x00, 0x01, 0x01, 0x00]
    );
}

#[test]
fn written_subpage_reads_back() {
    let mut b = board();

    let reply = send(&mut b, &protocol::write_page(0x0012, 2, DEST_COMM, 0, &[0xff; SUBPAGE_SIZE]));

    assert_eq!(reply.opcode(), Some(Opcode::BootloaderAck));
    assert_eq!(reply.data(), &[0]);

    let mut readback = [0u8; SUBPAGE_SIZE];
    b.flash().read(APP_ADDR, &mut readback).unwrap();
    assert_eq!(&readback[..], &[0xff; SUBPAGE_SIZE][..]);
    assert_eq!(b.flash().erased_pages(), &[16]);
    assert!(b.flash().is_locked());
}

#[test]
fn receive_errors_drop_the_partial_frame() {
    let mut b = board();

    let first = protocol::ping(0x0012, 1, DEST_COMM);
    let second = protocol::ping(0x0012, 2, DEST_COMM);

    let mut bytes = first.as_bytes()[..5].to_vec();
    bytes.extend_from_slice(second.as_bytes());

    // Overrun before anything arrives, then again mid-frame
    b.port_mut().rx_errors = vec![bytes.len(), second.len()];

    let replies = exchange(&mut b, &bytes);

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].msg_id(), 2);
    assert_eq!(replies[0].opcode(), Some(Opcode::BootloaderAck));
    assert_eq!(replies[0].data(), &[0x00]);
    assert!(b.port().rx_errors.is_empty());
}

#[test]
fn jump_to_blank_flash_is_abandoned() {
    let mut b = board_with(RamFlash::filled(FlashLayout::default(), 0x00), Options::default());

    let reply = send(&mut b, &protocol::jump(0x0012, 3, DEST_COMM));

    assert_eq!(reply.opcode(), Some(Opcode::BootloaderAck));
    assert_eq!(reply.data(), &[0xff]);
    assert!(!b.state().jump_pending());
    assert!(b.state().in_bootloader());

    // Still serving commands
    let reply = send(&mut b, &protocol::ping(0x0012, 4, DEST_COMM));
    assert_eq!(reply.data(), &[0x00]);
}

#[test]
fn noise_and_truncated_frames_yield_one_frame() {
    let mut b = board();

    let mut bytes = vec![0x00, 0x13, 0x22, 0x69, 0x02];
    bytes.extend_from_slice(&[0x22, 0x55]);
    bytes.extend_from_slice(protocol::ping(0x0012, 9, DEST_COMM).as_bytes());

    let replies = exchange(&mut b, &bytes);

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].msg_id(), 9);
    assert_eq!(replies[0].opcode(), Some(Opcode::BootloaderAck));
}

#[test]
fn replies_follow_request_order_under_back_pressure() {
    let mut b = board();
    b.port_mut().stall = true;

    let mut bytes = vec![];
    for msg_id in 1..=3 {
        bytes.extend_from_slice(protocol::ping(0x0012, msg_id, DEST_COMM).as_bytes());
    }

    let replies = exchange(&mut b, &bytes);

    let ids: Vec<u16> = replies.iter().map(|r| r.msg_id()).collect();
    assert_eq!(ids, &[1, 2, 3]);
}

#[test]
fn valid_image_is_started_after_reply_drains() {
    let mut b = board();

    let reply = send(&mut b, &protocol::erase(0x0012, 1, DEST_COMM));
    assert_eq!(reply.data(), &[0x01]);

    // Vector table: stack at the top of SRAM1, reset handler in the image
    let mut first = [0xa5u8; SUBPAGE_SIZE];
    first[..4].copy_from_slice(&0x2004_0000u32.to_le_bytes());
    first[4..8].copy_from_slice(&0x0800_8101u32.to_le_bytes());

    let reply = send(&mut b, &protocol::write_page(0x0012, 2, DEST_COMM, 0, &first));
    assert_eq!(reply.opcode(), Some(Opcode::BootloaderAck));

    for id in 1..20u8 {
        let reply = send(&mut b, &protocol::write_page(0x0012, 2 + id as u16, DEST_COMM, id, &[id; SUBPAGE_SIZE]));
        assert_eq!(reply.data(), &[id]);
    }

    assert_eq!(&b.flash().image()[..4], &0x2004_0000u32.to_le_bytes());
    assert!(b.flash().image()[19 * SUBPAGE_SIZE..20 * SUBPAGE_SIZE].iter().all(|v| *v == 19));
    assert!(b.flash().image()[20 * SUBPAGE_SIZE..].iter().all(|v| *v == 0xff));

    b.port_mut().rx.extend(protocol::jump(0x0012, 30, DEST_COMM).as_bytes());

    let res = catch_unwind(AssertUnwindSafe(|| loop {
        b.poll().unwrap();
    }));
    let msg = res.unwrap_err();
    assert_eq!(msg.downcast_ref::<String>().map(|s| s.as_str()), Some("jumped to 0x08008000"));

    // Acknowledgement fully sent before the line was flushed and control handed over
    let mut assembler = FrameAssembler::new();
    for v in &b.port().tx {
        assembler.push(*v);
    }
    let ack = assembler.frame().unwrap();
    assert_eq!(ack.msg_id(), 30);
    assert_eq!(ack.data(), &[0xff]);

    assert!(!b.state().in_bootloader());
    assert!(!b.state().jump_pending());
}

#[test]
fn application_mode_refuses_bootloader_commands() {
    let mut b = board().with_state(BootState::application());

    let reply = send(&mut b, &protocol::ping(0x0012, 1, DEST_COMM));
    assert_eq!(reply.opcode(), Some(Opcode::CommonNack));

    let reply = send(&mut b, &protocol::write_page(0x0012, 2, DEST_COMM, 0, &[0; SUBPAGE_SIZE]));
    assert_eq!(reply.opcode(), Some(Opcode::BootloaderNack));
    assert!(b.flash().erased_pages().is_empty());

    // Clock commands are still served
    let reply = send(&mut b, &protocol::set_time(0x0012, 3, DEST_COMM, 653978532, 265936000));
    assert_eq!(reply.opcode(), Some(Opcode::CommonAck));
}

#[test]
fn clock_is_unset_until_programmed() {
    let mut b = board();

    let reply = send(&mut b, &protocol::get_time(0x0012, 1, DEST_COMM));
    assert_eq!(reply.opcode(), Some(Opcode::CommonNack));
    assert_eq!(reply.msg_id(), 1);

    let reply = send(&mut b, &protocol::set_time(0x0012, 2, DEST_COMM, 0, 100));
    assert_eq!(reply.opcode(), Some(Opcode::CommonNack));
    assert!(!b.clock().is_set());

    let reply = send(&mut b, &protocol::set_time(0x0012, 3, DEST_COMM, 653978532, 265936000));
    assert_eq!(reply.opcode(), Some(Opcode::CommonAck));
    assert_eq!(b.clock().driver().registers(), (0x0020_2921, 0x0016_4108));

    let reply = send(&mut b, &protocol::get_time(0x0012, 4, DEST_COMM));
    assert_eq!(reply.opcode(), Some(Opcode::AppSetTime));
    assert_eq!(reply.body_len(), 0x0e);
    assert_eq!(&reply.data()[..4], &653978532u32.to_le_bytes());
    assert_eq!(&reply.data()[4..], &NS_BIAS.to_le_bytes());
}

#[test]
fn configured_reply_destination_and_erase() {
    let options = Options {
        dest_policy: DestPolicy::SwapNibbles,
        erase_mode: EraseMode::ValidateOnly,
        ..Options::default()
    };
    let mut b = board_with(RamFlash::filled(FlashLayout::default(), 0x42), options);

    let reply = send(&mut b, &protocol::ping(0x0012, 1, 0x1a));
    assert_eq!(reply.dest_id(), 0xa1);

    let reply = send(&mut b, &protocol::erase(0x0012, 2, DEST_COMM_RELAY));
    assert_eq!(reply.opcode(), Some(Opcode::BootloaderAck));
    assert_eq!(reply.dest_id(), 0x11);
    assert!(b.flash().image().iter().all(|v| *v == 0x42));
}

#[test]
fn unsupported_opcode_gets_common_nack() {
    let mut b = board();

    let telem = protocol::FrameBuilder::new(0x0012, 5, DEST_COMM, Opcode::AppGetTelem as u8).build();
    let reply = send(&mut b, &telem);

    assert_eq!(reply.opcode(), Some(Opcode::CommonNack));
    assert_eq!(reply.msg_id(), 5);
    assert_eq!(reply.hw_id(), 0x0012);
}
