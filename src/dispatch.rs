//! Command dispatch.
//!
//! Each complete frame is looked up in a static opcode table and answered
//! with exactly one reply. Handlers return a [`Reply`] describing the
//! answer; failures are turned into the opcode's negative acknowledgement.

use core::str::FromStr;

use crate::assembler::FrameAssembler;
use crate::boot::BootState;
use crate::flash::{FlashDriver, FlashError, FlashLayout, FlashProgrammer};
use crate::protocol::{AckReason, CommandFrame, FrameBuilder, Opcode, ReplyFrame, SUBPAGE_SIZE};
use crate::reply::ReplyCursor;
use crate::rtc::{Clock, RtcError};

/// How the reply destination id is derived
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DestPolicy {
    /// Always reply to the configured ground id
    Fixed,
    /// Swap the nibbles of the request destination id
    SwapNibbles,
}

impl FromStr for DestPolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(DestPolicy::Fixed),
            "swap-nibbles" => Ok(DestPolicy::SwapNibbles),
            _ => Err("expected one of: fixed, swap-nibbles"),
        }
    }
}

/// Behaviour of the `ERASE` command
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EraseMode {
    /// Erase every application page
    Full,
    /// Acknowledge without touching flash
    ValidateOnly,
}

impl FromStr for EraseMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(EraseMode::Full),
            "validate-only" => Ok(EraseMode::ValidateOnly),
            _ => Err("expected one of: full, validate-only"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DispatchOptions {
    pub dest_policy: DestPolicy,
    pub ground_id: u8,
    pub erase_mode: EraseMode,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            dest_policy: DestPolicy::Fixed,
            ground_id: crate::protocol::LST,
            erase_mode: EraseMode::Full,
        }
    }
}

/// Reasons a well-formed frame is refused
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum CommandError {
    #[cfg_attr(feature = "std", error("command is only serviced by the bootloader"))]
    NotInBootloader,
    #[cfg_attr(feature = "std", error("command payload is malformed"))]
    Malformed,
    #[cfg_attr(feature = "std", error("clock error: {0}"))]
    Rtc(RtcError),
    #[cfg_attr(feature = "std", error("flash error: {0}"))]
    Flash(FlashError),
    #[cfg_attr(feature = "std", error("opcode 0x{0:02x} is not supported"))]
    Unsupported(u8),
}

impl From<RtcError> for CommandError {
    fn from(e: RtcError) -> Self {
        CommandError::Rtc(e)
    }
}

impl From<FlashError> for CommandError {
    fn from(e: FlashError) -> Self {
        CommandError::Flash(e)
    }
}

/// Reply descriptor produced by a command handler
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    BootloaderAck(AckReason),
    BootloaderNack,
    CommonAck,
    CommonNack,
    /// Current time, sent as an `APP_SET_TIME` frame
    Time { seconds: u32, nanoseconds: u32 },
}

impl Reply {
    pub fn opcode(&self) -> Opcode {
        match self {
            Reply::BootloaderAck(_) => Opcode::BootloaderAck,
            Reply::BootloaderNack => Opcode::BootloaderNack,
            Reply::CommonAck => Opcode::CommonAck,
            Reply::CommonNack => Opcode::CommonNack,
            Reply::Time { .. } => Opcode::AppSetTime,
        }
    }

    /// Build the reply frame, echoing the request's hardware and message ids
    pub fn encode(&self, request: &CommandFrame, dest_id: u8) -> ReplyFrame {
        let b = FrameBuilder::new(request.hw_id(), request.msg_id(), dest_id, self.opcode() as u8);

        let b = match self {
            Reply::BootloaderAck(reason) => b.byte(reason.as_u8()),
            Reply::Time { seconds, nanoseconds } => b.u32_le(*seconds).u32_le(*nanoseconds),
            _ => b,
        };

        b.build()
    }
}

/// Resources a handler may act on
pub struct Context<'a> {
    pub flash: &'a mut dyn FlashDriver,
    pub programmer: &'a FlashProgrammer,
    pub clock: &'a mut dyn Clock,
    pub boot: &'a mut BootState,
    pub options: &'a DispatchOptions,
}

type Handler = fn(&mut Context<'_>, &CommandFrame) -> Result<Reply, CommandError>;

struct Command {
    opcode: Opcode,
    handler: Handler,
    /// Reply sent when the handler fails
    failure: Reply,
}

const COMMANDS: &[Command] = &[
    Command { opcode: Opcode::BootloaderPing, handler: ping, failure: Reply::CommonNack },
    Command { opcode: Opcode::BootloaderErase, handler: erase, failure: Reply::CommonNack },
    Command { opcode: Opcode::BootloaderWritePage, handler: write_page, failure: Reply::BootloaderNack },
    Command { opcode: Opcode::BootloaderJump, handler: jump, failure: Reply::CommonNack },
    Command { opcode: Opcode::AppGetTime, handler: get_time, failure: Reply::CommonNack },
    Command { opcode: Opcode::AppSetTime, handler: set_time, failure: Reply::CommonNack },
    Command { opcode: Opcode::CommonAck, handler: common_ack, failure: Reply::CommonNack },
    Command { opcode: Opcode::CommonNack, handler: common_nack, failure: Reply::CommonNack },
];

fn lookup(opcode: u8) -> Option<&'static Command> {
    COMMANDS.iter().find(|c| c.opcode as u8 == opcode)
}

fn require_bootloader(ctx: &Context<'_>) -> Result<(), CommandError> {
    if ctx.boot.in_bootloader() {
        Ok(())
    } else {
        Err(CommandError::NotInBootloader)
    }
}

fn ping(ctx: &mut Context<'_>, _frame: &CommandFrame) -> Result<Reply, CommandError> {
    require_bootloader(ctx)?;
    Ok(Reply::BootloaderAck(AckReason::Pong))
}

fn erase(ctx: &mut Context<'_>, _frame: &CommandFrame) -> Result<Reply, CommandError> {
    require_bootloader(ctx)?;

    match ctx.options.erase_mode {
        EraseMode::Full => {
            ctx.programmer.erase(&mut *ctx.flash)?;
        }
        EraseMode::ValidateOnly => {
            warn!("Erase acknowledged without erasing (validate-only mode)");
        }
    }

    Ok(Reply::BootloaderAck(AckReason::Erased))
}

fn write_page(ctx: &mut Context<'_>, frame: &CommandFrame) -> Result<Reply, CommandError> {
    require_bootloader(ctx)?;

    let data = frame.data();
    if data.len() != 1 + SUBPAGE_SIZE {
        return Err(CommandError::Malformed);
    }

    let subpage_id = data[0];
    let mut subpage = [0u8; SUBPAGE_SIZE];
    subpage.copy_from_slice(&data[1..]);

    ctx.programmer.write_subpage(&mut *ctx.flash, subpage_id, &subpage)?;

    Ok(Reply::BootloaderAck(AckReason::Subpage(subpage_id)))
}

fn jump(ctx: &mut Context<'_>, _frame: &CommandFrame) -> Result<Reply, CommandError> {
    require_bootloader(ctx)?;

    info!("Application jump requested");
    ctx.boot.request_jump();

    Ok(Reply::BootloaderAck(AckReason::Jump))
}

fn get_time(ctx: &mut Context<'_>, _frame: &CommandFrame) -> Result<Reply, CommandError> {
    let (seconds, nanoseconds) = ctx.clock.get_time()?;
    Ok(Reply::Time { seconds, nanoseconds })
}

fn set_time(ctx: &mut Context<'_>, frame: &CommandFrame) -> Result<Reply, CommandError> {
    let data = frame.data();
    if data.len() < 8 {
        return Err(CommandError::Malformed);
    }

    let seconds = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let nanoseconds = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    ctx.clock.set_time(seconds, nanoseconds)?;

    Ok(Reply::CommonAck)
}

fn common_ack(_ctx: &mut Context<'_>, _frame: &CommandFrame) -> Result<Reply, CommandError> {
    Ok(Reply::CommonAck)
}

fn common_nack(_ctx: &mut Context<'_>, _frame: &CommandFrame) -> Result<Reply, CommandError> {
    Ok(Reply::CommonNack)
}

/// Decides and builds the reply to each complete command frame
pub struct Dispatcher {
    options: DispatchOptions,
    programmer: FlashProgrammer,
}

impl Dispatcher {
    pub fn new(options: DispatchOptions, layout: FlashLayout) -> Self {
        Self {
            options,
            programmer: FlashProgrammer::new(layout),
        }
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Destination id written into the reply to `request`
    pub fn reply_dest(&self, request: &CommandFrame) -> u8 {
        match self.options.dest_policy {
            DestPolicy::Fixed => self.options.ground_id,
            DestPolicy::SwapNibbles => request.dest_id().rotate_left(4),
        }
    }

    /// Decide the reply to one frame, running whatever command it carries
    pub fn evaluate(
        &self,
        frame: &CommandFrame,
        flash: &mut dyn FlashDriver,
        clock: &mut dyn Clock,
        boot: &mut BootState,
    ) -> Reply {
        let opcode = frame.opcode_byte();

        let command = match lookup(opcode) {
            Some(c) => c,
            None => {
                let e = CommandError::Unsupported(opcode);
                warn!("Opcode 0x{:02x} (msg {}) refused: {:?}", opcode, frame.msg_id(), e);
                return Reply::CommonNack;
            }
        };

        let mut ctx = Context {
            flash,
            programmer: &self.programmer,
            clock,
            boot,
            options: &self.options,
        };

        match (command.handler)(&mut ctx, frame) {
            Ok(r) => {
                debug!("Opcode 0x{:02x} (msg {}) -> {:?}", opcode, frame.msg_id(), r);
                r
            }
            Err(e) => {
                warn!("Opcode 0x{:02x} (msg {}) refused: {:?}", opcode, frame.msg_id(), e);
                command.failure
            }
        }
    }

    /// Handle one frame, returning the encoded reply
    pub fn handle(
        &self,
        frame: &CommandFrame,
        flash: &mut dyn FlashDriver,
        clock: &mut dyn Clock,
        boot: &mut BootState,
    ) -> ReplyFrame {
        let reply = self.evaluate(frame, flash, clock, boot);
        reply.encode(frame, self.reply_dest(frame))
    }

    /// Answer the assembled frame if there is one and the previous reply has drained.
    ///
    /// Consumes the frame and returns true when a reply was queued.
    pub fn service(
        &self,
        assembler: &mut FrameAssembler,
        cursor: &mut ReplyCursor,
        flash: &mut dyn FlashDriver,
        clock: &mut dyn Clock,
        boot: &mut BootState,
    ) -> bool {
        if !cursor.is_empty() {
            return false;
        }

        let reply = match assembler.frame() {
            Some(frame) => self.handle(frame, flash, clock, boot),
            None => return false,
        };

        assembler.reset();

        if cursor.fill(reply).is_err() {
            error!("Reply buffer busy, reply dropped");
            return false;
        }

        true
    }
}
