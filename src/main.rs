#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use taolst_boot::client::{parse_u8, Client, ClientOptions};
use taolst_boot::flash::{FlashLayout, RamFlash};
use taolst_boot::linux::Emulator;
use taolst_boot::rtc::{j2000_from_system_time, system_time_from_j2000};
use taolst_boot::Options;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    client: ClientOptions,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Check the bootloader is responding
    Ping,

    /// Erase the application region
    Erase,

    /// Write an application image (raw binary) starting at sub-page 0
    Write {
        image: String,

        /// Erase the application region first
        #[structopt(long)]
        erase: bool,
    },

    /// Start the application
    Jump,

    /// Read the board clock
    GetTime,

    /// Set the board clock, from the host clock unless a time is given
    SetTime {
        /// Seconds since J2000
        #[structopt(long, requires = "nanoseconds")]
        seconds: Option<u32>,

        /// Nanoseconds past `seconds`
        #[structopt(long)]
        nanoseconds: Option<u32>,
    },

    /// Send a raw command and print the reply
    Send {
        /// Opcode, decimal or 0x prefixed hex
        #[structopt(parse(try_from_str = parse_u8))]
        opcode: u8,

        /// Payload as a hex string
        #[structopt(default_value = "")]
        data: String,
    },

    /// Serve the bootloader on the serial port using RAM-backed flash
    Emulate {
        #[structopt(flatten)]
        options: Options,

        /// Image to preload into the emulated application region
        #[structopt(long)]
        image: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Command::Emulate { options, image } = &o.command {
        return emulate(&o, options.clone(), image.as_deref());
    }

    info!("Connecting to serial port");

    let mut c = Client::linux(&o.port, o.baud, o.client.clone())
        .map_err(|e| anyhow!("Error connecting to serial port: {:?}", e))?;

    match &o.command {
        Command::Ping => {
            c.ping()?;
            info!("Bootloader responded");
        }
        Command::Erase => {
            c.erase()?;
            info!("Application region erased");
        }
        Command::Write { image, erase } => {
            let data = std::fs::read(image).with_context(|| format!("reading {}", image))?;

            info!("Writing {} image", bytefmt::format(data.len() as u64));

            if *erase {
                c.erase()?;
            }

            let bar = ProgressBar::new(data.len() as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{bar:40} {bytes}/{total_bytes} ({eta})")
                    .progress_chars("=> "),
            );

            let n = c.write_image(&data, |written| bar.set_position(written as u64));
            bar.finish();

            info!("Wrote {} sub-pages", n?);
        }
        Command::Jump => {
            c.jump()?;
            info!("Jump acknowledged");
        }
        Command::GetTime => {
            let (seconds, nanoseconds) = c.get_time()?;
            let t = system_time_from_j2000(seconds, nanoseconds);
            let unix = t.duration_since(std::time::UNIX_EPOCH)?;

            println!("J2000 {}.{:09} (unix {}.{:09})", seconds, nanoseconds, unix.as_secs(), unix.subsec_nanos());
        }
        Command::SetTime { seconds, nanoseconds } => {
            let (s, ns) = match (seconds, nanoseconds) {
                (Some(s), Some(ns)) => (*s, *ns),
                _ => j2000_from_system_time(std::time::SystemTime::now())?,
            };

            c.set_time(s, ns)?;
            info!("Clock set to J2000 {}.{:09}", s, ns);
        }
        Command::Send { opcode, data } => {
            let payload = hex::decode(data).context("decoding payload")?;

            let reply = c.send_raw(*opcode, &payload)?;

            println!(
                "opcode 0x{:02x} msg {} dest 0x{:02x} data {}",
                reply.opcode_byte(),
                reply.msg_id(),
                reply.dest_id(),
                hex::encode(reply.data())
            );
        }
        // Handled before connecting
        Command::Emulate { .. } => (),
    }

    Ok(())
}

fn emulate(o: &Args, options: Options, image: Option<&str>) -> anyhow::Result<()> {
    let mut flash = RamFlash::new(FlashLayout::default());

    if let Some(path) = image {
        let data = std::fs::read(path).with_context(|| format!("reading {}", path))?;
        flash.load(0, &data)?;
        info!("Preloaded {} image", bytefmt::format(data.len() as u64));
    }

    let mut b = Emulator::linux(&o.port, o.baud, options, flash)
        .map_err(|e| anyhow!("Error connecting to serial port: {:?}", e))?;

    info!("Serving bootloader on {}", o.port);

    b.run()?;

    Ok(())
}
