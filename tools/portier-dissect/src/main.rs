//! HCP1 dissector for raw bus captures.
//!
//! Reads a capture file, either raw bytes or whitespace-separated hex,
//! pushes it through one of the stream parsers and prints every frame it
//! recovers, annotated with its protocol meaning.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser as ArgParser;
use colored::Colorize;
use portier_uap::door::decode_status;
use portier_uap::hcp1::engine::{CMD_BUS_SCAN, CMD_STATUS_REQUEST, STATUS_RESPONSE};
use portier_uap::hcp1::packet::{BROADCAST_ADDR, MASTER_ADDR, UAP1_ADDR, UAP1_TYPE};
use portier_uap::hcp1::{FrameParser, Packet, ParserConfig, SalvageParser, StrictParser};

/// Protocol dissector for HCP1 bus captures
#[derive(ArgParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capture file, raw bytes by default
    input: PathBuf,

    /// Treat the input as whitespace-separated hex text
    #[arg(short = 'x', long)]
    hex: bool,

    /// Use the strict parser instead of the salvaging one
    #[arg(long)]
    strict: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.no_color {
        colored::control::set_override(false);
    }

    let raw = std::fs::read(&args.input)
        .with_context(|| format!("failed to read capture file {:?}", args.input))?;

    let bytes = if args.hex {
        let text = String::from_utf8(raw).context("hex capture is not valid UTF-8")?;
        let digits: String = text.split_whitespace().collect();
        hex::decode(&digits).context("capture is not valid hex")?
    } else {
        raw
    };

    // Offline dissection has no line timing, so timeouts and chunk
    // filters stay out of the way; bytes go in one at a time.
    let config = ParserConfig {
        inactivity_timeout: std::time::Duration::from_secs(3600),
        filter_max_length: false,
        filter_breaks: false,
    };
    let mut parser: Box<dyn FrameParser> = if args.strict {
        Box::new(StrictParser::new(config))
    } else {
        Box::new(SalvageParser::new(config))
    };

    let now = Instant::now();
    let mut frames = Vec::new();
    for byte in &bytes {
        parser.push(std::slice::from_ref(byte), now, &mut frames);
    }

    for (index, frame) in frames.iter().enumerate() {
        println!(
            "{index:4}  {}  {}",
            frame.hex_string().dimmed(),
            describe(frame)
        );
    }

    println!(
        "{} frames recovered from {} bytes",
        frames.len(),
        bytes.len()
    );

    Ok(())
}

/// One-line protocol meaning of a frame.
fn describe(frame: &Packet) -> String {
    let payload = frame.payload();

    match frame.address() {
        BROADCAST_ADDR => {
            let status = match decode_status(payload[0]) {
                Ok((door, light)) => format!("{door:?}, light {}", if light { "on" } else { "off" }),
                Err(err) => err.to_string(),
            };
            format!(
                "{} counter={} status={:02x?} ({status})",
                "broadcast".green(),
                frame.counter(),
                payload
            )
        }
        UAP1_ADDR => match payload[0] {
            CMD_BUS_SCAN => format!("{} counter={}", "scan request".cyan(), frame.counter()),
            CMD_STATUS_REQUEST => {
                format!("{} counter={}", "status request".blue(), frame.counter())
            }
            other => format!(
                "{} counter={} command={other:#04x}",
                "uap1 request".yellow(),
                frame.counter()
            ),
        },
        MASTER_ADDR if payload == [UAP1_TYPE, UAP1_ADDR] => {
            format!("{} counter={}", "scan response".magenta(), frame.counter())
        }
        MASTER_ADDR if payload[0] == STATUS_RESPONSE => format!(
            "{} counter={} cmd={:#04x} mode={:#04x}",
            "status response".magenta(),
            frame.counter(),
            payload.get(1).copied().unwrap_or(0),
            payload.get(2).copied().unwrap_or(0),
        ),
        addr => format!(
            "{} addr={addr:#04x} counter={} payload={:02x?}",
            "frame".yellow(),
            frame.counter(),
            payload
        ),
    }
}
