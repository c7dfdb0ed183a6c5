//! Main entry point for the portierd bridge daemon.

use clap::Parser;
use portier_uap::{config::ParserVariant, daemon::Daemon, tracing, Config};

/// Bridge a Hörmann garage door drive onto this machine.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial device connected to the drive bus
    #[arg(default_value = "/dev/ttyUSB0")]
    device: String,

    /// Line speed in baud
    #[arg(long, default_value_t = 19_200)]
    baud: u32,

    /// Parser inactivity reset in milliseconds
    #[arg(long, default_value_t = 50)]
    packet_timeout_ms: u64,

    /// Use the strict parser instead of the salvaging one
    #[arg(long)]
    strict: bool,

    /// Keep oversized read chunks instead of clamping them
    #[arg(long)]
    no_max_length_filter: bool,

    /// Keep sync-break zero bytes instead of filtering them
    #[arg(long)]
    no_break_filter: bool,

    /// Name used for this door in log output
    #[arg(long, default_value = "Hörmann Garage Door")]
    door_name: String,

    /// Run against an in-process mock drive, no hardware needed
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let args = Args::parse();

    let mut config = Config::new(args.device);
    config.baud_rate = args.baud;
    config.packet_timeout_ms = args.packet_timeout_ms;
    config.filter_max_length = !args.no_max_length_filter;
    config.filter_breaks = !args.no_break_filter;
    config.door_name = args.door_name;
    config.parser = if args.strict {
        ParserVariant::Strict
    } else {
        ParserVariant::Salvage
    };

    let daemon = Daemon::new(config);
    let daemon = if args.mock { daemon.with_mock() } else { daemon };

    daemon.run().await
}
