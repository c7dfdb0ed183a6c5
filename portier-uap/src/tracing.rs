//! Provide tracing, tailored to this program.
//!
//! The binary calls [`init_journald_or_stdout`] once at startup to
//! install a subscriber. The rest of the code includes
//! `use crate::tracing::prelude::*` for the level macros.

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Check if stderr is connected to the systemd journal by validating
/// JOURNAL_STREAM.
///
/// Per systemd documentation, programs should parse the device and inode
/// numbers from JOURNAL_STREAM and compare them against stderr's file
/// descriptor to detect I/O redirection.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    let journal_stream = match std::env::var("JOURNAL_STREAM") {
        Ok(val) => val,
        Err(_) => return false,
    };

    let Some((dev, ino)) = journal_stream.split_once(':') else {
        return false;
    };
    let (Ok(expected_dev), Ok(expected_ino)) = (dev.parse::<u64>(), ino.parse::<u64>()) else {
        return false;
    };

    let stat = match rustix::fs::fstat(std::io::stderr()) {
        Ok(stat) => stat,
        Err(_) => return false,
    };

    stat.st_dev as u64 == expected_dev && stat.st_ino as u64 == expected_ino
}

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            if let Ok(layer) = tracing_journald::layer() {
                tracing_subscriber::registry().with(layer).init();
                return;
            } else {
                error!("Failed to initialize journald logging, using stdout.");
            }
        }
    }

    use_stdout();
}

// Log to stdout, filtering according to environment variable RUST_LOG,
// overriding the default level (ERROR) to INFO.
fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
