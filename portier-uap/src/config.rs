//! Runtime configuration.

use std::time::Duration;

use crate::hcp1::parser::{FrameParser, ParserConfig, SalvageParser, StrictParser};
use crate::serial::SerialConfig;

/// Which stream parser recovers frames from the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserVariant {
    /// Single-pass parser for clean lines.
    Strict,
    /// Window parser that digs frames out of noise.
    #[default]
    Salvage,
}

/// Everything the daemon needs to talk to one drive.
#[derive(Debug, Clone)]
pub struct Config {
    /// OS device path of the RS485 adapter.
    pub path: String,

    /// Line speed; the drive always uses 19,200.
    pub baud_rate: u32,

    /// Parser inactivity reset, long enough to span a frame but shorter
    /// than the inter-cycle gap.
    pub packet_timeout_ms: u64,

    /// Clamp read chunks longer than a frame to their tail.
    pub filter_max_length: bool,

    /// Swallow sync-break zero bytes at chunk boundaries.
    pub filter_breaks: bool,

    /// Label used in log output.
    pub door_name: String,

    /// Parser variant to run the line through.
    pub parser: ParserVariant,
}

impl Config {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: 19_200,
            packet_timeout_ms: 50,
            filter_max_length: true,
            filter_breaks: true,
            door_name: "Hörmann Garage Door".to_string(),
            parser: ParserVariant::default(),
        }
    }

    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            baud_rate: self.baud_rate,
            ..SerialConfig::default()
        }
    }

    pub fn parser_config(&self) -> ParserConfig {
        ParserConfig {
            inactivity_timeout: Duration::from_millis(self.packet_timeout_ms),
            filter_max_length: self.filter_max_length,
            filter_breaks: self.filter_breaks,
        }
    }

    /// Instantiates the configured parser variant.
    pub fn build_parser(&self) -> Box<dyn FrameParser> {
        match self.parser {
            ParserVariant::Strict => Box::new(StrictParser::new(self.parser_config())),
            ParserVariant::Salvage => Box::new(SalvageParser::new(self.parser_config())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_bus() {
        let config = Config::new("/dev/ttyUSB0");

        assert_eq!(config.baud_rate, 19_200);
        assert_eq!(config.packet_timeout_ms, 50);
        assert!(config.filter_max_length);
        assert!(config.filter_breaks);
        assert_eq!(config.parser, ParserVariant::Salvage);
        assert_eq!(config.serial_config().data_bits, 8);
    }
}
