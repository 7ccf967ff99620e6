//! Server and connection options.

use crate::deflate;
use crate::error::{WebSocketError, WebSocketResult};
use flate2::Compression;
use std::time::Duration;

/// Default per-write deadline.
pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_secs(10);
/// Default allowed peer silence.
pub const DEFAULT_READ_INTERVAL: Duration = Duration::from_secs(60);
/// Default bound on the upgrade and close handshakes.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default largest inbound message in bytes.
pub const DEFAULT_READ_LIMIT: usize = 2048;
/// Default I/O buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Connection options.
///
/// Zero values mean "unset"; [`Options::set_defaults`] fills them in.
/// Options are frozen when the server is built, so every connection of a
/// server runs with the same values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Bound on the upgrade and on the close handshake
    pub handshake_timeout: Duration,
    /// Longest allowed silence between two inbound frames
    pub read_interval: Duration,
    /// Deadline for a single write
    pub write_interval: Duration,
    /// Cadence of keepalive pings; must be shorter than `read_interval`
    pub ping_interval: Duration,
    /// Largest inbound message in bytes, after decompression
    pub read_limit: usize,
    /// Read buffer size hint
    pub read_buffer_size: usize,
    /// Write buffer size hint
    pub write_buffer_size: usize,
    /// Acceptable subprotocols, most preferred first
    pub subprotocols: Vec<String>,
    /// Deflate level, -1 to 9; 0 disables compression
    pub compression_level: i32,
    /// Reject clients that offer none of `subprotocols`
    pub require_subprotocol: bool,
}

impl Options {
    /// Fill every unset field with its default.
    ///
    /// The ping interval defaults to 90% of the read interval.
    pub fn set_defaults(&mut self) {
        if self.write_interval.is_zero() {
            self.write_interval = DEFAULT_WRITE_INTERVAL;
        }
        if self.read_interval.is_zero() {
            self.read_interval = DEFAULT_READ_INTERVAL;
        }
        if self.handshake_timeout.is_zero() {
            self.handshake_timeout = DEFAULT_HANDSHAKE_TIMEOUT;
        }
        if self.ping_interval.is_zero() {
            self.ping_interval = self.read_interval * 9 / 10;
        }
        if self.read_limit == 0 {
            self.read_limit = DEFAULT_READ_LIMIT;
        }
        if self.read_buffer_size == 0 {
            self.read_buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.write_buffer_size == 0 {
            self.write_buffer_size = DEFAULT_BUFFER_SIZE;
        }
    }

    /// Check the invariants between fields.
    pub fn validate(&self) -> WebSocketResult<()> {
        if self.ping_interval >= self.read_interval {
            return Err(WebSocketError::InvalidOptions(format!(
                "ping interval {:?} must be shorter than read interval {:?}",
                self.ping_interval, self.read_interval
            )));
        }
        if !(-1..=9).contains(&self.compression_level) {
            return Err(WebSocketError::InvalidOptions(format!(
                "compression level {} is outside -1..=9",
                self.compression_level
            )));
        }
        if self.require_subprotocol && self.subprotocols.is_empty() {
            return Err(WebSocketError::InvalidOptions(
                "require_subprotocol needs at least one subprotocol".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether compression may be negotiated.
    pub fn compression_enabled(&self) -> bool {
        self.compression_level != 0
    }

    pub(crate) fn compression(&self) -> Option<Compression> {
        deflate::compression(self.compression_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_defaults() {
        let mut options = Options::default();
        options.set_defaults();

        assert_eq!(options.write_interval, Duration::from_secs(10));
        assert_eq!(options.read_interval, Duration::from_secs(60));
        assert_eq!(options.handshake_timeout, Duration::from_secs(1));
        assert_eq!(options.ping_interval, Duration::from_secs(54));
        assert_eq!(options.read_limit, 2048);
        assert_eq!(options.write_buffer_size, 4096);
        assert!(options.validate().is_ok());
        assert!(!options.compression_enabled());
    }

    #[test]
    fn test_ping_follows_custom_read_interval() {
        let mut options = Options {
            read_interval: Duration::from_millis(200),
            ..Default::default()
        };
        options.set_defaults();
        assert_eq!(options.ping_interval, Duration::from_millis(180));
    }

    #[test]
    fn test_explicit_values_are_kept() {
        let mut options = Options {
            read_limit: 1024,
            ping_interval: Duration::from_millis(50),
            read_interval: Duration::from_millis(200),
            compression_level: 6,
            ..Default::default()
        };
        options.set_defaults();
        assert_eq!(options.read_limit, 1024);
        assert_eq!(options.ping_interval, Duration::from_millis(50));
        assert!(options.compression_enabled());
        assert_eq!(options.compression(), Some(Compression::new(6)));
    }

    #[test]
    fn test_validate_rejects_slow_pings() {
        let mut options = Options {
            read_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(1),
            ..Default::default()
        };
        options.set_defaults();
        assert!(matches!(
            options.validate(),
            Err(WebSocketError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_validate_compression_level() {
        let mut options = Options {
            compression_level: 11,
            ..Default::default()
        };
        options.set_defaults();
        assert!(options.validate().is_err());

        options.compression_level = -1;
        assert!(options.validate().is_ok());
    }
}
