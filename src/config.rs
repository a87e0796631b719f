//! Session-wide configuration.
//!
//! Everything here is fixed when a session is constructed; a pool hands the
//! same configuration to every session it creates.

use crate::error::FlipError;
use crate::frame::{FLIP_VERSION, MAX_DATA_FRAME_LENGTH};

/// Configuration shared by every session created from a pool.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connect through TLS. Passed to the [`Connector`](crate::Connector).
    pub ssl: bool,
    /// Compress header blocks with the dictionary-seeded zlib context.
    /// Both peers must agree; disabling it is mostly useful for tests that
    /// compare exact wire bytes.
    pub enable_compression: bool,
    /// Protocol version written into (and required on) control frames.
    pub version: u16,
    /// Largest DATA frame payload sent when uploading a request body.
    pub max_data_frame_size: usize,
    /// Largest inbound DATA frame payload accepted before the session is
    /// torn down as malformed.
    pub max_frame_length: usize,
    /// Bytes reserved for each socket read.
    pub read_buffer_size: usize,
    /// Keep idle sessions in the pool after their last stream completes.
    pub keep_alive: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ssl: false,
            enable_compression: true,
            version: FLIP_VERSION,
            max_data_frame_size: 16 * 1024,
            max_frame_length: MAX_DATA_FRAME_LENGTH,
            read_buffer_size: 8 * 1024,
            keep_alive: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn with_compression(mut self, enable: bool) -> Self {
        self.enable_compression = enable;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_max_data_frame_size(mut self, size: usize) -> Self {
        self.max_data_frame_size = size;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), FlipError> {
        if self.version == 0 || self.version > 0x7FFF {
            return Err(FlipError::InvalidRequest(format!(
                "version must fit in 15 bits and be non-zero, got {}",
                self.version
            )));
        }
        if self.max_data_frame_size == 0 || self.max_data_frame_size > MAX_DATA_FRAME_LENGTH {
            return Err(FlipError::InvalidRequest(format!(
                "max_data_frame_size must be in 1..={MAX_DATA_FRAME_LENGTH}"
            )));
        }
        if self.max_frame_length == 0 || self.max_frame_length > MAX_DATA_FRAME_LENGTH {
            return Err(FlipError::InvalidRequest(format!(
                "max_frame_length must be in 1..={MAX_DATA_FRAME_LENGTH}"
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(FlipError::InvalidRequest(
                "read_buffer_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
