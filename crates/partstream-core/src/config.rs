//! Reassembly limits.

use serde::Deserialize;

use crate::error::ConfigError;
use crate::header::DEFAULT_MAX_HEADER_SIZE;

/// Default maximum number of fields per upload.
pub const DEFAULT_MAX_FIELDS: usize = 100;

/// Default maximum number of out-of-order pieces parked per session.
pub const DEFAULT_MAX_BUFFERED_PIECES: usize = 1024;

/// Default number of finished session ids remembered.
pub const DEFAULT_RETIRED_CAPACITY: usize = 1024;

/// Configuration for the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Maximum size of one field header in bytes.
    max_header_size: usize,
    /// Maximum number of fields (including files).
    max_fields: usize,
    /// Maximum body size of one field; unlimited when unset.
    max_field_size: Option<usize>,
    /// Maximum number of buffered out-of-order pieces per session.
    max_buffered_pieces: usize,
    /// How many finished sessions are remembered to reject late pieces.
    retired_capacity: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_fields: DEFAULT_MAX_FIELDS,
            max_field_size: None,
            max_buffered_pieces: DEFAULT_MAX_BUFFERED_PIECES,
            retired_capacity: DEFAULT_RETIRED_CAPACITY,
        }
    }
}

impl ReassemblyConfig {
    /// Create a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from JSON; missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(ConfigError::Parse)
    }

    /// Set the maximum header size.
    #[must_use]
    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    /// Set the maximum number of fields.
    #[must_use]
    pub fn max_fields(mut self, count: usize) -> Self {
        self.max_fields = count;
        self
    }

    /// Set the maximum field body size.
    #[must_use]
    pub fn max_field_size(mut self, size: usize) -> Self {
        self.max_field_size = Some(size);
        self
    }

    /// Set the maximum number of buffered pieces per session.
    #[must_use]
    pub fn max_buffered_pieces(mut self, count: usize) -> Self {
        self.max_buffered_pieces = count;
        self
    }

    /// Set how many finished sessions are remembered.
    #[must_use]
    pub fn retired_capacity(mut self, count: usize) -> Self {
        self.retired_capacity = count;
        self
    }

    /// Get the maximum header size.
    #[must_use]
    pub fn get_max_header_size(&self) -> usize {
        self.max_header_size
    }

    /// Get the maximum number of fields.
    #[must_use]
    pub fn get_max_fields(&self) -> usize {
        self.max_fields
    }

    /// Get the maximum field body size.
    #[must_use]
    pub fn get_max_field_size(&self) -> Option<usize> {
        self.max_field_size
    }

    /// Get the maximum number of buffered pieces per session.
    #[must_use]
    pub fn get_max_buffered_pieces(&self) -> usize {
        self.max_buffered_pieces
    }

    /// Get the retired session capacity.
    #[must_use]
    pub fn get_retired_capacity(&self) -> usize {
        self.retired_capacity
    }
}
