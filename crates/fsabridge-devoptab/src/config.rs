//! Bridge configuration.
//!
//! Built in code with [`BridgeConfig::default`] or loaded from TOML:
//!
//! ```toml
//! mount_slots = 8
//! max_read_chunk = 1048576
//! max_write_chunk = 1048576
//! staging_chunk = 32768
//! ```

use std::path::Path;

use fsabridge_shim::SHIM_ALIGNMENT;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on `mount_slots`.
pub const MAX_MOUNT_SLOTS: usize = 32;

/// Largest chunk size a single request can carry.
pub const MAX_CHUNK: usize = (u32::MAX as usize) & !(SHIM_ALIGNMENT - 1);

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Sizing knobs for the mount registry and the filesystem adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Fixed capacity of the mount registry.
    #[serde(default = "default_mount_slots")]
    pub mount_slots: usize,

    /// Largest single remote read issued straight into an aligned caller buffer.
    #[serde(default = "default_direct_chunk")]
    pub max_read_chunk: usize,

    /// Largest single remote write issued straight from an aligned caller buffer.
    #[serde(default = "default_direct_chunk")]
    pub max_write_chunk: usize,

    /// Largest single remote transfer staged through the scratch buffer.
    #[serde(default = "default_staging_chunk")]
    pub staging_chunk: usize,
}

fn default_mount_slots() -> usize {
    8
}

fn default_direct_chunk() -> usize {
    1024 * 1024
}

fn default_staging_chunk() -> usize {
    32 * 1024
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mount_slots: default_mount_slots(),
            max_read_chunk: default_direct_chunk(),
            max_write_chunk: default_direct_chunk(),
            staging_chunk: default_staging_chunk(),
        }
    }
}

fn check_chunk(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 || value % SHIM_ALIGNMENT != 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{value} is not a non-zero multiple of {SHIM_ALIGNMENT:#x}"),
        });
    }
    if value > MAX_CHUNK {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{value} exceeds {MAX_CHUNK:#x}"),
        });
    }
    Ok(())
}

impl BridgeConfig {
    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_MOUNT_SLOTS).contains(&self.mount_slots) {
            return Err(ConfigError::Invalid {
                field: "mount_slots",
                reason: format!("{} is outside 1..={MAX_MOUNT_SLOTS}", self.mount_slots),
            });
        }
        check_chunk("max_read_chunk", self.max_read_chunk)?;
        check_chunk("max_write_chunk", self.max_write_chunk)?;
        check_chunk("staging_chunk", self.staging_chunk)?;
        Ok(())
    }

    pub fn with_mount_slots(mut self, slots: usize) -> Self {
        self.mount_slots = slots;
        self
    }

    pub fn with_staging_chunk(mut self, bytes: usize) -> Self {
        self.staging_chunk = bytes;
        self
    }

    pub fn with_max_chunks(mut self, read: usize, write: usize) -> Self {
        self.max_read_chunk = read;
        self.max_write_chunk = write;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.mount_slots, 8);
        assert_eq!(config.max_read_chunk, 0x10_0000);
        assert_eq!(config.max_write_chunk, 0x10_0000);
        assert_eq!(config.staging_chunk, 0x8000);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml_str("mount_slots = 4\n").unwrap();
        assert_eq!(config.mount_slots, 4);
        assert_eq!(config.staging_chunk, 0x8000);
    }

    #[test]
    fn test_rejects_bad_values() {
        for doc in [
            "mount_slots = 0",
            "mount_slots = 33",
            "staging_chunk = 100",
            "max_read_chunk = 0",
            "max_write_chunk = 4294967296",
            "staging_chunk = 8589934592",
        ] {
            let err = BridgeConfig::from_toml_str(doc).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{doc}: {err}");
        }
        let largest = BridgeConfig::default().with_max_chunks(MAX_CHUNK, MAX_CHUNK);
        largest.validate().unwrap();
        assert!(matches!(
            BridgeConfig::from_toml_str("mount_slots = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mount_slots = 2\nstaging_chunk = 4096").unwrap();
        let config = BridgeConfig::load_from(file.path()).unwrap();
        assert_eq!(config.mount_slots, 2);
        assert_eq!(config.staging_chunk, 4096);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = BridgeConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
