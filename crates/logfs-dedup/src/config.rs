//! Volume and dedup-layer configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, DedupResult};
use crate::sentinel::RESERVED_ADDR_START;

/// Tuning knobs for the sharing protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Number of random pages compared before establishing sharing.
    pub sample_pages: usize,
    /// Files smaller than this are not worth sharing.
    pub min_share_bytes: u64,
    /// Pages copied and written back per revocation batch (one segment).
    pub revoke_batch_pages: usize,
    /// Maximum number of in-flight orphan-ledger entries.
    pub orphan_capacity: usize,
    /// Upper bound on waiting for in-flight readers and direct I/O.
    pub drain_timeout_ms: u64,
    /// Seed for page sampling; entropy when unset.
    pub sample_seed: Option<u64>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            sample_pages: 8,
            min_share_bytes: 64 * 1024,
            revoke_batch_pages: 512, // one 2MB segment
            orphan_capacity: 1024,
            drain_timeout_ms: 5_000,
            sample_seed: None,
        }
    }
}

impl DedupConfig {
    /// Drain timeout as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Configuration for a volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Name/label for this volume
    pub name: String,
    /// Capacity of the in-memory block store, in 4KB blocks
    pub total_blocks: u64,
    /// Sharing protocol tuning
    pub dedup: DedupConfig,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            name: "logfs".to_string(),
            total_blocks: 65536, // 256MB
            dedup: DedupConfig::default(),
        }
    }
}

impl VolumeConfig {
    /// Loads a config from a `.json` or `.toml` file and validates it.
    pub fn from_file(path: &Path) -> DedupResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: VolumeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| DedupError::InvalidConfig(e.to_string()))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| DedupError::InvalidConfig(e.to_string()))?,
            _ => {
                return Err(DedupError::InvalidConfig(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that every field is in range.
    pub fn validate(&self) -> DedupResult<()> {
        if self.total_blocks == 0 || self.total_blocks >= u64::from(RESERVED_ADDR_START) {
            return Err(DedupError::InvalidConfig(format!(
                "total_blocks must be in 1..{}, got {}",
                RESERVED_ADDR_START, self.total_blocks
            )));
        }
        if self.dedup.sample_pages == 0 {
            return Err(DedupError::InvalidConfig("sample_pages must be at least 1".into()));
        }
        if self.dedup.min_share_bytes == 0 {
            return Err(DedupError::InvalidConfig("min_share_bytes must be at least 1".into()));
        }
        if self.dedup.revoke_batch_pages == 0 {
            return Err(DedupError::InvalidConfig("revoke_batch_pages must be at least 1".into()));
        }
        if self.dedup.orphan_capacity < 2 {
            // a revocation that releases its inner needs two slots
            return Err(DedupError::InvalidConfig("orphan_capacity must be at least 2".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_is_valid() {
        assert!(VolumeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_samples() {
        let mut config = VolumeConfig::default();
        config.dedup.sample_pages = 0;
        assert!(matches!(config.validate(), Err(DedupError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_reserved_capacity() {
        let config = VolumeConfig {
            total_blocks: u64::from(RESERVED_ADDR_START),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file_with_partial_fields() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, r#"{{"name": "vol0", "dedup": {{"sample_pages": 3}}}}"#).unwrap();

        let config = VolumeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "vol0");
        assert_eq!(config.dedup.sample_pages, 3);
        assert_eq!(config.dedup.revoke_batch_pages, 512);
        assert_eq!(config.total_blocks, 65536);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "total_blocks = 1024").unwrap();
        writeln!(file, "[dedup]").unwrap();
        writeln!(file, "min_share_bytes = 4096").unwrap();
        writeln!(file, "sample_seed = 7").unwrap();

        let config = VolumeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.total_blocks, 1024);
        assert_eq!(config.dedup.min_share_bytes, 4096);
        assert_eq!(config.dedup.sample_seed, Some(7));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        assert!(matches!(
            VolumeConfig::from_file(file.path()),
            Err(DedupError::InvalidConfig(_))
        ));
    }
}
