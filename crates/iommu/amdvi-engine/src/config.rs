//! Engine configuration.
//!
//! Loaded from a TOML table with kebab-case keys; every key is optional.
//!
//! ```toml
//! device-id = 0x0002
//! iotlb-entries = 128
//! command-worker = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound for the linearly scanned DTE and IRTE caches.
const MAX_SCANNED_CACHE_ENTRIES: usize = 4096;

/// IOMMU emulation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct IommuConfig {
    /// PCI requester id (bus/device/function) of the IOMMU itself.
    pub device_id: u16,
    /// Capacity of the device table entry cache.
    pub dte_cache_entries: usize,
    /// Number of pre-allocated IOTLB entries.
    pub iotlb_entries: usize,
    /// Capacity of the interrupt remapping entry cache.
    pub irte_cache_entries: usize,
    /// Spawn the background command worker.
    pub command_worker: bool,
    /// Safety-net poll interval of the command worker, in milliseconds.
    pub worker_poll_ms: u64,
    /// Time budget for acquiring the device lock, in microseconds.
    pub lock_timeout_us: u64,
}

impl Default for IommuConfig {
    fn default() -> Self {
        Self {
            device_id: 0x0002,
            dte_cache_entries: 16,
            iotlb_entries: 64,
            irte_cache_entries: 32,
            command_worker: true,
            worker_poll_ms: 100,
            lock_timeout_us: 500,
        }
    }
}

impl IommuConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`IommuConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dte_cache_entries == 0 || self.dte_cache_entries > MAX_SCANNED_CACHE_ENTRIES {
            return Err(ConfigError::Invalid(format!(
                "dte-cache-entries must be in 1..={MAX_SCANNED_CACHE_ENTRIES}, got {}",
                self.dte_cache_entries
            )));
        }
        if self.irte_cache_entries == 0 || self.irte_cache_entries > MAX_SCANNED_CACHE_ENTRIES {
            return Err(ConfigError::Invalid(format!(
                "irte-cache-entries must be in 1..={MAX_SCANNED_CACHE_ENTRIES}, got {}",
                self.irte_cache_entries
            )));
        }
        if self.iotlb_entries == 0 {
            return Err(ConfigError::Invalid("iotlb-entries must be non-zero".into()));
        }
        if self.worker_poll_ms == 0 {
            return Err(ConfigError::Invalid("worker-poll-ms must be non-zero".into()));
        }
        Ok(())
    }

    /// Worker poll interval.
    #[must_use]
    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    /// Device lock acquisition budget.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_micros(self.lock_timeout_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = IommuConfig::from_toml_str("").unwrap();
        assert_eq!(config, IommuConfig::default());
        assert_eq!(config.dte_cache_entries, 16);
        assert_eq!(config.iotlb_entries, 64);
        assert_eq!(config.irte_cache_entries, 32);
    }

    #[test]
    fn kebab_case_keys_parse() {
        let config = IommuConfig::from_toml_str(
            "device-id = 0x18\niotlb-entries = 8\ncommand-worker = false\nworker-poll-ms = 5\n",
        )
        .unwrap();
        assert_eq!(config.device_id, 0x18);
        assert_eq!(config.iotlb_entries, 8);
        assert!(!config.command_worker);
        assert_eq!(config.worker_poll_interval(), Duration::from_millis(5));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = IommuConfig::from_toml_str("ppr-log = true").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = IommuConfig::from_toml_str("dte-cache-entries = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = IommuConfig::from_toml_str("worker-poll-ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reads_file() {
        use std::io::Write as _;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "irte-cache-entries = 4").unwrap();
        let config = IommuConfig::load(file.path()).unwrap();
        assert_eq!(config.irte_cache_entries, 4);

        let missing = IommuConfig::load(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
