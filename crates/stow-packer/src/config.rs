use serde::{Deserialize, Serialize};

use crate::address::HashAddresser;
use crate::error::{PackerError, PackerResult};

const KIB: usize = 1024;

/// Headroom kept below a backend's per-entry ceiling.
const CEILING_HEADROOM: usize = 4 * KIB;

/// Class of the underlying store, which fixes its per-entry ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendClass {
    /// Stores capping entries at 256 KiB.
    #[default]
    Compact,
    /// Stores capping entries at 400 KiB.
    Large,
}

impl BackendClass {
    pub fn entry_ceiling(self) -> usize {
        match self {
            BackendClass::Compact => 256 * KIB,
            BackendClass::Large => 400 * KIB,
        }
    }

    pub fn default_max_bucket_size(self) -> usize {
        match self {
            BackendClass::Compact => 240 * KIB,
            BackendClass::Large => 256 * KIB,
        }
    }

    /// Hard upper bound for `max_bucket_size`.
    pub fn max_bucket_size_limit(self) -> usize {
        self.entry_ceiling() - CEILING_HEADROOM
    }
}

/// Packer configuration.
///
/// Loaded from TOML by the CLI; every field has a default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackerConfig {
    /// Key prefix for bucket entries.
    pub storage_prefix: String,
    /// Key prefix for the config sidecar.
    pub config_prefix: String,
    /// Hash bits selecting the primary bucket. Frozen after first boot.
    pub base_bits: u32,
    /// Hash bits consumed per shard level.
    pub shard_bits: u32,
    pub backend_class: BackendClass,
    /// Bucket size limit in bytes; defaults by backend class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bucket_size: Option<usize>,
    /// Number of striped bucket locks. Must be a power of two.
    pub lock_stripes: usize,
    /// Compress buckets with zstd when it shrinks them.
    pub compress: bool,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            storage_prefix: "packer/buckets/".into(),
            config_prefix: "packer/config/".into(),
            base_bits: 8,
            shard_bits: 4,
            backend_class: BackendClass::default(),
            max_bucket_size: None,
            lock_stripes: 256,
            compress: true,
        }
    }
}

impl PackerConfig {
    pub fn from_toml_str(s: &str) -> PackerResult<Self> {
        toml::from_str(s).map_err(|e| PackerError::InvalidArgument(format!("config: {e}")))
    }

    pub fn to_toml_string(&self) -> PackerResult<String> {
        toml::to_string_pretty(self).map_err(|e| PackerError::Internal(e.to_string()))
    }

    /// Effective bucket size limit.
    pub fn max_bucket_size(&self) -> usize {
        self.max_bucket_size
            .unwrap_or_else(|| self.backend_class.default_max_bucket_size())
    }

    /// Normalize prefixes and validate every field.
    pub fn normalized(mut self) -> PackerResult<Self> {
        self.storage_prefix = normalize_prefix(&self.storage_prefix);
        self.config_prefix = normalize_prefix(&self.config_prefix);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> PackerResult<()> {
        HashAddresser::new(self.base_bits, self.shard_bits)?;

        if self.storage_prefix.is_empty() || !self.storage_prefix.ends_with('/') {
            return Err(PackerError::InvalidArgument(format!(
                "storage prefix {:?} must be non-empty and end with '/'",
                self.storage_prefix
            )));
        }
        if self.config_prefix.is_empty() || !self.config_prefix.ends_with('/') {
            return Err(PackerError::InvalidArgument(format!(
                "config prefix {:?} must be non-empty and end with '/'",
                self.config_prefix
            )));
        }
        if self.config_prefix.starts_with(&self.storage_prefix)
            || self.storage_prefix.starts_with(&self.config_prefix)
        {
            return Err(PackerError::InvalidArgument(format!(
                "storage prefix {:?} and config prefix {:?} overlap",
                self.storage_prefix, self.config_prefix
            )));
        }

        let max = self.max_bucket_size();
        let limit = self.backend_class.max_bucket_size_limit();
        if max == 0 {
            return Err(PackerError::InvalidArgument(
                "max bucket size must be positive".into(),
            ));
        }
        if max > limit {
            return Err(PackerError::InvalidArgument(format!(
                "max bucket size {max} exceeds the {limit} byte limit for {:?} backends",
                self.backend_class
            )));
        }

        if self.lock_stripes == 0 || !self.lock_stripes.is_power_of_two() {
            return Err(PackerError::InvalidArgument(format!(
                "lock stripe count {} is not a power of two",
                self.lock_stripes
            )));
        }
        Ok(())
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}
