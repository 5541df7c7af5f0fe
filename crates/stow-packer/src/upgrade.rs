//! Persisted configuration sidecar.
//!
//! The first boot writes the effective configuration to `<config_prefix>config`.
//! Later boots read it back and force `base_bits` to the persisted value,
//! since changing it would re-route every stored item. The remaining
//! parameters may drift freely; the sidecar is rewritten to match.

use serde::{Deserialize, Serialize};
use stow_view::{Context, StorageView};
use tracing::{info, warn};

use crate::address::HashAddresser;
use crate::config::PackerConfig;
use crate::error::{PackerError, PackerResult};

/// Key of the sidecar within the config prefix.
pub const CONFIG_KEY: &str = "config";

/// JSON form of the sidecar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub base_bucket_bits: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_bits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bucket_size: Option<usize>,
}

impl PersistedConfig {
    fn from_config(config: &PackerConfig) -> Self {
        Self {
            base_bucket_bits: config.base_bits,
            shard_bits: Some(config.shard_bits),
            max_bucket_size: Some(config.max_bucket_size()),
        }
    }
}

/// What the upgrader did on startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// No sidecar existed; one was written.
    Created,
    /// The sidecar matched the configuration.
    Unchanged,
    /// Drifting parameters were rewritten to the sidecar.
    Updated,
    /// The configured base bits differed and were replaced by the persisted value.
    BaseBitsForced { persisted: u32, configured: u32 },
}

/// Reconciles a [`PackerConfig`] with the persisted sidecar.
pub struct Upgrader<'a> {
    view: &'a dyn StorageView,
}

impl<'a> Upgrader<'a> {
    /// `view` must be scoped to the config prefix.
    pub fn new(view: &'a dyn StorageView) -> Self {
        Self { view }
    }

    pub fn read(&self, ctx: &Context) -> PackerResult<Option<PersistedConfig>> {
        let Some(bytes) = self.view.get(ctx, CONFIG_KEY)? else {
            return Ok(None);
        };
        let persisted: PersistedConfig = serde_json::from_slice(&bytes)
            .map_err(|e| PackerError::corrupt(CONFIG_KEY, format!("config sidecar: {e}")))?;
        Ok(Some(persisted))
    }

    /// Apply the sidecar to `config`, creating or refreshing it as needed.
    pub fn reconcile(&self, ctx: &Context, config: &mut PackerConfig) -> PackerResult<UpgradeOutcome> {
        let Some(persisted) = self.read(ctx)? else {
            self.write(ctx, &PersistedConfig::from_config(config))?;
            info!(base_bits = config.base_bits, "wrote initial packer config");
            return Ok(UpgradeOutcome::Created);
        };

        HashAddresser::new(persisted.base_bucket_bits, config.shard_bits).map_err(|e| {
            PackerError::corrupt(CONFIG_KEY, format!("persisted base bucket bits: {e}"))
        })?;

        let configured = config.base_bits;
        let forced = persisted.base_bucket_bits != configured;
        if forced {
            warn!(
                persisted = persisted.base_bucket_bits,
                configured, "base bucket bits drifted; keeping persisted value"
            );
            config.base_bits = persisted.base_bucket_bits;
        }

        let current = PersistedConfig::from_config(config);
        if current != persisted {
            self.write(ctx, &current)?;
            info!(
                shard_bits = config.shard_bits,
                max_bucket_size = config.max_bucket_size(),
                "refreshed packer config"
            );
        }

        Ok(if forced {
            UpgradeOutcome::BaseBitsForced {
                persisted: persisted.base_bucket_bits,
                configured,
            }
        } else if current != persisted {
            UpgradeOutcome::Updated
        } else {
            UpgradeOutcome::Unchanged
        })
    }

    fn write(&self, ctx: &Context, persisted: &PersistedConfig) -> PackerResult<()> {
        let bytes = serde_json::to_vec(persisted).map_err(|e| PackerError::Internal(e.to_string()))?;
        self.view.put(ctx, CONFIG_KEY, &bytes)?;
        Ok(())
    }
}
