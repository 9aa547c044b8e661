//! Engine configuration.

use karst_error::{KarstError, Result};
use karst_types::BlockSize;
use std::time::Duration;

/// Configuration for formatting or opening a karst volume.
///
/// When opening an existing volume, the geometry fields are replaced by
/// the superblock's values; the runtime knobs (pool sizing, compression,
/// advice deadline) always come from here.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub uuid: [u8; 16],
    pub block_size: BlockSize,
    /// Size of the exposed logical address space, in blocks.
    pub logical_blocks: u64,
    pub logical_zones: u8,
    pub physical_zones: u8,
    pub hash_zones: u8,
    /// Blocks per slab (data + refcount area + slab-journal tail).
    pub slab_blocks: u64,
    /// Recovery-journal ring size in blocks.
    pub journal_blocks: u64,
    /// Data-VIO pool size (bounds in-flight requests).
    pub pool_size: u32,
    /// Concurrent-discard bound; smaller than the pool to limit
    /// metadata churn from trims.
    pub discard_limit: u32,
    /// Whether the write path attempts compression and packing.
    pub compression: bool,
    /// Soft deadline for dedup-advice queries.
    pub advice_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            uuid: [0; 16],
            block_size: BlockSize::default(),
            logical_blocks: 1 << 20,
            logical_zones: 2,
            physical_zones: 2,
            hash_zones: 2,
            slab_blocks: 4096,
            journal_blocks: 64,
            pool_size: 64,
            discard_limit: 8,
            compression: true,
            advice_deadline: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.logical_blocks == 0 {
            return Err(KarstError::Format("logical space must be nonzero".to_owned()));
        }
        if self.logical_zones == 0 || self.physical_zones == 0 || self.hash_zones == 0 {
            return Err(KarstError::Format("zone counts must be nonzero".to_owned()));
        }
        if self.pool_size == 0 {
            return Err(KarstError::Format("request pool must be nonzero".to_owned()));
        }
        if self.discard_limit == 0 || self.discard_limit > self.pool_size {
            return Err(KarstError::Format(
                "discard limit must be in 1..=pool size".to_owned(),
            ));
        }
        if self.journal_blocks < 2 {
            return Err(KarstError::Format(
                "recovery journal needs at least two blocks".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_configs_are_rejected() {
        let mut config = EngineConfig::default();
        config.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.discard_limit = config.pool_size + 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.journal_blocks = 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.hash_zones = 0;
        assert!(config.validate().is_err());
    }
}
