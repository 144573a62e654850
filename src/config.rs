// Copyright (c) 2026 The vmm-virtio-core Authors.

//! # Device configuration validation
//!
//! Mirrors the teacher's `ConfigCheck` contract
//! (`machine_manager/src/config/network.rs`): every per-class config
//! struct derives `Serialize`/`Deserialize` for config-file loading and
//! implements `check()` to reject values the device cannot act on
//! before it is ever wired into a [`crate::virtio_mmio::VirtioMmioDevice`].

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Serialize};

pub trait ConfigCheck {
    fn check(&self) -> Result<()>;
}

/// Load a validated device config from a JSON config-file fragment, the
/// on-disk counterpart to the `CmdParser`-built configs the teacher
/// constructs from the command line.
pub fn load_json<T: DeserializeOwned + ConfigCheck>(text: &str) -> Result<T> {
    let cfg: T = serde_json::from_str(text).context("parsing device config JSON")?;
    cfg.check()?;
    Ok(cfg)
}

pub fn to_json<T: Serialize>(cfg: &T) -> Result<String> {
    Ok(serde_json::to_string(cfg)?)
}

impl ConfigCheck for crate::devices::block::BlockConfig {
    fn check(&self) -> Result<()> {
        if self.capacity == 0 {
            bail!("block device capacity must be non-zero");
        }
        Ok(())
    }
}

impl ConfigCheck for crate::devices::net::NetConfig {
    fn check(&self) -> Result<()> {
        if self.mac == [0u8; 6] {
            bail!("net device mac must not be all-zero");
        }
        Ok(())
    }
}

impl ConfigCheck for crate::devices::console::ConsoleConfig {
    fn check(&self) -> Result<()> {
        if self.cols == 0 || self.rows == 0 {
            bail!("console dimensions must be non-zero");
        }
        Ok(())
    }
}

impl ConfigCheck for crate::devices::vsock::VsockConfig {
    fn check(&self) -> Result<()> {
        if self.cid < 3 {
            bail!("vsock cid must be >= 3 (0-2 are reserved)");
        }
        Ok(())
    }
}

impl ConfigCheck for crate::devices::gpu::GpuConfig {
    fn check(&self) -> Result<()> {
        if self.num_scanouts == 0 {
            bail!("gpu device must expose at least one scanout");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::block::BlockConfig;

    #[test]
    fn zero_capacity_block_config_is_rejected() {
        let cfg = BlockConfig { capacity: 0 };
        assert!(cfg.check().is_err());
    }

    #[test]
    fn nonzero_capacity_block_config_passes() {
        let cfg = BlockConfig { capacity: 2048 };
        assert!(cfg.check().is_ok());
    }

    #[test]
    fn load_json_rejects_config_failing_check() {
        let err = load_json::<BlockConfig>(r#"{"capacity":0}"#).unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }

    #[test]
    fn to_json_then_load_json_round_trips() {
        let cfg = BlockConfig { capacity: 4096 };
        let text = to_json(&cfg).unwrap();
        let loaded: BlockConfig = load_json(&text).unwrap();
        assert_eq!(loaded.capacity, 4096);
    }
}
