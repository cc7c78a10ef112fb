// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Loads the `.ini`-format settings file: one `config::Config` builder pass over a
//! fixed `Raw` shadow struct, section by section, each with its own defaults so a
//! missing or partial file still yields a usable `IniSettings`.

use crate::error::Error;
use crate::node::{GasConfig, KernelTech, NodeConfig, NonceGeneration, ThermalConfig};

use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// `[0xBitcoin]`
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TokenConfig {
    pub miner_acct: String,
    /// Target one accepted solution every N minutes; 0 disables local re-targeting
    /// and the provider-supplied target/difficulty is used as-is.
    pub minutes_per_share: f64,
    /// Display-only difficulty override (`_Difficulty_` in the original INI, kept
    /// verbatim since it is user-visible config key the original miner shipped).
    pub difficulty: Option<u64>,
    pub gas_price_bidding: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            miner_acct: String::new(),
            minutes_per_share: 0.0,
            difficulty: None,
            gas_price_bidding: false,
        }
    }
}

/// `[CloseHits]`
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CloseHitsConfig {
    pub enabled: bool,
    pub close_hit_threshold: String,
    pub work_unit_frequency: u32,
}

impl Default for CloseHitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // upper 64 bits as hex; `0xFFFFFF0000000000` by default
            close_hit_threshold: "0xFFFFFF0000000000".to_string(),
            work_unit_frequency: 1,
        }
    }
}

/// `[Kernel]`
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub tech: KernelTech,
    pub src_folder: String,
    pub src_file: String,
    pub clrx_assembler: bool,
}

/// `[Network]`
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NetworkConfig {
    pub udp_listen: u16,
    pub udp_password: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            udp_listen: 5225,
            udp_password: String::new(),
        }
    }
}

/// `[General]`
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct GeneralConfig {
    pub nonce_generation: NonceGeneration,
    pub verify_dag: bool,
    pub dev_fee: f64,
}

/// Every INI section the core consumes, parsed from the file named by `--config`.
#[derive(Clone, Debug)]
pub struct IniSettings {
    pub node: NodeConfig,
    pub node2: NodeConfig,
    pub node2_configured: bool,
    pub network: NetworkConfig,
    pub token: TokenConfig,
    pub gas: GasConfig,
    pub thermal: ThermalConfig,
    pub close_hits: CloseHitsConfig,
    pub kernel: KernelConfig,
    pub general: GeneralConfig,
}

/// Shadow of [`IniSettings`] with section names matching INI headers for `serde`.
#[derive(Deserialize, Clone, Debug, Default)]
struct Raw {
    #[serde(rename = "Node", default)]
    node: NodeConfig,
    #[serde(rename = "Node2", default)]
    node2: Option<NodeConfig>,
    #[serde(rename = "Network", default)]
    network: NetworkConfig,
    #[serde(rename = "0xBitcoin", default)]
    token: TokenConfig,
    #[serde(rename = "Gas", default)]
    gas: GasConfig,
    #[serde(rename = "ThermalProtection", default)]
    thermal: ThermalConfig,
    #[serde(rename = "CloseHits", default)]
    close_hits: CloseHitsConfig,
    #[serde(rename = "Kernel", default)]
    kernel: KernelConfig,
    #[serde(rename = "General", default)]
    general: GeneralConfig,
}

impl IniSettings {
    pub fn load(path: &Path) -> Result<Self, Error> {
        // A missing config file is not an error: every section has INI-equivalent
        // defaults and the CLI may supply everything that matters (node address,
        // account). We still attempt to read it so a present-but-malformed file is
        // reported.
        let builder = if path.exists() {
            Config::builder().add_source(File::new(
                path.to_str().unwrap_or_default(),
                FileFormat::Ini,
            ))
        } else {
            Config::builder()
        };

        let raw: Raw = builder
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|source| Error::Ini {
                path: PathBuf::from(path),
                source,
            })?;

        let node2_configured = raw.node2.is_some();
        Ok(Self {
            node: raw.node,
            node2: raw.node2.unwrap_or_default(),
            node2_configured,
            network: raw.network,
            token: raw.token,
            gas: raw.gas,
            thermal: raw.thermal,
            close_hits: raw.close_hits,
            kernel: raw.kernel,
            general: raw.general,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = IniSettings::load(Path::new("/nonexistent/xbtc-miner.conf")).unwrap();
        assert_eq!(settings.network.udp_listen, 5225);
        assert!(!settings.node2_configured);
    }
}
