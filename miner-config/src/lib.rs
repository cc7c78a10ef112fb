// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! CLI argument parsing and INI settings loading for xbtc-miner.
//!
//! Kept separate from the mining core on purpose: this crate never touches sockets
//! or devices, it only produces a validated [`Settings`] value the core is built from.

mod error;
mod ini;
mod node;

pub use error::Error;
pub use ini::IniSettings;
pub use node::{GasConfig, KernelTech, NodeConfig, NonceGeneration, ThermalConfig};

// reexport so downstream crates need not depend on these directly
pub use clap;
pub use config;

use clap::Parser;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Backend acceleration technology selected on the command line (`-G|-C|-U`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    OpenCl,
    Cpu,
    Cuda,
}

/// Top level command-line interface, mirrors the subset of flags spec'd for the core.
#[derive(Parser, Debug, Clone)]
#[command(name = "xbtc-miner", version, about = "Multi-GPU 0xBitcoin-family miner")]
pub struct Cli {
    /// Primary node, `host[:port]`
    #[arg(short = 'N', long = "node")]
    pub node: Option<String>,

    /// Failover node, `host[:port]`
    #[arg(long = "node2")]
    pub node2: Option<String>,

    /// Solo polling interval in milliseconds
    #[arg(short = 'I', long = "polling-interval", default_value_t = 2000)]
    pub polling_interval_ms: u64,

    /// Maximum consecutive connection retries before failing over
    #[arg(short = 'R', long = "retries", default_value_t = 4)]
    pub retries: u32,

    /// Seconds without a new pool job before forcing a reconnect
    #[arg(long = "work-timeout", default_value_t = 60)]
    pub work_timeout_secs: u64,

    /// Use pool (stratum) mode
    #[arg(short = 'P', long = "pool", conflicts_with = "solo")]
    pub pool: bool,

    /// Use solo (JSON-RPC) mode
    #[arg(short = 'S', long = "solo", conflicts_with = "pool")]
    pub solo: bool,

    /// Use OpenCL backend
    #[arg(short = 'G', long = "opencl")]
    pub opencl: bool,

    /// Use CPU backend
    #[arg(short = 'C', long = "cpu")]
    pub cpu: bool,

    /// Use CUDA backend
    #[arg(short = 'U', long = "cuda")]
    pub cuda: bool,

    /// OpenCL platform index
    #[arg(long = "opencl-platform", default_value_t = 0)]
    pub opencl_platform: u32,

    /// Comma-separated list of OpenCL device indices to mine on
    #[arg(long = "opencl-devices", value_delimiter = ',')]
    pub opencl_devices: Vec<u32>,

    /// OpenCL local work size
    #[arg(long = "cl-local-work", default_value_t = 128)]
    pub cl_local_work: u32,

    /// Multiplier applied to local work size to get the global work size per batch
    #[arg(long = "cl-work-multiplier", default_value_t = 4096)]
    pub cl_work_multiplier: u32,

    /// Number of CPU mining threads
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    pub threads: u32,

    /// List the available devices and exit
    #[arg(long = "list-devices")]
    pub list_devices: bool,

    /// Run a benchmark instead of mining
    #[arg(short = 'M', long = "benchmark")]
    pub benchmark: bool,

    #[arg(long = "benchmark-warmup", default_value_t = 3)]
    pub benchmark_warmup_secs: u32,

    #[arg(long = "benchmark-trial", default_value_t = 3)]
    pub benchmark_trial_secs: u32,

    #[arg(long = "benchmark-trials", default_value_t = 5)]
    pub benchmark_trials: u32,

    /// Path to the INI configuration file
    #[arg(long = "config", default_value = "xbtc-miner.conf")]
    pub config: PathBuf,
}

impl Cli {
    pub fn backend(&self) -> Backend {
        if self.cuda {
            Backend::Cuda
        } else if self.cpu {
            Backend::Cpu
        } else {
            // OpenCL is the default backend when no other backend flag is passed
            // single-backend-selected convention.
            Backend::OpenCl
        }
    }
}

/// Fully resolved settings: CLI flags merged with (and overriding) INI file contents.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cli: Cli,
    pub ini: IniSettings,
}

impl Settings {
    /// Parse `std::env::args()` and load the referenced INI file.
    pub fn from_env() -> Result<Self> {
        let cli = Cli::parse();
        Self::from_cli(cli)
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        let ini = IniSettings::load(&cli.config)?;
        let settings = Self { cli, ini };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.ini.token.miner_acct.trim().is_empty() {
            return Err(Error::MissingField("0xBitcoin.MinerAcct"));
        }
        if !self.ini.token.miner_acct.starts_with("0x") || self.ini.token.miner_acct.len() != 42 {
            return Err(Error::InvalidAccount(self.ini.token.miner_acct.clone()));
        }
        if self.cli.node.is_none() && self.ini.node.host.is_empty() {
            return Err(Error::MissingField("Node.Host"));
        }
        self.validate_node_host(&self.primary_node().host)?;
        if let Some(failover) = self.failover_node() {
            self.validate_node_host(&failover.host)?;
        }
        Ok(())
    }

    /// A bare `host[:port]` isn't itself a URL, but it must be usable as the
    /// authority of one (the solo driver builds `http://{host}:{port}/` from it);
    /// round-tripping it through `url::Url` up front turns a malformed host into a
    /// configuration error instead of a confusing first-poll RPC failure.
    fn validate_node_host(&self, host: &str) -> Result<()> {
        if host.is_empty() {
            return Ok(());
        }
        url::Url::parse(&format!("http://{host}"))
            .map(|_| ())
            .map_err(|_| Error::InvalidNodeAddress(host.to_string()))
    }

    /// Effective node endpoint, CLI `-N` overriding `[Node] Host`.
    pub fn primary_node(&self) -> NodeConfig {
        match &self.cli.node {
            Some(addr) => NodeConfig::parse(addr, &self.ini.node),
            None => self.ini.node.clone(),
        }
    }

    /// Effective failover endpoint, if any (`-N2` or `[Node2]`).
    pub fn failover_node(&self) -> Option<NodeConfig> {
        if let Some(addr) = &self.cli.node2 {
            return Some(NodeConfig::parse(addr, &self.ini.node2));
        }
        self.ini.node2_configured.then(|| self.ini.node2.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backend_defaults_to_opencl() {
        let cli = Cli::parse_from(["xbtc-miner"]);
        assert_eq!(cli.backend(), Backend::OpenCl);
    }

    #[test]
    fn backend_prefers_cuda_over_cpu() {
        let cli = Cli::parse_from(["xbtc-miner", "--cuda", "--cpu"]);
        assert_eq!(cli.backend(), Backend::Cuda);
    }

    fn base_settings(node: &str) -> Settings {
        let cli = Cli::parse_from(["xbtc-miner", "-N", node, "-S"]);
        let mut ini = IniSettings::load(std::path::Path::new("/nonexistent/xbtc-miner.conf")).unwrap();
        ini.token.miner_acct = format!("0x{}", "11".repeat(20));
        Settings { cli, ini }
    }

    #[test]
    fn validate_accepts_a_well_formed_host_port() {
        let settings = base_settings("pool.example.com:8080");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validate_rejects_a_host_with_embedded_whitespace() {
        let settings = base_settings("not a host:8080");
        assert!(matches!(settings.validate(), Err(Error::InvalidNodeAddress(_))));
    }
}
