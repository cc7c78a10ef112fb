// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

use serde::Deserialize;

/// `[Node]` / `[Node2]` — a JSON-RPC (solo) or stratum (pool) endpoint.
#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    #[serde(rename = "rpcport")]
    pub rpc_port: u16,
    #[serde(rename = "stratumport")]
    pub stratum_port: u16,
    #[serde(rename = "stratumpwd")]
    pub stratum_pwd: String,
}

impl NodeConfig {
    /// Parse a CLI `host[:port]` form, falling back to the INI-provided ports for
    /// whichever of `rpc_port`/`stratum_port` isn't encoded in the string.
    pub fn parse(addr: &str, fallback: &NodeConfig) -> NodeConfig {
        let mut parts = addr.splitn(2, ':');
        let host = parts.next().unwrap_or_default().to_string();
        let port: Option<u16> = parts.next().and_then(|p| p.parse().ok());

        NodeConfig {
            rpc_port: port.unwrap_or(fallback.rpc_port),
            stratum_port: port.unwrap_or(fallback.stratum_port),
            stratum_pwd: fallback.stratum_pwd.clone(),
            host,
        }
    }

    /// True when this endpoint should be driven by [`crate`]'s pool (stratum) path
    /// rather than the solo JSON-RPC path.
    pub fn is_pool(&self) -> bool {
        self.stratum_port != 0
    }
}

/// `[General] NonceGeneration`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NonceGeneration {
    Linear,
    Random,
}

impl Default for NonceGeneration {
    fn default() -> Self {
        NonceGeneration::Linear
    }
}

impl<'de> serde::Deserialize<'de> for NonceGeneration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(NonceGeneration::Linear),
            "random" => Ok(NonceGeneration::Random),
            other => Err(serde::de::Error::custom(format!(
                "unknown NonceGeneration '{}', expected Linear or Random",
                other
            ))),
        }
    }
}

/// `[Kernel] Tech`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelTech {
    OpenCl,
    Cuda,
    Cpu,
}

impl<'de> serde::Deserialize<'de> for KernelTech {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_ascii_lowercase().as_str() {
            "opencl" => Ok(KernelTech::OpenCl),
            "cuda" => Ok(KernelTech::Cuda),
            "cpu" => Ok(KernelTech::Cpu),
            other => Err(serde::de::Error::custom(format!(
                "unknown Kernel Tech '{}', expected OpenCL, CUDA or CPU",
                other
            ))),
        }
    }
}

impl Default for KernelTech {
    fn default() -> Self {
        KernelTech::OpenCl
    }
}

/// `[ThermalProtection]`
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ThermalConfig {
    pub temp_provider: String,
    /// Setpoint in degrees Celsius; negative disables the PID loop entirely.
    pub throttle_temp: f64,
    /// Seconds of sustained over-temperature before the thermal-runaway shutdown fires.
    pub shut_down: u64,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            temp_provider: "none".to_string(),
            throttle_temp: 80.0,
            shut_down: 30,
        }
    }
}

/// `[Gas]`
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct GasConfig {
    pub eip1559: bool,
}
