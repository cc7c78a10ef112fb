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

//! Multi-GPU 0xBitcoin-family mining core: a [`farm::Farm`] orchestrates a roster
//! of per-device [`miner::Miner`] search loops against a shared work package, fed
//! by either [`solo::SoloDriver`] (JSON-RPC polling) or [`pool::PoolDriver`] (line
//! JSON over TCP) under the top-level [`supervisor::Supervisor`] node-rotation loop,
//! with [`telemetry::Telemetry`] and [`datalog::DataLog`] observing from the side.

pub mod datalog;
pub mod device;
pub mod error;
pub mod farm;
pub mod hash;
pub mod miner;
pub mod pool;
pub mod solo;
pub mod stats;
pub mod supervisor;
pub mod telemetry;
pub mod thermal;
pub mod work;

// reexport so the binary crate need not depend on these directly
pub use miner_config;
