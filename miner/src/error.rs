// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Per-subsystem error enums, one `thiserror` type per component boundary. `main`
//! collects everything through `anyhow::Result`, the usual `thiserror` + `anyhow`
//! split: precise enums at library boundaries, a single dynamic error at the edge.

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RPC call '{method}' failed: {message}")]
    Rpc { method: &'static str, message: String },

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("pool rejected subscription: {0}")]
    SubscribeRejected(String),

    #[error("exceeded {0} consecutive connection failures")]
    RetriesExhausted(u32),

    #[error("no work received for {0} seconds")]
    WorkTimeout(u64),
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{addr} is already connected")]
    AlreadyConnected { addr: SocketAddr },

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum DataLogError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize the data log: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device {index} kernel API error: {message}")]
    Kernel { index: u32, message: String },
}
