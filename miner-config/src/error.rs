// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read INI config at {path}: {source}")]
    Ini {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("required field '{0}' is missing from the configuration")]
    MissingField(&'static str),

    #[error("'{0}' is not a valid 0xBitcoin account (expected 0x-prefixed 20-byte hex)")]
    InvalidAccount(String),

    #[error("'{0}' is not a valid node address")]
    InvalidNodeAddress(String),
}
