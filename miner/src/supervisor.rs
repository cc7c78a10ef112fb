// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Top-level node selection loop: alternates between the primary
//! and failover node on driver exit, picking solo or pool mode per node from
//! `NodeConfig::is_pool`, until the Farm requests shutdown.

use crate::farm::Farm;
use crate::pool::{PoolConfig, PoolDriver};
use crate::solo::{SoloConfig, SoloDriver, TransactionSigner};

use miner_config::NodeConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Supervisor {
    farm: Arc<Farm>,
    nodes: Vec<NodeConfig>,
    signer: Arc<dyn TransactionSigner>,
    user_account: crate::hash::Sender,
    dev_account: crate::hash::Sender,
    dev_fee_fraction: f64,
    minutes_per_share: f64,
    polling_interval: Duration,
    retries: u32,
    work_timeout: Duration,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        farm: Arc<Farm>,
        nodes: Vec<NodeConfig>,
        signer: Arc<dyn TransactionSigner>,
        user_account: crate::hash::Sender,
        dev_account: crate::hash::Sender,
        dev_fee_fraction: f64,
        minutes_per_share: f64,
        polling_interval: Duration,
        retries: u32,
        work_timeout: Duration,
    ) -> Self {
        Self {
            farm,
            nodes,
            signer,
            user_account,
            dev_account,
            dev_fee_fraction,
            minutes_per_share,
            polling_interval,
            retries,
            work_timeout,
        }
    }

    /// Runs until the Farm is told to shut down. Exits cleanly (returns) at that
    /// point rather than attempting one more connection.
    pub async fn run(&self) {
        if self.nodes.is_empty() {
            warn!("supervisor has no nodes configured, nothing to drive");
            return;
        }

        let mut i = 0usize;
        loop {
            if self.farm.is_shutting_down() {
                info!("supervisor exiting: farm is shutting down");
                return;
            }

            let node = &self.nodes[i % self.nodes.len()];
            let result = if node.is_pool() {
                self.run_pool(node).await
            } else {
                self.run_solo(node).await
            };

            if let Err(err) = result {
                warn!(error = %err, host = %node.host, "driver exited with error, rotating node");
            } else {
                info!(host = %node.host, "driver exited cleanly, rotating node");
            }

            i = (i + 1) % self.nodes.len();
        }
    }

    async fn run_solo(&self, node: &NodeConfig) -> Result<(), crate::error::DriverError> {
        let rpc_url = format!("http://{}:{}", node.host, node.rpc_port);
        let config = SoloConfig {
            rpc_url,
            polling_interval: self.polling_interval,
            max_retries: self.retries,
            user_account: self.user_account,
            dev_account: self.dev_account,
            dev_fee_fraction: self.dev_fee_fraction,
            minutes_per_share: self.minutes_per_share,
        };
        let driver = SoloDriver::new(config, self.farm.clone(), self.signer.clone());
        driver.run().await
    }

    async fn run_pool(&self, node: &NodeConfig) -> Result<(), crate::error::DriverError> {
        let config = PoolConfig {
            host: node.host.clone(),
            port: node.stratum_port,
            worker_name: hex::encode(self.user_account),
            password: node.stratum_pwd.clone(),
            work_timeout: self.work_timeout,
            max_consecutive_failures: self.retries,
        };
        let driver = PoolDriver::new(config, self.farm.clone());
        driver.run().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datalog::DataLog;
    use crate::solo::AcceptAllSigner;

    fn new_test_farm() -> Arc<Farm> {
        Farm::new(Arc::new(DataLog::in_memory()), 0xFFFF_FF00_0000_0000, 1, true)
    }

    #[tokio::test]
    async fn empty_node_list_returns_immediately() {
        let farm = new_test_farm();
        let supervisor = Supervisor::new(
            farm,
            vec![],
            Arc::new(AcceptAllSigner),
            [1u8; 20],
            [2u8; 20],
            0.0125,
            0.0,
            Duration::from_millis(1),
            4,
            Duration::from_secs(60),
        );
        supervisor.run().await;
    }

    #[tokio::test]
    async fn shutdown_request_stops_the_loop_before_dialing() {
        let farm = new_test_farm();
        farm.request_shutdown();
        let supervisor = Supervisor::new(
            farm,
            vec![NodeConfig { host: "127.0.0.1".to_string(), rpc_port: 1, stratum_port: 0, stratum_pwd: String::new() }],
            Arc::new(AcceptAllSigner),
            [1u8; 20],
            [2u8; 20],
            0.0125,
            0.0,
            Duration::from_millis(1),
            4,
            Duration::from_secs(60),
        );
        supervisor.run().await;
    }
}
