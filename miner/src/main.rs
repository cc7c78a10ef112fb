// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::info;

use miner::datalog::DataLog;
use miner::device::{Device, StubDevice};
use miner::farm::Farm;
use miner::solo::AcceptAllSigner;
use miner::supervisor::Supervisor;
use miner::telemetry::Telemetry;
use miner::thermal::{PidGains, PidThrottler};
use miner_config::{Backend, NodeConfig, NonceGeneration, Settings};

/// Fixed developer revenue address for the dev-fee rotation; unlike
/// `MinerAcct` this is not user-configurable.
const DEV_FEE_ACCOUNT: &str = "0x00000000000000000000000000000000000dEF";

const DATA_LOG_FILE: &str = "mining_data.json";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env().context("loading settings")?;

    if settings.cli.list_devices {
        list_devices(&settings);
        return Ok(());
    }

    let datalog = Arc::new(DataLog::load(&PathBuf::from(DATA_LOG_FILE)));

    let close_hit_threshold = parse_hex_u64(&settings.ini.close_hits.close_hit_threshold)
        .unwrap_or(0xFFFF_FF00_0000_0000);
    let farm = Farm::new(
        datalog.clone(),
        close_hit_threshold,
        settings.ini.close_hits.work_unit_frequency,
        settings.ini.close_hits.enabled,
    );

    let miners = build_miners(&settings, farm.nonce_tracker())?;
    info!(count = miners.len(), backend = ?settings.cli.backend(), "starting miners");
    farm.start(miners);

    if settings.cli.benchmark {
        return run_benchmark(&settings, &farm).await;
    }

    let user_account = parse_account(&settings.ini.token.miner_acct)?;
    let dev_account = parse_account(DEV_FEE_ACCOUNT)?;

    let nodes = collect_nodes(&settings);
    let supervisor = Supervisor::new(
        farm.clone(),
        nodes,
        Arc::new(AcceptAllSigner),
        user_account,
        dev_account,
        settings.ini.general.dev_fee / 100.0,
        settings.ini.token.minutes_per_share,
        Duration::from_millis(settings.cli.polling_interval_ms),
        settings.cli.retries,
        Duration::from_secs(settings.cli.work_timeout_secs),
    );

    let telemetry = Telemetry::bind(
        settings.ini.network.udp_listen,
        settings.ini.network.udp_password.clone(),
        farm.clone(),
        datalog.clone(),
    )
    .await
    .context("binding telemetry socket")?;

    let thermal_farm = farm.clone();
    let thermal_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(miner::farm::THERMAL_TICK_PERIOD);
        loop {
            ticker.tick().await;
            if thermal_farm.is_shutting_down() {
                return;
            }
            thermal_farm.tick_thermal();
        }
    });

    let telemetry_task = tokio::spawn(async move { telemetry.run().await });

    supervisor.run().await;
    farm.stop();

    thermal_task.abort();
    telemetry_task.abort();
    Ok(())
}

fn list_devices(settings: &Settings) {
    match settings.cli.backend() {
        Backend::OpenCl => {
            let indices = resolve_device_indices(settings);
            for index in indices {
                println!("opencl[{index}] (platform {})", settings.cli.opencl_platform);
            }
        }
        Backend::Cuda => {
            let indices = resolve_device_indices(settings);
            for index in indices {
                println!("cuda[{index}]");
            }
        }
        Backend::Cpu => {
            for index in 0..settings.cli.threads {
                println!("cpu[{index}]");
            }
        }
    }
}

fn resolve_device_indices(settings: &Settings) -> Vec<u32> {
    if settings.cli.opencl_devices.is_empty() {
        vec![0]
    } else {
        settings.cli.opencl_devices.clone()
    }
}

/// Builds the device roster. Real OpenCL/CUDA backends are out of scope; every
/// configured slot is realized as a [`StubDevice`] sized per `[Kernel]`'s work-size
/// settings, which is also what the `--cpu` fallback and `--benchmark` use.
fn build_miners(settings: &Settings, nonce_tracker: Arc<miner::work::NonceSearchSpaceTracker>) -> Result<Vec<Arc<miner::miner::Miner>>> {
    let device_indices = match settings.cli.backend() {
        Backend::Cpu => (0..settings.cli.threads).collect::<Vec<_>>(),
        _ => resolve_device_indices(settings),
    };

    if device_indices.is_empty() {
        return Err(anyhow!("no mining devices selected"));
    }

    let nonce_generation = settings.ini.general.nonce_generation;
    let thermal = &settings.ini.thermal;

    let mut miners = Vec::with_capacity(device_indices.len());
    for index in device_indices {
        let mut device = StubDevice::new(index);
        device.local_work_size = settings.cli.cl_local_work;
        device.work_size_multiplier = settings.cli.cl_work_multiplier;
        let device: Arc<dyn Device> = Arc::new(device);

        let setpoint = if thermal.temp_provider == "none" { -1.0 } else { thermal.throttle_temp };
        let pid = PidThrottler::new(PidGains::default(), setpoint, thermal.shut_down);

        miners.push(miner::miner::Miner::new(index, device, nonce_generation, pid, nonce_tracker.clone()));
    }
    Ok(miners)
}

async fn run_benchmark(settings: &Settings, farm: &Arc<Farm>) -> Result<()> {
    use miner::hash::Target;

    info!(
        warmup_secs = settings.cli.benchmark_warmup_secs,
        trial_secs = settings.cli.benchmark_trial_secs,
        trials = settings.cli.benchmark_trials,
        "running benchmark"
    );
    farm.set_work([0u8; 32], Target::from_u64(1), [0u8; 20], 0);

    tokio::time::sleep(Duration::from_secs(settings.cli.benchmark_warmup_secs as u64)).await;

    for trial in 0..settings.cli.benchmark_trials {
        tokio::time::sleep(Duration::from_secs(settings.cli.benchmark_trial_secs as u64)).await;
        let total_mhs: f64 = farm.miners().iter().map(|m| m.hash_rate_mhs()).sum();
        info!(trial, total_mhs, "benchmark sample");
    }

    farm.request_shutdown();
    farm.stop();
    Ok(())
}

fn collect_nodes(settings: &Settings) -> Vec<NodeConfig> {
    let mut nodes = vec![settings.primary_node()];
    if let Some(failover) = settings.failover_node() {
        nodes.push(failover);
    }
    nodes
}

fn parse_account(addr: &str) -> Result<miner::hash::Sender> {
    let trimmed = addr.trim_start_matches("0x");
    let bytes = hex::decode(trimmed).map_err(|err| anyhow!("invalid account address '{addr}': {err}"))?;
    if bytes.len() != 20 {
        return Err(anyhow!("invalid account address '{addr}': expected 20 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn parse_hex_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}
