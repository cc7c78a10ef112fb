// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Polling JSON-RPC work source: pulls challenge/target/difficulty
//! from a node, de-dupes against a short challenge history, applies the optional
//! `MinutesPerShare` local re-targeting, and signs+submits winning solutions as
//! transactions. Transaction signing and RLP encoding are out of scope here;
//! [`TransactionSigner`] is the seam a real secp256k1/RLP implementation fills.

use crate::error::DriverError;
use crate::farm::Farm;
use crate::hash::{Sender, Target};
use crate::work::{ChallengeHistory, Solution, SolutionOutcome, Freshness};

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A pending on-chain transaction the driver is waiting to confirm.
struct PendingTx {
    hash: String,
    miner_id: u32,
    block_number: u32,
    submitted_at: Instant,
    for_challenge: [u8; 32],
}

/// Signs and RLP-encodes a `submitMinimumWork` style transaction for a solution and
/// hands back a hex-encoded raw transaction plus the hash it will confirm under;
/// also resolves a transaction hash to a receipt status. The real implementation
/// (secp256k1 + RLP, legacy or EIP-1559 per `[Gas] EIP1559`) is out of scope here.
#[async_trait::async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign_submit(&self, nonce: &[u8; 32], solution_hash: &[u8; 32]) -> Result<String, DriverError>;
    async fn receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, DriverError>;
}

/// A signer stub that always accepts instantly, used by tests and `--benchmark`.
pub struct AcceptAllSigner;

#[async_trait::async_trait]
impl TransactionSigner for AcceptAllSigner {
    async fn sign_submit(&self, nonce: &[u8; 32], _solution_hash: &[u8; 32]) -> Result<String, DriverError> {
        Ok(hex::encode(nonce))
    }

    async fn receipt_status(&self, _tx_hash: &str) -> Result<Option<bool>, DriverError> {
        Ok(Some(true))
    }
}

#[derive(Clone, Debug)]
pub struct SoloConfig {
    pub rpc_url: String,
    pub polling_interval: Duration,
    pub max_retries: u32,
    pub user_account: Sender,
    pub dev_account: Sender,
    pub dev_fee_fraction: f64,
    pub minutes_per_share: f64,
}

/// Divides wall time into 4-hour dev-fee blocks. `next_switch` is signed: positive
/// while mining to the user account (seconds until the flip to dev), negative while
/// mining to the dev account.
struct DevFeeRotation {
    block: Duration,
    fee_fraction: f64,
    epoch: Instant,
}

const DEV_FEE_BLOCK: Duration = Duration::from_secs(4 * 60 * 60);

impl DevFeeRotation {
    fn new(fee_fraction: f64) -> Self {
        Self {
            block: DEV_FEE_BLOCK,
            fee_fraction: fee_fraction.clamp(0.0, 1.0),
            epoch: Instant::now(),
        }
    }

    /// `(is_dev, next_switch_signed_secs)`.
    fn current(&self, now: Instant) -> (bool, i64) {
        let elapsed = now.saturating_duration_since(self.epoch).as_secs_f64() % self.block.as_secs_f64();
        let dev_secs = self.block.as_secs_f64() * self.fee_fraction;
        if elapsed < dev_secs {
            (true, -((dev_secs - elapsed) as i64))
        } else {
            (false, (self.block.as_secs_f64() - elapsed) as i64)
        }
    }
}

pub struct SoloDriver {
    http: reqwest::Client,
    config: SoloConfig,
    farm: Arc<Farm>,
    signer: Arc<dyn TransactionSigner>,
    rpc_id: AtomicU64,
    rate_estimate_mhs: AtomicU32,
}

/// Raw provider response for one poll: `getMiningChallenge` / `getMiningTarget` /
/// `getMiningDifficulty` (or their provider-specific equivalents), collapsed to
/// this shape regardless of which concrete JSON-RPC method names a node exposes.
struct MiningWork {
    challenge: [u8; 32],
    target: Target,
    difficulty: u64,
    block_number: u32,
}

impl SoloDriver {
    pub fn new(config: SoloConfig, farm: Arc<Farm>, signer: Arc<dyn TransactionSigner>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            farm,
            signer,
            rpc_id: AtomicU64::new(1),
            rate_estimate_mhs: AtomicU32::new(0),
        }
    }

    async fn rpc_call(&self, method: &'static str, params: Value) -> Result<Value, DriverError> {
        let id = self.rpc_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let response = self
            .http
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| DriverError::Rpc { method, message: err.to_string() })?;
        let value: Value = response
            .json()
            .await
            .map_err(|err| DriverError::Rpc { method, message: err.to_string() })?;
        if let Some(error) = value.get("error") {
            return Err(DriverError::Rpc { method, message: error.to_string() });
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| DriverError::Protocol(format!("'{method}' response missing 'result'")))
    }

    async fn fetch_work(&self) -> Result<MiningWork, DriverError> {
        let challenge_hex = self
            .rpc_call("getMiningChallenge", json!([]))
            .await?
            .as_str()
            .ok_or_else(|| DriverError::Protocol("getMiningChallenge: not a string".into()))?
            .to_string();
        let target_hex = self
            .rpc_call("getMiningTarget", json!([]))
            .await?
            .as_str()
            .ok_or_else(|| DriverError::Protocol("getMiningTarget: not a string".into()))?
            .to_string();
        let difficulty = self
            .rpc_call("getMiningDifficulty", json!([]))
            .await
            .ok()
            .and_then(|v| v.as_str().and_then(|s| s.trim_start_matches("0x").parse::<u64>().ok()).or(v.as_u64()))
            .unwrap_or(0);
        let block_number = self
            .rpc_call("eth_blockNumber", json!([]))
            .await
            .ok()
            .and_then(|v| v.as_str().map(|s| s.trim_start_matches("0x").to_string()))
            .and_then(|s| u32::from_str_radix(&s, 16).ok())
            .unwrap_or(0);

        let challenge = parse_hex32(&challenge_hex).ok_or_else(|| DriverError::Protocol("malformed challenge".into()))?;
        let target = parse_hex32(&target_hex)
            .map(|bytes| Target::from_be_bytes(&bytes))
            .ok_or_else(|| DriverError::Protocol("malformed target".into()))?;

        Ok(MiningWork { challenge, target, difficulty, block_number })
    }

    /// Applies `[0xBitcoin] MinutesPerShare` local re-targeting: sizes the target so
    /// one solution is expected every `minutes_per_share` minutes at the farm's
    /// current aggregate rate, re-fit whenever that rate moves by more than 10%.
    fn retarget(&self, provider_target: Target) -> Target {
        if self.config.minutes_per_share <= 0.0 {
            return provider_target;
        }
        let rate_hps = self.farm.miners().iter().map(|m| m.hash_rate_mhs()).sum::<f64>() * 1_000_000.0;
        if rate_hps <= 0.0 {
            return provider_target;
        }
        let expected_hashes = rate_hps * 60.0 * self.config.minutes_per_share;
        let difficulty = (expected_hashes.max(1.0)) as u64;

        let last_mhs = self.rate_estimate_mhs.load(Ordering::Relaxed) as f64;
        let current_mhs = rate_hps / 1_000_000.0;
        if last_mhs > 0.0 && (current_mhs - last_mhs).abs() / last_mhs <= 0.10 {
            return provider_target;
        }
        self.rate_estimate_mhs.store(current_mhs as u32, Ordering::Relaxed);
        Target::from_difficulty(difficulty)
    }

    fn active_sender(&self, rotation: &DevFeeRotation) -> (Sender, i64) {
        let (is_dev, next_switch) = rotation.current(Instant::now());
        let sender = if is_dev { self.config.dev_account } else { self.config.user_account };
        (sender, next_switch)
    }

    /// Drives the poll/submit/pending-tx loop until retries are exhausted. Returns
    /// `Err` when the caller (Supervisor) should fail over or give up; a clean
    /// shutdown (Farm request) returns `Ok(())`.
    pub async fn run(&self) -> Result<(), DriverError> {
        let mut history = ChallengeHistory::new();
        let rotation = DevFeeRotation::new(self.config.dev_fee_fraction);
        let mut submissions = self.farm.subscribe_submissions();
        let mut pending: Vec<PendingTx> = Vec::new();

        let mut poll_ticker = tokio::time::interval(self.config.polling_interval);
        let mut tx_ticker = tokio::time::interval(Duration::from_millis(1000));
        let mut consecutive_failures = 0u32;

        loop {
            if self.farm.is_shutting_down() {
                return Ok(());
            }

            tokio::select! {
                _ = poll_ticker.tick() => {
                    match self.fetch_work().await {
                        Ok(work) => {
                            consecutive_failures = 0;
                            if history.observe(work.challenge) {
                                let target = self.retarget(work.target);
                                let (sender, _next_switch) = self.active_sender(&rotation);
                                self.farm.set_work(work.challenge, target, sender, work.block_number);
                                info!(block = work.block_number, difficulty = work.difficulty, "new solo work published");
                            }
                        }
                        Err(err) => {
                            consecutive_failures += 1;
                            warn!(error = %err, consecutive_failures, "solo poll failed");
                            if consecutive_failures >= self.config.max_retries {
                                self.farm.set_work([0u8; 32], Target::default(), self.config.user_account, 0);
                                return Err(DriverError::RetriesExhausted(consecutive_failures));
                            }
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }

                _ = tx_ticker.tick() => {
                    self.drive_pending_txs(&mut pending).await;
                }

                Some(solution) = submissions.recv() => {
                    self.submit_solution(solution, &mut pending).await;
                }
            }
        }
    }

    async fn submit_solution(&self, solution: Solution, pending: &mut Vec<PendingTx>) {
        match self.signer.sign_submit(&solution.nonce, &solution.hash).await {
            Ok(tx_hash) => {
                info!(miner = solution.miner_id, tx_hash = %tx_hash, "solution transaction submitted");
                pending.push(PendingTx {
                    hash: tx_hash,
                    miner_id: solution.miner_id,
                    block_number: self.farm.current_work().block_number,
                    submitted_at: Instant::now(),
                    for_challenge: solution.for_challenge,
                });
            }
            Err(err) => {
                warn!(miner = solution.miner_id, error = %err, "failed to sign/submit solution transaction");
                let freshness = self.freshness_of(solution.for_challenge);
                self.farm.solution_found(SolutionOutcome::Failed(freshness), solution.miner_id, 0, crate::hash::upper64(&solution.hash));
            }
        }
    }

    fn freshness_of(&self, for_challenge: [u8; 32]) -> Freshness {
        if self.farm.current_work().challenge == for_challenge {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }

    const PENDING_TX_TIMEOUT: Duration = Duration::from_secs(180);

    async fn drive_pending_txs(&self, pending: &mut Vec<PendingTx>) {
        let mut still_pending = Vec::with_capacity(pending.len());
        for tx in pending.drain(..) {
            if tx.submitted_at.elapsed() > Self::PENDING_TX_TIMEOUT {
                warn!(tx_hash = %tx.hash, "pending transaction timed out, dropping");
                continue;
            }
            match self.signer.receipt_status(&tx.hash).await {
                Ok(Some(accepted)) => {
                    let freshness = self.freshness_of(tx.for_challenge);
                    let outcome = if accepted {
                        SolutionOutcome::Accepted(freshness)
                    } else {
                        SolutionOutcome::Rejected(freshness)
                    };
                    debug!(tx_hash = %tx.hash, accepted, "transaction receipt resolved");
                    self.farm.solution_found(outcome, tx.miner_id, tx.block_number, 0);
                }
                Ok(None) => still_pending.push(tx),
                Err(err) => {
                    warn!(tx_hash = %tx.hash, error = %err, "failed to fetch receipt, retrying");
                    still_pending.push(tx);
                }
            }
        }
        *pending = still_pending;
    }
}

fn parse_hex32(s: &str) -> Option<[u8; 32]> {
    let trimmed = s.trim_start_matches("0x");
    let bytes = hex::decode(trimmed).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datalog::DataLog;

    fn new_test_farm() -> Arc<Farm> {
        Farm::new(Arc::new(DataLog::in_memory()), 0xFFFF_FF00_0000_0000, 1, true)
    }

    #[test]
    fn parse_hex32_accepts_0x_prefix() {
        let s = format!("0x{}", "11".repeat(32));
        assert_eq!(parse_hex32(&s), Some([0x11u8; 32]));
    }

    #[test]
    fn parse_hex32_rejects_wrong_length() {
        assert_eq!(parse_hex32("0x1122"), None);
    }

    #[test]
    fn dev_fee_rotation_starts_in_dev_block() {
        let rotation = DevFeeRotation::new(0.0125);
        let (is_dev, next_switch) = rotation.current(rotation.epoch);
        assert!(is_dev);
        assert!(next_switch < 0);
    }

    #[test]
    fn dev_fee_rotation_flips_to_user_after_dev_block() {
        let rotation = DevFeeRotation::new(0.5);
        let midpoint = rotation.epoch + DEV_FEE_BLOCK / 2 + Duration::from_secs(1);
        let (is_dev, next_switch) = rotation.current(midpoint);
        assert!(!is_dev);
        assert!(next_switch > 0);
    }

    #[tokio::test]
    async fn retarget_is_identity_without_minutes_per_share() {
        let farm = new_test_farm();
        let config = SoloConfig {
            rpc_url: "http://localhost".to_string(),
            polling_interval: Duration::from_millis(1),
            max_retries: 4,
            user_account: [1u8; 20],
            dev_account: [2u8; 20],
            dev_fee_fraction: 0.0125,
            minutes_per_share: 0.0,
        };
        let driver = SoloDriver::new(config, farm, Arc::new(AcceptAllSigner));
        let target = Target::from_u64(12345);
        assert_eq!(driver.retarget(target), target);
    }
}
