// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The per-device search worker: one OS thread running a double-buffered kernel
//! queue (`BUF_COUNT` outstanding batches, host-side verification of every
//! device-flagged candidate, PID-driven throttle sleep between launches).

use crate::device::{Device, PrecomputedState};
use crate::farm::Farm;
use crate::hash::Nonce;
use crate::stats::HashMeter;
use crate::thermal::{PidThrottler, TickOutcome};
use crate::work::{BestHash, NonceSearchSpaceTracker, Solution, WorkPackage};

use miner_config::NonceGeneration;
use rand::RngCore;

use atomic_enum::atomic_enum;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

const BUF_COUNT: usize = 2;

#[atomic_enum]
#[derive(PartialEq)]
pub enum MinerStatus {
    Idle,
    Searching,
    Paused,
    Stopped,
}

struct PendingBatch {
    nonce_base: Nonce,
    buffer_index: u32,
}

/// Per-device mutable snapshot exposed to Telemetry readers; only this miner's own
/// thread writes to the underlying atomics, readers take a short-lived copy.
#[derive(Debug, Clone, Copy)]
pub struct MinerSnapshot {
    pub id: u32,
    pub hash_rate_mhs: f64,
    pub current_hash_sample: u64,
    pub best_hash: u64,
    pub throttle_percent: u32,
    pub temperature_celsius: f64,
    pub fan_rpm: u32,
    pub hash_faults_session: u64,
}

pub struct Miner {
    pub id: u32,
    device: Arc<dyn Device>,
    nonce_generation: NonceGeneration,
    nonce_tracker: Arc<NonceSearchSpaceTracker>,

    hash_meter: HashMeter,
    pid: PidThrottler,
    best_hash: BestHash,
    current_hash_sample: AtomicU64,
    hash_faults_session: AtomicU64,

    current_work: RwLock<Arc<WorkPackage>>,
    previous_work: RwLock<Arc<WorkPackage>>,

    status: AtomicMinerStatus,
    wake_mutex: Mutex<()>,
    wake_condvar: Condvar,

    farm: OnceCell<Weak<Farm>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    pub fn new(
        id: u32,
        device: Arc<dyn Device>,
        nonce_generation: NonceGeneration,
        pid: PidThrottler,
        nonce_tracker: Arc<NonceSearchSpaceTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            device,
            nonce_generation,
            nonce_tracker,
            hash_meter: HashMeter::new(),
            pid,
            best_hash: BestHash::new(),
            current_hash_sample: AtomicU64::new(0),
            hash_faults_session: AtomicU64::new(0),
            current_work: RwLock::new(Arc::new(WorkPackage::empty())),
            previous_work: RwLock::new(Arc::new(WorkPackage::empty())),
            status: AtomicMinerStatus::new(MinerStatus::Idle),
            wake_mutex: Mutex::new(()),
            wake_condvar: Condvar::new(),
            farm: OnceCell::new(),
            join: Mutex::new(None),
        })
    }

    /// Bind the (non-owning) handle back to the owning Farm. Called once, right
    /// after `Arc::new`, before the miner is handed out to anything else.
    pub fn attach_farm(&self, farm: Weak<Farm>) {
        let _ = self.farm.set(farm);
    }

    fn farm(&self) -> Option<Arc<Farm>> {
        self.farm.get().and_then(Weak::upgrade)
    }

    pub fn throttle_percent(&self) -> u32 {
        self.pid.throttle_percent()
    }

    pub fn pid(&self) -> &PidThrottler {
        &self.pid
    }

    pub fn best_hash(&self) -> u64 {
        self.best_hash.get()
    }

    pub fn reset_best_hash(&self) {
        self.best_hash.reset();
    }

    pub fn current_hash_sample(&self) -> u64 {
        self.current_hash_sample.load(Ordering::Relaxed)
    }

    pub fn hash_rate_mhs(&self) -> f64 {
        self.hash_meter.rate_mhs()
    }

    pub fn hash_faults_session(&self) -> u64 {
        self.hash_faults_session.load(Ordering::Relaxed)
    }

    pub fn snapshot(self: &Arc<Self>) -> MinerSnapshot {
        MinerSnapshot {
            id: self.id,
            hash_rate_mhs: self.hash_rate_mhs(),
            current_hash_sample: self.current_hash_sample(),
            best_hash: self.best_hash(),
            throttle_percent: self.throttle_percent(),
            temperature_celsius: self.device.temperature_celsius(),
            fan_rpm: self.device.fan_rpm(),
            hash_faults_session: self.hash_faults_session(),
        }
    }

    /// Atomically swap the current package; spawn the search thread if idle,
    /// otherwise pause and let the loop pick up the new package on its next pass.
    /// Must never be called from the search loop's own thread.
    pub fn set_work(self: &Arc<Self>, pkg: Arc<WorkPackage>) {
        {
            let mut previous = self.previous_work.write().unwrap();
            let mut current = self.current_work.write().unwrap();
            *previous = current.clone();
            *current = pkg;
        }
        self.hash_meter.reset_for_new_work();
        self.wake_condvar.notify_all();

        match self.status.load(Ordering::Acquire) {
            MinerStatus::Idle | MinerStatus::Stopped => self.kick_off(),
            _ => {}
        }
    }

    fn kick_off(self: &Arc<Self>) {
        self.status.store(MinerStatus::Searching, Ordering::Release);
        let me = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("miner-{}", self.id))
            .spawn(move || me.search_loop())
            .expect("failed to spawn miner search thread");
        *self.join.lock().unwrap() = Some(handle);
    }

    /// Abort the search, draining any in-flight kernel launches before returning.
    pub fn pause(&self) {
        if self.status.load(Ordering::Acquire) == MinerStatus::Searching {
            self.status.store(MinerStatus::Paused, Ordering::Release);
        }
        self.wake_condvar.notify_all();
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.farm()
            .map(|farm| farm.is_shutting_down())
            .unwrap_or(false)
    }

    fn should_exit(&self, started_version: u64) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        if self.status.load(Ordering::Acquire) == MinerStatus::Paused {
            return true;
        }
        self.current_work.read().unwrap().version != started_version
    }

    fn random_nonce_base(&self) -> Nonce {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }

    fn next_nonce_base(&self, linear_counter: &AtomicU64) -> Nonce {
        let mut nonce = self.random_nonce_base();
        match self.nonce_generation {
            NonceGeneration::Linear => {
                let index = linear_counter.fetch_add(1, Ordering::Relaxed);
                nonce[24..32].copy_from_slice(&index.to_be_bytes());
            }
            NonceGeneration::Random => loop {
                let mut candidate = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut candidate);
                let index = u64::from_be_bytes(candidate);
                if self.nonce_tracker.try_claim(index) {
                    nonce[24..32].copy_from_slice(&index.to_be_bytes());
                    break;
                }
            },
        }
        nonce
    }

    fn search_loop(self: Arc<Self>) {
        let work_version = self.current_work.read().unwrap().version;
        info!(miner = self.id, work_version, "search loop starting");

        let mut pending: Vec<PendingBatch> = Vec::with_capacity(BUF_COUNT);
        let mut last_kernel_ms: f64 = 1.0;
        let mut drains_since_feed = 0u32;
        let linear_counter = AtomicU64::new({
            let base = self.random_nonce_base();
            u64::from_be_bytes(base[24..32].try_into().unwrap())
        });

        'search: loop {
            if self.should_exit(work_version) {
                break 'search;
            }

            // 1. Throttle check.
            let throttle = self.throttle_percent();
            if throttle >= 100 {
                pending.clear();
                loop {
                    if self.should_exit(work_version) {
                        break 'search;
                    }
                    let guard = self.wake_mutex.lock().unwrap();
                    let _ = self
                        .wake_condvar
                        .wait_timeout(guard, Duration::from_millis(100))
                        .unwrap();
                    if self.throttle_percent() < 100 {
                        break;
                    }
                }
                continue 'search;
            } else if throttle > 0 {
                let sleep_ms = (throttle as f64) * last_kernel_ms / (100.0 - throttle as f64);
                if sleep_ms > 0.0 {
                    thread::sleep(Duration::from_millis(sleep_ms as u64));
                }
            }

            if self.should_exit(work_version) {
                break 'search;
            }

            let work = self.current_work.read().unwrap().clone();

            // 2. Enqueue iff pending < BUF_COUNT.
            if pending.len() < BUF_COUNT {
                let nonce_base = self.next_nonce_base(&linear_counter);
                let buffer_index = pending.len() as u32;
                let state = PrecomputedState::new(work.challenge, work.sender, nonce_base, work.target);
                match self.device.enqueue(&state, buffer_index) {
                    Ok(()) => pending.push(PendingBatch { nonce_base, buffer_index }),
                    Err(err) => {
                        warn!(miner = self.id, error = %err, "device enqueue failed, tearing down miner");
                        break 'search;
                    }
                }
            }

            // 3. Drain iff pending==BUF_COUNT.
            if pending.len() == BUF_COUNT {
                let batch = pending.remove(0);
                let drain_started = Instant::now();
                let result = match self.device.drain(batch.buffer_index) {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(miner = self.id, error = %err, "device drain failed, tearing down miner");
                        break 'search;
                    }
                };
                last_kernel_ms = result.kernel_elapsed.as_secs_f64() * 1000.0;
                let _ = drain_started;

                self.hash_meter.account_batch(result.work_size, Instant::now());
                drains_since_feed += 1;
                if drains_since_feed % 2 == 0 {
                    if let Some(farm) = self.farm() {
                        farm.feed_hashes(result.work_size);
                    }
                }

                // 4. Verify + submit every candidate the device flagged.
                for lane in result.lanes {
                    let mut nonce = batch.nonce_base;
                    nonce[12..20].copy_from_slice(&lane.to_le_bytes());
                    self.verify_and_submit(&work, nonce);
                }

                // Independent close-hit probe: the device only flags candidates
                // that already pass `target`, so "near miss" telemetry is sampled
                // host-side from the batch's own nonce base instead.
                self.probe_close_hit(&work, &batch.nonce_base);
            }
        }

        self.status.store(MinerStatus::Idle, Ordering::Release);
        debug!(miner = self.id, "search loop exiting");
    }

    /// A device-flagged candidate always has to pass host re-verification; a miss
    /// here means the device itself malfunctioned, not a near-miss worth telemetry.
    fn verify_and_submit(self: &Arc<Self>, work: &WorkPackage, nonce: Nonce) {
        let (hash, met) = work.verify(&nonce);
        let sample = crate::hash::upper64(&hash);
        self.current_hash_sample.store(sample, Ordering::Relaxed);

        if met {
            self.best_hash.suggest(sample);
            if let Some(farm) = self.farm() {
                let solution = Solution {
                    nonce,
                    hash,
                    miner_id: self.id,
                    for_challenge: work.challenge,
                    for_version: work.version,
                };
                farm.submit_proof(solution);
            }
        } else {
            self.hash_faults_session.fetch_add(1, Ordering::Relaxed);
            if let Some(farm) = self.farm() {
                farm.report_hash_fault(self.id);
            }
        }
    }

    /// Host-side close-hit sampling: the device only ever flags target-passing
    /// candidates, so "mining is alive and getting warm" telemetry is derived from
    /// independently hashing each batch's own nonce base.
    fn probe_close_hit(self: &Arc<Self>, work: &WorkPackage, nonce_base: &Nonce) {
        let (hash, met) = work.verify(nonce_base);
        if met {
            return;
        }
        let sample = crate::hash::upper64(&hash);
        self.current_hash_sample.store(sample, Ordering::Relaxed);
        if let Some(farm) = self.farm() {
            farm.maybe_report_close_hit(self.id, sample);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::StubDevice;
    use crate::hash::Target;
    use crate::work::NonceSearchSpaceTracker;
    use crate::thermal::PidGains;

    fn new_test_miner() -> Arc<Miner> {
        let device = Arc::new(StubDevice::new(0));
        let pid = PidThrottler::new(PidGains::default(), -1.0, 30);
        Miner::new(0, device, NonceGeneration::Linear, pid, Arc::new(NonceSearchSpaceTracker::new()))
    }

    #[test]
    fn idle_miner_reports_zero_rate_and_max_best_hash() {
        let miner = new_test_miner();
        assert_eq!(miner.best_hash(), u64::MAX);
        assert_eq!(miner.hash_rate_mhs(), 0.0);
    }

    #[test]
    fn linear_nonce_generation_increments() {
        let miner = new_test_miner();
        let counter = AtomicU64::new(0);
        let a = miner.next_nonce_base(&counter);
        let b = miner.next_nonce_base(&counter);
        let idx_a = u64::from_be_bytes(a[24..32].try_into().unwrap());
        let idx_b = u64::from_be_bytes(b[24..32].try_into().unwrap());
        assert_eq!(idx_b, idx_a + 1);
    }

    #[test]
    fn work_verify_matches_target() {
        let pkg = WorkPackage::new([0u8; 32], Target::from_u64(u64::MAX), [0u8; 20], 0, 1);
        let (_, met) = pkg.verify(&[0u8; 32]);
        assert!(met);
    }
}
