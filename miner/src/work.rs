// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The data model shared by every component: work packages, solutions, and the
//! bookkeeping types that travel through the Farm's callback slots. A work package
//! is the fixed `(challenge, target, sender)` tuple this token-mining path needs,
//! immutable once published.

use crate::hash::{self, Challenge, Hash, Nonce, Sender, Target};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Published by a driver on new work, consumed by every miner. Immutable once
/// constructed; superseding it means publishing a new one, never mutating this one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkPackage {
    pub challenge: Challenge,
    pub target: Target,
    pub difficulty: u64,
    pub sender: Sender,
    /// Solo only; 0 for pool work.
    pub block_number: u32,
    /// Monotonic publish order, used by miners to detect a superseding package
    /// without comparing challenges.
    pub version: u64,
}

impl WorkPackage {
    pub fn new(challenge: Challenge, target: Target, sender: Sender, block_number: u32, version: u64) -> Self {
        Self {
            challenge,
            target,
            difficulty: target.difficulty(),
            sender,
            block_number,
            version,
        }
    }

    /// The idle/empty package published while mining is paused (e.g. retries
    /// exhausted with no failover, or dev-fee transition).
    pub fn empty() -> Self {
        Self::new([0u8; 32], Target::default(), [0u8; 20], 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.challenge == [0u8; 32] && self.version == 0
    }

    pub fn verify(&self, nonce: &Nonce) -> (Hash, bool) {
        let h = hash::keccak256_0xbitcoin(&self.challenge, &self.sender, nonce);
        let met = self.target.is_met_by(&h);
        (h, met)
    }
}

/// A candidate produced by a miner's search loop, verified host-side before it is
/// handed to the Farm.
#[derive(Clone, Debug)]
pub struct Solution {
    pub nonce: Nonce,
    pub hash: Hash,
    pub miner_id: u32,
    pub for_challenge: Challenge,
    /// The work-package version the solution was mined under; lets the Farm and
    /// driver distinguish "current" from "previous" challenges for staleness.
    pub for_version: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SolutionOutcome {
    Accepted(Freshness),
    Rejected(Freshness),
    Failed(Freshness),
}

impl SolutionOutcome {
    pub fn freshness(&self) -> Freshness {
        match self {
            SolutionOutcome::Accepted(f) | SolutionOutcome::Rejected(f) | SolutionOutcome::Failed(f) => *f,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.freshness() == Freshness::Stale
    }

    pub fn state_str(&self) -> &'static str {
        match self {
            SolutionOutcome::Accepted(_) => "Accepted",
            SolutionOutcome::Rejected(_) => "Rejected",
            SolutionOutcome::Failed(_) => "Failed",
        }
    }
}

/// A hash below a configurable display threshold but not below the real target;
/// used purely for "is mining alive" telemetry.
#[derive(Copy, Clone, Debug)]
pub struct CloseHit {
    pub value: u64,
    pub work_age_secs: u64,
    pub miner_id: u32,
}

/// A miner reported a candidate that failed host re-verification: device error.
#[derive(Copy, Clone, Debug)]
pub struct HashFault {
    pub miner_id: u32,
}

/// Lifetime-minimum upper-64-bits of any produced hash; monotonically non-increasing
/// until explicitly reset.
#[derive(Debug)]
pub struct BestHash(AtomicU64);

impl BestHash {
    pub fn new() -> Self {
        Self(AtomicU64::new(u64::MAX))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Racy-safe monotonic update: only ever decreases the stored value, returns
    /// `true` iff this call actually improved it.
    pub fn suggest(&self, candidate: u64) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        while candidate < current {
            match self.0.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    pub fn reset(&self) {
        self.0.store(u64::MAX, Ordering::Release);
    }
}

impl Default for BestHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide set of 64-bit indices already claimed in random-nonce mode, so two
/// miners never search the same starting point under one work package.
#[derive(Debug, Default)]
pub struct NonceSearchSpaceTracker {
    claimed: std::sync::Mutex<std::collections::HashSet<u64>>,
}

impl NonceSearchSpaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `index` for the caller; returns `false` if another miner already has it.
    pub fn try_claim(&self, index: u64) -> bool {
        self.claimed.lock().unwrap().insert(index)
    }

    /// Called whenever a new work package is published.
    pub fn clear(&self) {
        self.claimed.lock().unwrap().clear();
    }
}

/// Small de-dup FIFO used by the solo driver to ignore challenges a flaky provider
/// re-announces. Capacity is fixed at 5 per spec.
#[derive(Debug, Default)]
pub struct ChallengeHistory {
    seen: VecDeque<Challenge>,
}

const CHALLENGE_HISTORY_CAPACITY: usize = 5;

impl ChallengeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` iff `challenge` had not been seen before, and records it.
    pub fn observe(&mut self, challenge: Challenge) -> bool {
        if self.seen.contains(&challenge) {
            return false;
        }
        if self.seen.len() >= CHALLENGE_HISTORY_CAPACITY {
            self.seen.pop_front();
        }
        self.seen.push_back(challenge);
        true
    }
}

/// A single active Telemetry peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientBinding {
    pub addr: std::net::IpAddr,
    pub return_port: u16,
    pub miner_id: u32,
}

#[derive(Debug)]
pub struct KeepAlive {
    pub deadline: Instant,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn best_hash_is_monotone_non_increasing() {
        let best = BestHash::new();
        assert_eq!(best.get(), u64::MAX);
        assert!(best.suggest(500));
        assert_eq!(best.get(), 500);
        assert!(!best.suggest(600));
        assert_eq!(best.get(), 500);
        assert!(best.suggest(10));
        assert_eq!(best.get(), 10);
        best.reset();
        assert_eq!(best.get(), u64::MAX);
    }

    #[test]
    fn challenge_history_drops_oldest_past_capacity() {
        let mut history = ChallengeHistory::new();
        for i in 0..5u8 {
            assert!(history.observe([i; 32]));
        }
        // re-observing any of the five is now a duplicate
        assert!(!history.observe([2u8; 32]));
        // a sixth evicts the oldest ([0; 32])
        assert!(history.observe([5u8; 32]));
        assert!(history.observe([0u8; 32]));
    }

    #[test]
    fn nonce_tracker_rejects_duplicate_claims() {
        let tracker = NonceSearchSpaceTracker::new();
        assert!(tracker.try_claim(42));
        assert!(!tracker.try_claim(42));
        tracker.clear();
        assert!(tracker.try_claim(42));
    }
}
