// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The 256-bit target/difficulty arithmetic the rest of the core is built on, plus
//! the single cryptographic primitive everything else treats as a black box:
//! `keccak256(challenge || sender || nonce)`, the real Keccak-256 permutation via
//! the `sha3` crate, not a stand-in. 256-bit integers come from `uint`'s
//! `construct_uint!`.

use sha3::{Digest, Keccak256};
use uint::construct_uint;

construct_uint! {
    /// Big-endian 256-bit unsigned integer used for `Target` and hash comparisons.
    pub struct U256(4);
}

pub const HASH_LEN: usize = 32;
pub const CHALLENGE_LEN: usize = 32;
pub const SENDER_LEN: usize = 20;
pub const NONCE_LEN: usize = 32;

pub type Hash = [u8; HASH_LEN];
pub type Challenge = [u8; CHALLENGE_LEN];
pub type Sender = [u8; SENDER_LEN];
pub type Nonce = [u8; NONCE_LEN];

/// `2^234`, the constant 0xBitcoin uses to turn a target into a display difficulty.
pub fn difficulty_constant() -> U256 {
    U256::one() << 234
}

/// `keccak256_0xBitcoin(challenge, sender, nonce) -> hash`
///
/// The preimage is the 84-byte concatenation `challenge || sender || nonce`; this is
/// the single cryptographic primitive the rest of the crate treats as a black box.
pub fn keccak256_0xbitcoin(challenge: &Challenge, sender: &Sender, nonce: &Nonce) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(challenge);
    hasher.update(sender);
    hasher.update(nonce);
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest);
    out
}

/// A 256-bit big-endian threshold: a hash is a winning solution iff its integer value
/// is strictly less than the target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target(pub U256);

impl Target {
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        Target(U256::from_big_endian(bytes))
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.0.to_big_endian(&mut out);
        out
    }

    pub fn from_u64(value: u64) -> Self {
        Target(U256::from(value))
    }

    /// `hash < target`
    pub fn is_met_by(&self, hash: &Hash) -> bool {
        U256::from_big_endian(hash) < self.0
    }

    /// `difficulty ≈ 2^234 / target` (integer division).
    pub fn difficulty(&self) -> u64 {
        if self.0.is_zero() {
            return u64::MAX;
        }
        let d = difficulty_constant() / self.0;
        if d > U256::from(u64::MAX) {
            u64::MAX
        } else {
            d.as_u64()
        }
    }

    /// Construct a target from a desired difficulty: the inverse of [`Target::difficulty`].
    pub fn from_difficulty(difficulty: u64) -> Self {
        if difficulty == 0 {
            return Target(U256::max_value());
        }
        Target(difficulty_constant() / U256::from(difficulty))
    }
}

impl Default for Target {
    /// The maximal (easiest) target: difficulty 0, matches "no target set yet".
    fn default() -> Self {
        Target(U256::max_value())
    }
}

/// Upper 64 bits of a hash, used pervasively for telemetry/display (`BestHash`,
/// `CloseHit::value`).
pub fn upper64(hash: &Hash) -> u64 {
    u64::from_be_bytes(hash[0..8].try_into().expect("hash is 32 bytes"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let challenge = [0x11u8; 32];
        let sender = [0x22u8; 20];
        let nonce = [0x33u8; 32];
        let h1 = keccak256_0xbitcoin(&challenge, &sender, &nonce);
        let h2 = keccak256_0xbitcoin(&challenge, &sender, &nonce);
        assert_eq!(h1, h2);

        let mut other_nonce = nonce;
        other_nonce[0] ^= 1;
        let h3 = keccak256_0xbitcoin(&challenge, &sender, &other_nonce);
        assert_ne!(h1, h3);
    }

    #[test]
    fn target_ordering_matches_integer_value() {
        let easy = Target::from_u64(u64::MAX);
        let hard = Target::from_u64(1);
        assert!(hard.0 < easy.0);
    }

    #[test]
    fn target_membership() {
        let target = Target::from_be_bytes(&[
            0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff,
        ]);
        let winning = [0u8; 32];
        let losing = [0xffu8; 32];
        assert!(target.is_met_by(&winning));
        assert!(!target.is_met_by(&losing));
    }

    #[test]
    fn difficulty_round_trips_approximately() {
        let target = Target::from_difficulty(1_000_000);
        // integer division means this is approximate, not exact
        assert!((target.difficulty() as i64 - 1_000_000i64).abs() <= 1);
    }
}
