// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Per-miner hash-rate accounting: a `Mutex`-protected accumulator fed by
//! `account_batch`, reporting a short-window exponential moving average.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// `N` in `α = 2/(N+1)`.
const EMA_N: f64 = 4.0;
/// Windows shorter than this are extended until either enough wall time or enough
/// settled batches have accumulated.
const MIN_WINDOW: Duration = Duration::from_millis(700);

struct Window {
    started_at: Instant,
    hashes: u64,
    batches: u32,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            hashes: 0,
            batches: 0,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        now.duration_since(self.started_at) >= MIN_WINDOW && self.batches >= 1
    }

    fn rate_mhs(&self, now: Instant) -> f64 {
        let secs = now.duration_since(self.started_at).as_secs_f64().max(1e-6);
        (self.hashes as f64) / secs / 1_000_000.0
    }
}

struct MeterInner {
    window: Window,
    /// Windows discarded so far since the last work-change reset (accelerator queue
    /// startup latency distorts the first two).
    discarded: u32,
    ema: Option<f64>,
    last_reported: f64,
}

/// Exponential moving average of one miner's hash rate, with a change detector used
/// by Telemetry's `ON_CHANGE` streams.
pub struct HashMeter {
    inner: Mutex<MeterInner>,
}

impl HashMeter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                window: Window::new(Instant::now()),
                discarded: 0,
                ema: None,
                last_reported: 0.0,
            }),
        }
    }

    /// Called once per settled batch from the search loop, with the number of
    /// hashes that batch covered.
    pub fn account_batch(&self, hashes: u64, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.window.hashes += hashes;
        inner.window.batches += 1;

        if inner.window.ready(now) {
            let rate = inner.window.rate_mhs(now);
            inner.window = Window::new(now);

            if inner.discarded < 2 {
                inner.discarded += 1;
                return;
            }

            let alpha = 2.0 / (EMA_N + 1.0);
            inner.ema = Some(match inner.ema {
                Some(prev) => alpha * rate + (1.0 - alpha) * prev,
                None => rate,
            });
        }
    }

    /// A new work package invalidates in-flight batch timing; the next two windows
    /// are discarded again.
    pub fn reset_for_new_work(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.window = Window::new(Instant::now());
        inner.discarded = 0;
    }

    /// Current EMA rate in MH/s; 0 before the first settled window.
    pub fn rate_mhs(&self) -> f64 {
        self.inner.lock().unwrap().ema.unwrap_or(0.0)
    }

    /// Returns `true` iff the rate has moved by at least `delta` MH/s since the last
    /// call that returned `true`, and snapshots the new value atomically with the
    /// check (guarded by the same mutex as the rate itself).
    pub fn delta_exceeded(&self, delta: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.ema.unwrap_or(0.0);
        if (current - inner.last_reported).abs() >= delta {
            inner.last_reported = current;
            true
        } else {
            false
        }
    }
}

impl Default for HashMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Sums the per-miner EMA into a farm-wide aggregate rate.
pub fn aggregate_mhs<'a>(meters: impl IntoIterator<Item = &'a HashMeter>) -> f64 {
    meters.into_iter().map(HashMeter::rate_mhs).sum()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rate_is_zero_before_first_window() {
        let meter = HashMeter::new();
        assert_eq!(meter.rate_mhs(), 0.0);
    }

    #[test]
    fn first_two_windows_are_discarded() {
        let meter = HashMeter::new();
        let t0 = Instant::now();
        // three windows each covering MIN_WINDOW + a hair, each with one batch
        for i in 1..=3u32 {
            let now = t0 + MIN_WINDOW * i + Duration::from_millis(5);
            meter.account_batch(1_000_000, now);
        }
        // only the third window should have produced an EMA sample
        assert!(meter.rate_mhs() > 0.0);
    }

    #[test]
    fn delta_exceeded_updates_snapshot_only_when_crossed() {
        let meter = HashMeter::new();
        let t0 = Instant::now();
        for i in 1..=3u32 {
            let now = t0 + MIN_WINDOW * i + Duration::from_millis(5);
            meter.account_batch(1_000_000, now);
        }
        assert!(meter.delta_exceeded(0.0));
        assert!(!meter.delta_exceeded(1e9));
    }
}
