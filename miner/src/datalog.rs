// Copyright (C) 2026  xbtc-miner contributors
//
// This file is part of xbtc-miner.
//
// xbtc-miner is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Durable JSON record of best-hash, solutions, close-hits and hash-faults: an
//! in-memory `Mutex<Document>` backed by `serde_json`, persisted write-to-temp-
//! then-rename so a crash mid-write never leaves a truncated file on disk.

use crate::error::DataLogError;
use crate::work::{CloseHit, HashFault, SolutionOutcome};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, warn};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SolutionRecord {
    pub date: String,
    pub block: u32,
    pub state: String,
    pub stale: bool,
    pub gpu_miner: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CloseHitRecord {
    pub date: String,
    pub close_hit: u64,
    pub work: u64,
    pub gpu_miner: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HashFaultRecord {
    pub date: String,
    pub gpu_miner: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Document {
    #[serde(rename = "BestHash")]
    pub best_hash: u64,
    #[serde(rename = "BestHashDate")]
    pub best_hash_date: String,
    #[serde(rename = "Solutions")]
    pub solutions: Vec<SolutionRecord>,
    #[serde(rename = "CloseHits")]
    pub close_hits: Vec<CloseHitRecord>,
    #[serde(rename = "HashFaults")]
    pub hash_faults: Vec<HashFaultRecord>,
}

pub struct DataLog {
    path: Option<PathBuf>,
    document: Mutex<Document>,
}

/// Stand-in for a wall-clock timestamp; callers that need a real one pass it in
/// (the core never calls `SystemTime::now()` directly so behavior stays
/// reproducible under test).
pub fn now_iso8601(now: std::time::SystemTime) -> String {
    let since_epoch = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", since_epoch.as_secs())
}

impl DataLog {
    /// Load `path`, tolerating a missing or corrupt file by resetting to an empty
    /// document (logged, not fatal).
    pub fn load(path: &Path) -> Self {
        let document = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(error = %err, path = %path.display(), "data log corrupt, resetting");
                Document::default()
            }),
            Err(_) => Document::default(),
        };
        Self {
            path: Some(path.to_path_buf()),
            document: Mutex::new(document),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: Mutex::new(Document::default()),
        }
    }

    fn persist(&self, document: &Document) {
        let Some(path) = &self.path else { return };
        if let Err(err) = self.try_persist(path, document) {
            error!(error = %err, path = %path.display(), "failed to persist data log");
        }
    }

    fn try_persist(&self, path: &Path, document: &Document) -> Result<(), DataLogError> {
        let serialized = serde_json::to_vec_pretty(document)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &serialized).map_err(|source| DataLogError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, path).map_err(|source| DataLogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn record_best_hash(&self, value: u64) {
        let mut doc = self.document.lock().unwrap();
        doc.best_hash = value;
        doc.best_hash_date = now_iso8601(std::time::SystemTime::now());
        self.persist(&doc);
    }

    pub fn record_solution(&self, outcome: SolutionOutcome, block: u32, gpu_miner: u32) {
        let mut doc = self.document.lock().unwrap();
        doc.solutions.push(SolutionRecord {
            date: now_iso8601(std::time::SystemTime::now()),
            block,
            state: outcome.state_str().to_string(),
            stale: outcome.is_stale(),
            gpu_miner,
        });
        self.persist(&doc);
    }

    pub fn record_close_hit(&self, close_hit: CloseHit) {
        let mut doc = self.document.lock().unwrap();
        doc.close_hits.push(CloseHitRecord {
            date: now_iso8601(std::time::SystemTime::now()),
            close_hit: close_hit.value,
            work: close_hit.work_age_secs,
            gpu_miner: close_hit.miner_id,
        });
        self.persist(&doc);
    }

    pub fn record_hash_fault(&self, fault: HashFault) {
        let mut doc = self.document.lock().unwrap();
        doc.hash_faults.push(HashFaultRecord {
            date: now_iso8601(std::time::SystemTime::now()),
            gpu_miner: fault.miner_id,
        });
        self.persist(&doc);
    }

    pub fn best_hash(&self) -> u64 {
        self.document.lock().unwrap().best_hash
    }

    pub fn solution_count(&self) -> usize {
        self.document.lock().unwrap().solutions.len()
    }

    pub fn retrieve_solutions(&self, clear: bool) -> Vec<SolutionRecord> {
        let mut doc = self.document.lock().unwrap();
        let records = doc.solutions.clone();
        if clear {
            doc.solutions.clear();
            self.persist(&doc);
        }
        records
    }

    pub fn retrieve_close_hits(&self, clear: bool) -> Vec<CloseHitRecord> {
        let mut doc = self.document.lock().unwrap();
        let records = doc.close_hits.clone();
        if clear {
            doc.close_hits.clear();
            self.persist(&doc);
        }
        records
    }

    pub fn retrieve_hash_faults(&self, clear: bool) -> Vec<HashFaultRecord> {
        let mut doc = self.document.lock().unwrap();
        let records = doc.hash_faults.clone();
        if clear {
            doc.hash_faults.clear();
            self.persist(&doc);
        }
        records
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn corrupt_file_resets_to_empty_document() {
        let dir = std::env::temp_dir().join(format!("xbtc-miner-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mining_data.json");
        std::fs::write(&path, b"not json").unwrap();

        let log = DataLog::load(&path);
        assert_eq!(log.best_hash(), 0);
        assert_eq!(log.solution_count(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn retrieve_then_clear_leaves_only_later_records() {
        let log = DataLog::in_memory();
        log.record_solution(SolutionOutcome::Accepted(crate::work::Freshness::Fresh), 1, 0);
        log.record_solution(SolutionOutcome::Accepted(crate::work::Freshness::Fresh), 2, 0);

        let records = log.retrieve_solutions(true);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].block, 1);
        assert_eq!(records[1].block, 2);

        let empty = log.retrieve_solutions(false);
        assert!(empty.is_empty());

        log.record_solution(SolutionOutcome::Rejected(crate::work::Freshness::Stale), 3, 1);
        let after = log.retrieve_solutions(false);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].block, 3);
    }

    #[test]
    fn persistence_writes_then_renames_never_truncates_in_place() {
        let dir = std::env::temp_dir().join(format!("xbtc-miner-test-persist-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mining_data.json");

        let log = DataLog::load(&path);
        log.record_best_hash(42);

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists(), "temp file must be renamed away, not left behind");

        std::fs::remove_dir_all(&dir).ok();
    }
}
