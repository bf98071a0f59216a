use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::indexing::SymbolIndexingResult;

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub uptime_seconds: u64,
    pub packages_indexed: u64,
    pub packages_invalid: u64,
    pub packages_not_found: u64,
    pub packages_failed: u64,
    pub pdbs_stored: u64,
    pub pdbs_already_present: u64,
    pub total_bytes_stored: u64,
    pub total_downloads: u64,
    pub total_bytes_served: u64,
}

pub struct MetricsCollector {
    start_time: std::time::SystemTime,
    indexed: AtomicU64,
    invalid: AtomicU64,
    not_found: AtomicU64,
    failed: AtomicU64,
    pdbs_stored: AtomicU64,
    pdbs_present: AtomicU64,
    bytes_stored: AtomicU64,
    downloads: AtomicU64,
    bytes_served: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: std::time::SystemTime::now(),
            indexed: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            pdbs_stored: AtomicU64::new(0),
            pdbs_present: AtomicU64::new(0),
            bytes_stored: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            bytes_served: AtomicU64::new(0),
        }
    }

    pub fn record_outcome(&self, result: SymbolIndexingResult) {
        let counter = match result {
            SymbolIndexingResult::Success => &self.indexed,
            SymbolIndexingResult::InvalidSymbolPackage => &self.invalid,
            SymbolIndexingResult::PackageNotFound => &self.not_found,
            SymbolIndexingResult::Cancelled | SymbolIndexingResult::InternalError => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pdb_stored(&self, bytes: u64) {
        self.pdbs_stored.fetch_add(1, Ordering::Relaxed);
        self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_pdb_already_present(&self) {
        self.pdbs_present.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_served(&self, bytes: u64) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> Metrics {
        Metrics {
            uptime_seconds: self.start_time.elapsed().unwrap_or_default().as_secs(),
            packages_indexed: self.indexed.load(Ordering::Relaxed),
            packages_invalid: self.invalid.load(Ordering::Relaxed),
            packages_not_found: self.not_found.load(Ordering::Relaxed),
            packages_failed: self.failed.load(Ordering::Relaxed),
            pdbs_stored: self.pdbs_stored.load(Ordering::Relaxed),
            pdbs_already_present: self.pdbs_present.load(Ordering::Relaxed),
            total_bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            total_downloads: self.downloads.load(Ordering::Relaxed),
            total_bytes_served: self.bytes_served.load(Ordering::Relaxed),
        }
    }
}
