/// Pipeline statistics tracking and reporting
use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

/// Counters shared by the pipeline stages.
///
/// Workers on several threads update these concurrently, so every field is
/// an atomic; relaxed ordering is enough because the counts are only read
/// after `Pipeline::finish()` has joined all workers.
#[derive(Default, Debug)]
pub struct PipelineStats {
    /// Reads accepted by the conversion stage
    pub reads_in: AtomicU64,
    /// Reads skipped as malformed or over the record cap
    pub reads_skipped: AtomicU64,
    /// Records aligned to the reference (primary alignments)
    pub mapped: AtomicU64,
    /// Records with no alignment hits
    pub unmapped: AtomicU64,
    /// Supplementary alignment records emitted
    pub supplementary: AtomicU64,
    /// Secondary alignment records emitted
    pub secondary: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read(&self) {
        self.reads_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skipped(&self) {
        self.reads_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_mapped(&self) {
        self.mapped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unmapped(&self) {
        self.unmapped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_supplementary(&self) {
        self.supplementary.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_secondary(&self) {
        self.secondary.fetch_add(1, Ordering::Relaxed);
    }

    /// Total reads that reached the aligner.
    pub fn total_aligned_inputs(&self) -> u64 {
        self.mapped.load(Ordering::Relaxed) + self.unmapped.load(Ordering::Relaxed)
    }

    /// Print summary statistics to log.
    pub fn print_summary(&self) {
        let reads_in = self.reads_in.load(Ordering::Relaxed);
        let skipped = self.reads_skipped.load(Ordering::Relaxed);
        let mapped = self.mapped.load(Ordering::Relaxed);
        let unmapped = self.unmapped.load(Ordering::Relaxed);
        let supplementary = self.supplementary.load(Ordering::Relaxed);
        let secondary = self.secondary.load(Ordering::Relaxed);

        if reads_in == 0 {
            info!("No reads processed");
            return;
        }

        let total = (mapped + unmapped).max(1);

        info!("=== Alignment Summary ===");
        info!("Number of input reads: {}", reads_in);
        if skipped > 0 {
            info!("Skipped reads: {}", skipped);
        }
        info!(
            "Mapped reads: {} ({:.2}%)",
            mapped,
            100.0 * mapped as f64 / total as f64
        );
        info!(
            "Unmapped reads: {} ({:.2}%)",
            unmapped,
            100.0 * unmapped as f64 / total as f64
        );
        if supplementary > 0 {
            info!("Supplementary alignments: {}", supplementary);
        }
        if secondary > 0 {
            info!("Secondary alignments: {}", secondary);
        }
    }
}
