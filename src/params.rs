use std::path::PathBuf;

use clap::Parser;

// ---------------------------------------------------------------------------
// Strand convention enum
// ---------------------------------------------------------------------------

/// Basecalling strand convention for the conversion stage.
///
/// RNA reads come off the sequencer 3'→5', so their sequence and quality
/// are reversed before record construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrandConvention {
    Dna,
    Rna,
}

impl std::str::FromStr for StrandConvention {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dna" => Ok(Self::Dna),
            "rna" => Ok(Self::Rna),
            _ => Err(format!(
                "unknown strand convention '{s}'; expected 'dna' or 'rna'"
            )),
        }
    }
}

impl std::fmt::Display for StrandConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dna => write!(f, "dna"),
            Self::Rna => write!(f, "rna"),
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters struct
// ---------------------------------------------------------------------------

/// readpipe command-line parameters.
///
/// Everything the pipeline needs is fixed here at assembly time; nothing is
/// reconfigurable once the stages are running.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "readpipe",
    about = "Streaming read-to-alignment pipeline with a built-in minimizer aligner",
    version
)]
pub struct Parameters {
    // ── Inputs and output ───────────────────────────────────────────────
    /// Reference sequences (FASTA or FASTQ, optionally gzipped)
    #[arg(long = "reference", short = 'r')]
    pub reference: PathBuf,

    /// Input reads (FASTQ, optionally gzipped)
    #[arg(long = "reads", short = 'i')]
    pub reads: PathBuf,

    /// Output SAM file
    #[arg(long = "output", short = 'o', default_value = "aligned.sam")]
    pub output: PathBuf,

    // ── Index parameters ────────────────────────────────────────────────
    /// Minimizer k-mer length
    #[arg(long = "kmer-size", short = 'k', default_value_t = 15)]
    pub kmer_size: usize,

    /// Minimizer window length
    #[arg(long = "window-size", short = 'w', default_value_t = 10)]
    pub window_size: usize,

    /// Maximum index partition size in bytes; larger references fail
    #[arg(long = "max-index-size", default_value_t = 8_000_000_000)]
    pub max_index_size: u64,

    // ── Threading ───────────────────────────────────────────────────────
    /// Alignment worker threads; 0 = all available cores
    #[arg(long = "aligner-threads", short = 't', default_value_t = 0)]
    pub aligner_threads: usize,

    /// Conversion worker threads; 0 = all available cores
    #[arg(long = "converter-threads", default_value_t = 0)]
    pub converter_threads: usize,

    /// Capacity of the bounded queue in front of each stage
    #[arg(long = "queue-capacity", default_value_t = 1000)]
    pub queue_capacity: usize,

    // ── Conversion options ──────────────────────────────────────────────
    /// Emit the move table (mv tag) on converted records
    #[arg(long = "emit-moves", default_value_t = false)]
    pub emit_moves: bool,

    /// Strand convention: dna or rna
    #[arg(long = "strand", default_value = "dna")]
    pub strand: StrandConvention,

    /// Minimum probability for a modified-base call to be reported
    #[arg(long = "modbase-threshold", default_value_t = 0.0)]
    pub modbase_threshold: f32,

    /// Stop after this many reads; unset = all
    #[arg(long = "max-reads", short = 'n')]
    pub max_reads: Option<u64>,

    // ── Provenance ──────────────────────────────────────────────────────
    /// Run identifier recorded in the RG tag
    #[arg(long = "run-id", default_value = "run0")]
    pub run_id: String,

    /// Sample identifier recorded in the RG tag
    #[arg(long = "sample-id", default_value = "sample0")]
    pub sample_id: String,
}

impl Parameters {
    /// Check parameter combinations before the pipeline is assembled.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.kmer_size == 0 || self.kmer_size > 31 {
            return Err(crate::error::Error::Parameter(
                "--kmer-size must be in 1..=31".into(),
            ));
        }

        if self.window_size == 0 || self.window_size > 255 {
            return Err(crate::error::Error::Parameter(
                "--window-size must be in 1..=255".into(),
            ));
        }

        if self.max_index_size == 0 {
            return Err(crate::error::Error::Parameter(
                "--max-index-size must be >= 1".into(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(crate::error::Error::Parameter(
                "--queue-capacity must be >= 1".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.modbase_threshold) {
            return Err(crate::error::Error::Parameter(
                "--modbase-threshold must be in [0, 1]".into(),
            ));
        }

        Ok(())
    }

    /// Resolved alignment worker count (0 means all available cores).
    pub fn aligner_thread_count(&self) -> usize {
        resolve_threads(self.aligner_threads)
    }

    /// Resolved conversion worker count (0 means all available cores).
    pub fn converter_thread_count(&self) -> usize {
        resolve_threads(self.converter_threads)
    }
}

fn resolve_threads(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: parse a command line (without program name).
    fn parse(args: &[&str]) -> Parameters {
        let mut full = vec!["readpipe"];
        full.extend_from_slice(args);
        Parameters::parse_from(full)
    }

    #[test]
    fn defaults() {
        let p = parse(&["--reference", "ref.fa", "--reads", "reads.fq"]);
        assert_eq!(p.kmer_size, 15);
        assert_eq!(p.window_size, 10);
        assert_eq!(p.max_index_size, 8_000_000_000);
        assert_eq!(p.queue_capacity, 1000);
        assert_eq!(p.strand, StrandConvention::Dna);
        assert!(!p.emit_moves);
        assert!(p.max_reads.is_none());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn short_flags() {
        let p = parse(&[
            "-r", "ref.fa", "-i", "reads.fq", "-o", "out.sam", "-k", "28", "-w", "28", "-t", "4",
            "-n", "100",
        ]);
        assert_eq!(p.kmer_size, 28);
        assert_eq!(p.window_size, 28);
        assert_eq!(p.aligner_threads, 4);
        assert_eq!(p.max_reads, Some(100));
        assert_eq!(p.output, PathBuf::from("out.sam"));
    }

    #[test]
    fn strand_parsing() {
        let p = parse(&["--reference", "r.fa", "--reads", "r.fq", "--strand", "RNA"]);
        assert_eq!(p.strand, StrandConvention::Rna);
    }

    #[test]
    fn validate_kmer_size_bounds() {
        let p = parse(&["--reference", "r.fa", "--reads", "r.fq", "-k", "32"]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("kmer-size"));
    }

    #[test]
    fn validate_modbase_threshold_bounds() {
        let p = parse(&[
            "--reference",
            "r.fa",
            "--reads",
            "r.fq",
            "--modbase-threshold",
            "1.5",
        ]);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("modbase-threshold"));
    }

    #[test]
    fn thread_resolution() {
        let p = parse(&["--reference", "r.fa", "--reads", "r.fq", "-t", "3"]);
        assert_eq!(p.aligner_thread_count(), 3);
        assert!(p.converter_thread_count() >= 1);
    }
}
