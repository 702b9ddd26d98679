/// Minimizer reference index and alignment engine
///
/// The index is built once from a reference file, is immutable afterwards,
/// and is shared read-only by all alignment workers. `align()` takes a
/// per-worker scratch so concurrent callers never contend on anything but
/// the downstream queue.
pub mod chain;
pub mod minimizer;
pub mod reference;

use std::path::Path;

use log::debug;
use rustc_hash::FxHashMap;

use crate::error::Error;

pub use self::chain::{AlignmentHit, CigarOp, HitKind};
use self::chain::Anchor;
use self::minimizer::Minimizer;
use self::reference::RefSequence;

/// Skip query minimizers whose index bucket is larger than this.
const MAX_SEED_OCCURRENCES: usize = 16;
/// Minimum query bases a chain must cover to produce a hit.
pub(crate) const MIN_CHAIN_COVERAGE: u64 = 25;
/// Keep an overlapping alternative placement only at this score fraction.
pub(crate) const SECONDARY_RATIO: f32 = 0.8;
/// At most this many secondary hits per query.
pub(crate) const MAX_SECONDARY: usize = 5;

/// Index construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct IndexParams {
    /// Minimizer k-mer length (1..=31)
    pub kmer_size: usize,
    /// Minimizer window length
    pub window_size: usize,
    /// Maximum index partition size in bytes
    pub max_index_size: u64,
}

/// One reference sequence in the index.
#[derive(Debug, Clone)]
pub struct Contig {
    pub name: String,
    /// Start of this contig in the concatenated reference
    pub offset: usize,
    pub length: usize,
}

/// Per-worker reusable buffers for `align()`.
///
/// Owned by exactly one worker thread for that thread's lifetime; never
/// shared.
#[derive(Debug, Default)]
pub struct AlignmentScratch {
    minimizers: Vec<Minimizer>,
    anchors: Vec<Anchor>,
    rc_query: Vec<u8>,
}

impl AlignmentScratch {
    pub fn new() -> Self {
        Self::default()
    }

    fn clear(&mut self) {
        self.minimizers.clear();
        self.anchors.clear();
        self.rc_query.clear();
    }
}

/// Position entry of one indexed minimizer: packed position and strand.
#[derive(Debug, Clone, Copy)]
struct SeedLoc(u64);

impl SeedLoc {
    fn new(pos: u64, reverse: bool) -> Self {
        Self((pos << 1) | u64::from(reverse))
    }

    fn pos(self) -> u64 {
        self.0 >> 1
    }

    fn reverse(self) -> bool {
        self.0 & 1 == 1
    }
}

/// Immutable minimizer index over a reference.
pub struct MinimizerIndex {
    params: IndexParams,
    contigs: Vec<Contig>,
    /// Concatenated 0–4 encoded reference
    codes: Vec<u8>,
    buckets: FxHashMap<u64, Vec<SeedLoc>>,
}

impl MinimizerIndex {
    /// Build an index from a reference file.
    pub fn build(path: &Path, params: IndexParams) -> Result<Self, Error> {
        let sequences = reference::load_reference(path)?;
        Self::from_sequences(sequences, params)
    }

    /// Build an index from already-loaded reference sequences.
    ///
    /// Fails with `Error::IndexCapacity` when the reference does not fit a
    /// single index partition; this is checked before any indexing work.
    pub fn from_sequences(
        sequences: Vec<RefSequence>,
        params: IndexParams,
    ) -> Result<Self, Error> {
        if params.kmer_size == 0 || params.kmer_size > 31 {
            return Err(Error::Index(format!(
                "k-mer size {} out of range 1..=31",
                params.kmer_size
            )));
        }
        if params.window_size == 0 {
            return Err(Error::Index("window size must be >= 1".into()));
        }

        let total: u64 = sequences.iter().map(|s| s.codes.len() as u64).sum();
        if total > params.max_index_size {
            return Err(Error::IndexCapacity {
                required: total,
                limit: params.max_index_size,
            });
        }

        let mut contigs = Vec::with_capacity(sequences.len());
        let mut codes = Vec::with_capacity(total as usize);
        let mut buckets: FxHashMap<u64, Vec<SeedLoc>> = FxHashMap::default();
        let mut buf: Vec<Minimizer> = Vec::new();

        for seq in sequences {
            let offset = codes.len();
            buf.clear();
            // Extract per contig so no k-mer spans a contig boundary.
            minimizer::minimizers(&seq.codes, params.kmer_size, params.window_size, &mut buf);
            for m in &buf {
                buckets
                    .entry(m.hash)
                    .or_default()
                    .push(SeedLoc::new((offset + m.pos as usize) as u64, m.reverse));
            }

            contigs.push(Contig {
                name: seq.name,
                offset,
                length: seq.codes.len(),
            });
            codes.extend_from_slice(&seq.codes);
        }

        debug!(
            "indexed {} contigs, {} bases, {} distinct minimizers",
            contigs.len(),
            codes.len(),
            buckets.len()
        );

        Ok(Self {
            params,
            contigs,
            codes,
            buckets,
        })
    }

    pub fn params(&self) -> IndexParams {
        self.params
    }

    /// Ordered (name, length) list for SAM header construction.
    pub fn reference_entries(&self) -> Vec<(String, u64)> {
        self.contigs
            .iter()
            .map(|c| (c.name.clone(), c.length as u64))
            .collect()
    }

    /// Align one query (0–4 encoded) against the reference.
    ///
    /// Returns hits ordered primary-first; an empty result means the query
    /// is unmapped. `scratch` must belong to the calling worker.
    pub fn align(&self, query: &[u8], scratch: &mut AlignmentScratch) -> Vec<AlignmentHit> {
        scratch.clear();

        let k = self.params.kmer_size;
        if query.len() < k {
            return Vec::new();
        }

        minimizer::minimizers(query, k, self.params.window_size, &mut scratch.minimizers);

        let qlen = query.len();
        for m in &scratch.minimizers {
            let Some(bucket) = self.buckets.get(&m.hash) else {
                continue;
            };
            if bucket.len() > MAX_SEED_OCCURRENCES {
                // Repetitive seed; unusable for placement.
                continue;
            }
            for loc in bucket {
                let reverse = m.reverse != loc.reverse();
                let qpos = if reverse {
                    (qlen - (m.pos as usize + k)) as u32
                } else {
                    m.pos
                };
                scratch.anchors.push(Anchor {
                    rpos: loc.pos(),
                    qpos,
                    reverse,
                });
            }
        }

        chain::chain_anchors(
            &self.codes,
            &self.contigs,
            k,
            query,
            &mut scratch.anchors,
            &mut scratch.rc_query,
        )
    }
}
