/// Internal read representation handed to the conversion stage
///
/// This is the shape a basecalling front end (or the FASTQ feeder in
/// `run()`) produces. The conversion stage turns it into a canonical
/// alignment record; nothing downstream of conversion sees this type.

/// A single modified-base call on a read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModBaseCall {
    /// Position of the call on the read sequence (0-based)
    pub position: usize,
    /// Call probability in [0, 1]
    pub probability: f32,
}

/// Modification context for a read's modified-base calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModBaseContext {
    /// Canonical base the modification applies to (e.g. b'C')
    pub canonical: u8,
    /// Single-letter modification code (e.g. b'm' for 5mC)
    pub code: u8,
}

/// One read as produced by the upstream collaborator.
#[derive(Debug, Clone)]
pub struct ReadUnit {
    /// Read identifier
    pub read_id: String,
    /// Nucleotide sequence in basecall order (ASCII)
    pub sequence: Vec<u8>,
    /// Per-base Phred quality scores; same length as sequence, or empty
    pub quality: Vec<u8>,
    /// Sequencing run identifier
    pub run_id: String,
    /// Sample identifier
    pub sample_id: String,
    /// Signal-to-base move table (0/1 per model stride), if available
    pub moves: Option<Vec<u8>>,
    /// Model stride for the move table
    pub model_stride: u8,
    /// Modification context shared by all calls on this read
    pub mod_context: Option<ModBaseContext>,
    /// Modified-base calls, ordered by position
    pub mod_calls: Vec<ModBaseCall>,
}

impl ReadUnit {
    /// A bare read with no basecaller side channels attached.
    pub fn new(read_id: impl Into<String>, sequence: Vec<u8>, quality: Vec<u8>) -> Self {
        Self {
            read_id: read_id.into(),
            sequence,
            quality,
            run_id: String::new(),
            sample_id: String::new(),
            moves: None,
            model_stride: 1,
            mod_context: None,
            mod_calls: Vec::new(),
        }
    }
}
