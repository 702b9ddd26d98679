/// FASTQ reading and nucleotide code utilities
use crate::error::Error;
use flate2::read::GzDecoder;
use noodles::fastq;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Offset between ASCII FASTQ quality characters and Phred scores.
pub const PHRED_OFFSET: u8 = 33;

/// A read from a FASTQ file.
///
/// The sequence stays in ASCII (`A`/`C`/`G`/`T`/`N`); quality values are
/// Phred scores with the +33 offset already removed.
#[derive(Debug, Clone)]
pub struct FastqRead {
    /// Read identifier
    pub name: String,
    /// Nucleotide sequence
    pub sequence: Vec<u8>,
    /// Per-base Phred quality scores
    pub quality: Vec<u8>,
}

/// FASTQ reader that handles gzip decompression transparently.
pub struct FastqReader {
    inner: fastq::Reader<Box<dyn BufRead + Send>>,
}

impl FastqReader {
    /// Open a FASTQ file, plain or gzip compressed (detected by extension).
    pub fn open(path: &Path) -> Result<Self, Error> {
        let reader = open_buffered(path)?;
        Ok(Self {
            inner: fastq::Reader::new(reader),
        })
    }

    /// Get the next read, or `None` at end of file.
    pub fn next_read(&mut self) -> Result<Option<FastqRead>, Error> {
        match self.inner.records().next() {
            Some(Ok(record)) => {
                let name = std::str::from_utf8(record.name().as_ref())
                    .map_err(|e| {
                        Error::from(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("invalid UTF-8 in read name: {}", e),
                        ))
                    })?
                    .to_string();

                let sequence = record.sequence().to_vec();

                let quality = record
                    .quality_scores()
                    .iter()
                    .map(|&b| b.saturating_sub(PHRED_OFFSET))
                    .collect();

                Ok(Some(FastqRead {
                    name,
                    sequence,
                    quality,
                }))
            }
            Some(Err(e)) => Err(Error::from(e)),
            None => Ok(None),
        }
    }
}

/// Open a file for buffered reading, decompressing gzip by extension.
pub fn open_buffered(path: &Path) -> Result<Box<dyn BufRead + Send>, Error> {
    let path_str = path.to_string_lossy();
    let is_gzipped = path_str.ends_with(".gz") || path_str.ends_with(".gzip");

    let file = File::open(path).map_err(|e| Error::io(e, path))?;

    if is_gzipped {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Convert an ASCII base to its compact code.
///
/// The code alphabet is 0=A, 1=C, 2=G, 3=T, 4=N; lowercase input is
/// accepted and ambiguity codes (R, Y, S, ...) collapse to N.
pub fn encode_base(base: u8) -> u8 {
    match base.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

/// Convert a compact base code back to its ASCII base.
pub fn decode_base(encoded: u8) -> u8 {
    match encoded {
        0 => b'A',
        1 => b'C',
        2 => b'G',
        3 => b'T',
        _ => b'N',
    }
}

/// Complement a compact base code (A↔T, C↔G, N→N).
pub fn complement_base(code: u8) -> u8 {
    if code < 4 {
        3 - code
    } else {
        4
    }
}

/// Reverse-complement an ASCII nucleotide sequence.
///
/// Applying this twice returns the original sequence for any input over
/// the supported alphabet.
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| decode_base(complement_base(encode_base(b))))
        .collect()
}
