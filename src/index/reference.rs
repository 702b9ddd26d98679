/// Reference sequence loading for index construction
use std::io::BufRead;
use std::path::Path;

use noodles::fastq;

use crate::error::Error;
use crate::io::fastq::{encode_base, open_buffered};

/// One reference sequence, encoded 0=A, 1=C, 2=G, 3=T, 4=N.
#[derive(Debug, Clone)]
pub struct RefSequence {
    pub name: String,
    pub codes: Vec<u8>,
}

/// Load reference sequences from a FASTA or FASTQ file (plain or gzipped).
///
/// The format is chosen by extension: `.fq`/`.fastq` (with optional `.gz`)
/// is FASTQ, anything else FASTA.
pub fn load_reference(path: &Path) -> Result<Vec<RefSequence>, Error> {
    let name = path.to_string_lossy();
    let stem = name
        .strip_suffix(".gz")
        .or_else(|| name.strip_suffix(".gzip"))
        .unwrap_or(&name);

    if stem.ends_with(".fq") || stem.ends_with(".fastq") {
        load_fastq(path)
    } else {
        load_fasta(path)
    }
}

/// Parse a FASTA file into encoded reference sequences.
///
/// - Base encoding: A=0, C=1, G=2, T=3, N/other=4
/// - Control characters (ASCII < 32) are skipped
/// - Case-insensitive (a == A)
/// - Sequence name is the header token up to the first whitespace
fn load_fasta(path: &Path) -> Result<Vec<RefSequence>, Error> {
    let reader = open_buffered(path)?;

    let mut sequences = Vec::new();
    let mut current_name: Option<String> = None;
    let mut current_codes: Vec<u8> = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result.map_err(|e| Error::io(e, path))?;

        if line.is_empty() {
            continue;
        }

        if let Some(stripped) = line.strip_prefix('>') {
            if let Some(name) = current_name.take() {
                sequences.push(RefSequence {
                    name,
                    codes: std::mem::take(&mut current_codes),
                });
            }

            let name = stripped
                .split_whitespace()
                .next()
                .ok_or_else(|| {
                    Error::Reference(format!(
                        "empty sequence name at {}:{}",
                        path.display(),
                        line_num + 1
                    ))
                })?
                .to_string();

            current_name = Some(name);
        } else {
            if current_name.is_none() {
                return Err(Error::Reference(format!(
                    "sequence data before first header at {}:{}",
                    path.display(),
                    line_num + 1
                )));
            }

            for &byte in line.as_bytes() {
                if byte < 32 {
                    continue;
                }
                current_codes.push(encode_base(byte));
            }
        }
    }

    if let Some(name) = current_name {
        sequences.push(RefSequence {
            name,
            codes: current_codes,
        });
    }

    if sequences.is_empty() {
        return Err(Error::Reference(format!(
            "no sequences found in {}",
            path.display()
        )));
    }

    Ok(sequences)
}

/// Parse a FASTQ file into encoded reference sequences (quality ignored).
fn load_fastq(path: &Path) -> Result<Vec<RefSequence>, Error> {
    let mut reader = fastq::Reader::new(open_buffered(path)?);

    let mut sequences = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| Error::io(e, path))?;
        let name = String::from_utf8_lossy(record.name().as_ref()).to_string();
        let codes = record.sequence().iter().map(|&b| encode_base(b)).collect();
        sequences.push(RefSequence { name, codes });
    }

    if sequences.is_empty() {
        return Err(Error::Reference(format!(
            "no sequences found in {}",
            path.display()
        )));
    }

    Ok(sequences)
}
