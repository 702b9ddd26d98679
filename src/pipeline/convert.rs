/// Read-to-record conversion stage
///
/// Turns internal reads into canonical (unmapped) alignment records and
/// attaches the provenance tags that must survive every downstream
/// stage: read group, mean quality, optionally the move table and the
/// thresholded modified-base calls.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bstr::BString;
use log::warn;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record_buf::data::field::value::Array;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::{QualityScores, RecordBuf, Sequence};

use crate::error::Error;
use crate::params::StrandConvention;
use crate::read::ReadUnit;
use crate::stats::PipelineStats;

use super::{BoundedQueue, Message, PipelineStage, WorkerPool};

/// Conversion behavior, fixed at assembly time.
#[derive(Debug, Clone)]
pub struct ConverterOptions {
    /// Attach the mv move-table tag when the read carries one
    pub emit_moves: bool,
    /// DNA or RNA basecalling convention
    pub strand: StrandConvention,
    /// Minimum probability for a modified-base call to be reported
    pub modbase_threshold: f32,
    /// Discard records beyond this count
    pub max_records: Option<u64>,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self {
            emit_moves: false,
            strand: StrandConvention::Dna,
            modbase_threshold: 0.0,
            max_records: None,
        }
    }
}

/// Worker-pool stage converting `Message::Read` into `Message::Record`.
pub struct ReadConverter {
    input: BoundedQueue<Message>,
    sink: Arc<dyn PipelineStage>,
    opts: ConverterOptions,
    pool: WorkerPool,
    worker_count: usize,
    accepted: AtomicU64,
    stats: Arc<PipelineStats>,
}

impl ReadConverter {
    pub fn new(
        sink: Arc<dyn PipelineStage>,
        worker_count: usize,
        queue_capacity: usize,
        opts: ConverterOptions,
        stats: Arc<PipelineStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            input: BoundedQueue::with_capacity(queue_capacity),
            sink,
            opts,
            pool: WorkerPool::new("convert"),
            // At least one worker, or shutdown would never propagate.
            worker_count: worker_count.max(1),
            accepted: AtomicU64::new(0),
            stats,
        })
    }

    fn process(&self, msg: Message) {
        let read = match msg {
            Message::Read(read) => read,
            Message::Record(_) => {
                warn!("convert: dropping unexpected record message");
                self.stats.add_skipped();
                return;
            }
        };

        let record = match convert_read(read, &self.opts) {
            Ok(record) => record,
            Err(reason) => {
                // A malformed read never takes the stage down.
                warn!("convert: skipping read: {}", reason);
                self.stats.add_skipped();
                return;
            }
        };

        if let Some(cap) = self.opts.max_records {
            if self.accepted.fetch_add(1, Ordering::AcqRel) >= cap {
                self.stats.add_skipped();
                return;
            }
        }

        self.stats.add_read();
        self.sink.push(Message::Record(Box::new(record)));
    }
}

impl PipelineStage for ReadConverter {
    fn name(&self) -> &'static str {
        "convert"
    }

    fn start(self: Arc<Self>) {
        let stage = Arc::clone(&self);
        let sink = Arc::clone(&self.sink);
        self.pool.spawn(
            self.worker_count,
            move |_| {
                while let Some(msg) = stage.input.pop() {
                    stage.process(msg);
                }
            },
            move || sink.close(),
        );
    }

    fn push(&self, msg: Message) {
        if self.input.push(msg).is_err() {
            warn!("convert: message pushed after close was dropped");
        }
    }

    fn close(&self) {
        self.input.close();
    }

    fn join(&self) -> Result<(), Error> {
        self.pool.join()
    }
}

/// Build the canonical record for one read.
pub(crate) fn convert_read(
    mut read: ReadUnit,
    opts: &ConverterOptions,
) -> Result<RecordBuf, String> {
    if read.sequence.is_empty() {
        return Err(format!("'{}' has an empty sequence", read.read_id));
    }
    if !read.quality.is_empty() && read.quality.len() != read.sequence.len() {
        return Err(format!(
            "'{}' quality length {} does not match sequence length {}",
            read.read_id,
            read.quality.len(),
            read.sequence.len()
        ));
    }

    // RNA is basecalled 3'→5': flip the read into standard orientation.
    // The move table stays in signal order.
    if opts.strand == StrandConvention::Rna {
        let len = read.sequence.len();
        read.sequence.reverse();
        read.quality.reverse();
        for call in &mut read.mod_calls {
            call.position = len - 1 - call.position;
        }
        read.mod_calls.sort_by_key(|c| c.position);
    }

    let mut record = RecordBuf::default();
    record.name_mut().replace(BString::from(read.read_id.as_str()));
    *record.flags_mut() = Flags::UNMAPPED;

    let mean_quality = if read.quality.is_empty() {
        0.0
    } else {
        read.quality.iter().map(|&q| q as f32).sum::<f32>() / read.quality.len() as f32
    };

    *record.sequence_mut() = Sequence::from(read.sequence.clone());
    *record.quality_scores_mut() = QualityScores::from(read.quality);

    let data = record.data_mut();
    data.insert(
        Tag::READ_GROUP,
        Value::String(BString::from(format!("{}_{}", read.run_id, read.sample_id))),
    );
    data.insert(Tag::new(b'q', b's'), Value::Float(mean_quality));

    if opts.emit_moves {
        if let Some(moves) = &read.moves {
            let mut values: Vec<i8> = Vec::with_capacity(moves.len() + 1);
            values.push(read.model_stride as i8);
            values.extend(moves.iter().map(|&m| m as i8));
            data.insert(Tag::new(b'm', b'v'), Value::Array(Array::Int8(values)));
        }
    }

    if let Some(ctx) = read.mod_context {
        if let Some((mm, ml)) = build_modbase_tags(
            &read.sequence,
            ctx,
            &read.mod_calls,
            opts.modbase_threshold,
        ) {
            data.insert(
                Tag::BASE_MODIFICATIONS,
                Value::String(BString::from(mm)),
            );
            data.insert(
                Tag::BASE_MODIFICATION_PROBABILITIES,
                Value::Array(Array::UInt8(ml)),
            );
        }
    }

    Ok(record)
}

/// Delta-encode modified-base calls over the canonical base occurrences.
///
/// Returns the MM string and the 0–255 scaled ML probabilities, or `None`
/// when no call passes the threshold.
fn build_modbase_tags(
    sequence: &[u8],
    ctx: crate::read::ModBaseContext,
    calls: &[crate::read::ModBaseCall],
    threshold: f32,
) -> Option<(String, Vec<u8>)> {
    // Ordinal of each sequence position among canonical-base positions.
    let mut ordinals = vec![usize::MAX; sequence.len()];
    let mut count = 0usize;
    for (i, &base) in sequence.iter().enumerate() {
        if base.to_ascii_uppercase() == ctx.canonical {
            ordinals[i] = count;
            count += 1;
        }
    }

    let mut mm = format!("{}+{}", ctx.canonical as char, ctx.code as char);
    let mut ml = Vec::new();
    let mut prev_ordinal: Option<usize> = None;

    for call in calls {
        if call.probability < threshold {
            continue;
        }
        let ordinal = match ordinals.get(call.position) {
            Some(&o) if o != usize::MAX => o,
            _ => continue, // call does not sit on a canonical base
        };

        let delta = match prev_ordinal {
            None => ordinal,
            Some(p) => ordinal - p - 1,
        };
        prev_ordinal = Some(ordinal);

        mm.push(',');
        mm.push_str(&delta.to_string());
        ml.push((call.probability * 255.0).round().clamp(0.0, 255.0) as u8);
    }

    if ml.is_empty() {
        return None;
    }
    mm.push(';');
    Some((mm, ml))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::{ModBaseCall, ModBaseContext};

    fn read_with_seq(seq: &[u8]) -> ReadUnit {
        let mut read = ReadUnit::new("read1", seq.to_vec(), vec![30; seq.len()]);
        read.run_id = "runA".into();
        read.sample_id = "sampleB".into();
        read
    }

    fn tag(record: &RecordBuf, tag: Tag) -> Option<Value> {
        record.data().get(&tag).cloned()
    }

    #[test]
    fn basic_conversion_sets_provenance() {
        let record = convert_read(read_with_seq(b"ACGTACGT"), &ConverterOptions::default()).unwrap();

        assert_eq!(record.name().map(|n| n.to_string()), Some("read1".into()));
        assert!(record.flags().is_unmapped());
        assert_eq!(record.sequence().as_ref(), b"ACGTACGT");
        assert_eq!(
            tag(&record, Tag::READ_GROUP),
            Some(Value::String(BString::from("runA_sampleB")))
        );
        match tag(&record, Tag::new(b'q', b's')) {
            Some(Value::Float(qs)) => assert!((qs - 30.0).abs() < 0.01),
            other => panic!("missing qs tag: {:?}", other),
        }
    }

    #[test]
    fn empty_sequence_is_malformed() {
        let err = convert_read(read_with_seq(b""), &ConverterOptions::default()).unwrap_err();
        assert!(err.contains("empty sequence"));
    }

    #[test]
    fn quality_length_mismatch_is_malformed() {
        let mut read = read_with_seq(b"ACGT");
        read.quality = vec![30; 3];
        let err = convert_read(read, &ConverterOptions::default()).unwrap_err();
        assert!(err.contains("does not match"));
    }

    #[test]
    fn move_table_is_gated_by_option() {
        let mut read = read_with_seq(b"ACGT");
        read.moves = Some(vec![1, 0, 1, 0, 1, 1]);
        read.model_stride = 5;

        let without = convert_read(read.clone(), &ConverterOptions::default()).unwrap();
        assert!(tag(&without, Tag::new(b'm', b'v')).is_none());

        let opts = ConverterOptions {
            emit_moves: true,
            ..Default::default()
        };
        let with = convert_read(read, &opts).unwrap();
        assert_eq!(
            tag(&with, Tag::new(b'm', b'v')),
            Some(Value::Array(Array::Int8(vec![5, 1, 0, 1, 0, 1, 1])))
        );
    }

    #[test]
    fn modbase_tags_are_thresholded_and_delta_encoded() {
        // C positions: 1, 3, 6, 7 (ordinals 0..3).
        let mut read = read_with_seq(b"ACGCAACC");
        read.mod_context = Some(ModBaseContext {
            canonical: b'C',
            code: b'm',
        });
        read.mod_calls = vec![
            ModBaseCall {
                position: 1,
                probability: 0.9,
            },
            ModBaseCall {
                position: 3,
                probability: 0.2, // below threshold
            },
            ModBaseCall {
                position: 7,
                probability: 0.6,
            },
        ];

        let opts = ConverterOptions {
            modbase_threshold: 0.5,
            ..Default::default()
        };
        let record = convert_read(read, &opts).unwrap();

        // Ordinals 0 and 3 survive: deltas 0 then 2 skipped Cs.
        assert_eq!(
            tag(&record, Tag::BASE_MODIFICATIONS),
            Some(Value::String(BString::from("C+m,0,2;")))
        );
        assert_eq!(
            tag(&record, Tag::BASE_MODIFICATION_PROBABILITIES),
            Some(Value::Array(Array::UInt8(vec![230, 153])))
        );
    }

    #[test]
    fn all_calls_below_threshold_omit_tags() {
        let mut read = read_with_seq(b"ACGC");
        read.mod_context = Some(ModBaseContext {
            canonical: b'C',
            code: b'm',
        });
        read.mod_calls = vec![ModBaseCall {
            position: 1,
            probability: 0.1,
        }];

        let opts = ConverterOptions {
            modbase_threshold: 0.5,
            ..Default::default()
        };
        let record = convert_read(read, &opts).unwrap();
        assert!(tag(&record, Tag::BASE_MODIFICATIONS).is_none());
        assert!(tag(&record, Tag::BASE_MODIFICATION_PROBABILITIES).is_none());
    }

    #[test]
    fn rna_reads_are_reversed() {
        let mut read = read_with_seq(b"ACGT");
        read.quality = vec![10, 20, 30, 40];
        read.mod_context = Some(ModBaseContext {
            canonical: b'A',
            code: b'a',
        });
        read.mod_calls = vec![ModBaseCall {
            position: 0,
            probability: 1.0,
        }];

        let opts = ConverterOptions {
            strand: StrandConvention::Rna,
            ..Default::default()
        };
        let record = convert_read(read, &opts).unwrap();

        // Reversed, not complemented.
        assert_eq!(record.sequence().as_ref(), b"TGCA");
        assert_eq!(record.quality_scores().as_ref(), &[40, 30, 20, 10]);
        // The A moved from position 0 to position 3 (the only A: ordinal 0).
        assert_eq!(
            tag(&record, Tag::BASE_MODIFICATIONS),
            Some(Value::String(BString::from("A+a,0;")))
        );
    }
}
