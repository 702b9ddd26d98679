/// Alignment stage wrapping the minimizer index
///
/// Workers pop canonical records, align their sequences against the
/// shared read-only index using per-worker scratch buffers, and emit one
/// output record per hit (primary first). Input tags ride along verbatim
/// because every output starts as a clone of the input record.
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::warn;
use noodles::sam;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::MappingQuality;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::alignment::record_buf::{QualityScores, RecordBuf, Sequence};

use crate::error::Error;
use crate::index::{
    AlignmentHit, AlignmentScratch, CigarOp, HitKind, IndexParams, MinimizerIndex,
};
use crate::io::fastq::{encode_base, reverse_complement};
use crate::stats::PipelineStats;

use super::{BoundedQueue, Message, PipelineStage, WorkerPool};

/// Worker-pool stage aligning records against a reference index.
pub struct Aligner {
    input: BoundedQueue<Message>,
    sink: Arc<dyn PipelineStage>,
    index: Arc<MinimizerIndex>,
    /// One scratch per worker, claimed by worker index at startup.
    scratches: Mutex<Vec<Option<AlignmentScratch>>>,
    worker_count: usize,
    pool: WorkerPool,
    stats: Arc<PipelineStats>,
}

impl Aligner {
    /// Build the reference index synchronously and construct the stage.
    ///
    /// Index construction failures (including `Error::IndexCapacity` for
    /// references that need more than one partition) surface here, before
    /// any worker thread exists.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sink: Arc<dyn PipelineStage>,
        reference: &Path,
        kmer_size: usize,
        window_size: usize,
        max_index_size: u64,
        worker_count: usize,
        queue_capacity: usize,
        stats: Arc<PipelineStats>,
    ) -> Result<Arc<Self>, Error> {
        let index = MinimizerIndex::build(
            reference,
            IndexParams {
                kmer_size,
                window_size,
                max_index_size,
            },
        )?;
        Ok(Self::with_index(
            sink,
            Arc::new(index),
            worker_count,
            queue_capacity,
            stats,
        ))
    }

    /// Construct the stage around an existing index.
    pub fn with_index(
        sink: Arc<dyn PipelineStage>,
        index: Arc<MinimizerIndex>,
        worker_count: usize,
        queue_capacity: usize,
        stats: Arc<PipelineStats>,
    ) -> Arc<Self> {
        // At least one worker, or shutdown would never propagate.
        let worker_count = worker_count.max(1);
        let scratches = (0..worker_count)
            .map(|_| Some(AlignmentScratch::new()))
            .collect();
        Arc::new(Self {
            input: BoundedQueue::with_capacity(queue_capacity),
            sink,
            index,
            scratches: Mutex::new(scratches),
            worker_count,
            pool: WorkerPool::new("align"),
            stats,
        })
    }

    /// Ordered (name, length) contig list, for writer header derivation.
    pub fn reference_entries(&self) -> Vec<(String, u64)> {
        self.index.reference_entries()
    }

    fn process(&self, msg: Message, scratch: &mut AlignmentScratch) {
        let record = match msg {
            Message::Record(record) => record,
            Message::Read(_) => {
                warn!("align: dropping unconverted read message");
                return;
            }
        };

        match align_record(&self.index, &record, scratch) {
            Ok(outputs) => {
                for output in outputs {
                    match output.flags() {
                        f if f.is_unmapped() => self.stats.add_unmapped(),
                        f if f.is_supplementary() => self.stats.add_supplementary(),
                        f if f.is_secondary() => self.stats.add_secondary(),
                        _ => self.stats.add_mapped(),
                    }
                    self.sink.push(Message::Record(output));
                }
            }
            Err(e) => {
                let name = record
                    .name()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "<unnamed>".to_string());
                warn!("align: skipping record '{}': {}", name, e);
            }
        }
    }
}

impl PipelineStage for Aligner {
    fn name(&self) -> &'static str {
        "align"
    }

    fn start(self: Arc<Self>) {
        let stage = Arc::clone(&self);
        let sink = Arc::clone(&self.sink);
        self.pool.spawn(
            self.worker_count,
            move |worker| {
                let mut scratch = stage
                    .scratches
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())[worker]
                    .take()
                    .unwrap_or_default();
                while let Some(msg) = stage.input.pop() {
                    stage.process(msg, &mut scratch);
                }
            },
            move || sink.close(),
        );
    }

    fn push(&self, msg: Message) {
        if self.input.push(msg).is_err() {
            warn!("align: message pushed after close was dropped");
        }
    }

    fn close(&self) {
        self.input.close();
    }

    fn join(&self) -> Result<(), Error> {
        self.pool.join()
    }
}

/// Align one record, producing one output per hit (or one unmapped copy).
fn align_record(
    index: &MinimizerIndex,
    record: &RecordBuf,
    scratch: &mut AlignmentScratch,
) -> Result<Vec<Box<RecordBuf>>, Error> {
    let sequence: &[u8] = record.sequence().as_ref();
    let codes: Vec<u8> = sequence.iter().map(|&b| encode_base(b)).collect();

    let hits = index.align(&codes, scratch);
    if hits.is_empty() {
        let mut out = record.clone();
        *out.flags_mut() = Flags::UNMAPPED;
        *out.reference_sequence_id_mut() = None;
        *out.alignment_start_mut() = None;
        *out.mapping_quality_mut() = None;
        *out.cigar_mut() = Default::default();
        return Ok(vec![Box::new(out)]);
    }

    let quality: &[u8] = record.quality_scores().as_ref();
    // Computed once, only when some hit is on the reverse strand.
    let mut reversed: Option<(Vec<u8>, Vec<u8>)> = None;

    let mut outputs = Vec::with_capacity(hits.len());
    for hit in &hits {
        let mut out = record.clone();

        let mut flags = Flags::empty();
        if hit.reverse {
            flags |= Flags::REVERSE_COMPLEMENTED;
        }
        match hit.kind {
            HitKind::Primary => {}
            HitKind::Secondary => flags |= Flags::SECONDARY,
            HitKind::Supplementary => flags |= Flags::SUPPLEMENTARY,
        }
        *out.flags_mut() = flags;

        *out.reference_sequence_id_mut() = Some(hit.target_id);
        *out.alignment_start_mut() = Some((hit.target_start + 1).try_into().map_err(|e| {
            Error::Alignment(format!(
                "invalid alignment position {}: {}",
                hit.target_start + 1,
                e
            ))
        })?);
        *out.mapping_quality_mut() = MappingQuality::new(hit.mapq);
        *out.cigar_mut() = convert_cigar(&hit.cigar);

        // Per SAM convention a reverse-strand record stores the reverse
        // complement of the read and a reversed quality array. Only the
        // primary output carries the payload at all; secondary and
        // supplementary records stay empty and rely on the rl tag for
        // the original read length.
        if hit.kind == HitKind::Primary {
            if hit.reverse {
                let (rc_seq, rev_qual) = reversed.get_or_insert_with(|| {
                    let mut q = quality.to_vec();
                    q.reverse();
                    (reverse_complement(sequence), q)
                });
                *out.sequence_mut() = Sequence::from(rc_seq.clone());
                *out.quality_scores_mut() = QualityScores::from(rev_qual.clone());
            }
        } else {
            *out.sequence_mut() = Sequence::default();
            *out.quality_scores_mut() = QualityScores::default();
        }

        attach_alignment_tags(&mut out, hit);
        outputs.push(Box::new(out));
    }

    Ok(outputs)
}

/// The fixed alignment tag vocabulary, attached to every mapped output.
///
/// Pre-existing provenance tags are untouched: these keys are disjoint
/// from anything the conversion stage emits.
fn attach_alignment_tags(record: &mut RecordBuf, hit: &AlignmentHit) {
    let data = record.data_mut();
    data.insert(Tag::EDIT_DISTANCE, Value::from(hit.edit_distance as i32));
    data.insert(Tag::new(b'm', b's'), Value::from(hit.mismatches as i32));
    data.insert(Tag::ALIGNMENT_SCORE, Value::from(hit.score));
    data.insert(Tag::new(b'n', b'n'), Value::Float(hit.identity));
    data.insert(Tag::new(b'd', b'e'), Value::Float(hit.divergence));
    data.insert(Tag::new(b't', b'p'), Value::Character(hit.kind.code()));
    data.insert(Tag::new(b'c', b'm'), Value::from(hit.chain_id as i32));
    data.insert(Tag::new(b's', b'1'), Value::from(hit.target_span as i32));
    data.insert(Tag::new(b'r', b'l'), Value::from(hit.read_length as i32));
}

/// Convert engine CIGAR runs to a noodles CIGAR.
fn convert_cigar(ops: &[CigarOp]) -> sam::alignment::record_buf::Cigar {
    use sam::alignment::record::cigar::op::Kind;

    let mut cigar = sam::alignment::record_buf::Cigar::default();
    for op in ops {
        let (kind, len) = match *op {
            CigarOp::Match(len) => (Kind::Match, len),
            CigarOp::Ins(len) => (Kind::Insertion, len),
            CigarOp::Del(len) => (Kind::Deletion, len),
            CigarOp::SoftClip(len) => (Kind::SoftClip, len),
        };
        cigar
            .as_mut()
            .push(sam::alignment::record::cigar::Op::new(kind, len as usize));
    }
    cigar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::reference::RefSequence;
    use bstr::BString;
    use noodles::sam::alignment::record::QualityScores as _;

    fn encode(seq: &[u8]) -> Vec<u8> {
        seq.iter().map(|&b| encode_base(b)).collect()
    }

    fn random_seq(len: usize, mut state: u64) -> Vec<u8> {
        let mut seq = Vec::with_capacity(len);
        for _ in 0..len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            seq.push(b"ACGT"[(state >> 33) as usize & 3]);
        }
        seq
    }

    fn index_for(target: &[u8], k: usize, w: usize) -> Arc<MinimizerIndex> {
        Arc::new(
            MinimizerIndex::from_sequences(
                vec![RefSequence {
                    name: "target".into(),
                    codes: encode(target),
                }],
                IndexParams {
                    kmer_size: k,
                    window_size: w,
                    max_index_size: 1_000_000_000,
                },
            )
            .unwrap(),
        )
    }

    fn record_for(name: &str, seq: &[u8]) -> RecordBuf {
        let mut record = RecordBuf::default();
        record.name_mut().replace(BString::from(name));
        *record.flags_mut() = Flags::UNMAPPED;
        *record.sequence_mut() = Sequence::from(seq.to_vec());
        *record.quality_scores_mut() = QualityScores::from(vec![30u8; seq.len()]);
        record
    }

    #[test]
    fn self_alignment_output_matches_input() {
        let target = random_seq(120, 77);
        let index = index_for(&target, 15, 10);
        let mut scratch = AlignmentScratch::new();

        let record = record_for("read1", &target);
        let outputs = align_record(&index, &record, &mut scratch).unwrap();
        assert_eq!(outputs.len(), 1);

        let out = &outputs[0];
        assert!(!out.flags().is_unmapped());
        assert!(!out.flags().is_reverse_complemented());
        assert_eq!(out.sequence().as_ref(), &target[..]);
        assert_eq!(out.quality_scores().as_ref(), &vec![30u8; 120][..]);
        assert_eq!(
            out.data().get(&Tag::EDIT_DISTANCE),
            Some(&Value::from(0i32))
        );
        assert_eq!(
            out.data().get(&Tag::new(b't', b'p')),
            Some(&Value::Character(b'P'))
        );
    }

    #[test]
    fn reverse_hit_stores_reverse_complement() {
        let target = random_seq(120, 78);
        let index = index_for(&target, 15, 10);
        let mut scratch = AlignmentScratch::new();

        let query = reverse_complement(&target);
        let mut quality: Vec<u8> = (0..120u8).collect();
        let mut record = record_for("read1", &query);
        *record.quality_scores_mut() = QualityScores::from(quality.clone());

        let outputs = align_record(&index, &record, &mut scratch).unwrap();
        assert_eq!(outputs.len(), 1);

        let out = &outputs[0];
        assert!(out.flags().is_reverse_complemented());
        // Stored sequence is the reverse complement of the query, i.e.
        // the original target.
        assert_eq!(out.sequence().as_ref(), &target[..]);
        quality.reverse();
        assert_eq!(out.quality_scores().as_ref(), &quality[..]);
    }

    #[test]
    fn unmapped_record_keeps_payload_and_tags() {
        let target = random_seq(200, 79);
        let index = index_for(&target, 15, 10);
        let mut scratch = AlignmentScratch::new();

        let query = random_seq(80, 12345);
        let mut record = record_for("read1", &query);
        record
            .data_mut()
            .insert(Tag::READ_GROUP, Value::String(BString::from("runX")));

        let outputs = align_record(&index, &record, &mut scratch).unwrap();
        assert_eq!(outputs.len(), 1);

        let out = &outputs[0];
        assert!(out.flags().is_unmapped());
        assert!(out.reference_sequence_id().is_none());
        assert!(out.alignment_start().is_none());
        assert_eq!(out.sequence().as_ref(), &query[..]);
        assert_eq!(
            out.data().get(&Tag::READ_GROUP),
            Some(&Value::String(BString::from("runX")))
        );
        // No alignment tags on an unmapped record.
        assert!(out.data().get(&Tag::new(b't', b'p')).is_none());
    }

    #[test]
    fn split_read_fans_out_with_preserved_tags() {
        let target = random_seq(800, 80);
        let mut query = target[100..180].to_vec();
        query.extend_from_slice(&target[620..700]);

        let index = index_for(&target, 28, 28);
        let mut scratch = AlignmentScratch::new();

        let mut record = record_for("read1", &query);
        record
            .data_mut()
            .insert(Tag::READ_GROUP, Value::String(BString::from("runX")));

        let outputs = align_record(&index, &record, &mut scratch).unwrap();
        assert_eq!(outputs.len(), 2);

        let primary = &outputs[0];
        assert!(!primary.flags().is_supplementary());
        assert_eq!(primary.sequence().len(), 160);
        assert_eq!(
            primary.data().get(&Tag::new(b't', b'p')),
            Some(&Value::Character(b'P'))
        );

        let supplementary = &outputs[1];
        assert!(supplementary.flags().is_supplementary());
        assert_eq!(supplementary.sequence().len(), 0);
        assert_eq!(supplementary.quality_scores().len(), 0);
        assert_eq!(
            supplementary.data().get(&Tag::new(b't', b'p')),
            Some(&Value::Character(b'I'))
        );
        // The read length tag recovers the payload size on both outputs.
        for out in &outputs {
            assert_eq!(
                out.data().get(&Tag::new(b'r', b'l')),
                Some(&Value::from(160i32))
            );
            assert_eq!(
                out.data().get(&Tag::READ_GROUP),
                Some(&Value::String(BString::from("runX")))
            );
        }
    }
}
