pub mod error;
pub mod params;

pub mod index;
pub mod io;
pub mod pipeline;
pub mod read;
pub mod stats;

use std::sync::Arc;

use log::info;

use crate::index::{IndexParams, MinimizerIndex};
use crate::io::fastq::FastqReader;
use crate::io::sam::SamWriterStage;
use crate::params::Parameters;
use crate::pipeline::{Aligner, ConverterOptions, Message, Pipeline, ReadConverter};
use crate::read::ReadUnit;
use crate::stats::PipelineStats;

/// Top-level driver. Called from `main()` after CLI parsing.
pub fn run(params: &Parameters) -> anyhow::Result<()> {
    params.validate()?;

    info!("readpipe v{}", env!("CARGO_PKG_VERSION"));
    info!("reference: {}", params.reference.display());
    info!("reads: {}", params.reads.display());
    info!(
        "k = {}, w = {}, aligner threads = {}, converter threads = {}",
        params.kmer_size,
        params.window_size,
        params.aligner_thread_count(),
        params.converter_thread_count()
    );

    let stats = Arc::new(PipelineStats::new());

    // The index is built before the pipeline exists: a reference that
    // does not fit a single partition aborts here, with no threads
    // started.
    info!("loading index {}", params.reference.display());
    let index = Arc::new(MinimizerIndex::build(
        &params.reference,
        IndexParams {
            kmer_size: params.kmer_size,
            window_size: params.window_size,
            max_index_size: params.max_index_size,
        },
    )?);
    info!("loaded index {}", params.reference.display());

    let writer = SamWriterStage::create(
        &params.output,
        &index.reference_entries(),
        params.queue_capacity,
    )?;

    let aligner = Aligner::with_index(
        writer.clone(),
        Arc::clone(&index),
        params.aligner_thread_count(),
        params.queue_capacity,
        Arc::clone(&stats),
    );

    let converter = ReadConverter::new(
        aligner.clone(),
        params.converter_thread_count(),
        params.queue_capacity,
        ConverterOptions {
            emit_moves: params.emit_moves,
            strand: params.strand,
            modbase_threshold: params.modbase_threshold,
            max_records: params.max_reads,
        },
        Arc::clone(&stats),
    );

    let pipeline = Pipeline::new(vec![converter, aligner, writer]);
    pipeline.start();

    info!("starting alignment");
    let mut reader = FastqReader::open(&params.reads)?;
    let mut fed = 0u64;
    while let Some(read) = reader.next_read()? {
        if let Some(cap) = params.max_reads {
            if fed >= cap {
                break;
            }
        }
        fed += 1;

        let mut unit = ReadUnit::new(read.name, read.sequence, read.quality);
        unit.run_id = params.run_id.clone();
        unit.sample_id = params.sample_id.clone();
        pipeline.push(Message::Read(unit));
    }

    pipeline.finish()?;
    info!("finished alignment");

    stats.print_summary();
    info!("Alignment complete!");
    Ok(())
}
