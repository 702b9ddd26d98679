/// SAM output writing and the writer pipeline sink
use std::fs::File;
use std::io::{BufWriter, Write as IoWrite};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{error, warn};
use noodles::sam;
use noodles::sam::alignment::io::Write;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::header::record::value::{map::Program, Map};

use crate::error::Error;
use crate::pipeline::{BoundedQueue, Message, PipelineStage, WorkerPool};

/// SAM file writer with a header derived from the reference index.
pub struct SamWriter {
    writer: sam::io::Writer<BufWriter<File>>,
    header: sam::Header,
}

impl SamWriter {
    /// Create the output file and write its header.
    ///
    /// `reference_entries` is the ordered (name, length) contig list the
    /// aligner exposes; it becomes the @SQ dictionary.
    pub fn create(path: &Path, reference_entries: &[(String, u64)]) -> Result<Self, Error> {
        let file = File::create(path).map_err(|e| Error::io(e, path))?;
        let buf_writer = BufWriter::new(file);

        let header = build_sam_header(reference_entries)?;
        let mut writer = sam::io::Writer::new(buf_writer);
        writer.write_header(&header)?;

        Ok(Self { writer, header })
    }

    pub fn write_record(&mut self, record: &RecordBuf) -> Result<(), Error> {
        self.writer.write_alignment_record(&self.header, record)?;
        Ok(())
    }

    /// Flush buffered output.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.writer.get_mut().flush()?;
        Ok(())
    }
}

/// Build the SAM header: @HD, @SQ per contig, and the @PG line.
pub fn build_sam_header(reference_entries: &[(String, u64)]) -> Result<sam::Header, Error> {
    let mut builder = sam::Header::builder();

    builder = builder.set_header(Default::default());

    for (name, length) in reference_entries {
        let length_nz = NonZeroUsize::new(*length as usize)
            .ok_or_else(|| Error::Index(format!("contig {} has zero length", name)))?;

        builder = builder.add_reference_sequence(
            name.as_str(),
            Map::<sam::header::record::value::map::ReferenceSequence>::new(length_nz),
        );
    }

    builder = builder.add_program("readpipe", Map::<Program>::default());

    Ok(builder.build())
}

/// Terminal pipeline stage draining records into a `SamWriter`.
///
/// A single worker keeps output writing ordered with respect to its own
/// input queue; upstream stages provide no cross-record order anyway.
pub struct SamWriterStage {
    input: BoundedQueue<Message>,
    writer: Arc<Mutex<SamWriter>>,
    pool: WorkerPool,
}

impl SamWriterStage {
    pub fn create(
        path: &Path,
        reference_entries: &[(String, u64)],
        queue_capacity: usize,
    ) -> Result<Arc<Self>, Error> {
        let writer = SamWriter::create(path, reference_entries)?;
        Ok(Arc::new(Self {
            input: BoundedQueue::with_capacity(queue_capacity),
            writer: Arc::new(Mutex::new(writer)),
            pool: WorkerPool::new("write"),
        }))
    }
}

impl PipelineStage for SamWriterStage {
    fn name(&self) -> &'static str {
        "write"
    }

    fn start(self: Arc<Self>) {
        let stage = Arc::clone(&self);
        let writer = Arc::clone(&self.writer);
        self.pool.spawn(
            1,
            move |_| {
                while let Some(msg) = stage.input.pop() {
                    match msg {
                        Message::Record(record) => {
                            let mut writer =
                                stage.writer.lock().unwrap_or_else(|e| e.into_inner());
                            if let Err(e) = writer.write_record(&record) {
                                warn!("write: failed to write record: {}", e);
                            }
                        }
                        Message::Read(_) => {
                            warn!("write: dropping unconverted read message");
                        }
                    }
                }
            },
            move || {
                let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = writer.finish() {
                    error!("write: failed to flush output: {}", e);
                }
            },
        );
    }

    fn push(&self, msg: Message) {
        if self.input.push(msg).is_err() {
            warn!("write: message pushed after close was dropped");
        }
    }

    fn close(&self) {
        self.input.close();
    }

    fn join(&self) -> Result<(), Error> {
        self.pool.join()
    }
}
