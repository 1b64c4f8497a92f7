// dbbackup/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use tracing::warn;

use crate::errors::PipelineError;
use crate::storage::StorageWriter;

/// The effective writer handed to the dump supervisor: either the storage
/// writer itself or a gzip stream on top of it.
pub enum OutputPipeline {
    Plain(Box<dyn StorageWriter>),
    Gzip(GzEncoder<Box<dyn StorageWriter>>),
}

impl OutputPipeline {
    pub fn new(destination: Box<dyn StorageWriter>, compress: bool) -> Self {
        if compress {
            OutputPipeline::Gzip(GzEncoder::new(destination, Compression::default()))
        } else {
            OutputPipeline::Plain(destination)
        }
    }

    pub fn writer(&mut self) -> &mut (dyn Write + Send) {
        match self {
            OutputPipeline::Plain(destination) => destination,
            OutputPipeline::Gzip(encoder) => encoder,
        }
    }

    /// Finishes the gzip stream, then closes the destination.
    ///
    /// The destination is closed even when finishing the compressor failed;
    /// a compressor failure takes precedence since the object is truncated.
    pub async fn close(self) -> Result<(), PipelineError> {
        match self {
            OutputPipeline::Plain(mut destination) => destination
                .close()
                .await
                .map_err(PipelineError::Destination),
            OutputPipeline::Gzip(mut encoder) => {
                let finished = encoder.try_finish();
                let closed = encoder.get_mut().close().await;
                if let Err(source) = finished {
                    if let Err(e) = closed {
                        warn!(error = %e, "Failed to close main writer after gzip failure");
                    }
                    return Err(PipelineError::Compressor(source));
                }
                closed.map_err(PipelineError::Destination)
            }
        }
    }

    /// Discards the output of a failed dump. No gzip trailer is written and
    /// the destination is aborted instead of closed.
    pub async fn abort(self) -> Result<(), PipelineError> {
        match self {
            OutputPipeline::Plain(mut destination) => destination
                .abort()
                .await
                .map_err(PipelineError::Destination),
            OutputPipeline::Gzip(mut encoder) => {
                let aborted = encoder.get_mut().abort().await;
                // Dropping the encoder tries to write its trailer; the aborted
                // writer refuses it.
                drop(encoder);
                aborted.map_err(PipelineError::Destination)
            }
        }
    }
}
