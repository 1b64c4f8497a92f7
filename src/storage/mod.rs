//! Storage backends that receive dump streams.
//!
//! The core only ever needs to open a write stream for a key and close it
//! once; everything backend specific stays behind [`Storage`].

pub mod local;
pub mod s3_upload;

use async_trait::async_trait;
use std::io::{self, Write};

use crate::errors::StorageError;

pub use local::FileStorage;
pub use s3_upload::S3Storage;

/// A destination stream for one backup object.
///
/// `close` flushes everything buffered and releases backend resources. It is
/// called exactly once per writer; writes after close fail.
#[async_trait]
pub trait StorageWriter: Write + Send {
    async fn close(&mut self) -> io::Result<()>;

    /// Releases the writer without publishing the object, so a dump that
    /// failed halfway never shows up as a finished backup. Writes after
    /// abort fail.
    async fn abort(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn open_writer(&self, key: &str) -> Result<Box<dyn StorageWriter>, StorageError>;

    /// Cheap reachability check used by the `check` command.
    async fn check(&self) -> Result<(), StorageError>;
}

pub(crate) fn closed_writer_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "writer already closed")
}
