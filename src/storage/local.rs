use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Storage, StorageWriter, closed_writer_error};
use crate::errors::StorageError;

/// Writes backups as plain files below a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from("./")
        } else {
            dir
        };
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn open_writer(&self, key: &str) -> Result<Box<dyn StorageWriter>, StorageError> {
        let path = self.dir.join(key);
        let open = || -> io::Result<File> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            File::create(&path)
        };
        let file = open().map_err(|source| StorageError::Open {
            key: key.to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Opened backup file");

        Ok(Box::new(FileWriter {
            path,
            file: Some(BufWriter::new(file)),
        }))
    }

    async fn check(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            StorageError::Unavailable(format!(
                "cannot create backup directory {}: {e}",
                self.dir.display()
            ))
        })?;
        let metadata = fs::metadata(&self.dir).map_err(|e| {
            StorageError::Unavailable(format!("{}: {e}", self.dir.display()))
        })?;
        if metadata.permissions().readonly() {
            return Err(StorageError::Unavailable(format!(
                "backup directory {} is read-only",
                self.dir.display()
            )));
        }
        Ok(())
    }
}

struct FileWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(closed_writer_error()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageWriter for FileWriter {
    async fn close(&mut self) -> io::Result<()> {
        let Some(writer) = self.file.take() else {
            return Ok(());
        };
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        debug!(path = %self.path.display(), "Closed backup file");
        Ok(())
    }

    async fn abort(&mut self) -> io::Result<()> {
        let Some(writer) = self.file.take() else {
            return Ok(());
        };
        // Buffered bytes are thrown away rather than flushed.
        let (file, _) = writer.into_parts();
        drop(file);
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        debug!(path = %self.path.display(), "Removed partial backup file");
        Ok(())
    }
}
