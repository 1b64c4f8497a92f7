pub mod dsn;

use std::path::{Path, PathBuf};
use which::which;

use crate::errors::ConfigError;

/// Resolves a dump binary either as a path on disk or through `PATH`.
pub fn resolve_executable(binary: &str) -> Result<PathBuf, ConfigError> {
    let path = Path::new(binary);
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    which(binary).map_err(|source| ConfigError::BinaryNotFound {
        binary: binary.to_string(),
        source,
    })
}
