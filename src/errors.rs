use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by external collaborators (database enumeration).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid or unusable configuration. Fatal to the process before any cycle runs.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("invalid DSN {dsn:?}: {source}")]
    Dsn {
        dsn: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to find db binary {binary:?}: {source}")]
    BinaryNotFound {
        binary: String,
        #[source]
        source: which::Error,
    },

    #[error("invalid cron schedule {expression:?}: {reason}")]
    Schedule { expression: String, reason: String },
}

/// Failures of a single dump invocation or of the connectivity probe.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("failed to validate db connection: {0}")]
    Connectivity(String),

    #[error("dump of {database} was cancelled")]
    Cancelled { database: String },

    #[error("timed out dumping database: {database} (after {timeout:?})")]
    Timeout { database: String, timeout: Duration },

    #[error("failed to start dumper for {database}: {source}")]
    Spawn {
        database: String,
        #[source]
        source: io::Error,
    },

    #[error("dumper failed for {database} ({status}): {stderr}")]
    Runtime {
        database: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("failed to flush dump output for {database}: {source}")]
    Flush {
        database: String,
        #[source]
        source: io::Error,
    },
}

/// Close failures of the compression/storage pipeline, kept apart so
/// storage problems are distinguishable from compression problems.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to close gzip writer: {0}")]
    Compressor(#[source] io::Error),

    #[error("failed to close main writer: {0}")]
    Destination(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to open writer for {key}: {source}")]
    Open {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A per-database failure, always tagged with the database it belongs to.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("failed to get main writer for {database}: {source}")]
    Open {
        database: String,
        #[source]
        source: StorageError,
    },

    #[error("dumping {database} failed: {source}")]
    Dump {
        database: String,
        #[source]
        source: DumpError,
    },

    #[error("closing output for {database} failed: {source}")]
    Close {
        database: String,
        #[source]
        source: PipelineError,
    },
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("zero items provided")]
    EmptyInput,

    #[error("pool was cancelled")]
    Cancelled,

    #[error("{missing} item(s) were abandoned by a worker")]
    Abandoned { missing: usize },

    #[error(transparent)]
    Job(#[from] JobError),
}

/// Failure of one complete backup pass.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("failed to retrieve databases: {0}")]
    Enumeration(#[source] BoxError),

    #[error("unable to find database: {0}")]
    UnknownDatabase(String),

    #[error("backup cycle cancelled")]
    Cancelled,

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("worker pool failed: {0}")]
    Pool(#[source] PoolError),

    #[error("backup cycle failed: {0}")]
    Job(#[source] JobError),
}

impl CycleError {
    /// Whether the retry loop may attempt the cycle again.
    ///
    /// `UnknownDatabase` stays retryable: the database may appear on the
    /// next attempt, even though in practice it is usually a config mistake.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CycleError::Cancelled | CycleError::Configuration(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            CycleError::Cancelled
                | CycleError::Job(JobError::Dump {
                    source: DumpError::Cancelled { .. },
                    ..
                })
        )
    }
}

impl From<PoolError> for CycleError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::EmptyInput => {
                CycleError::Configuration(ConfigError::Invalid("empty job list".to_string()))
            }
            PoolError::Cancelled => CycleError::Cancelled,
            PoolError::Job(job) => CycleError::Job(job),
            other => CycleError::Pool(other),
        }
    }
}

/// Final failure of a cycle after the retry policy gave up.
#[derive(Error, Debug)]
#[error("backup failed after {attempts} attempt(s): {source}")]
pub struct BackupFailed {
    pub attempts: u32,
    #[source]
    pub source: CycleError,
}

impl BackupFailed {
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}
