pub mod archive;
pub mod databases;
pub mod db_dump;
pub mod logic;
pub mod naming;
pub mod pool;

pub use databases::{DatabaseFilter, Retriever, SystemRetriever};
pub use db_dump::{CliDumper, DumpSpec, Dumper};
pub use logic::{BackupCycle, CycleOutcome, CycleSettings};
pub use naming::FilenameTemplate;
