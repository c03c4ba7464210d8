mod staging;

pub use staging::{StagingFile, StagingMode, StagingStore, DEFAULT_ORPHAN_AGE};
