//! pescan-core: structural malware classification for PE executables.
//!
//! Provides entropy and PE feature extraction, the offline training
//! pipeline, the persisted artifact, single-file inference, batch scan
//! orchestration and result reporting used by the CLI.

pub mod artifact;
pub mod dataset;
pub mod entropy;
pub mod error;
pub mod features;
pub mod inference;
pub mod ml;
pub mod pe;
pub mod report;
pub mod scan;
pub mod train;

#[cfg(test)]
mod testutil;

pub use error::{Result, ScanError};
