//! Transfer accounting.

pub mod progress;

pub use progress::{UploadStats, UploadSummary};
