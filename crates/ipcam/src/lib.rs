//! Segmented recording of IP camera streams.
//!
//! The engine pulls a video and an audio byte stream over HTTP, writes each
//! to a temp file for a fixed wall-clock window, and merges every pair into
//! one file under a per-day output directory. Old day directories are
//! rotated out after a retention window.
//!
//! [`Capture`] drives the loop. The pieces it is built from are usable on
//! their own:
//!
//! - [`StreamHandle`]: one source with health check and backoff
//! - [`SegmentPair`]: the two halves of one segment and their lifecycle
//! - [`Merger`]: muxes the halves, [`FfmpegMerger`] in production
//! - [`DirListing`]: day buckets, retention and the temp sweep

pub mod backoff;
pub mod cache;
pub mod capture;
pub mod config;
pub mod error;
pub mod merger;
pub mod naming;
pub mod segment;
pub mod stream;
pub mod tasks;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use backoff::ExpBackoff;
pub use cache::{DirListing, SweepReport};
pub use capture::Capture;
pub use config::{CaptureConfig, HttpConfig};
pub use error::{CaptureError, Result};
pub use merger::{EncodeParams, FfmpegMerger, MergeJob, Merger};
pub use naming::{SegmentPaths, SegmentStamp};
pub use segment::{Deadline, SegmentPair, SegmentState};
pub use stream::{CopyReport, StreamHandle};
