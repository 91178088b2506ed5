//! A segment: the audio and video halves recorded side by side for one
//! wall-clock window, then merged into a single file.
//!
//! Lifecycle: `Created → Copying → TimedOut → Merging → CleanedUp`.
//!
//! The deadline is wall-clock based. When it fires both copies are told to
//! stop at their next read, the temp files are flushed and closed, and only
//! then is the pair handed to the merger. Bytes the sources deliver after
//! the deadline belong to no segment.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::merger::{EncodeParams, MergeJob, Merger};
use crate::naming::{SegmentPaths, SegmentStamp};
use crate::stream::{CopyReport, StreamHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentState {
    Created,
    Copying,
    TimedOut,
    Merging,
    CleanedUp,
}

impl SegmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Copying => "copying",
            Self::TimedOut => "timed-out",
            Self::Merging => "merging",
            Self::CleanedUp => "cleaned-up",
        }
    }
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the deadline wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Reached,
    Interrupted,
}

/// Result of merging a pair and removing its temp files.
#[derive(Debug)]
pub struct SegmentReport {
    pub audio: Option<CopyReport>,
    pub video: Option<CopyReport>,
    pub merge: Result<()>,
    pub cleanup_errors: Vec<CaptureError>,
}

type CopyTask = JoinHandle<Result<CopyReport>>;

enum Halves {
    Idle(StreamHandle, StreamHandle),
    Running(CopyTask, CopyTask),
    Done,
}

pub struct SegmentPair {
    stamp: SegmentStamp,
    paths: SegmentPaths,
    state: Mutex<SegmentState>,
    halves: Mutex<Halves>,
    stop: CancellationToken,
}

impl std::fmt::Debug for SegmentPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPair")
            .field("stamp", &self.stamp)
            .field("state", &*self.state.lock())
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl SegmentPair {
    /// Acquire both sources and open both temp outputs.
    pub async fn open(client: &Client, config: &CaptureConfig, stamp: SegmentStamp) -> Result<Self> {
        let paths = SegmentPaths::new(&stamp, &config.tmp_dir, &config.out_dir, &config.extension);

        let (mut audio, mut video) = tokio::try_join!(
            StreamHandle::acquire(client, &config.audio_url),
            StreamHandle::acquire(client, &config.video_url),
        )?;

        audio.set_output(&paths.audio_temp).await?;
        if let Err(e) = video.set_output(&paths.video_temp).await {
            remove_temp(&paths.audio_temp).await.ok();
            return Err(e);
        }

        Ok(Self::from_handles(stamp, paths, audio, video))
    }

    /// Assemble a pair from handles whose outputs are already set.
    pub fn from_handles(
        stamp: SegmentStamp,
        paths: SegmentPaths,
        audio: StreamHandle,
        video: StreamHandle,
    ) -> Self {
        Self {
            stamp,
            paths,
            state: Mutex::new(SegmentState::Created),
            halves: Mutex::new(Halves::Idle(audio, video)),
            stop: CancellationToken::new(),
        }
    }

    pub fn stamp(&self) -> &SegmentStamp {
        &self.stamp
    }

    pub fn paths(&self) -> &SegmentPaths {
        &self.paths
    }

    pub fn state(&self) -> SegmentState {
        *self.state.lock()
    }

    fn advance(&self, from: &[SegmentState], to: SegmentState) -> Result<()> {
        let mut state = self.state.lock();
        if !from.contains(&state) {
            return Err(CaptureError::InvalidTransition {
                segment: self.stamp.to_string(),
                from: state.as_str(),
                to: to.as_str(),
            });
        }
        debug!(segment = %self.stamp, from = %*state, to = %to, "segment state");
        *state = to;
        Ok(())
    }

    /// Start both copies on their own tasks.
    pub fn start(&self) -> Result<()> {
        self.advance(&[SegmentState::Created], SegmentState::Copying)?;

        let mut halves = self.halves.lock();
        *halves = match std::mem::replace(&mut *halves, Halves::Done) {
            Halves::Idle(audio, video) => Halves::Running(
                tokio::spawn(run_copy(audio, self.stop.clone())),
                tokio::spawn(run_copy(video, self.stop.clone())),
            ),
            other => other,
        };
        Ok(())
    }

    /// Copy both halves until `length` elapsed or `interrupt` fires.
    ///
    /// Both copies are started before the deadline clock starts. The pair is
    /// left in `Copying` state; [`SegmentPair::stop`] ends the copies.
    pub async fn sync_timeout(&self, length: Duration, interrupt: &CancellationToken) -> Result<Deadline> {
        self.start()?;
        info!(segment = %self.stamp, seconds = length.as_secs(), "recording segment");

        tokio::select! {
            _ = interrupt.cancelled() => Ok(Deadline::Interrupted),
            _ = tokio::time::sleep(length) => {
                debug!(segment = %self.stamp, "segment deadline reached");
                Ok(Deadline::Reached)
            }
        }
    }

    /// Stop both copies and wait until their temp files are closed.
    ///
    /// Returns the copy reports of the halves that ran.
    pub async fn stop(&self) -> Result<(Option<CopyReport>, Option<CopyReport>)> {
        self.advance(
            &[SegmentState::Created, SegmentState::Copying],
            SegmentState::TimedOut,
        )?;
        self.stop.cancel();

        let halves = std::mem::replace(&mut *self.halves.lock(), Halves::Done);
        match halves {
            Halves::Running(audio, video) => {
                let (audio, video) = tokio::join!(audio, video);
                Ok((
                    joined(&self.stamp, "audio", audio),
                    joined(&self.stamp, "video", video),
                ))
            }
            Halves::Idle(audio, video) => {
                for handle in [audio, video] {
                    if let Err(e) = handle.close().await {
                        warn!(segment = %self.stamp, error = %e, "failed to close unused handle");
                    }
                }
                Ok((None, None))
            }
            Halves::Done => Ok((None, None)),
        }
    }

    /// Stop the copies, merge the halves and remove the temp files.
    ///
    /// A merge failure is terminal for this segment only; the temp files are
    /// removed either way.
    pub async fn finalize(&self, merger: &dyn Merger, frame_rate: &str) -> Result<SegmentReport> {
        let (audio, video) = self.stop().await?;
        self.advance(&[SegmentState::TimedOut], SegmentState::Merging)?;

        let job = MergeJob {
            video: self.paths.video_temp.clone(),
            audio: self.paths.audio_temp.clone(),
            output: self.paths.output.clone(),
            params: EncodeParams::with_frame_rate(frame_rate),
        };

        debug!(segment = %self.stamp, rate = frame_rate, "merging segment");
        let merge = merger.merge(&job).await;
        if let Err(e) = &merge {
            warn!(
                segment = %self.stamp,
                video = %job.video.display(),
                audio = %job.audio.display(),
                error = %e,
                "unable to merge the cached A/V files"
            );
        }

        let cleanup_errors = self.cleanup().await;
        self.advance(&[SegmentState::Merging], SegmentState::CleanedUp)?;

        Ok(SegmentReport {
            audio,
            video,
            merge,
            cleanup_errors,
        })
    }

    /// Abandon the pair without merging: stop the copies, drop the temp files.
    pub async fn discard(&self) -> Vec<CaptureError> {
        if let Err(e) = self.stop().await {
            debug!(segment = %self.stamp, error = %e, "discarding pair that was already stopped");
        }
        self.cleanup().await
    }

    async fn cleanup(&self) -> Vec<CaptureError> {
        let mut errors = Vec::new();
        for path in [&self.paths.video_temp, &self.paths.audio_temp] {
            debug!(path = %path.display(), "removing temp file");
            if let Err(e) = remove_temp(path).await {
                warn!(path = %path.display(), error = %e, "failed to remove temp file");
                errors.push(e);
            }
        }
        errors
    }
}

async fn run_copy(mut handle: StreamHandle, stop: CancellationToken) -> Result<CopyReport> {
    let report = handle.copy(&stop).await;
    let closed = handle.close().await;
    let report = report?;
    closed?;
    Ok(report)
}

fn joined(
    stamp: &SegmentStamp,
    kind: &'static str,
    result: std::result::Result<Result<CopyReport>, tokio::task::JoinError>,
) -> Option<CopyReport> {
    match result {
        Ok(Ok(report)) => Some(report),
        Ok(Err(e)) => {
            warn!(segment = %stamp, kind, error = %e, "copy failed");
            None
        }
        Err(e) => {
            warn!(segment = %stamp, kind, error = %e, "copy task did not complete");
            None
        }
    }
}

async fn remove_temp(path: &std::path::Path) -> Result<()> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| CaptureError::io("removing temp file", path, e))
}

/// Shared handle to a pair, as stored in the orchestrator's current slot.
pub type SharedPair = Arc<SegmentPair>;
