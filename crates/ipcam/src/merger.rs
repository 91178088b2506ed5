//! Muxing the audio and video halves of a segment into one file.
//!
//! The engine only depends on the [`Merger`] trait. [`FfmpegMerger`] is the
//! production implementation and shells out to an ffmpeg binary.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{AUDIO_CODEC, PIXEL_FORMAT, VIDEO_BITRATE, VIDEO_CODEC};
use crate::error::{CaptureError, Result};

/// Lines of encoder stderr kept in a [`CaptureError::MergeFailed`].
const STDERR_TAIL_LINES: usize = 8;

/// Encoder parameters for one merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeParams {
    /// Input frame rate of the video half, passed through verbatim.
    pub frame_rate: String,
    pub video_bitrate: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub pixel_format: String,
}

impl EncodeParams {
    /// The fixed H.264/AAC profile with the given input frame rate.
    pub fn with_frame_rate(frame_rate: impl Into<String>) -> Self {
        Self {
            frame_rate: frame_rate.into(),
            video_bitrate: VIDEO_BITRATE.to_string(),
            video_codec: VIDEO_CODEC.to_string(),
            audio_codec: AUDIO_CODEC.to_string(),
            pixel_format: PIXEL_FORMAT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeJob {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
    pub params: EncodeParams,
}

#[async_trait]
pub trait Merger: Send + Sync {
    /// Produce `job.output` from the two inputs. The inputs are left in place.
    async fn merge(&self, job: &MergeJob) -> Result<()>;
}

/// Merger backed by an ffmpeg executable.
#[derive(Debug, Clone)]
pub struct FfmpegMerger {
    binary: String,
}

impl Default for FfmpegMerger {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegMerger {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Build the ffmpeg command line for a job.
    fn build_args(job: &MergeJob) -> Vec<String> {
        let params = &job.params;
        let mut args: Vec<String> = ["-y", "-hide_banner", "-nostdin", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect();

        // Video input; the raw stream carries no reliable timing.
        args.extend(["-vsync".into(), "1".into()]);
        args.extend(["-r".into(), params.frame_rate.clone()]);
        args.extend(["-i".into(), job.video.to_string_lossy().into_owned()]);

        args.extend(["-i".into(), job.audio.to_string_lossy().into_owned()]);

        args.extend(["-b:v".into(), params.video_bitrate.clone()]);
        args.extend(["-c:v".into(), params.video_codec.clone()]);
        args.extend(["-c:a".into(), params.audio_codec.clone()]);
        args.extend(["-pix_fmt".into(), params.pixel_format.clone()]);

        args.push(job.output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Merger for FfmpegMerger {
    async fn merge(&self, job: &MergeJob) -> Result<()> {
        let args = Self::build_args(job);
        debug!(binary = %self.binary, ?args, "starting merger");

        let output = Command::new(&self.binary)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CaptureError::MergerSpawn {
                program: self.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            return Err(CaptureError::MergeFailed {
                output: job.output.clone(),
                status: output.status.to_string(),
                stderr: tail,
            });
        }

        info!(output = %job.output.display(), "segment merged");
        Ok(())
    }
}
