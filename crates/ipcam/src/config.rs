use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use url::Url;

use crate::error::{CaptureError, Result};

pub const DEFAULT_USER_AGENT: &str = concat!("ipcam-stream/", env!("CARGO_PKG_VERSION"));

/// Bytes read from a source while checking that it is healthy.
pub const HEALTH_CHECK_BYTES: usize = 128;

/// Cap on the total backoff time spent acquiring one source.
pub const ACQUIRE_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Shortest segment whose name cannot collide with the next one.
pub const MIN_SEGMENT_LENGTH: Duration = Duration::from_secs(1);

/// Fixed encoder settings handed to the merger with every segment.
pub const VIDEO_BITRATE: &str = "4000k";
pub const VIDEO_CODEC: &str = "libx264";
pub const AUDIO_CODEC: &str = "aac";
pub const PIXEL_FORMAT: &str = "yuv420p";

/// Validated, immutable capture request.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Wall-clock length of one segment
    pub segment_length: Duration,
    pub video_url: Url,
    pub audio_url: Url,
    /// Holds the raw halves of in-flight segments. Emptied at startup.
    pub tmp_dir: PathBuf,
    /// Root of the day buckets.
    pub out_dir: PathBuf,
    /// Output file extension including the leading dot
    pub extension: String,
    /// Frame rate of the video source, passed to the merger verbatim
    pub video_rate: String,
    /// Day buckets older than this many days are removed. Zero disables the sweep.
    pub retention_days: u32,
    /// Whether a source that stays down after backoff stops the recorder.
    pub exit_on_source_failure: bool,
    pub http: HttpConfig,
}

impl CaptureConfig {
    pub fn new(
        segment_length: Duration,
        video_url: &str,
        audio_url: &str,
        tmp_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let config = Self {
            segment_length,
            video_url: parse_source_url(video_url)?,
            audio_url: parse_source_url(audio_url)?,
            tmp_dir: tmp_dir.into(),
            out_dir: out_dir.into(),
            extension: ".mp4".to_string(),
            video_rate: "25".to_string(),
            retention_days: 7,
            exit_on_source_failure: false,
            http: HttpConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_video_rate(mut self, rate: impl Into<String>) -> Self {
        self.video_rate = rate.into();
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_exit_on_source_failure(mut self, exit: bool) -> Self {
        self.exit_on_source_failure = exit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        // Segment names have one-second resolution.
        if self.segment_length < MIN_SEGMENT_LENGTH {
            return Err(CaptureError::configuration(
                "segment length must be at least one second",
            ));
        }
        if self.video_rate.trim().is_empty() {
            return Err(CaptureError::configuration("video rate must not be empty"));
        }
        if !self.extension.starts_with('.') || self.extension.len() < 2 {
            return Err(CaptureError::configuration(format!(
                "extension `{}` must start with a dot",
                self.extension
            )));
        }
        if self.extension.contains(['/', '\\']) {
            return Err(CaptureError::configuration(format!(
                "extension `{}` must not contain path separators",
                self.extension
            )));
        }
        if self.tmp_dir.as_os_str().is_empty() || self.out_dir.as_os_str().is_empty() {
            return Err(CaptureError::configuration(
                "temp and output directories must be set",
            ));
        }
        if self.tmp_dir == self.out_dir {
            return Err(CaptureError::configuration(
                "temp directory must differ from the output directory",
            ));
        }
        Ok(())
    }
}

/// HTTP settings shared by every source connection.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Maximum silence between two body chunks before the read fails.
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl HttpConfig {
    /// Build the client. No overall request timeout is set: source bodies
    /// are endless and segments are bounded by the capture deadline instead.
    pub fn build_client(&self) -> Result<Client> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(CaptureError::from)
    }
}

fn parse_source_url(input: &str) -> Result<Url> {
    let url = Url::parse(input).map_err(|e| CaptureError::invalid_url(input, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(CaptureError::invalid_url(
            input,
            format!("unsupported scheme `{other}`"),
        )),
    }
}
