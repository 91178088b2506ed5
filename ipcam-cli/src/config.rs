//! Capture settings from command-line flags or a JSON document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use ipcam_engine::CaptureConfig;
use serde::Deserialize;

use crate::cli::Args;

/// Capture settings as the user wrote them, before validation.
///
/// The JSON form uses the keys `length`, `videoURL`, `audioURL`, `tmpDir`,
/// `outDir`, `extension`, `videoRate`, `rotate` and `log`. Missing keys take
/// the same defaults as the flags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamRequest {
    /// Segment length in minutes.
    pub length: u64,
    #[serde(rename = "videoURL")]
    pub video_url: String,
    #[serde(rename = "audioURL")]
    pub audio_url: String,
    #[serde(rename = "tmpDir")]
    pub tmp_dir: String,
    #[serde(rename = "outDir")]
    pub out_dir: String,
    pub extension: String,
    #[serde(rename = "videoRate")]
    pub video_rate: String,
    pub rotate: u32,
    pub log: Option<PathBuf>,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            length: 60,
            video_url: String::new(),
            audio_url: String::new(),
            tmp_dir: "/tmp/".to_string(),
            out_dir: "~/".to_string(),
            extension: ".mp4".to_string(),
            video_rate: "25".to_string(),
            rotate: 7,
            log: None,
        }
    }
}

impl StreamRequest {
    /// The JSON document named by `--cfg` if present, the flags otherwise.
    /// The two sources are never merged.
    pub fn resolve(args: &Args) -> Result<Self> {
        match &args.config {
            Some(path) => Self::load_json(path),
            None => Ok(Self::from_args(args)),
        }
    }

    pub fn from_args(args: &Args) -> Self {
        Self {
            length: args.length,
            video_url: args.video_url.clone(),
            audio_url: args.audio_url.clone(),
            tmp_dir: args.tmp_dir.clone(),
            out_dir: args.out_dir.clone(),
            extension: args.extension.clone(),
            video_rate: args.video_rate.clone(),
            rotate: args.rotate,
            log: args.log.clone(),
        }
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Validate and convert into the engine's configuration.
    pub fn into_capture_config(self, exit_on_source_failure: bool) -> Result<CaptureConfig> {
        if self.length == 0 {
            bail!("segment length must be at least one minute");
        }
        let secs = self
            .length
            .checked_mul(60)
            .ok_or_else(|| anyhow!("segment length of {} minutes is too large", self.length))?;

        let config = CaptureConfig::new(
            Duration::from_secs(secs),
            &self.video_url,
            &self.audio_url,
            expand_home(&self.tmp_dir)?,
            expand_home(&self.out_dir)?,
        )?
        .with_extension(self.extension)
        .with_video_rate(self.video_rate)
        .with_retention_days(self.rotate)
        .with_exit_on_source_failure(exit_on_source_failure);

        config.validate()?;
        Ok(config)
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return Ok(PathBuf::from(path)),
    };
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot expand `{path}`: no home directory"))?;
    Ok(if rest.is_empty() { home } else { home.join(rest) })
}
