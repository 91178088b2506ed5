use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Segment length in minutes
    #[arg(long = "len", default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub length: u64,

    /// Video source URL
    #[arg(long = "vurl", default_value = "")]
    pub video_url: String,

    /// Audio source URL
    #[arg(long = "aurl", default_value = "")]
    pub audio_url: String,

    /// Directory for in-flight segment halves. Emptied at startup.
    #[arg(long = "tmp", default_value = "/tmp/")]
    pub tmp_dir: String,

    /// Root directory of the day buckets
    #[arg(long = "out", default_value = "~/")]
    pub out_dir: String,

    /// Output file extension
    #[arg(long = "ext", default_value = ".mp4")]
    pub extension: String,

    /// Frame rate of the video source
    #[arg(long = "vrate", default_value = "25")]
    pub video_rate: String,

    /// Keep this many days of recordings, 0 keeps everything
    #[arg(long, default_value_t = 7)]
    pub rotate: u32,

    /// Also write JSON logs to this file
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Read the capture settings from a JSON file instead of the flags above
    #[arg(long = "cfg")]
    pub config: Option<PathBuf>,

    /// ffmpeg binary used to merge segments
    #[arg(long, default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Stop recording when a source stays unreachable after retrying
    #[arg(long)]
    pub exit_on_source_failure: bool,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}
