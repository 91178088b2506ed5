//! Deterministic names for segment outputs and their temp files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};

use crate::cache::DAY_FORMAT;

/// Format of the per-segment timestamp used in file names.
pub const STAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Clock reading a segment is named after.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentStamp {
    day: String,
    full: String,
}

impl SegmentStamp {
    pub fn at<Tz: TimeZone>(now: &DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        Self {
            day: now.format(DAY_FORMAT).to_string(),
            full: now.format(STAMP_FORMAT).to_string(),
        }
    }

    /// Day-bucket directory name, `YYYY-MM-DD`.
    pub fn day(&self) -> &str {
        &self.day
    }

    /// Full timestamp, `YYYY-MM-DD-HH-MM-SS`.
    pub fn full(&self) -> &str {
        &self.full
    }
}

impl std::fmt::Display for SegmentStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

/// Every path a segment touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPaths {
    pub day_dir: PathBuf,
    pub output: PathBuf,
    pub audio_temp: PathBuf,
    pub video_temp: PathBuf,
}

impl SegmentPaths {
    /// `{out}/{day}/{full}{ext}` for the merged file and
    /// `{tmp}/a-{full}_temp{ext}` / `{tmp}/v-{full}_temp{ext}` for the halves.
    pub fn new(stamp: &SegmentStamp, tmp_dir: &Path, out_dir: &Path, extension: &str) -> Self {
        let day_dir = out_dir.join(stamp.day());
        Self {
            output: day_dir.join(format!("{}{extension}", stamp.full())),
            audio_temp: tmp_dir.join(format!("a-{}_temp{extension}", stamp.full())),
            video_temp: tmp_dir.join(format!("v-{}_temp{extension}", stamp.full())),
            day_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, Utc};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2024, 7, 9)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn stamp_is_deterministic() {
        let stamp = SegmentStamp::at(&at(8, 5, 3));
        assert_eq!(stamp.day(), "2024-07-09");
        assert_eq!(stamp.full(), "2024-07-09-08-05-03");
        assert_eq!(stamp, SegmentStamp::at(&at(8, 5, 3)));
    }

    #[test]
    fn paths_follow_layout() {
        let stamp = SegmentStamp::at(&at(23, 59, 59));
        let paths = SegmentPaths::new(&stamp, Path::new("/tmp"), Path::new("/srv/cam"), ".mp4");

        assert_eq!(paths.day_dir, Path::new("/srv/cam/2024-07-09"));
        assert_eq!(
            paths.output,
            Path::new("/srv/cam/2024-07-09/2024-07-09-23-59-59.mp4")
        );
        assert_eq!(
            paths.audio_temp,
            Path::new("/tmp/a-2024-07-09-23-59-59_temp.mp4")
        );
        assert_eq!(
            paths.video_temp,
            Path::new("/tmp/v-2024-07-09-23-59-59_temp.mp4")
        );
        assert_ne!(paths.audio_temp, paths.video_temp);
        assert_eq!(paths.output.parent(), Some(paths.day_dir.as_path()));
    }

    #[test]
    fn consecutive_segments_do_not_collide() {
        let first = at(23, 30, 0);
        let mut seen = std::collections::HashSet::new();
        for n in 0..4 {
            let stamp = SegmentStamp::at(&(first + Duration::minutes(30 * n)));
            let paths = SegmentPaths::new(&stamp, Path::new("/t"), Path::new("/o"), ".mkv");
            assert!(seen.insert(paths.output.clone()));
            assert!(seen.insert(paths.audio_temp));
            assert!(seen.insert(paths.video_temp));
        }
        // 23:30 and 00:00 the next day land in different buckets.
        assert_ne!(
            SegmentStamp::at(&first).day(),
            SegmentStamp::at(&(first + Duration::minutes(30))).day()
        );
    }
}
