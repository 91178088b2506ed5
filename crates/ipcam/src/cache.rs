//! Directory snapshots used for day-bucket management, retention and the
//! startup sweep of the temp directory.
//!
//! A [`DirListing`] records the immediate children of a directory at load
//! time. It is never refreshed implicitly: filesystem changes made after
//! [`DirListing::load`] are only visible after loading again.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone};
use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};

/// Name that the retention sweep never considers, whatever its age.
pub const CACHE_DIR_NAME: &str = "cache";

/// Format of day-bucket directory names.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct DirListing {
    root: PathBuf,
    entries: BTreeSet<String>,
}

/// Outcome of a removal pass. Failures are collected rather than raised.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub errors: Vec<CaptureError>,
}

impl DirListing {
    /// Snapshot the immediate children of `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let mut dir = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| CaptureError::io("reading directory", &root, e))?;

        let mut entries = BTreeSet::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| CaptureError::io("reading directory", &root, e))?
        {
            // Non UTF-8 names can neither be day buckets nor segment files.
            match entry.file_name().into_string() {
                Ok(name) => {
                    entries.insert(name);
                }
                Err(name) => debug!(root = %root.display(), ?name, "skipping non UTF-8 entry"),
            }
        }

        Ok(Self { root, entries })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Membership against the snapshot.
    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains(name)
    }

    /// Create one child directory. An already existing directory is an error,
    /// so callers check [`DirListing::exists`] first.
    pub async fn mkdir(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| CaptureError::io("creating directory", &path, e))?;
        Ok(path)
    }

    /// Day buckets dated strictly before `reference - days`.
    ///
    /// The [`CACHE_DIR_NAME`] entry is skipped. Names that are not dates are
    /// returned as individual errors and do not stop the scan.
    pub fn list_older<Tz: TimeZone>(
        &self,
        reference: &DateTime<Tz>,
        days: u32,
    ) -> (Vec<String>, Vec<CaptureError>) {
        let threshold = reference
            .naive_local()
            .checked_sub_signed(Duration::days(i64::from(days)));
        let mut older = Vec::new();
        let mut errors = Vec::new();

        for name in &self.entries {
            if name == CACHE_DIR_NAME {
                continue;
            }

            match NaiveDate::parse_from_str(name, DAY_FORMAT) {
                Ok(date) if threshold.is_some_and(|t| date.and_time(NaiveTime::MIN) < t) => {
                    older.push(name.clone())
                }
                Ok(_) => {}
                Err(source) => errors.push(CaptureError::InvalidBucket {
                    name: name.clone(),
                    source,
                }),
            }
        }

        (older, errors)
    }

    /// Remove every day bucket older than the retention window.
    ///
    /// Removal failures are logged and collected, never retried.
    pub async fn rotate<Tz: TimeZone>(&self, reference: &DateTime<Tz>, days: u32) -> SweepReport {
        let (targets, errors) = self.list_older(reference, days);
        let mut report = SweepReport {
            removed: Vec::with_capacity(targets.len()),
            errors,
        };

        for target in targets {
            let path = self.root.join(&target);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "removed expired day bucket");
                    report.removed.push(path);
                }
                Err(e) => report
                    .errors
                    .push(CaptureError::io("removing day bucket", &path, e)),
            }
        }

        for error in &report.errors {
            warn!(root = %self.root.display(), error = %error, "retention sweep");
        }

        report
    }

    /// Remove every entry of the snapshot, files and directories alike.
    pub async fn clear(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for name in &self.entries {
            let path = self.root.join(name);
            let removed = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(e) => Err(e),
            };

            match removed {
                Ok(()) => {
                    debug!(path = %path.display(), "removed stale cache entry");
                    report.removed.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove stale cache entry");
                    report
                        .errors
                        .push(CaptureError::io("removing cache entry", &path, e));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, NaiveDateTime, Utc};
    use tempfile::TempDir;

    fn noon(date: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(&format!("{date} 12:00:00"), "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    async fn seeded(names: &[&str]) -> (TempDir, DirListing) {
        let temp = TempDir::new().unwrap();
        for name in names {
            std::fs::create_dir(temp.path().join(name)).unwrap();
        }
        let listing = DirListing::load(temp.path()).await.unwrap();
        (temp, listing)
    }

    #[tokio::test]
    async fn load_fails_for_missing_directory() {
        let temp = TempDir::new().unwrap();
        let err = DirListing::load(temp.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, CaptureError::Io { .. }));
    }

    #[tokio::test]
    async fn snapshot_is_not_live() {
        let (temp, listing) = seeded(&["2024-01-01"]).await;
        std::fs::create_dir(temp.path().join("2024-01-02")).unwrap();

        assert!(listing.exists("2024-01-01"));
        assert!(!listing.exists("2024-01-02"));

        let reloaded = DirListing::load(temp.path()).await.unwrap();
        assert!(reloaded.exists("2024-01-02"));
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test]
    async fn mkdir_rejects_existing_directory() {
        let (temp, listing) = seeded(&["2024-01-01"]).await;

        let created = listing.mkdir("2024-01-02").await.unwrap();
        assert_eq!(created, temp.path().join("2024-01-02"));
        assert!(created.is_dir());

        let err = listing.mkdir("2024-01-01").await.unwrap_err();
        match err {
            CaptureError::Io { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn list_older_uses_strict_threshold() {
        let (_temp, listing) =
            seeded(&["2024-03-01", "2024-03-02", "2024-03-03", "2024-03-09"]).await;

        // threshold: 2024-03-02 12:00
        let (older, errors) = listing.list_older(&noon("2024-03-09"), 7);
        assert!(errors.is_empty());
        assert_eq!(older, vec!["2024-03-01", "2024-03-02"]);
    }

    #[tokio::test]
    async fn rotate_spares_cache_and_reports_bad_names() {
        let (temp, listing) = seeded(&[
            "cache",
            "2024-02-01",
            "2024-02-20",
            "2024-02-28",
            "2024-02-29",
            "holiday-clips",
            "2024-13-01",
        ])
        .await;

        let report = listing.rotate(&noon("2024-02-29"), 3).await;

        let mut removed: Vec<_> = report
            .removed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        removed.sort();
        assert_eq!(removed, vec!["2024-02-01", "2024-02-20"]);
        assert_eq!(report.errors.len(), 2);
        assert!(
            report
                .errors
                .iter()
                .all(|e| matches!(e, CaptureError::InvalidBucket { .. }))
        );

        assert!(temp.path().join("cache").is_dir());
        assert!(temp.path().join("2024-02-28").is_dir());
        assert!(temp.path().join("2024-02-29").is_dir());
        assert!(temp.path().join("holiday-clips").is_dir());
        assert!(!temp.path().join("2024-02-01").exists());
    }

    #[tokio::test]
    async fn rotate_with_many_windows_never_touches_cache() {
        for days in [1u32, 2, 5, 30] {
            let (temp, listing) =
                seeded(&["cache", "2020-01-01", "2020-01-05", "2020-01-10"]).await;
            let reference = noon("2020-01-11");
            let threshold = reference.naive_utc() - Duration::days(i64::from(days));

            let report = listing.rotate(&reference, days).await;
            assert!(report.errors.is_empty());
            assert!(temp.path().join("cache").exists());

            for name in ["2020-01-01", "2020-01-05", "2020-01-10"] {
                let day = NaiveDate::parse_from_str(name, DAY_FORMAT)
                    .unwrap()
                    .and_time(NaiveTime::MIN);
                assert_eq!(
                    temp.path().join(name).exists(),
                    day >= threshold,
                    "window {days} days, bucket {name}"
                );
            }
        }
    }

    #[tokio::test]
    async fn clear_removes_files_and_directories() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a-2024-01-01-00-00-00_temp.mp4"), b"x").unwrap();
        std::fs::create_dir_all(temp.path().join("nested/deeper")).unwrap();
        std::fs::write(temp.path().join("nested/deeper/file"), b"y").unwrap();

        let listing = DirListing::load(temp.path()).await.unwrap();
        let report = listing.clear().await;

        assert_eq!(report.removed.len(), 2);
        assert!(report.errors.is_empty());
        assert!(DirListing::load(temp.path()).await.unwrap().is_empty());
        assert!(temp.path().is_dir());
    }

    #[tokio::test]
    async fn today_bucket_survives_a_one_day_window() {
        let today = Local::now().format(DAY_FORMAT).to_string();
        let (temp, listing) = seeded(&[today.as_str()]).await;
        let report = listing.rotate(&Local::now(), 1).await;
        assert!(report.removed.is_empty());
        assert!(temp.path().join(&today).is_dir());
    }
}
