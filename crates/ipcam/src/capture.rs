//! The capture loop.
//!
//! Each cycle names a segment after the current time, makes sure its day
//! bucket exists, kicks off the retention sweep, records both sources for
//! one segment length and hands the finished pair to a background merge.
//! The next segment starts recording while the previous one is merged.
//!
//! The pair being recorded sits in the `current` slot. The loop publishes a
//! pair there only once it is fully built, and both the loop and
//! [`Capture::shutdown`] take it out under the same lock, so each pair is
//! merged exactly once.

use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ExpBackoff;
use crate::cache::DirListing;
use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::merger::Merger;
use crate::naming::SegmentStamp;
use crate::segment::{Deadline, SegmentPair, SharedPair};
use crate::tasks::TaskGroup;

pub struct Capture {
    config: CaptureConfig,
    client: Client,
    merger: Arc<dyn Merger>,
    current: Mutex<Option<SharedPair>>,
    tasks: TaskGroup,
    shutdown: CancellationToken,
}

impl Capture {
    pub fn new(config: CaptureConfig, merger: Arc<dyn Merger>) -> Result<Self> {
        config.validate()?;
        let client = config.http.build_client()?;
        Ok(Self {
            config,
            client,
            merger,
            current: Mutex::new(None),
            tasks: TaskGroup::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Whether a segment is currently being recorded.
    pub fn is_recording(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Clear the temp directory, then record segments until shutdown.
    ///
    /// Returns `Ok(())` once [`Capture::shutdown`] has been requested, or
    /// the first unrecoverable error.
    pub async fn run(&self) -> Result<()> {
        info!(
            segment_secs = self.config.segment_length.as_secs(),
            video = %self.config.video_url,
            audio = %self.config.audio_url,
            tmp = %self.config.tmp_dir.display(),
            out = %self.config.out_dir.display(),
            retention_days = self.config.retention_days,
            "starting capture"
        );

        self.sweep_cache().await?;
        debug!("cache is ready; starting capture");

        let mut skipped: u32 = 0;
        while !self.shutdown.is_cancelled() {
            for failure in self.tasks.reap() {
                debug!(error = %failure, "reaped failed background task");
            }

            let now = Local::now();
            let stamp = SegmentStamp::at(&now);
            debug!(segment = %stamp, "setting stream timestamp");

            let listing = self.prepare_day_bucket(&stamp).await?;
            self.spawn_rotation(listing, now);

            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                opened = SegmentPair::open(&self.client, &self.config, stamp.clone()) => opened,
            };
            let pair = match opened {
                Ok(pair) => {
                    skipped = 0;
                    Arc::new(pair)
                }
                Err(e) if self.config.exit_on_source_failure => {
                    error!(segment = %stamp, error = %e, "failed to initialize A/V sources");
                    return Err(e);
                }
                Err(e) => {
                    error!(segment = %stamp, error = %e, "failed to initialize A/V sources, skipping segment");
                    skipped = skipped.saturating_add(1);
                    // Never wait longer than the window that was skipped.
                    let pause = ExpBackoff::delay(skipped).min(self.config.segment_length);
                    debug!(skipped, pause_ms = pause.as_millis() as u64, "pausing before next segment");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                    continue;
                }
            };

            if !self.install(&pair) {
                pair.discard().await;
                break;
            }

            match pair
                .sync_timeout(self.config.segment_length, &self.shutdown)
                .await
            {
                Ok(Deadline::Reached) => self.hand_off(&pair),
                // The shutdown path owns the installed pair from here on.
                Ok(Deadline::Interrupted) => break,
                // Shutdown took the pair before its copies started.
                Err(_) if self.shutdown.is_cancelled() => break,
                Err(e) => return Err(e),
            }
        }

        debug!("capture loop stopped");
        Ok(())
    }

    /// Stop the loop, flush the segment being recorded and wait for every
    /// outstanding merge and sweep.
    ///
    /// Safe to call from another task while [`Capture::run`] is active.
    pub async fn shutdown(&self) {
        info!("shutting down, merging cached files");
        self.shutdown.cancel();

        let pair = self.current.lock().take();
        if let Some(pair) = pair {
            if let Err(e) = finalize(self.merger.as_ref(), &pair, &self.config.video_rate).await {
                warn!(segment = %pair.stamp(), error = %e, "final segment was not merged");
            }
        }

        let failures = self.tasks.drain().await;
        if failures.is_empty() {
            info!("merge completed, exiting");
        } else {
            warn!(failures = failures.len(), "background work failed during shutdown");
        }
    }

    /// Remove everything a previous run left in the temp directory.
    async fn sweep_cache(&self) -> Result<()> {
        let tmp = &self.config.tmp_dir;
        tokio::fs::create_dir_all(tmp)
            .await
            .map_err(|e| CaptureError::io("creating temp directory", tmp, e))?;

        let cache = DirListing::load(tmp).await?;
        if cache.is_empty() {
            return Ok(());
        }

        debug!(entries = cache.len(), "clearing existing cache");
        let report = cache.clear().await;
        for error in &report.errors {
            error!(error = %error, "failed to clear cache");
        }
        Ok(())
    }

    /// Load the output root and create today's bucket if needed.
    async fn prepare_day_bucket(&self, stamp: &SegmentStamp) -> Result<DirListing> {
        debug!(out = %self.config.out_dir.display(), "loading output directory");
        let listing = DirListing::load(&self.config.out_dir).await?;

        if !listing.exists(stamp.day()) {
            debug!(bucket = stamp.day(), "creating new output folder");
            match listing.mkdir(stamp.day()).await {
                Ok(_) => {}
                // Someone else created it since the snapshot was taken.
                Err(CaptureError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
        Ok(listing)
    }

    fn spawn_rotation(&self, listing: DirListing, now: DateTime<Local>) {
        let days = self.config.retention_days;
        if days == 0 {
            return;
        }
        debug!(days, "started rotate routine");
        self.tasks.spawn("rotate", async move {
            listing.rotate(&now, days).await;
            Ok(())
        });
    }

    /// Publish a fully built pair as the current one, unless shutdown began.
    fn install(&self, pair: &SharedPair) -> bool {
        let mut current = self.current.lock();
        if self.shutdown.is_cancelled() {
            return false;
        }
        if let Some(previous) = current.replace(pair.clone()) {
            warn!(segment = %previous.stamp(), "replaced a segment that was never handed off");
        }
        true
    }

    /// Take the pair out of the slot and merge it in the background.
    ///
    /// The spawn happens under the slot lock: either shutdown already took
    /// the pair, or the merge is in the task group before shutdown drains it.
    fn hand_off(&self, pair: &SharedPair) {
        let mut current = self.current.lock();
        let Some(taken) = current.take_if(|p| Arc::ptr_eq(p, pair)) else {
            return;
        };

        let merger = self.merger.clone();
        let rate = self.config.video_rate.clone();
        debug!(segment = %taken.stamp(), rate = %rate, "merging stream");
        let spawned = self.tasks.spawn("merge", async move {
            finalize(merger.as_ref(), &taken, &rate).await
        });
        if !spawned {
            warn!(segment = %pair.stamp(), "segment dropped, task group already closed");
        }
    }
}

async fn finalize(merger: &dyn Merger, pair: &SegmentPair, rate: &str) -> Result<()> {
    let report = pair.finalize(merger, rate).await?;
    for error in &report.cleanup_errors {
        debug!(segment = %pair.stamp(), error = %error, "cleanup error");
    }
    report.merge
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ConcatMerger, SourceServer, wait_for};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    struct Harness {
        server: SourceServer,
        tmp: TempDir,
        out: TempDir,
        merger: Arc<ConcatMerger>,
        capture: Arc<Capture>,
    }

    async fn harness(length: Duration, configure: impl FnOnce(CaptureConfig) -> CaptureConfig) -> Harness {
        let server = SourceServer::start().await;
        let tmp = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let config = CaptureConfig::new(
            length,
            server.url("/live").as_str(),
            server.url("/live").as_str(),
            tmp.path(),
            out.path(),
        )
        .unwrap();
        let merger = Arc::new(ConcatMerger::default());
        let capture = Arc::new(Capture::new(configure(config), merger.clone()).unwrap());
        Harness {
            server,
            tmp,
            out,
            merger,
            capture,
        }
    }

    fn spawn_run(capture: &Arc<Capture>) -> JoinHandle<Result<()>> {
        let capture = capture.clone();
        tokio::spawn(async move { capture.run().await })
    }

    async fn wait_until_recording(capture: &Capture) {
        wait_for(|| capture.is_recording()).await;
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn records_consecutive_segments_until_shutdown() {
        let h = harness(Duration::from_secs(1), |c| c.with_retention_days(0)).await;
        let runner = spawn_run(&h.capture);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        h.capture.shutdown().await;
        runner.await.unwrap().unwrap();

        let outputs = h.merger.outputs();
        assert!(outputs.len() >= 2, "expected two segments, got {outputs:?}");
        for output in &outputs {
            assert!(output.exists(), "{} was not written", output.display());
            assert_eq!(output.parent().unwrap().parent().unwrap(), h.out.path());
            assert!(std::fs::metadata(output).unwrap().len() > 0);
        }
        assert!(names(h.tmp.path()).is_empty());
        assert!(!h.capture.is_recording());
    }

    #[tokio::test]
    async fn shutdown_merges_the_segment_in_progress() {
        let h = harness(Duration::from_secs(30), |c| c).await;
        let runner = spawn_run(&h.capture);
        wait_until_recording(&h.capture).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        h.capture.shutdown().await;
        assert!(h.capture.is_shutting_down());

        // The merged file is in place by the time shutdown returns.
        let outputs = h.merger.outputs();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].exists());
        assert!(names(h.tmp.path()).is_empty());

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn startup_sweep_empties_the_temp_directory() {
        let h = harness(Duration::from_secs(30), |c| c).await;
        std::fs::write(h.tmp.path().join("a-stale_temp.mp4"), b"old").unwrap();
        std::fs::create_dir_all(h.tmp.path().join("leftover/nested")).unwrap();

        let runner = spawn_run(&h.capture);
        wait_until_recording(&h.capture).await;

        let remaining = names(h.tmp.path());
        assert_eq!(remaining.len(), 2, "unexpected temp contents: {remaining:?}");
        assert!(remaining.iter().all(|n| n.ends_with("_temp.mp4") && !n.contains("stale")));

        h.capture.shutdown().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rotation_removes_expired_buckets() {
        let h = harness(Duration::from_secs(30), |c| c.with_retention_days(7)).await;
        std::fs::create_dir(h.out.path().join("2000-01-01")).unwrap();
        std::fs::create_dir(h.out.path().join("cache")).unwrap();

        let runner = spawn_run(&h.capture);
        wait_until_recording(&h.capture).await;
        h.capture.shutdown().await;
        runner.await.unwrap().unwrap();

        let buckets = names(h.out.path());
        assert!(!buckets.contains(&"2000-01-01".to_string()));
        assert!(buckets.contains(&"cache".to_string()));
        // `cache` plus the bucket of the segment that was recorded.
        assert_eq!(buckets.len(), 2, "unexpected buckets: {buckets:?}");
        let today = h.merger.outputs()[0].parent().unwrap().to_path_buf();
        assert!(today.is_dir());
    }

    #[tokio::test]
    async fn skipped_segments_are_paced() {
        let h = harness(Duration::from_secs(1), |c| c.with_retention_days(0)).await;
        let runner = spawn_run(&h.capture);
        wait_until_recording(&h.capture).await;

        // Every later segment fails to create its temp files.
        std::fs::remove_dir_all(h.tmp.path()).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        h.capture.shutdown().await;

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        // Two requests per attempt; an unpaced loop makes thousands.
        let hits = h.server.hits();
        assert!(hits < 30, "sources were requested {hits} times");
    }

    #[tokio::test]
    async fn unreadable_output_root_is_fatal() {
        let h = harness(Duration::from_secs(1), |c| c).await;
        let file = h.out.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();

        let mut config = h.capture.config().clone();
        config.out_dir = file;
        let capture = Capture::new(config, h.merger.clone()).unwrap();

        let err = capture.run().await.unwrap_err();
        assert!(matches!(err, CaptureError::Io { .. }), "unexpected error: {err}");
        assert!(h.merger.outputs().is_empty());
    }

    #[tokio::test]
    async fn shutdown_interrupts_source_acquisition() {
        let tmp = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let config = CaptureConfig::new(
            Duration::from_secs(1),
            "http://127.0.0.1:9/video",
            "http://127.0.0.1:9/audio",
            tmp.path(),
            out.path(),
        )
        .unwrap();
        let merger = Arc::new(ConcatMerger::default());
        let capture = Arc::new(Capture::new(config, merger.clone()).unwrap());

        let runner = spawn_run(&capture);
        tokio::time::sleep(Duration::from_millis(300)).await;
        capture.shutdown().await;

        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(merger.outputs().is_empty());
        assert!(names(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn run_after_shutdown_returns_immediately() {
        let h = harness(Duration::from_secs(1), |c| c).await;
        h.capture.shutdown().await;
        h.capture.run().await.unwrap();
        assert!(!h.capture.is_recording());
        assert!(h.merger.outputs().is_empty());
    }
}
