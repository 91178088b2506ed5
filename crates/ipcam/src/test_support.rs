//! Fake A/V sources and mergers for tests.
//!
//! Compiled for the crate's own tests and, through the `test-support`
//! feature, for integration tests of this crate and of the CLI.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::routing::get;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use url::Url;

use crate::error::{CaptureError, Result};
use crate::merger::{MergeJob, Merger};

/// Deterministic content: byte `i` of every source is `i % 251`.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A camera on `127.0.0.1` serving:
///
/// - `/fixed`: [`SourceServer::FIXED_LEN`] bytes of [`pattern`], then EOF
/// - `/short`: `hello`
/// - `/empty`: 200 with no body
/// - `/live`: an endless, throttled continuation of [`pattern`]
///
/// Every request is counted, whatever its path.
pub struct SourceServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl SourceServer {
    pub const FIXED_LEN: usize = 200_003;

    pub async fn start() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let app = Router::new()
            .route("/fixed", get(|| async { pattern(Self::FIXED_LEN) }))
            .route("/short", get(|| async { "hello" }))
            .route("/empty", get(|| async { StatusCode::OK }))
            .route("/live", get(|| async { Body::from_stream(live_body()) }))
            .layer(middleware::from_fn(move |req: Request, next: Next| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    next.run(req).await
                }
            }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, hits }
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{path}", self.addr)).unwrap()
    }

    /// Requests served so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Endless body continuing [`pattern`], throttled to roughly 50 KiB/s.
fn live_body() -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::unfold(0usize, |offset| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let chunk: Vec<u8> = (offset..offset + 512).map(|i| (i % 251) as u8).collect();
        Some((Ok(Bytes::from(chunk)), offset + 512))
    })
}

/// Merger that concatenates video then audio into the output, recording
/// every job it saw.
#[derive(Default)]
pub struct ConcatMerger {
    jobs: Mutex<Vec<MergeJob>>,
    fail: bool,
}

impl ConcatMerger {
    pub fn failing() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn jobs(&self) -> Vec<MergeJob> {
        self.jobs.lock().clone()
    }

    pub fn outputs(&self) -> Vec<PathBuf> {
        self.jobs.lock().iter().map(|j| j.output.clone()).collect()
    }
}

#[async_trait]
impl Merger for ConcatMerger {
    async fn merge(&self, job: &MergeJob) -> Result<()> {
        self.jobs.lock().push(job.clone());
        if self.fail {
            return Err(CaptureError::MergeFailed {
                output: job.output.clone(),
                status: "exit status: 1".into(),
                stderr: "simulated encoder failure".into(),
            });
        }
        let mut merged = tokio::fs::read(&job.video)
            .await
            .map_err(|e| CaptureError::io("reading video", &job.video, e))?;
        let audio = tokio::fs::read(&job.audio)
            .await
            .map_err(|e| CaptureError::io("reading audio", &job.audio, e))?;
        merged.extend_from_slice(&audio);
        tokio::fs::write(&job.output, merged)
            .await
            .map_err(|e| CaptureError::io("writing merged output", &job.output, e))
    }
}

/// Every regular file below `root`, sorted. A missing `root` has none.
pub fn files_under(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

/// Poll `condition` every 20ms, panicking after five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}
