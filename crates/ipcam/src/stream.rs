//! One inbound HTTP byte stream paired with one outbound temp file.
//!
//! Acquisition reads the first few bytes of the body to make sure the source
//! is actually producing data. Those bytes are kept and replayed in front of
//! the live body, so the copy always starts from position zero.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::backoff::ExpBackoff;
use crate::config::{ACQUIRE_BACKOFF_CAP, HEALTH_CHECK_BYTES};
use crate::error::{CaptureError, Result};

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

const WRITE_BUFFER: usize = 64 * 1024;

/// What a finished copy wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    pub path: PathBuf,
    pub bytes: u64,
    /// Whether the source ran dry before the copy was stopped.
    pub exhausted: bool,
}

pub struct StreamHandle {
    url: Url,
    source: ByteStream,
    sink: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("url", &self.url.as_str())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    /// Connect to `url`, retrying with exponential backoff for up to ten
    /// seconds of accumulated waiting.
    #[instrument(skip(client), fields(url = %url), level = "debug")]
    pub async fn acquire(client: &Client, url: &Url) -> Result<Self> {
        Self::acquire_with(client, url, ExpBackoff::new(ACQUIRE_BACKOFF_CAP)).await
    }

    pub(crate) async fn acquire_with(client: &Client, url: &Url, backoff: ExpBackoff) -> Result<Self> {
        debug!("connecting to A/V source");

        match backoff.run(|_| Self::connect(client, url)).await {
            Ok(done) => {
                debug!(attempts = done.attempts, "source is healthy");
                Ok(done.value)
            }
            Err(exhausted) => Err(CaptureError::SourceExhausted {
                url: url.to_string(),
                attempts: exhausted.attempts,
                source: Box::new(exhausted.error),
            }),
        }
    }

    /// One acquisition attempt: GET, expect 200, then read ahead until at
    /// least [`HEALTH_CHECK_BYTES`] arrived or the body ended.
    async fn connect(client: &Client, url: &Url) -> Result<Self> {
        let response = client.get(url.clone()).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(CaptureError::HttpStatus {
                status,
                url: url.to_string(),
            });
        }

        debug!(
            content_length = ?response.content_length(),
            content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE),
            "source responded"
        );

        let mut body = response.bytes_stream();
        let mut prefix: Vec<Bytes> = Vec::new();
        let mut seen = 0usize;

        while seen < HEALTH_CHECK_BYTES {
            match body.next().await {
                Some(Ok(chunk)) => {
                    seen += chunk.len();
                    if !chunk.is_empty() {
                        prefix.push(chunk);
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        if seen == 0 {
            return Err(CaptureError::EmptyBody {
                url: url.to_string(),
            });
        }

        // Replay what the health check consumed ahead of the live body.
        let replay = stream::iter(prefix.into_iter().map(Ok));
        Ok(Self {
            url: url.clone(),
            source: Box::pin(replay.chain(body)),
            sink: None,
            path: None,
        })
    }

    /// Create (or truncate) the temp file this handle copies into.
    pub async fn set_output(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        debug!(path = %path.display(), "creating temp output");

        let file = File::create(path)
            .await
            .map_err(|e| CaptureError::io("creating temp output", path, e))?;

        self.sink = Some(BufWriter::with_capacity(WRITE_BUFFER, file));
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Stream bytes from the source into the sink until the source ends or
    /// `stop` is cancelled.
    ///
    /// Cancellation abandons the pending read only; a chunk that already
    /// arrived is always written out in full.
    pub async fn copy(&mut self, stop: &CancellationToken) -> Result<CopyReport> {
        let path = self.path.clone().ok_or_else(|| {
            CaptureError::configuration(format!("no output set for {}", self.url))
        })?;
        let sink = self.sink.as_mut().ok_or_else(|| {
            CaptureError::configuration(format!("no output set for {}", self.url))
        })?;

        debug!(path = %path.display(), "copying source into temp output");

        let mut bytes = 0u64;
        let exhausted = loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break false,
                next = self.source.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    sink.write_all(&chunk)
                        .await
                        .map_err(|e| CaptureError::io("writing temp output", &path, e))?;
                    bytes += chunk.len() as u64;
                }
                Some(Err(e)) => {
                    warn!(path = %path.display(), bytes, error = %e, "source read failed");
                    break true;
                }
                None => break true,
            }
        };

        sink.flush()
            .await
            .map_err(|e| CaptureError::io("flushing temp output", &path, e))?;

        if bytes == 0 {
            warn!(path = %path.display(), url = %self.url, "copy wrote zero bytes");
        } else {
            debug!(path = %path.display(), bytes, exhausted, "copy finished");
        }

        Ok(CopyReport {
            path,
            bytes,
            exhausted,
        })
    }

    /// Flush and close the sink, then drop the source connection.
    ///
    /// Consuming `self` rules out closing twice.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            let path = self.path.clone().unwrap_or_default();
            sink.flush()
                .await
                .map_err(|e| CaptureError::io("flushing temp output", &path, e))?;
            sink.into_inner()
                .sync_all()
                .await
                .map_err(|e| CaptureError::io("syncing temp output", &path, e))?;
        }
        Ok(())
    }
}
