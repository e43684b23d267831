// HLS Segment Scheduler: downloads every segment of a job with bounded concurrency.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::header::HeaderMap;
use tracing::{debug, error, info, warn};

use crate::hls::HlsDownloaderError;
use crate::hls::error::FetchError;
use crate::hls::events::{JobContext, JobEvent};
use crate::hls::fetcher::SegmentDownloader;
use crate::hls::progress::ProgressTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub index: usize,
    pub uri: String,
    pub local_path: PathBuf,
    pub status: TaskStatus,
}

impl DownloadTask {
    /// A pending task writing to `segment_{index:06}.{extension}` inside `dir`.
    pub fn new(index: usize, uri: impl Into<String>, dir: &Path, extension: &str) -> Self {
        Self {
            index,
            uri: uri.into(),
            local_path: dir.join(format!("segment_{index:06}.{extension}")),
            status: TaskStatus::Pending,
        }
    }
}

pub struct SegmentScheduler {
    segment_downloader: Arc<dyn SegmentDownloader>,
    download_concurrency: usize,
    shutdown_grace_period: Duration,
}

impl SegmentScheduler {
    pub fn new(
        segment_downloader: Arc<dyn SegmentDownloader>,
        download_concurrency: usize,
        shutdown_grace_period: Duration,
    ) -> Self {
        Self {
            segment_downloader,
            download_concurrency: download_concurrency.max(1),
            shutdown_grace_period,
        }
    }

    /// Download all tasks and return their local paths in task order.
    ///
    /// The first failing segment fails the whole batch: no new downloads are
    /// started and the in-flight ones are told to stop. They get
    /// `shutdown_grace_period` to wind down before being dropped.
    pub async fn download_all(
        &self,
        tasks: &mut [DownloadTask],
        headers: &HeaderMap,
        ctx: &JobContext,
        progress: &Arc<ProgressTracker>,
    ) -> Result<Vec<PathBuf>, HlsDownloaderError> {
        info!(
            segments = tasks.len(),
            concurrency = self.download_concurrency,
            "Starting segment downloads"
        );

        // Stops siblings on failure without cancelling the caller's token.
        let batch_token = ctx.cancellation_token().child_token();

        let on_chunk: Arc<dyn Fn(u64) + Send + Sync> = {
            let progress = Arc::clone(progress);
            let ctx = ctx.clone();
            Arc::new(move |n| {
                if let Some(event) = progress.record_bytes(n) {
                    ctx.try_emit(JobEvent::Progress(event));
                }
            })
        };

        let mut next_task = 0usize;
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<HlsDownloaderError> = None;

        loop {
            while failure.is_none()
                && !batch_token.is_cancelled()
                && in_flight.len() < self.download_concurrency
                && next_task < tasks.len()
            {
                let slot = next_task;
                next_task += 1;

                let task = &mut tasks[slot];
                task.status = TaskStatus::InFlight;
                debug!(index = task.index, uri = %task.uri, "Scheduling segment");

                let downloader = Arc::clone(&self.segment_downloader);
                let uri = task.uri.clone();
                let path = task.local_path.clone();
                let token = batch_token.clone();
                let on_chunk = Arc::clone(&on_chunk);
                in_flight.push(async move {
                    let result = downloader
                        .download_segment(&uri, &path, headers, &token, on_chunk.as_ref())
                        .await;
                    (slot, result)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = batch_token.cancelled() => {
                    info!("Segment downloads interrupted");
                    break;
                }

                Some((slot, result)) = in_flight.next() => {
                    if let Err(e) = Self::complete(&mut tasks[slot], result, ctx, progress) {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                        batch_token.cancel();
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            batch_token.cancel();
            let drain = async {
                while let Some((slot, result)) = in_flight.next().await {
                    if let Err(e) = Self::complete(&mut tasks[slot], result, ctx, progress) {
                        if failure.is_none() && !e.is_cancelled() {
                            failure = Some(e);
                        }
                    }
                }
            };
            if tokio::time::timeout(self.shutdown_grace_period, drain)
                .await
                .is_err()
            {
                warn!(
                    grace_period = ?self.shutdown_grace_period,
                    "In-flight segment downloads did not stop in time, dropping them"
                );
            }
        }

        if ctx.is_cancelled() {
            return Err(HlsDownloaderError::Cancelled);
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let paths: Vec<PathBuf> = tasks.iter().map(|t| t.local_path.clone()).collect();
        info!(
            segments = paths.len(),
            bytes = progress.bytes_downloaded(),
            "All segments downloaded"
        );
        Ok(paths)
    }

    fn complete(
        task: &mut DownloadTask,
        result: Result<u64, FetchError>,
        ctx: &JobContext,
        progress: &ProgressTracker,
    ) -> Result<(), HlsDownloaderError> {
        match result {
            Ok(bytes) => {
                task.status = TaskStatus::Done;
                ctx.try_emit(JobEvent::SegmentDownloaded {
                    index: task.index,
                    bytes,
                });
                ctx.try_emit(JobEvent::Progress(progress.segment_done()));
                Ok(())
            }
            Err(source) => {
                task.status = TaskStatus::Failed;
                if !matches!(source, FetchError::Cancelled) {
                    error!(index = task.index, uri = %task.uri, error = %source, "Segment download failed");
                }
                Err(HlsDownloaderError::SegmentFetch {
                    index: task.index,
                    url: task.uri.clone(),
                    source,
                })
            }
        }
    }
}
