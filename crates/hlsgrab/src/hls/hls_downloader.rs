use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hls::segment::TS_PACKET_SIZE;
use hls::{Manifest, SegmentKind};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::events::{JobContext, JobEvent};
use super::fetcher::{HttpFetcher, SegmentDownloader};
use super::job::{JobReport, JobRun, JobState, JobStatus};
use super::merger::{ContainerMerger, MergeInput, choose_strategy};
use super::playlist::PlaylistEngine;
use super::progress::{ProgressTracker, estimate_total_bytes};
use super::remux::ExternalRemuxer;
use super::scheduler::{DownloadTask, SegmentScheduler};
use super::{HlsConfig, HlsDownloaderError};
use crate::{DownloadError, MediaDescriptor, create_client};

const TEMP_DIR_PREFIX: &str = "hls_download";
/// Extension used when the segment URI does not reveal the container.
const UNKNOWN_SEGMENT_EXTENSION: &str = "seg";
const INIT_SEGMENT_FILE: &str = "init.mp4";

type ActiveOutputs = Arc<Mutex<HashSet<PathBuf>>>;

pub struct HlsDownloader {
    config: Arc<HlsConfig>,
    fetcher: Arc<HttpFetcher>,
    segment_downloader: Arc<dyn SegmentDownloader>,
    active_outputs: ActiveOutputs,
}

impl HlsDownloader {
    pub fn new(config: HlsConfig) -> Result<Self, DownloadError> {
        let client = create_client(&config.base)?;
        let fetcher = Arc::new(HttpFetcher::new(
            client,
            config.scheduler_config.buffer_size,
        ));

        Ok(Self {
            config: Arc::new(config),
            segment_downloader: fetcher.clone(),
            fetcher,
            active_outputs: Arc::default(),
        })
    }

    /// Replace the component that downloads individual segments.
    pub fn with_segment_downloader(mut self, segment_downloader: Arc<dyn SegmentDownloader>) -> Self {
        self.segment_downloader = segment_downloader;
        self
    }

    pub fn config(&self) -> &HlsConfig {
        &self.config
    }

    /// Whether this downloader handles the descriptor.
    pub fn suitable(descriptor: &MediaDescriptor) -> bool {
        descriptor.suitable()
    }

    /// Whether a job is currently writing to `output`.
    pub fn is_running(&self, output: impl AsRef<Path>) -> bool {
        self.active_outputs
            .lock()
            .contains(&output_key(output.as_ref()))
    }

    /// Run one download job to completion.
    ///
    /// Returns `Err` only when the job could not start because another job
    /// is writing to the same output path. Everything that happens once the
    /// job runs is described by the returned report.
    pub async fn download(
        &self,
        descriptor: &MediaDescriptor,
        output: impl AsRef<Path>,
        ctx: JobContext,
    ) -> Result<JobReport, HlsDownloaderError> {
        let output = output.as_ref();
        let _guard = ActiveOutputGuard::acquire(&self.active_outputs, output)?;
        let span = info_span!("hls_job", job_id = %ctx.job_id());

        async move {
            info!(uri = %descriptor.uri, output = %output.display(), "Starting HLS job");
            let mut run = JobRun::new(&ctx);
            let result = self.run_job(descriptor, output, &ctx, &mut run).await;
            let report = run.finish(result).await;

            match report.status {
                JobStatus::Done => info!(
                    segments = report.segment_count,
                    bytes = report.bytes_downloaded,
                    "HLS job finished"
                ),
                JobStatus::Cancelled => info!("HLS job cancelled"),
                JobStatus::Failed => {
                    error!(cause = report.cause.as_deref().unwrap_or_default(), "HLS job failed")
                }
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn run_job(
        &self,
        descriptor: &MediaDescriptor,
        output: &Path,
        ctx: &JobContext,
        run: &mut JobRun<'_>,
    ) -> Result<PathBuf, HlsDownloaderError> {
        if !descriptor.suitable() {
            return Err(HlsDownloaderError::Config(format!(
                "not an HLS stream: {}",
                descriptor.uri
            )));
        }
        let headers = descriptor.header_map();

        run.advance(JobState::FetchingManifest).await?;
        let manifest = self.resolve_media_manifest(&descriptor.uri, &headers, ctx, run).await?;

        if manifest.segments.is_empty() {
            return Err(HlsDownloaderError::ManifestParse(
                "manifest contains no segments".to_string(),
            ));
        }
        if !manifest.is_vod() {
            warn!("Playlist has no end tag, downloading the segments currently listed");
        }
        run.segment_count = manifest.segments.len();

        let temp_dir = self.create_temp_dir()?;
        debug!(path = %temp_dir.path().display(), "Created job directory");

        let result = self
            .download_and_merge(&manifest, &headers, output, ctx, run, temp_dir.path())
            .await;

        if let Err(e) = temp_dir.close() {
            warn!(error = %e, "Failed to remove job directory");
        }
        result
    }

    /// Follow master manifests until a media manifest is reached.
    async fn resolve_media_manifest(
        &self,
        uri: &str,
        headers: &HeaderMap,
        ctx: &JobContext,
        run: &mut JobRun<'_>,
    ) -> Result<Manifest, HlsDownloaderError> {
        let engine = PlaylistEngine::new(
            Arc::clone(&self.fetcher),
            self.config.playlist_config.variant_selection_policy,
        );
        let cancel = ctx.cancellation_token();
        let max_depth = self.config.playlist_config.max_variant_depth;

        let mut playlist = engine.load_playlist(uri, headers, cancel).await?;
        let mut depth = 0;

        while playlist.manifest.is_master() {
            run.advance(JobState::MasterDetected).await?;
            if depth >= max_depth {
                return Err(HlsDownloaderError::ManifestParse(format!(
                    "more than {max_depth} nested master playlists"
                )));
            }
            depth += 1;

            let variant_uri = engine.select_media_variant(&playlist)?.uri.clone();
            run.advance(JobState::FetchingVariant).await?;
            playlist = engine.load_playlist(&variant_uri, headers, cancel).await?;
        }

        run.advance(JobState::ParsingSegments).await?;
        Ok(playlist.manifest)
    }

    async fn download_and_merge(
        &self,
        manifest: &Manifest,
        headers: &HeaderMap,
        output: &Path,
        ctx: &JobContext,
        run: &mut JobRun<'_>,
        work_dir: &Path,
    ) -> Result<PathBuf, HlsDownloaderError> {
        let scheduler_config = &self.config.scheduler_config;
        let cancel = ctx.cancellation_token();

        let uri_kind = SegmentKind::from_uri(&manifest.segments[0].uri);
        let extension = uri_kind.map_or(UNKNOWN_SEGMENT_EXTENSION, |k| k.extension());
        let mut tasks: Vec<DownloadTask> = manifest
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| DownloadTask::new(index, segment.uri.clone(), work_dir, extension))
            .collect();

        let progress = Arc::new(ProgressTracker::new(
            estimate_total_bytes(manifest.total_duration(), scheduler_config.assumed_bitrate_bps),
            tasks.len(),
            scheduler_config.progress_interval,
        ));

        run.advance(JobState::Downloading).await?;

        let init_segment = match &manifest.init_segment {
            Some(uri) => Some(
                self.download_init_segment(uri, work_dir, headers, ctx, &progress)
                    .await?,
            ),
            None => None,
        };

        let scheduler = SegmentScheduler::new(
            Arc::clone(&self.segment_downloader),
            scheduler_config.download_concurrency,
            scheduler_config.shutdown_grace_period,
        );
        let downloaded = scheduler
            .download_all(&mut tasks, headers, ctx, &progress)
            .await;
        run.bytes_downloaded = progress.bytes_downloaded();
        let paths = downloaded?;

        let kind = match uri_kind {
            Some(kind) => kind,
            None => sniff_segment_kind(&paths[0]).await?,
        };

        let output_config = &self.config.output_config;
        let remuxer = if output_config.external_remux {
            ExternalRemuxer::probe(&output_config.remux_program).await
        } else {
            None
        };
        let strategy = choose_strategy(kind, remuxer.is_some());
        run.strategy = Some(strategy);
        info!(%kind, %strategy, "Selected merge strategy");
        ctx.emit(JobEvent::StrategySelected(strategy)).await;

        run.advance(JobState::Merging).await?;
        if let Some(parent) = output.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let durations: Vec<f64> = manifest.segments.iter().map(|s| s.duration).collect();
        let input = MergeInput {
            segments: &paths,
            durations: &durations,
            init_segment: init_segment.as_deref(),
            version: manifest.version,
            target_duration: manifest.target_duration,
            work_dir,
        };
        ContainerMerger::new(scheduler_config.buffer_size, remuxer)
            .merge(&input, strategy, output, cancel)
            .await?;

        ctx.emit(JobEvent::Progress(progress.finished())).await;
        Ok(output.to_path_buf())
    }

    async fn download_init_segment(
        &self,
        uri: &str,
        work_dir: &Path,
        headers: &HeaderMap,
        ctx: &JobContext,
        progress: &ProgressTracker,
    ) -> Result<PathBuf, HlsDownloaderError> {
        let path = work_dir.join(INIT_SEGMENT_FILE);
        let on_chunk = |n: u64| {
            progress.record_bytes(n);
        };

        self.segment_downloader
            .download_segment(uri, &path, headers, ctx.cancellation_token(), &on_chunk)
            .await
            .map_err(|source| HlsDownloaderError::InitSegmentFetch {
                url: uri.to_string(),
                source,
            })?;
        debug!(uri, "Init segment downloaded");
        Ok(path)
    }

    fn create_temp_dir(&self) -> Result<TempDir, HlsDownloaderError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(TEMP_DIR_PREFIX);

        let dir = match &self.config.output_config.temp_dir_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

/// Classify a segment whose URI was inconclusive from its leading bytes.
/// Unrecognized data is treated as a transport stream.
async fn sniff_segment_kind(path: &Path) -> Result<SegmentKind, HlsDownloaderError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = vec![0u8; 3 * TS_PACKET_SIZE];
    let mut filled = 0;

    while filled < head.len() {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);

    Ok(SegmentKind::sniff(&head).unwrap_or_else(|| {
        warn!(path = %path.display(), "Unrecognized segment container, treating as transport stream");
        SegmentKind::TransportStream
    }))
}

fn output_key(output: &Path) -> PathBuf {
    std::path::absolute(output).unwrap_or_else(|_| output.to_path_buf())
}

/// Marks an output path as busy for the lifetime of a job.
struct ActiveOutputGuard {
    outputs: ActiveOutputs,
    key: PathBuf,
}

impl ActiveOutputGuard {
    fn acquire(outputs: &ActiveOutputs, output: &Path) -> Result<Self, HlsDownloaderError> {
        let key = output_key(output);
        if !outputs.lock().insert(key.clone()) {
            return Err(HlsDownloaderError::JobAlreadyRunning(key));
        }
        Ok(Self {
            outputs: Arc::clone(outputs),
            key,
        })
    }
}

impl Drop for ActiveOutputGuard {
    fn drop(&mut self) {
        self.outputs.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_guard_rejects_second_job() {
        let outputs = ActiveOutputs::default();
        let first = ActiveOutputGuard::acquire(&outputs, Path::new("out/video.mp4")).unwrap();

        let err = ActiveOutputGuard::acquire(&outputs, Path::new("out/video.mp4")).err();
        assert!(matches!(err, Some(HlsDownloaderError::JobAlreadyRunning(_))));

        // A different output is independent.
        let _other = ActiveOutputGuard::acquire(&outputs, Path::new("out/other.mp4")).unwrap();

        drop(first);
        assert!(ActiveOutputGuard::acquire(&outputs, Path::new("out/video.mp4")).is_ok());
    }

    #[tokio::test]
    async fn test_sniff_segment_kind() {
        let dir = tempfile::tempdir().unwrap();

        let ts = dir.path().join("a.seg");
        let mut data = vec![0u8; 2 * TS_PACKET_SIZE];
        data[0] = 0x47;
        data[TS_PACKET_SIZE] = 0x47;
        std::fs::write(&ts, &data).unwrap();
        assert_eq!(
            sniff_segment_kind(&ts).await.unwrap(),
            SegmentKind::TransportStream
        );

        let fmp4 = dir.path().join("b.seg");
        std::fs::write(&fmp4, [0, 0, 0, 8, b'm', b'o', b'o', b'f']).unwrap();
        assert_eq!(sniff_segment_kind(&fmp4).await.unwrap(), SegmentKind::Fmp4);
    }

    #[test]
    fn test_unsuitable_descriptor() {
        assert!(!HlsDownloader::suitable(&MediaDescriptor::new(
            "https://example.com/video.mp4"
        )));
        assert!(HlsDownloader::suitable(&MediaDescriptor::new(
            "https://example.com/index.m3u8"
        )));
    }
}
