// Job lifecycle: state machine and final report.

use std::fmt;
use std::path::PathBuf;

use tracing::debug;
use uuid::Uuid;

use super::HlsDownloaderError;
use super::events::{JobContext, JobEvent};
use super::merger::MergeStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Start,
    FetchingManifest,
    MasterDetected,
    FetchingVariant,
    ParsingSegments,
    Downloading,
    Merging,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }

    /// Legal transitions. Every edge moves forward with one exception:
    /// `FetchingVariant -> MasterDetected`, taken when the selected variant
    /// is itself a master playlist. The number of such loops is bounded by
    /// `HlsPlaylistConfig::max_variant_depth`.
    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;

        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed | Cancelled)
                | (Start, FetchingManifest)
                | (FetchingManifest, MasterDetected | ParsingSegments)
                | (MasterDetected, FetchingVariant)
                | (FetchingVariant, MasterDetected | ParsingSegments)
                | (ParsingSegments, Downloading)
                | (Downloading, Merging)
                | (Merging, Done)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Start => "start",
            JobState::FetchingManifest => "fetching_manifest",
            JobState::MasterDetected => "master_detected",
            JobState::FetchingVariant => "fetching_variant",
            JobState::ParsingSegments => "parsing_segments",
            JobState::Downloading => "downloading",
            JobState::Merging => "merging",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub output: Option<PathBuf>,
    /// Human readable failure cause
    pub cause: Option<String>,
    pub segment_count: usize,
    pub bytes_downloaded: u64,
    pub strategy: Option<MergeStrategy>,
}

impl JobReport {
    pub fn success(&self) -> bool {
        self.status == JobStatus::Done
    }
}

/// Tracks the state of a running job and publishes transitions.
#[derive(Debug)]
pub(crate) struct JobRun<'a> {
    ctx: &'a JobContext,
    state: JobState,
    pub(crate) segment_count: usize,
    pub(crate) bytes_downloaded: u64,
    pub(crate) strategy: Option<MergeStrategy>,
}

impl<'a> JobRun<'a> {
    pub(crate) fn new(ctx: &'a JobContext) -> Self {
        Self {
            ctx,
            state: JobState::Start,
            segment_count: 0,
            bytes_downloaded: 0,
            strategy: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> JobState {
        self.state
    }

    pub(crate) async fn advance(&mut self, next: JobState) -> Result<(), HlsDownloaderError> {
        if !self.state.can_advance_to(next) {
            return Err(HlsDownloaderError::Internal(format!(
                "illegal job transition {} -> {}",
                self.state, next
            )));
        }
        let from = std::mem::replace(&mut self.state, next);
        debug!(%from, to = %next, "Job state changed");
        self.ctx
            .emit(JobEvent::StateChanged { from, to: next })
            .await;
        Ok(())
    }

    /// Move to the terminal state matching `result` and build the report.
    pub(crate) async fn finish(
        mut self,
        result: Result<PathBuf, HlsDownloaderError>,
    ) -> JobReport {
        let (status, output, cause) = match result {
            Ok(path) => match self.advance(JobState::Done).await {
                Ok(()) => (JobStatus::Done, Some(path), None),
                Err(e) => {
                    let _ = self.advance(JobState::Failed).await;
                    (JobStatus::Failed, None, Some(e.to_string()))
                }
            },
            Err(e) if e.is_cancelled() || self.ctx.is_cancelled() => {
                let _ = self.advance(JobState::Cancelled).await;
                (JobStatus::Cancelled, None, Some(e.to_string()))
            }
            Err(e) => {
                let _ = self.advance(JobState::Failed).await;
                (JobStatus::Failed, None, Some(e.to_string()))
            }
        };

        JobReport {
            job_id: self.ctx.job_id(),
            status,
            output,
            cause,
            segment_count: self.segment_count,
            bytes_downloaded: self.bytes_downloaded,
            strategy: self.strategy,
        }
    }
}
