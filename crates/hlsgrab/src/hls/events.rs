use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::job::JobState;
use super::merger::MergeStrategy;
use super::progress::ProgressEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StateChanged { from: JobState, to: JobState },
    Progress(ProgressEvent),
    SegmentDownloaded { index: usize, bytes: u64 },
    StrategySelected(MergeStrategy),
}

/// Per-job wiring supplied by the caller: the job identity, an optional
/// event channel and the cancellation token.
///
/// The event channel is bounded. Progress and segment events are dropped
/// when it is full; state changes wait for room, so a registered receiver
/// must be drained while the job runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: Uuid,
    events: Option<mpsc::Sender<JobEvent>>,
    cancel: CancellationToken,
}

impl Default for JobContext {
    fn default() -> Self {
        Self::new()
    }
}

impl JobContext {
    pub fn new() -> Self {
        Self {
            job_id: Uuid::new_v4(),
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<JobEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deliver an event, waiting for channel capacity.
    pub async fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = events.send(event).await;
        }
    }

    /// Deliver an event if the channel has room.
    pub fn try_emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            let _ = events.try_send(event);
        }
    }
}
