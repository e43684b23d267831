// HLS download engine: manifest resolution, segment scheduling and container merging

pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod hls_downloader;
pub mod job;
pub mod merger;
pub mod playlist;
pub mod progress;
pub mod remux;
pub mod scheduler;

// Re-exports for easier access
pub use config::{HlsConfig, HlsOutputConfig, HlsPlaylistConfig, HlsSchedulerConfig};
pub use error::{FetchError, HlsDownloaderError};
pub use events::{JobContext, JobEvent};
pub use fetcher::{HttpFetcher, SegmentDownloader};
pub use hls_downloader::HlsDownloader;
pub use job::{JobReport, JobState, JobStatus};
pub use merger::MergeStrategy;
pub use progress::ProgressEvent;
