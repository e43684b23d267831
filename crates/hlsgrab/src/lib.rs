//! # hlsgrab-engine
//!
//! Downloads an HLS stream into a single local file.
//!
//! A job fetches the manifest, follows a master playlist to the selected
//! variant, downloads every media segment with bounded concurrency and
//! reassembles them into one container:
//!
//! - transport-stream segments are concatenated,
//! - fragmented MP4 segments get a synthesized `ftyp`/`moov` and a single `mdat`,
//! - or, when `ffmpeg` is installed, the segments are remuxed with stream copy.
//!
//! Jobs report their state transitions and progress over a channel and can
//! be cancelled through a [`tokio_util::sync::CancellationToken`].

pub mod builder;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod hls;

pub use builder::DownloaderConfigBuilder;
pub use client::create_client;
pub use config::DownloaderConfig;
pub use descriptor::MediaDescriptor;
pub use error::DownloadError;

pub use crate::hls::{
    HlsConfig, HlsDownloader, HlsDownloaderError, JobContext, JobEvent, JobReport, JobState,
    JobStatus, MergeStrategy,
};
