use std::path::PathBuf;
use std::time::Duration;

pub use hls::VariantSelectionPolicy;

use crate::DownloaderConfig;

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct HlsConfig {
    /// Base downloader configuration
    pub base: DownloaderConfig,
    pub playlist_config: HlsPlaylistConfig,
    pub scheduler_config: HlsSchedulerConfig,
    pub output_config: HlsOutputConfig,
}

// --- Playlist Configuration ---
#[derive(Debug, Clone)]
pub struct HlsPlaylistConfig {
    pub variant_selection_policy: VariantSelectionPolicy,
    /// How many master manifests may be followed before giving up
    pub max_variant_depth: usize,
}

impl Default for HlsPlaylistConfig {
    fn default() -> Self {
        Self {
            variant_selection_policy: VariantSelectionPolicy::default(),
            max_variant_depth: 3,
        }
    }
}

// --- Scheduler Configuration ---
#[derive(Debug, Clone)]
pub struct HlsSchedulerConfig {
    pub download_concurrency: usize, // Max concurrent segment downloads
    pub buffer_size: usize,          // Write buffer per in-flight segment
    /// Bitrate assumed when estimating the total download size
    pub assumed_bitrate_bps: u64,
    /// Minimum delay between two progress events for the same job
    pub progress_interval: Duration,
    /// How long in-flight downloads get to stop after a failure or cancellation
    pub shutdown_grace_period: Duration,
}

impl Default for HlsSchedulerConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            buffer_size: 8192,
            assumed_bitrate_bps: 2_000_000,
            progress_interval: Duration::from_millis(250),
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

// --- Output Configuration ---
#[derive(Debug, Clone)]
pub struct HlsOutputConfig {
    /// Prefer remuxing through an external tool when it is installed
    pub external_remux: bool,
    /// Program name or path of the remux tool
    pub remux_program: String,
    /// Parent directory for per-job temporary directories (system temp dir when unset)
    pub temp_dir_root: Option<PathBuf>,
}

impl Default for HlsOutputConfig {
    fn default() -> Self {
        Self {
            external_remux: true,
            remux_program: "ffmpeg".to_string(),
            temp_dir_root: None,
        }
    }
}
