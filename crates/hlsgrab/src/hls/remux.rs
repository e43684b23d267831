// External remux through ffmpeg (or a compatible tool) using stream copy.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hls::HlsDownloaderError;

/// Name of the playlist synthesized next to the downloaded segments.
pub const LOCAL_PLAYLIST_NAME: &str = "local.m3u8";

/// A remux tool located on this machine that answered the version probe.
#[derive(Debug, Clone)]
pub struct ExternalRemuxer {
    program: PathBuf,
}

impl ExternalRemuxer {
    /// Locate `program` (a name looked up on `PATH`, or a path) and check
    /// that `<program> -version` exits successfully.
    pub async fn probe(program: &str) -> Option<Self> {
        let path = match which::which(program) {
            Ok(path) => path,
            Err(e) => {
                debug!(program, error = %e, "Remux tool not found");
                return None;
            }
        };

        let status = Command::new(&path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => {
                debug!(program = %path.display(), "Remux tool available");
                Some(Self { program: path })
            }
            Ok(status) => {
                warn!(program = %path.display(), code = ?status.code(), "Remux tool probe failed");
                None
            }
            Err(e) => {
                warn!(program = %path.display(), error = %e, "Could not run remux tool");
                None
            }
        }
    }

    /// Write the local playlist into `dir` and remux it into `output`.
    /// Succeeds only when the tool exits with status 0 and `output` is non-empty.
    pub async fn remux(
        &self,
        dir: &Path,
        playlist: &LocalPlaylist<'_>,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, HlsDownloaderError> {
        let playlist_path = dir.join(LOCAL_PLAYLIST_NAME);
        tokio::fs::write(&playlist_path, playlist.render()).await?;

        let mut command = Command::new(&self.program);
        command
            .args(remux_args(&playlist_path, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(program = %self.program.display(), output = %output.display(), "Starting external remux");
        let child = command.spawn()?;

        // Dropping the child on cancellation kills the process.
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HlsDownloaderError::Cancelled),
            result = child.wait_with_output() => result?,
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(HlsDownloaderError::Remux(format!(
                "{} exited with {}: {}",
                self.program.display(),
                result.status,
                stderr.trim()
            )));
        }

        let written = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            return Err(HlsDownloaderError::Remux(
                "remux produced an empty output file".to_string(),
            ));
        }
        Ok(written)
    }
}

fn remux_args(playlist: &Path, output: &Path) -> Vec<std::ffi::OsString> {
    let mut args: Vec<std::ffi::OsString> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-allowed_extensions",
        "ALL",
        "-i",
    ]
    .into_iter()
    .map(Into::into)
    .collect();
    args.push(playlist.as_os_str().to_owned());
    args.extend(
        ["-c", "copy", "-bsf:a", "aac_adtstoasc", "-f", "mp4"]
            .into_iter()
            .map(Into::into),
    );
    args.push(output.as_os_str().to_owned());
    args
}

/// A VOD playlist pointing at already downloaded segment files.
#[derive(Debug, Clone)]
pub struct LocalPlaylist<'a> {
    pub version: u32,
    pub target_duration: u64,
    /// Init segment file name, relative to the playlist
    pub init_segment: Option<&'a str>,
    /// `(file name, duration in seconds)` in playback order
    pub segments: Vec<(String, f64)>,
}

impl LocalPlaylist<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "#EXTM3U");
        let _ = writeln!(out, "#EXT-X-VERSION:{}", self.version);
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration);
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:0");
        if let Some(init) = self.init_segment {
            let _ = writeln!(out, "#EXT-X-MAP:URI=\"{init}\"");
        }
        for (name, duration) in &self.segments {
            let _ = writeln!(out, "#EXTINF:{duration:.3},");
            let _ = writeln!(out, "{name}");
        }
        let _ = writeln!(out, "#EXT-X-ENDLIST");
        out
    }
}
