// Container Merger: turns the ordered segment files of a job into one output file.

use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use hls::SegmentKind;
use hls::isobmff::{self, BOX_HEADER_SIZE, LARGE_BOX_HEADER_SIZE, MDAT};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hls::HlsDownloaderError;
use crate::hls::remux::{ExternalRemuxer, LocalPlaylist};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeStrategy {
    /// Byte-for-byte append of transport-stream segments
    Concatenate,
    /// Synthesized `ftyp`/`moov` followed by one `mdat` holding every segment's media data
    Fmp4Reconstruct,
    /// Stream-copy remux through an external tool
    ExternalRemux,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStrategy::Concatenate => "concatenate",
            MergeStrategy::Fmp4Reconstruct => "fmp4_reconstruct",
            MergeStrategy::ExternalRemux => "external_remux",
        };
        f.write_str(name)
    }
}

/// The external tool wins whenever it is usable; otherwise the segment kind decides.
pub fn choose_strategy(kind: SegmentKind, remux_available: bool) -> MergeStrategy {
    if remux_available {
        return MergeStrategy::ExternalRemux;
    }
    match kind {
        SegmentKind::TransportStream => MergeStrategy::Concatenate,
        SegmentKind::Fmp4 => MergeStrategy::Fmp4Reconstruct,
    }
}

/// `<output>.part`, the file every strategy writes before the final rename.
pub fn part_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Everything the merger needs to know about a job's downloaded segments.
#[derive(Debug)]
pub struct MergeInput<'a> {
    /// Segment files in manifest order
    pub segments: &'a [PathBuf],
    /// Segment durations in seconds, parallel to `segments`
    pub durations: &'a [f64],
    pub init_segment: Option<&'a Path>,
    pub version: u32,
    pub target_duration: u64,
    /// Directory holding the segment files
    pub work_dir: &'a Path,
}

impl MergeInput<'_> {
    fn total_duration_ms(&self) -> u32 {
        let ms = self.durations.iter().sum::<f64>() * 1000.0;
        if ms.is_finite() && ms > 0.0 {
            ms.min(u32::MAX as f64) as u32
        } else {
            0
        }
    }
}

pub struct ContainerMerger {
    buffer_size: usize,
    remuxer: Option<ExternalRemuxer>,
}

impl ContainerMerger {
    pub fn new(buffer_size: usize, remuxer: Option<ExternalRemuxer>) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            remuxer,
        }
    }

    /// Merge into `<output>.part` and rename onto `output` on success.
    /// On failure the partial file is removed and `output` is left untouched.
    pub async fn merge(
        &self,
        input: &MergeInput<'_>,
        strategy: MergeStrategy,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, HlsDownloaderError> {
        let part = part_path(output);
        info!(%strategy, segments = input.segments.len(), output = %output.display(), "Merging segments");

        let result = match strategy {
            MergeStrategy::Concatenate => {
                concatenate(input.segments, &part, self.buffer_size, cancel).await
            }
            MergeStrategy::Fmp4Reconstruct => {
                reconstruct_fmp4(
                    input.segments,
                    input.total_duration_ms(),
                    &part,
                    self.buffer_size,
                    cancel,
                )
                .await
            }
            MergeStrategy::ExternalRemux => self.remux(input, &part, cancel).await,
        };

        match result {
            Ok(bytes) => {
                fs::rename(&part, output).await?;
                info!(bytes, output = %output.display(), "Merge complete");
                Ok(bytes)
            }
            Err(e) => {
                if let Err(remove_err) = fs::remove_file(&part).await
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %part.display(), error = %remove_err, "Failed to remove partial output");
                }
                Err(e)
            }
        }
    }

    async fn remux(
        &self,
        input: &MergeInput<'_>,
        part: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, HlsDownloaderError> {
        let remuxer = self.remuxer.as_ref().ok_or_else(|| {
            HlsDownloaderError::Remux("no external remux tool available".to_string())
        })?;

        let init_name = input
            .init_segment
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str());
        let segments = input
            .segments
            .iter()
            .zip(input.durations)
            .map(|(path, duration)| {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        HlsDownloaderError::Internal(format!(
                            "segment path {} has no file name",
                            path.display()
                        ))
                    })?;
                Ok((name.to_string(), *duration))
            })
            .collect::<Result<Vec<_>, HlsDownloaderError>>()?;

        let playlist = LocalPlaylist {
            version: input.version,
            target_duration: input.target_duration,
            init_segment: init_name,
            segments,
        };
        remuxer.remux(input.work_dir, &playlist, part, cancel).await
    }
}

/// Append the segment files to `output` in order.
pub async fn concatenate(
    segments: &[PathBuf],
    output: &Path,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, HlsDownloaderError> {
    let mut writer = BufWriter::with_capacity(buffer_size, File::create(output).await?);
    let mut total = 0u64;

    for segment in segments {
        if cancel.is_cancelled() {
            return Err(HlsDownloaderError::Cancelled);
        }
        let mut reader = File::open(segment).await?;
        total += tokio::io::copy(&mut reader, &mut writer).await?;
    }

    writer.flush().await?;
    Ok(total)
}

/// Build a single MP4-shaped file from fragmented segments.
///
/// Writes a synthesized `ftyp` and `moov`, then one `mdat` whose payload is
/// every segment's `mdat` payloads in order. The first pass only reads box
/// headers to size the `mdat`; the second loads one segment at a time.
pub async fn reconstruct_fmp4(
    segments: &[PathBuf],
    duration_ms: u32,
    output: &Path,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<u64, HlsDownloaderError> {
    let mut payload_total = 0u64;
    for segment in segments {
        payload_total += scan_mdat_payload_len(segment).await?;
    }
    debug!(payload_total, "Sized reconstructed mdat");
    if payload_total == 0 {
        return Err(HlsDownloaderError::Merge(
            "no mdat payload in any segment".to_string(),
        ));
    }

    let mut writer = BufWriter::with_capacity(buffer_size, File::create(output).await?);
    let ftyp = isobmff::ftyp_box();
    let moov = isobmff::minimal_moov(duration_ms);
    let mdat_header = isobmff::mdat_header(payload_total);
    writer.write_all(&ftyp).await?;
    writer.write_all(&moov).await?;
    writer.write_all(&mdat_header).await?;

    let mut written = 0u64;
    for segment in segments {
        if cancel.is_cancelled() {
            return Err(HlsDownloaderError::Cancelled);
        }
        let data = fs::read(segment).await?;
        for payload in isobmff::mdat_payloads(&data) {
            writer.write_all(payload).await?;
            written += payload.len() as u64;
        }
    }
    writer.flush().await?;

    if written != payload_total {
        return Err(HlsDownloaderError::Merge(format!(
            "mdat payload size changed between passes ({payload_total} declared, {written} written)"
        )));
    }

    Ok((ftyp.len() + moov.len() + mdat_header.len()) as u64 + written)
}

/// Sum the `mdat` payload lengths of one segment file by walking box headers
/// without reading payloads. Stops at the first malformed header.
pub async fn scan_mdat_payload_len(path: &Path) -> Result<u64, HlsDownloaderError> {
    let mut file = File::open(path).await?;
    let file_len = file.metadata().await?.len();

    let mut header = [0u8; LARGE_BOX_HEADER_SIZE];
    let mut offset = 0u64;
    let mut total = 0u64;

    while file_len - offset >= BOX_HEADER_SIZE as u64 {
        let remaining = file_len - offset;
        let want = remaining.min(LARGE_BOX_HEADER_SIZE as u64) as usize;

        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut header[..want]).await?;

        let Some(parsed) = isobmff::parse_box_header(&header[..want], remaining) else {
            warn!(path = %path.display(), offset, "Malformed box header, ignoring the rest of the segment");
            break;
        };

        if parsed.fourcc == MDAT {
            total += parsed.payload_len();
        }
        offset += parsed.size;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp4_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(fourcc);
        out.extend_from_slice(payload);
        out
    }

    fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_choose_strategy() {
        assert_eq!(
            choose_strategy(SegmentKind::TransportStream, false),
            MergeStrategy::Concatenate
        );
        assert_eq!(
            choose_strategy(SegmentKind::Fmp4, false),
            MergeStrategy::Fmp4Reconstruct
        );
        assert_eq!(
            choose_strategy(SegmentKind::TransportStream, true),
            MergeStrategy::ExternalRemux
        );
        assert_eq!(
            choose_strategy(SegmentKind::Fmp4, true),
            MergeStrategy::ExternalRemux
        );
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/out/video.ts")),
            PathBuf::from("/out/video.ts.part")
        );
    }

    #[tokio::test]
    async fn test_concatenate_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let segments = vec![
            write(dir.path(), "a", b"AAAA"),
            write(dir.path(), "b", b"BB"),
            write(dir.path(), "c", b"CCCCCC"),
        ];
        let output = dir.path().join("out.ts");

        let n = concatenate(&segments, &output, 8192, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(n, 12);
        assert_eq!(std::fs::read(&output).unwrap(), b"AAAABBCCCCCC");
    }

    #[tokio::test]
    async fn test_scan_counts_every_mdat() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = mp4_box(b"moof", &[0; 16]);
        data.extend(mp4_box(b"mdat", &[1; 10]));
        data.extend(mp4_box(b"moof", &[0; 4]));
        data.extend(mp4_box(b"mdat", &[2; 5]));
        let path = write(dir.path(), "seg.m4s", &data);

        assert_eq!(scan_mdat_payload_len(&path).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_scan_handles_large_size_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = 1u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&(16u64 + 3).to_be_bytes());
        data.extend_from_slice(&[9, 9, 9]);
        let path = write(dir.path(), "large.m4s", &data);

        assert_eq!(scan_mdat_payload_len(&path).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reconstruct_fmp4_sums_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = mp4_box(b"styp", b"msdh");
        first.extend(mp4_box(b"moof", &[0; 8]));
        first.extend(mp4_box(b"mdat", b"hello"));
        let mut second = mp4_box(b"moof", &[0; 8]);
        second.extend(mp4_box(b"mdat", b"world!"));
        let segments = vec![
            write(dir.path(), "0.m4s", &first),
            write(dir.path(), "1.m4s", &second),
        ];
        let output = dir.path().join("out.mp4");

        let n = reconstruct_fmp4(&segments, 6_000, &output, 8192, &CancellationToken::new())
            .await
            .unwrap();

        let merged = std::fs::read(&output).unwrap();
        assert_eq!(n, merged.len() as u64);
        assert_eq!(isobmff::mdat_payload_len(&merged), 11);
        let payloads: Vec<u8> = isobmff::mdat_payloads(&merged).flatten().copied().collect();
        assert_eq!(payloads, b"helloworld!");
        assert_eq!(&merged[4..8], b"ftyp");
    }

    #[tokio::test]
    async fn test_reconstruct_fmp4_without_media_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = mp4_box(b"styp", b"msdh");
        data.extend(mp4_box(b"moof", &[0; 16]));
        let segments = vec![write(dir.path(), "0.m4s", &data)];
        let output = dir.path().join("out.mp4");
        let input = MergeInput {
            segments: &segments,
            durations: &[4.0],
            init_segment: None,
            version: 7,
            target_duration: 4,
            work_dir: dir.path(),
        };

        let err = ContainerMerger::new(8192, None)
            .merge(&input, MergeStrategy::Fmp4Reconstruct, &output, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, HlsDownloaderError::Merge(ref msg) if msg.contains("no mdat")));
        assert!(!output.exists());
        assert!(!part_path(&output).exists());
    }

    #[tokio::test]
    async fn test_failed_merge_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let segments = vec![dir.path().join("missing.ts")];
        let output = dir.path().join("out.ts");
        let input = MergeInput {
            segments: &segments,
            durations: &[10.0],
            init_segment: None,
            version: 3,
            target_duration: 10,
            work_dir: dir.path(),
        };

        let merger = ContainerMerger::new(8192, None);
        let result = merger
            .merge(&input, MergeStrategy::Concatenate, &output, &CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert!(!output.exists());
        assert!(!part_path(&output).exists());
    }

    #[tokio::test]
    async fn test_remux_without_tool_fails() {
        let dir = tempfile::tempdir().unwrap();
        let segments = vec![write(dir.path(), "segment_000000.ts", b"x")];
        let output = dir.path().join("out.mp4");
        let input = MergeInput {
            segments: &segments,
            durations: &[10.0],
            init_segment: None,
            version: 3,
            target_duration: 10,
            work_dir: dir.path(),
        };

        let err = ContainerMerger::new(8192, None)
            .merge(&input, MergeStrategy::ExternalRemux, &output, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HlsDownloaderError::Remux(_)));
    }

    #[cfg(unix)]
    mod external_tool {
        use super::*;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        /// Write an executable shell script that answers `-version` and runs
        /// `body` for a remux call. `$last` holds the output path.
        async fn stub_tool(dir: &Path, body: &str) -> ExternalRemuxer {
            let path = dir.join("fake-ffmpeg");
            {
                let mut file = std::fs::File::create(&path).unwrap();
                write!(
                    file,
                    "#!/bin/sh\nif [ \"$1\" = \"-version\" ]; then exit 0; fi\nfor last; do :; done\n{body}\n"
                )
                .unwrap();
                file.sync_all().unwrap();
            }
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

            let program = path.to_str().unwrap();
            // A concurrently forked test process can briefly hold the script open.
            for _ in 0..10 {
                if let Some(remuxer) = ExternalRemuxer::probe(program).await {
                    return remuxer;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("stub remux tool did not answer -version");
        }

        async fn remux_with(body: &str) -> (tempfile::TempDir, PathBuf, Result<u64, HlsDownloaderError>) {
            let dir = tempfile::tempdir().unwrap();
            let work = dir.path().join("work");
            std::fs::create_dir(&work).unwrap();
            let segments = vec![write(&work, "segment_000000.ts", b"x")];
            let output = dir.path().join("out.mp4");
            let input = MergeInput {
                segments: &segments,
                durations: &[10.0],
                init_segment: None,
                version: 3,
                target_duration: 10,
                work_dir: &work,
            };

            let remuxer = stub_tool(dir.path(), body).await;
            let result = ContainerMerger::new(8192, Some(remuxer))
                .merge(&input, MergeStrategy::ExternalRemux, &output, &CancellationToken::new())
                .await;
            (dir, output, result)
        }

        #[tokio::test]
        async fn test_remux_success_renames_output() {
            let (dir, output, result) = remux_with("printf 'mp4' > \"$last\"").await;

            assert_eq!(result.unwrap(), 3);
            assert_eq!(std::fs::read(&output).unwrap(), b"mp4");
            assert!(!part_path(&output).exists());
            assert!(dir.path().join("work").join(crate::hls::remux::LOCAL_PLAYLIST_NAME).exists());
        }

        #[tokio::test]
        async fn test_remux_empty_output_fails() {
            let (_dir, output, result) = remux_with(": > \"$last\"").await;

            let err = result.unwrap_err();
            assert!(matches!(err, HlsDownloaderError::Remux(ref msg) if msg.contains("empty output")));
            assert!(!output.exists());
            assert!(!part_path(&output).exists());
        }

        #[tokio::test]
        async fn test_remux_nonzero_exit_reports_stderr() {
            let (_dir, output, result) = remux_with("echo boom >&2\nexit 3").await;

            let err = result.unwrap_err();
            assert!(matches!(err, HlsDownloaderError::Remux(ref msg) if msg.contains("boom")));
            assert!(!output.exists());
        }
    }
}
