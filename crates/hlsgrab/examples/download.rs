//! Download one HLS stream to a local file.
//!
//! ```text
//! cargo run -p hlsgrab-engine --example download -- <manifest-url | descriptor.json> <output>
//! ```
//!
//! A descriptor file holds the JSON handed over by a content extractor, e.g.
//! `{"uri": "https://host/master.m3u8", "protocol": "hls", "http_headers": {"Referer": "https://host/"}}`.

use std::process::ExitCode;

use hlsgrab_engine::{HlsConfig, HlsDownloader, JobContext, JobEvent, MediaDescriptor};
use tokio::sync::mpsc;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_ansi(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {e}");
        return ExitCode::FAILURE;
    }

    let mut args = std::env::args().skip(1);
    let (Some(source), Some(output)) = (args.next(), args.next()) else {
        eprintln!("usage: download <manifest-url | descriptor.json> <output>");
        return ExitCode::FAILURE;
    };

    let descriptor = if source.ends_with(".json") {
        let parsed = std::fs::read_to_string(&source)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                serde_json::from_str::<MediaDescriptor>(&text).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(path = %source, error = %e, "Invalid descriptor file");
                return ExitCode::FAILURE;
            }
        }
    } else {
        MediaDescriptor::new(source).with_protocol("hls")
    };

    let downloader = match HlsDownloader::new(HlsConfig::default()) {
        Ok(downloader) => downloader,
        Err(e) => {
            error!(error = %e, "Failed to create downloader");
            return ExitCode::FAILURE;
        }
    };

    let (tx, mut rx) = mpsc::channel(64);
    let ctx = JobContext::new().with_events(tx);

    let cancel = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling download");
            cancel.cancel();
        }
    });

    let reporter = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                JobEvent::StateChanged { from, to } => info!(%from, %to, "State"),
                JobEvent::Progress(p) => info!(
                    percent = format!("{:.1}", p.percent),
                    bytes = p.bytes_downloaded,
                    segments = format!("{}/{}", p.segments_done, p.segments_total),
                    "Progress"
                ),
                JobEvent::StrategySelected(strategy) => info!(%strategy, "Merge strategy"),
                JobEvent::SegmentDownloaded { .. } => {}
            }
        }
    });

    let result = downloader.download(&descriptor, &output, ctx).await;
    let _ = reporter.await;

    match result {
        Ok(report) if report.success() => {
            info!(output = %output, bytes = report.bytes_downloaded, "Download complete");
            ExitCode::SUCCESS
        }
        Ok(report) => {
            error!(status = ?report.status, cause = ?report.cause, "Download did not complete");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Download could not start");
            ExitCode::FAILURE
        }
    }
}
