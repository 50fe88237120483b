//! Synthetic instant-replay example.
//!
//! Captures synthetic frames for a few seconds, changes resolution midway,
//! then saves the buffered window to `replay.mp4`. Needs `ffmpeg` on PATH.
//!
//! Run with: cargo run --example synthetic_replay

use std::time::Duration;

use instant_replay::{
    CaptureSource, ClipOutcome, EncoderPolicy, ForcedBackend, InstantReplay, RecordingSettings,
    SyntheticSource,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "instant_replay=info".into()),
        )
        .init();

    let settings = RecordingSettings {
        width: 640,
        height: 360,
        fps: 30,
        retention_seconds: 10,
        ..Default::default()
    };

    println!("Capturing synthetic frames for 6 seconds...");

    let mut session = InstantReplay::builder()
        .settings(settings)
        .policy(EncoderPolicy {
            forced_backend: ForcedBackend::Auto,
            strict_gpu_only: false,
        })
        // Switch to 720p after three seconds to exercise an encoder restart.
        .capture_source(|settings| {
            let source = SyntheticSource::from_settings(settings).with_resolution_change(
                u64::from(settings.fps) * 3,
                1280,
                720,
            );
            Ok(Box::new(source) as Box<dyn CaptureSource>)
        })
        .on_status(|status| println!("status: {status}"))
        .start()
        .await?;

    tokio::time::sleep(Duration::from_secs(6)).await;

    match session.save_clip("replay.mp4").await? {
        ClipOutcome::Written { path, bytes } => {
            println!("Saved {} ({bytes} bytes)", path.display());
        }
        ClipOutcome::Skipped => println!("Nothing buffered yet"),
    }

    println!("Debug: {}", session.debug_status());
    session.stop().await;
    println!("Stats: {:?}", session.stats());

    Ok(())
}
