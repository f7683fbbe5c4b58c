//! Swing Capture - audio-triggered multi-camera swing recording.
//!
//! Cameras and a microphone run continuously into short histories. When the
//! classifier hears a club strike, every camera's history plus the frames
//! that follow are saved as one clip per shot.

pub mod buffer;
pub mod capture;
pub mod config;
pub mod detection;
pub mod events;
pub mod recorder;
pub mod session;
pub mod utils;
pub mod workers;

use config::CaptureConfig;
use events::CaptureEvent;
use session::{Backends, CaptureSession};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_ENV: &str = "SWING_CAPTURE_CONFIG";

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("swing-capture")
                .join("config.json")
        })
}

/// Initialize logging and run the command given on the command line
pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swing_capture_lib=debug,swing_capture=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Swing Capture v{}", env!("CARGO_PKG_VERSION"));

    let path = config_path();
    match std::env::args().nth(1).as_deref() {
        Some("devices") => {
            list_devices();
            Ok(())
        }
        Some("init") => {
            let config = CaptureConfig::load(&path)?;
            config.save(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Some(other) if other != "capture" => {
            anyhow::bail!("Unknown command {:?} (expected capture, devices or init)", other)
        }
        _ => {
            let config = CaptureConfig::load(&path)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(capture(config))
        }
    }
}

fn list_devices() {
    println!("Cameras:");
    for camera in capture::list_cameras() {
        println!("  {}: {}", camera.index, camera.name);
    }
    println!("Audio inputs:");
    for device in capture::list_audio_devices() {
        let default = if device.is_default { " (default)" } else { "" };
        println!("  {}{} {} Hz", device.name, default, device.sample_rate);
    }
}

async fn capture(config: CaptureConfig) -> anyhow::Result<()> {
    if config.cameras.is_empty() {
        tracing::warn!("No cameras configured, set them in {}", config_path().display());
    }
    let backends = Backends::system(&config);
    let session = CaptureSession::start(config, backends).await?;
    let events = tokio::spawn(log_events(session.subscribe()));

    println!("Session folder: {}", session.session_dir().display());
    println!("Cameras: {}", session.camera_ids().join(", "));
    println!("Commands: t = trigger, n [clip] = not a shot, a = arm/disarm, l = list clips, q = quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "t" => {
                        session.manual_trigger();
                    }
                    "n" => match session.mark_not_shot().await {
                        Ok(Some(clip)) => println!("{} marked as not a shot", clip.name),
                        Ok(None) => println!("No clip to mark"),
                        Err(e) => tracing::error!("Mark not shot failed: {}", e),
                    },
                    command if command.starts_with("n ") => {
                        let name = command[2..].trim();
                        match session.visible_clips().into_iter().find(|c| c.name == name) {
                            Some(clip) => match session.mark_clip_not_shot(clip.id).await {
                                Ok(clip) => println!("{} marked as not a shot", clip.name),
                                Err(e) => tracing::error!("Mark not shot failed: {}", e),
                            },
                            None => println!("No clip named {:?}", name),
                        }
                    }
                    "a" => session.set_armed(!session.is_armed()),
                    "l" => {
                        let (shots, not_shots) = session.training_counts();
                        println!(
                            "Classifier {:?}, {} shots / {} not shots labeled",
                            session.classifier_mode(),
                            shots,
                            not_shots
                        );
                        for clip in session.visible_clips() {
                            println!("{}  {:.2}s  {:?}", clip.name, clip.duration_seconds, clip.status);
                        }
                    }
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command {:?}", other),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop().await;
    events.abort();
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<CaptureEvent>) {
    loop {
        match events.recv().await {
            Ok(CaptureEvent::Trigger(trigger)) => tracing::info!(
                "Trigger {:?} at {}us (confidence {:.2})",
                trigger.source,
                trigger.timestamp_us,
                trigger.confidence
            ),
            Ok(CaptureEvent::ClipCompleted(clip)) => println!("Saved {}", clip.name),
            Ok(CaptureEvent::ClipFailed { message, .. }) => println!("Clip failed: {}", message),
            Ok(CaptureEvent::ArmedChanged(armed)) => {
                println!("{}", if armed { "Armed" } else { "Disarmed" })
            }
            Ok(CaptureEvent::Status(status)) => {
                tracing::warn!("[{}] {}: {}", status.kind.code(), status.source, status.message)
            }
            Ok(CaptureEvent::CameraFps { camera_id, fps }) => {
                tracing::debug!("Camera {} at {:.1} fps", camera_id, fps)
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
