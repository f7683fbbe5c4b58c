//! Clip encoding
//!
//! Per-camera videos are encoded by piping raw RGB frames into an FFmpeg
//! subprocess; thumbnails are written as PNG with the `png` crate.

use super::{RecordingError, RecordingResult};
use crate::capture::transform::resize;
use crate::capture::{Frame, Image};
use crate::utils::fs::write_atomic;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;

/// Writes a clip's artifacts. Called from a blocking thread.
pub trait ClipWriter: Send + Sync {
    /// Encode timestamp-ordered frames into one video file
    fn write_video(&self, path: &Path, frames: &[Arc<Frame>], fps: u32) -> RecordingResult<()>;

    /// Scale `image` to `width`x`height` and save it
    fn write_thumbnail(&self, path: &Path, image: &Image, width: u32, height: u32) -> RecordingResult<()>;
}

/// H.264 quality settings
#[derive(Debug, Clone)]
pub struct FfmpegClipWriter {
    pub preset: String,
    pub crf: u8,
}

impl Default for FfmpegClipWriter {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            crf: 23,
        }
    }
}

impl ClipWriter for FfmpegClipWriter {
    fn write_video(&self, path: &Path, frames: &[Arc<Frame>], fps: u32) -> RecordingResult<()> {
        let first = frames.first().ok_or(RecordingError::NoFrames)?;
        let (width, height) = (first.image.width, first.image.height);

        // Encode next to the target and rename when FFmpeg succeeds
        let partial = partial_path(path);
        let mut encoder = VideoEncoder::new(&partial, width, height, fps, &self.preset, self.crf)?;
        for frame in frames {
            if frame.image.width == width && frame.image.height == height {
                encoder.write_frame(&frame.image.pixels)?;
            } else {
                // Source reconnected at a different resolution mid-clip
                encoder.write_frame(&resize(&frame.image, width, height).pixels)?;
            }
        }
        let written = encoder.frame_count();
        if let Err(e) = encoder.finish() {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, path)?;
        tracing::debug!("Encoded {} frames to {:?}", written, path);
        Ok(())
    }

    fn write_thumbnail(&self, path: &Path, image: &Image, width: u32, height: u32) -> RecordingResult<()> {
        let thumb = resize(image, width, height);
        let bytes = encode_png(&thumb)?;
        write_atomic(path, &bytes)?;
        Ok(())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Encode an RGB image as PNG
pub fn encode_png(image: &Image) -> RecordingResult<Vec<u8>> {
    let mut bytes = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut bytes, image.width, image.height);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| RecordingError::Thumbnail(e.to_string()))?;
        writer
            .write_image_data(&image.pixels)
            .map_err(|e| RecordingError::Thumbnail(e.to_string()))?;
    }
    Ok(bytes)
}

/// Video encoder fed with raw RGB24 frames on stdin
struct VideoEncoder {
    process: Child,
    stdin: ChildStdin,
    frame_count: u64,
}

impl VideoEncoder {
    fn new(output: &Path, width: u32, height: u32, fps: u32, preset: &str, crf: u8) -> RecordingResult<Self> {
        let args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgb24".to_string(),
            "-s".to_string(),
            format!("{}x{}", width, height),
            "-r".to_string(),
            fps.to_string(),
            "-i".to_string(),
            "-".to_string(),
            // yuv420p needs even dimensions
            "-vf".to_string(),
            "pad=ceil(iw/2)*2:ceil(ih/2)*2".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            preset.to_string(),
            "-crf".to_string(),
            crf.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            output.to_string_lossy().to_string(),
        ];

        tracing::debug!("Starting FFmpeg encoder: {:?}", args);

        let mut process = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RecordingError::Encoder(format!("Failed to start FFmpeg encoder: {}", e)))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| RecordingError::Encoder("Failed to capture FFmpeg stdin".to_string()))?;

        Ok(Self {
            process,
            stdin,
            frame_count: 0,
        })
    }

    fn write_frame(&mut self, rgb: &[u8]) -> RecordingResult<()> {
        self.stdin
            .write_all(rgb)
            .map_err(|e| RecordingError::Encoder(format!("Failed to write frame: {}", e)))?;
        self.frame_count += 1;
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Close stdin and wait for FFmpeg to exit
    fn finish(self) -> RecordingResult<()> {
        drop(self.stdin);

        let output = self
            .process
            .wait_with_output()
            .map_err(|e| RecordingError::Encoder(format!("Failed to wait for FFmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RecordingError::Encoder(format!(
                "FFmpeg exited with error: {}",
                stderr
            )));
        }
        Ok(())
    }
}
