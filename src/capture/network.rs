//! Network camera source
//!
//! Any URL ffmpeg can open (RTSP, HTTP MJPEG, phone camera apps) is decoded by
//! an ffmpeg subprocess to raw RGB24 frames on stdout.

use super::traits::{FrameSource, Image};
use super::CaptureError;
use std::io::{BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};

/// Default socket read timeout for network streams
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Network stream decoded by ffmpeg
pub struct NetworkSource {
    url: String,
    process: Child,
    stdout: BufReader<ChildStdout>,
    width: u32,
    height: u32,
    frame_size: usize,
    frames_read: u64,
}

impl NetworkSource {
    /// Probe the stream for dimensions, then start decoding
    pub fn open(url: &str, timeout_ms: u64) -> Result<Self, CaptureError> {
        let (width, height) = probe_stream(url, timeout_ms)?;

        tracing::info!("Opening network stream {}: {}x{}", url, width, height);

        let timeout_us = (timeout_ms * 1_000).to_string();
        let mut process = Command::new("ffmpeg")
            .args([
                "-loglevel",
                "error",
                "-rw_timeout",
                &timeout_us,
                "-fflags",
                "nobuffer",
                "-i",
                url,
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgb24",
                "-s",
                &format!("{}x{}", width, height),
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::SourceUnavailable(format!("Failed to start FFmpeg: {}", e)))?;

        let frame_size = (width * height * 3) as usize;
        let stdout = process.stdout.take().ok_or_else(|| {
            CaptureError::SourceUnavailable("Failed to capture FFmpeg stdout".to_string())
        })?;

        Ok(Self {
            url: url.to_string(),
            process,
            stdout: BufReader::with_capacity(frame_size * 2, stdout),
            width,
            height,
            frame_size,
            frames_read: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

impl FrameSource for NetworkSource {
    fn read_frame(&mut self) -> Result<Option<Image>, CaptureError> {
        let mut buffer = vec![0u8; self.frame_size];
        match self.stdout.read_exact(&mut buffer) {
            Ok(()) => {
                self.frames_read += 1;
                Ok(Some(Image::new(self.width, self.height, buffer)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
                CaptureError::StreamInterrupted(format!("{} ended after {} frames", self.url, self.frames_read)),
            ),
            Err(e) => Err(CaptureError::StreamInterrupted(format!(
                "Failed to read frame from {}: {}",
                self.url, e
            ))),
        }
    }

    fn close(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

impl Drop for NetworkSource {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

/// Ask ffprobe for the first video stream's dimensions
fn probe_stream(url: &str, timeout_ms: u64) -> Result<(u32, u32), CaptureError> {
    let timeout_us = (timeout_ms * 1_000).to_string();
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-rw_timeout",
            &timeout_us,
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0",
            url,
        ])
        .output()
        .map_err(|e| CaptureError::SourceUnavailable(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CaptureError::SourceUnavailable(format!(
            "ffprobe failed for {}: {}",
            url,
            stderr.trim()
        )));
    }

    parse_dimensions(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| CaptureError::SourceUnavailable(format!("No video stream at {}", url)))
}

/// Parse `width,height` from ffprobe csv output
fn parse_dimensions(stdout: &str) -> Option<(u32, u32)> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut parts = line.trim().trim_end_matches(',').split(',');
    let width: u32 = parts.next()?.trim().parse().ok()?;
    let height: u32 = parts.next()?.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}
