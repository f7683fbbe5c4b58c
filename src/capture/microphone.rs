//! Microphone source using cpal
//!
//! cpal::Stream is not Send, so the stream is built on the audio worker's
//! thread and owned by the source. The device callback down-mixes to mono,
//! resamples to the session rate and forwards blocks through a channel;
//! `read_chunk` reassembles them into fixed-size chunks.

use super::traits::{AudioDeviceInfo, AudioOpener, AudioSource};
use super::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

/// No audio for this long means the device is gone
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Enumerate input devices
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("Failed to enumerate audio devices: {}", e);
            return Vec::new();
        }
    };

    devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_input_config().ok()?;
            Some(AudioDeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                sample_rate: config.sample_rate().0,
                channels: config.channels(),
            })
        })
        .collect()
}

/// Find an input device by name: exact, then case-insensitive, then substring
fn find_input_device(host: &cpal::Host, wanted: &str) -> Result<cpal::Device, CaptureError> {
    let devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?
        .filter_map(|d| d.name().ok().map(|n| (n, d)))
        .collect();

    let wanted_lower = wanted.to_lowercase();
    let position = devices
        .iter()
        .position(|(n, _)| n == wanted)
        .or_else(|| devices.iter().position(|(n, _)| n.to_lowercase() == wanted_lower))
        .or_else(|| devices.iter().position(|(n, _)| n.to_lowercase().contains(&wanted_lower)));

    match position {
        Some(i) => {
            let (name, device) = devices.into_iter().nth(i).ok_or_else(|| {
                CaptureError::SourceUnavailable(format!("Audio device {} vanished", wanted))
            })?;
            tracing::debug!("Found audio device {} (searched for: {})", name, wanted);
            Ok(device)
        }
        None => {
            let available: Vec<String> = devices.into_iter().map(|(n, _)| n).collect();
            Err(CaptureError::SourceUnavailable(format!(
                "Audio device {} not found. Available: {}",
                wanted,
                available.join(", ")
            )))
        }
    }
}

/// Opens the configured (or default) input device
#[derive(Debug, Clone)]
pub struct MicrophoneOpener {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub chunk_size: usize,
}

impl AudioOpener for MicrophoneOpener {
    fn open(&self) -> Result<Box<dyn AudioSource>, CaptureError> {
        Ok(Box::new(MicrophoneSource::open(
            self.device.as_deref(),
            self.sample_rate,
            self.chunk_size,
        )?))
    }
}

/// A live cpal input stream
pub struct MicrophoneSource {
    _stream: cpal::Stream,
    rx: Receiver<Vec<f32>>,
    failed: Arc<AtomicBool>,
    pending: VecDeque<f32>,
    sample_rate: u32,
    chunk_size: usize,
}

impl MicrophoneSource {
    pub fn open(
        device_name: Option<&str>,
        sample_rate: u32,
        chunk_size: usize,
    ) -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = match device_name {
            None | Some("default") => host.default_input_device().ok_or_else(|| {
                CaptureError::SourceUnavailable("No default audio input device".to_string())
            })?,
            Some(name) => find_input_device(&host, name)?,
        };

        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let supported = device
            .default_input_config()
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;

        let source_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let sample_format = supported.sample_format();

        tracing::info!(
            "Using audio device {}: {} Hz, {} channel(s), format {:?}",
            name,
            source_rate,
            channels,
            sample_format
        );

        let stream_config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx) = mpsc::sync_channel(256);
        let failed = Arc::new(AtomicBool::new(false));
        let params = StreamParams {
            tx,
            failed: failed.clone(),
            source_rate,
            target_rate: sample_rate,
            channels,
        };

        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, params)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, params)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, params)?,
            format => {
                return Err(CaptureError::Unsupported(format!(
                    "sample format {:?}",
                    format
                )))
            }
        };

        stream
            .play()
            .map_err(|e| CaptureError::SourceUnavailable(format!("Failed to start audio stream: {}", e)))?;

        Ok(Self {
            _stream: stream,
            rx,
            failed,
            pending: VecDeque::with_capacity(chunk_size * 4),
            sample_rate,
            chunk_size,
        })
    }
}

impl AudioSource for MicrophoneSource {
    fn read_chunk(&mut self) -> Result<Vec<f32>, CaptureError> {
        while self.pending.len() < self.chunk_size {
            if self.failed.load(Ordering::Relaxed) {
                return Err(CaptureError::StreamInterrupted(
                    "Audio device reported an error".to_string(),
                ));
            }
            match self.rx.recv_timeout(READ_TIMEOUT) {
                Ok(block) => self.pending.extend(block),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(CaptureError::StreamInterrupted(
                        "No audio from device".to_string(),
                    ))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CaptureError::StreamInterrupted(
                        "Audio stream closed".to_string(),
                    ))
                }
            }
        }
        Ok(self.pending.drain(..self.chunk_size).collect())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

struct StreamParams {
    tx: SyncSender<Vec<f32>>,
    failed: Arc<AtomicBool>,
    source_rate: u32,
    target_rate: u32,
    channels: usize,
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    params: StreamParams,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let StreamParams {
        tx,
        failed,
        source_rate,
        target_rate,
        channels,
    } = params;

    let err_failed = failed.clone();
    let err_fn = move |err: cpal::StreamError| {
        tracing::error!("Audio stream error: {}", err);
        err_failed.store(true, Ordering::Relaxed);
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(channels.max(1))
                    .map(|frame| {
                        let sum: f32 = frame
                            .iter()
                            .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                            .sum();
                        sum / frame.len() as f32
                    })
                    .collect();
                let block = resample(&mono, source_rate, target_rate);
                // Drop the block if the worker is behind; it must never block the callback
                let _ = tx.try_send(block);
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::SourceUnavailable(format!("Failed to build audio stream: {}", e)))
}

/// Linear interpolation resampling
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src = i as f64 / ratio;
        let idx = src.floor() as usize;
        let frac = (src - idx as f64) as f32;
        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples.get(idx).copied().unwrap_or(0.0)
        };
        output.push(sample);
    }

    output
}
