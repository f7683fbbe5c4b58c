//! Local webcam source using nokhwa

use super::traits::{CameraInfo, FrameSource, Image};
use super::CaptureError;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;

/// Get list of available cameras
pub fn list_cameras() -> Vec<CameraInfo> {
    match nokhwa::query(ApiBackend::Auto) {
        Ok(cameras) => cameras
            .into_iter()
            .filter_map(|info| match info.index() {
                CameraIndex::Index(i) => Some(CameraInfo {
                    index: *i,
                    name: info.human_name().to_string(),
                }),
                CameraIndex::String(_) => None,
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate cameras: {:?}", e);
            Vec::new()
        }
    }
}

/// An open webcam stream. Must stay on the thread that opened it.
pub struct WebcamSource {
    index: u32,
    camera: Camera,
    open: bool,
}

impl WebcamSource {
    pub fn open(index: u32) -> Result<Self, CaptureError> {
        let format =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);

        let mut camera = Camera::new(CameraIndex::Index(index), format).map_err(|e| {
            CaptureError::SourceUnavailable(format!("Failed to open camera {}: {:?}", index, e))
        })?;

        camera.open_stream().map_err(|e| {
            CaptureError::SourceUnavailable(format!(
                "Failed to open stream for camera {}: {:?}",
                index, e
            ))
        })?;

        let camera_format = camera.camera_format();
        tracing::info!(
            "Webcam {} opened: {}x{} @ {}fps, format={:?}",
            index,
            camera_format.resolution().width(),
            camera_format.resolution().height(),
            camera_format.frame_rate(),
            camera_format.format()
        );

        Ok(Self {
            index,
            camera,
            open: true,
        })
    }
}

impl FrameSource for WebcamSource {
    fn read_frame(&mut self) -> Result<Option<Image>, CaptureError> {
        // Blocks until the camera delivers the next frame
        let buffer = self.camera.frame().map_err(|e| {
            CaptureError::StreamInterrupted(format!("Camera {} read failed: {:?}", self.index, e))
        })?;

        match buffer.decode_image::<RgbFormat>() {
            Ok(decoded) => {
                let (width, height) = (decoded.width(), decoded.height());
                Ok(Some(Image::new(width, height, decoded.into_raw())))
            }
            Err(e) => {
                // A single corrupt MJPEG frame is not a disconnect
                tracing::debug!("Camera {} frame decode failed: {:?}", self.index, e);
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            if let Err(e) = self.camera.stop_stream() {
                tracing::warn!("Error stopping camera {} stream: {:?}", self.index, e);
            }
            self.open = false;
        }
    }
}

impl Drop for WebcamSource {
    fn drop(&mut self) {
        self.close();
    }
}
