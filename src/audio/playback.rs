//! Audio playback to system speakers via cpal.
//!
//! The output stream callback pulls rendered audio from a shared [`Mixer`].
//! Everything about *what* plays and *when* is decided by the playback
//! scheduler through the mixer; this module only owns the device.

use crate::audio::mixer::{AudioGraph, Mixer};
use crate::config::AudioConfig;
use crate::error::{DeviceError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A continuously running output stream rendering a [`Mixer`].
pub struct CpalPlayback {
    device: cpal::Device,
    stream_config: StreamConfig,
    mixer: Mixer,
    stream: Option<cpal::Stream>,
    errors: mpsc::UnboundedSender<String>,
}

impl CpalPlayback {
    /// Open the configured (or default) output device and start rendering.
    ///
    /// Stream errors reported by the backend are forwarded to `errors` so the
    /// owner can [`restart`](Self::restart) the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the stream
    /// cannot be started.
    pub fn start(
        config: &AudioConfig,
        mixer: Mixer,
        errors: mpsc::UnboundedSender<String>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(DeviceError::from)?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| DeviceError::NotFound(format!("output device '{name}'")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| DeviceError::NotFound("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let channels = device
            .default_output_config()
            .map(|c| c.channels())
            .unwrap_or(1);

        let stream_config = StreamConfig {
            channels,
            sample_rate: mixer.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut playback = Self {
            device,
            stream_config,
            mixer,
            stream: None,
            errors,
        };
        playback.open()?;
        Ok(playback)
    }

    /// Rebuild the output stream after a backend error.
    ///
    /// The new stream renders the same [`Mixer`], whose clock keeps running,
    /// so scheduled speech and gain ramps resume where they stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be rebuilt.
    pub fn restart(&mut self) -> Result<()> {
        warn!("restarting audio output stream");
        self.stream = None;
        self.open()
    }

    fn open(&mut self) -> Result<()> {
        let mixer = self.mixer.clone();
        let channels = self.stream_config.channels;
        let errors = self.errors.clone();

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    mixer.render_interleaved(data, channels);
                },
                move |err| {
                    error!("audio output stream error: {err}");
                    let _ = errors.send(err.to_string());
                },
                None,
            )
            .map_err(DeviceError::from)?;

        stream
            .play()
            .map_err(DeviceError::from)?;

        info!(
            "audio output started: {}Hz, {} channels",
            self.stream_config.sample_rate, channels
        );
        self.stream = Some(stream);
        Ok(())
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(DeviceError::from)?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        if self.stream.take().is_some() {
            info!("audio output stopped");
        }
    }
}
