//! Microphone audio capture using cpal.
//!
//! Captures audio at the device's native sample rate, mixes down to mono,
//! resamples to the configured input rate and re-blocks the result into
//! fixed-length [`AudioFrame`]s for the pipeline.

use crate::audio::dsp::{resample_linear, to_mono};
use crate::config::AudioConfig;
use crate::error::{DeviceError, Result};
use crate::pipeline::messages::AudioFrame;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Audio capture from the system microphone via cpal.
pub struct CpalCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    frame_samples: usize,
}

impl CpalCapture {
    /// Open the configured (or default) input device.
    ///
    /// Uses the device's default configuration for maximum compatibility,
    /// then converts to the target rate in software.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotFound`] if the device does not exist and
    /// [`DeviceError::PermissionDenied`] if the OS refuses access.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            host.input_devices()
                .map_err(DeviceError::from)?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| DeviceError::NotFound(format!("input device '{name}'")))?
        } else {
            host.default_input_device()
                .ok_or_else(|| DeviceError::NotFound("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(DeviceError::from)?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            "native input config: {}Hz, {} channels -> {}Hz mono, {}ms frames",
            native_rate, native_channels, config.input_sample_rate, config.frame_ms
        );

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: config.input_sample_rate,
            frame_samples: config.frame_samples(),
        })
    }

    /// Run the capture loop, sending fixed-size frames to `tx`.
    ///
    /// `ready` receives the outcome of opening the stream, so callers can
    /// surface device errors before declaring the session live. Holds the
    /// stream until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio stream cannot be created or started.
    pub async fn run(
        &self,
        tx: mpsc::Sender<AudioFrame>,
        ready: oneshot::Sender<Result<()>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let stream = match self.open_stream(tx) {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = ready.send(Err(e.clone().into()));
                return Err(e.into());
            }
        };

        cancel.cancelled().await;

        drop(stream);
        info!("audio capture stopped");
        Ok(())
    }

    fn open_stream(
        &self,
        tx: mpsc::Sender<AudioFrame>,
    ) -> std::result::Result<cpal::Stream, DeviceError> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let mut framer = Framer::new(target_rate, self.frame_samples);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = to_mono(data, native_channels);
                    let samples = resample_linear(&mono, native_rate, target_rate, 1.0);
                    for frame in framer.push(&samples, Instant::now()) {
                        // Never block the audio thread.
                        if tx.try_send(frame).is_err() {
                            debug!("audio channel full, dropping frame");
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(DeviceError::from)?;

        stream
            .play()
            .map_err(DeviceError::from)?;

        info!(
            "audio capture started: native {}Hz -> target {}Hz",
            native_rate, target_rate
        );
        Ok(stream)
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
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

/// Re-blocks arbitrary callback buffers into fixed-length frames.
///
/// Each push is anchored to the callback's wall-clock instant: the newest
/// buffered sample is taken to have arrived at `now` and frame starts are
/// counted back from it. Resampling rounding therefore never accumulates
/// into drift against [`Instant::now`].
#[derive(Debug)]
pub struct Framer {
    sample_rate: u32,
    frame_len: usize,
    buf: Vec<f32>,
}

impl Framer {
    /// Frames of `frame_len` samples at `sample_rate`.
    pub fn new(sample_rate: u32, frame_len: usize) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frame_len: frame_len.max(1),
            buf: Vec::with_capacity(frame_len * 2),
        }
    }

    /// Append samples received at `now`, returning any completed frames.
    pub fn push(&mut self, samples: &[f32], now: Instant) -> Vec<AudioFrame> {
        self.buf.extend_from_slice(samples);

        let mut frames = Vec::with_capacity(self.buf.len() / self.frame_len);
        while self.buf.len() >= self.frame_len {
            let age = self.samples_duration(self.buf.len());
            frames.push(AudioFrame {
                samples: self.buf.drain(..self.frame_len).collect(),
                sample_rate: self.sample_rate,
                captured_at: now.checked_sub(age).unwrap_or(now),
            });
        }
        frames
    }

    fn samples_duration(&self, samples: usize) -> Duration {
        Duration::from_nanos(samples as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}
