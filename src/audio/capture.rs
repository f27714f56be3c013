// Microphone capture through cpal. Only compiled with the `mic` feature.

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};

use crate::audio::source::{append_downmixed_samples, AudioSource, AudioTrack, BlockSink};
use crate::error::EngineError;

/// Live input device exposed as an [`AudioSource`].
///
/// A missing device is not an error here: it surfaces as a source without an
/// audio track, so the graph reports `NoAudioTrack` at start-up.
pub struct MicSource {
    device: Option<cpal::Device>,
    config: Option<cpal::SupportedStreamConfig>,
    stream: Option<cpal::Stream>,
}

impl MicSource {
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().context("no input devices available")?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    pub fn new(preferred_device: Option<&str>) -> Self {
        let host = cpal::default_host();
        let device = match preferred_device {
            Some(name) => host.input_devices().ok().and_then(|mut devices| {
                devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
            }),
            None => host.default_input_device(),
        };
        let config = device.as_ref().and_then(|d| match d.default_input_config() {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Input device has no usable config: {}", e);
                None
            }
        });
        Self {
            device,
            config,
            stream: None,
        }
    }

    pub fn device_name(&self) -> String {
        self.device
            .as_ref()
            .and_then(|d| d.name().ok())
            .unwrap_or_else(|| "Unknown Device".to_string())
    }
}

impl AudioSource for MicSource {
    fn audio_track(&self) -> Option<AudioTrack> {
        self.device.as_ref()?;
        Some(AudioTrack {
            label: self.device_name(),
            enabled: true,
            live: self.config.is_some(),
        })
    }

    fn sample_rate(&self) -> u32 {
        self.config.as_ref().map(|c| c.sample_rate().0).unwrap_or(0)
    }

    fn connect(&mut self, mut sink: BlockSink) -> Result<(), EngineError> {
        let device = self.device.as_ref().ok_or(EngineError::NoAudioTrack)?;
        let supported = self.config.clone().ok_or(EngineError::InactiveTrack)?;
        if self.stream.is_some() {
            return Err(EngineError::AudioContext(
                "input stream already connected".to_string(),
            ));
        }

        let format = supported.sample_format();
        let stream_config: StreamConfig = supported.into();
        let channels = usize::from(stream_config.channels.max(1));
        let mut scratch: Vec<f32> = Vec::new();
        let err_fn = |err| tracing::warn!("audio stream error: {}", err);

        let stream = match format {
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _| {
                    scratch.clear();
                    append_downmixed_samples(&mut scratch, data, channels, |s| s);
                    sink(&scratch);
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _| {
                    scratch.clear();
                    append_downmixed_samples(&mut scratch, data, channels, |s| {
                        s as f32 / 32_768.0
                    });
                    sink(&scratch);
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &stream_config,
                move |data: &[u16], _| {
                    scratch.clear();
                    append_downmixed_samples(&mut scratch, data, channels, |s| {
                        (s as f32 - 32_768.0) / 32_768.0
                    });
                    sink(&scratch);
                },
                err_fn,
                None,
            ),
            other => {
                return Err(EngineError::AudioContext(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        }
        .map_err(|e| EngineError::AudioContext(e.to_string()))?;

        self.stream = Some(stream);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| EngineError::AudioContext("input stream not connected".to_string()))?;
        stream
            .play()
            .map_err(|e| EngineError::AudioContext(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::warn!("Failed to pause input stream: {}", e);
            }
        }
    }
}
