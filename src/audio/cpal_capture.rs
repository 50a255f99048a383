//! Microphone capture with cpal
//!
//! Works with PipeWire, PulseAudio, ALSA and CoreAudio. `cpal::Stream`
//! is not Send, so the stream lives on a dedicated thread; chunks of mono
//! 16 kHz samples come back over a channel.

use crate::error::AudioError;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread;
use std::time::Duration;

/// Sample rate whisper expects
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Chunks buffered before the callback starts dropping them
const CHUNK_BUFFER: usize = 256;

/// How long start waits for the stream thread to report in
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters for building an audio input stream
struct StreamBuildParams {
    tx: SyncSender<Vec<f32>>,
    source_rate: u32,
    target_rate: u32,
    source_channels: usize,
}

/// cpal-based audio capture
pub struct CpalCapture {
    /// Device name, or "default"
    device: String,
    /// Dropping this stops the capture thread
    stop_tx: Option<Sender<()>>,
    /// Handle to the capture thread
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl CpalCapture {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            stop_tx: None,
            thread_handle: None,
        }
    }

    /// Open the device and start streaming chunks
    pub fn start(&mut self) -> Result<Receiver<Vec<f32>>, AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = if self.device == "default" {
            host.default_input_device()
                .ok_or_else(|| AudioError::DeviceNotFound("default".to_string()))?
        } else {
            find_audio_device(&host, &self.device)?
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        tracing::info!("Using audio device: {}", device_name);

        let supported_config = device
            .default_input_config()
            .map_err(|e| AudioError::Connection(e.to_string()))?;
        let source_sample_rate = supported_config.sample_rate().0;
        let source_channels = supported_config.channels() as usize;
        let sample_format = supported_config.sample_format();

        tracing::debug!(
            "Device config: {} Hz, {} channel(s), format: {:?}",
            source_sample_rate,
            source_channels,
            sample_format
        );

        let (chunk_tx, chunk_rx) = mpsc::sync_channel(CHUNK_BUFFER);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();

        let thread_handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream_config = cpal::StreamConfig {
                    channels: supported_config.channels(),
                    sample_rate: supported_config.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                };
                let err_fn = |err| tracing::error!("Audio stream error: {}", err);
                let params = StreamBuildParams {
                    tx: chunk_tx,
                    source_rate: source_sample_rate,
                    target_rate: TARGET_SAMPLE_RATE,
                    source_channels,
                };

                let stream_result = match sample_format {
                    cpal::SampleFormat::F32 => {
                        build_stream::<f32>(&device, &stream_config, params, err_fn)
                    }
                    cpal::SampleFormat::I16 => {
                        build_stream::<i16>(&device, &stream_config, params, err_fn)
                    }
                    cpal::SampleFormat::U16 => {
                        build_stream::<u16>(&device, &stream_config, params, err_fn)
                    }
                    format => Err(AudioError::StreamError(format!(
                        "Unsupported sample format: {:?}",
                        format
                    ))),
                };

                let stream = match stream_result {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                tracing::debug!("Audio capture thread started");

                // Runs until stop() sends or drops the sender
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("Audio capture thread stopped");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => {
                drop(stop_tx);
                return Err(AudioError::Connection(
                    "Audio stream did not start in time".to_string(),
                ));
            }
        }

        self.stop_tx = Some(stop_tx);
        self.thread_handle = Some(thread_handle);
        Ok(chunk_rx)
    }

    /// Stop streaming. The chunk receiver disconnects once the stream is gone.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find an input device by name
///
/// Tries an exact match, then a case-insensitive match, then a
/// case-insensitive substring, so PipeWire short names and partial names
/// both work.
fn find_audio_device(host: &cpal::Host, device_name: &str) -> Result<cpal::Device, AudioError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| AudioError::Connection(e.to_string()))?
        .filter_map(|d| d.name().ok().map(|name| (name, d)))
        .collect();

    let wanted = device_name.to_lowercase();
    let rank = |name: &str| {
        if name == device_name {
            Some(0)
        } else if name.to_lowercase() == wanted {
            Some(1)
        } else if name.to_lowercase().contains(&wanted) {
            Some(2)
        } else {
            None
        }
    };

    let names: Vec<String> = devices.iter().map(|(name, _)| name.clone()).collect();
    let best = devices
        .into_iter()
        .filter_map(|(name, device)| rank(&name).map(|r| (r, name, device)))
        .min_by_key(|(r, _, _)| *r);

    match best {
        Some((_, name, device)) => {
            tracing::debug!("Matched audio device '{}' for '{}'", name, device_name);
            Ok(device)
        }
        None if names.is_empty() => Err(AudioError::DeviceNotFound(format!(
            "{} (no audio input devices found)",
            device_name
        ))),
        None => Err(AudioError::DeviceNotFound(format!(
            "{} (available: {})",
            device_name,
            names.join(", ")
        ))),
    }
}

/// Build an input stream for a specific sample type
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    params: StreamBuildParams,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use cpal::traits::DeviceTrait;

    let StreamBuildParams {
        tx,
        source_rate,
        target_rate,
        source_channels,
    } = params;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Convert to f32 and mix to mono
                let mono_f32: Vec<f32> = data
                    .chunks(source_channels)
                    .map(|frame| {
                        let sum: f32 = frame
                            .iter()
                            .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                            .sum();
                        sum / source_channels as f32
                    })
                    .collect();

                // Resample if needed
                let resampled = if source_rate != target_rate {
                    resample(&mono_f32, source_rate, target_rate)
                } else {
                    mono_f32
                };

                // Receiver might be gone or behind; dropping a chunk is fine
                let _ = tx.try_send(resampled);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    Ok(stream)
}

/// Linear interpolation resampling
/// For better quality, consider using the `rubato` crate
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples.get(idx).copied().unwrap_or(0.0)
        };

        output.push(sample);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_same_rate() {
        let samples = vec![1.0, 2.0, 3.0, 4.0];
        let result = resample(&samples, 16000, 16000);
        assert_eq!(result, samples);
    }

    #[test]
    fn test_resample_downsample() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let result = resample(&samples, 48000, 16000);
        // 48000 -> 16000 is 3:1 ratio, so 8 samples -> ~3 samples
        assert!(result.len() >= 2 && result.len() <= 4);
    }

    #[test]
    fn test_resample_upsample() {
        let samples = vec![1.0, 2.0];
        let result = resample(&samples, 8000, 16000);
        // 8000 -> 16000 is 1:2 ratio, so 2 samples -> 4 samples
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_resample_empty() {
        let samples: Vec<f32> = vec![];
        let result = resample(&samples, 48000, 16000);
        assert!(result.is_empty());
    }
}
