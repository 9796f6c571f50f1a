//! Real-time audio capture using CPAL.
//!
//! Opens an input device, captures all native channels at 16 kHz, and
//! delivers single-channel f32 frames to a registered callback on the audio
//! backend's real-time thread. Channel selection (rather than downmixing)
//! happens here: when `force_single_channel` is set, only
//! `input_channel_index` of the interleaved stream is delivered.

use crate::config::AudioCaptureConfig;
use crate::error::{Result, RtSttError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};

/// Environment switches that keep JACK/ALSA/PipeWire from spamming stderr
/// while CPAL probes the available backends.
const PROBE_QUIET_ENV: &[(&str, &str)] = &[
    ("JACK_NO_START_SERVER", "1"),
    ("JACK_NO_AUDIO_RESERVATION", "1"),
    ("PIPEWIRE_DEBUG", "0"),
    ("ALSA_DEBUG", "0"),
    ("PW_LOG", "0"),
];

/// Quiet the audio backends' probe-time chatter.
///
/// Must run at startup, before any threads are spawned.
pub fn suppress_audio_warnings() {
    for (key, value) in PROBE_QUIET_ENV {
        // SAFETY: called before any other thread can read the environment.
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

/// Run a closure with stderr redirected to `/dev/null`, for backend probing
/// that prints harmless but confusing warnings.
///
/// # Safety
/// Swaps fd 2 around the closure via `dup`/`dup2`; safe while no other
/// thread manipulates stderr concurrently.
fn quiet_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    // SAFETY: fd 2 is restored from the saved duplicate before returning.
    unsafe {
        let stderr_copy = libc::dup(2);
        let sink = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if stderr_copy >= 0 && sink >= 0 {
            libc::dup2(sink, 2);
            libc::close(sink);
        }

        let result = f();

        if stderr_copy >= 0 {
            libc::dup2(stderr_copy, 2);
            libc::close(stderr_copy);
        }

        result
    }
}

/// Callback receiving single-channel f32 frames at 16 kHz.
///
/// Runs on the audio backend's real-time thread: it must not block.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Seam for audio capture so the daemon can be driven without hardware.
pub trait AudioCapture: Send {
    /// Register the frame callback. Must be called before `start`.
    fn set_callback(&mut self, callback: FrameCallback);

    /// Begin delivering frames.
    fn start(&mut self) -> Result<()>;

    /// Stop delivering frames. No callback fires after this returns.
    fn stop(&mut self) -> Result<()>;

    /// Release the device.
    fn shutdown(&mut self) -> Result<()>;

    /// Channel count the device natively captures.
    fn native_channels(&self) -> u16;
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only accessed under the owning struct's exclusive
/// methods; stream handles never cross threads concurrently.
struct SendableStream(cpal::Stream);

// SAFETY: see SendableStream doc comment.
unsafe impl Send for SendableStream {}

/// CPAL-backed capture with channel selection.
pub struct CpalAudioCapture {
    device: cpal::Device,
    device_name: String,
    config: AudioCaptureConfig,
    native_channels: u16,
    /// Channel actually delivered after the fallback check.
    selected_channel: u16,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    stream: Option<SendableStream>,
}

impl CpalAudioCapture {
    /// Open the configured device (or the default) and probe its format.
    ///
    /// A named device that cannot be found falls back to the default with a
    /// warning. A requested channel index beyond the native channel count
    /// falls back to channel 0 with a warning.
    pub fn new(config: AudioCaptureConfig) -> Result<Self> {
        let device = quiet_stderr(|| Self::open_device(&config.device_name))?;
        let device_name = device
            .name()
            .unwrap_or_else(|_| "<unnamed>".to_string());

        let default_config = quiet_stderr(|| device.default_input_config())
            .map_err(|e| RtSttError::DeviceOpenFailed {
                device: device_name.clone(),
                message: format!("failed to query input format: {}", e),
            })?;
        let native_channels = default_config.channels();

        let selected_channel = if config.input_channel_index < native_channels {
            config.input_channel_index
        } else {
            eprintln!(
                "rt-stt: input channel {} exceeds device channel count {}, using channel 0",
                config.input_channel_index, native_channels
            );
            0
        };

        Ok(Self {
            device,
            device_name,
            config,
            native_channels,
            selected_channel,
            callback: Arc::new(Mutex::new(None)),
            stream: None,
        })
    }

    fn open_device(name: &str) -> Result<cpal::Device> {
        let host = cpal::default_host();

        if !name.is_empty() {
            let devices = host
                .input_devices()
                .map_err(|e| RtSttError::DeviceOpenFailed {
                    device: name.to_string(),
                    message: format!("failed to enumerate devices: {}", e),
                })?;
            for device in devices {
                if let Ok(dev_name) = device.name()
                    && dev_name == name
                {
                    return Ok(device);
                }
            }
            eprintln!("rt-stt: audio device '{}' not found, using default", name);
        }

        host.default_input_device()
            .ok_or_else(|| RtSttError::DeviceOpenFailed {
                device: if name.is_empty() {
                    "default".to_string()
                } else {
                    name.to_string()
                },
                message: "no input device available".to_string(),
            })
    }

    /// Name of the device actually opened.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let channels = if self.config.force_single_channel {
            self.native_channels
        } else {
            self.config.channels.max(1)
        };
        let frames_per_buffer =
            self.config.buffer_size_ms * self.config.sample_rate / 1000;
        let stream_config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(frames_per_buffer),
        };

        let callback = Arc::clone(&self.callback);
        let stride = channels as usize;
        let pick = if self.config.force_single_channel && stride > 1 {
            Some(self.selected_channel as usize)
        } else {
            None
        };
        // Preallocated scratch for channel extraction; grows amortized only.
        let mut mono: Vec<f32> = Vec::with_capacity(frames_per_buffer as usize);

        let err_callback = |err| {
            eprintln!("rt-stt: audio stream error: {}", err);
        };

        let stream = self
            .device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let Ok(mut guard) = callback.try_lock() else {
                        return;
                    };
                    let Some(cb) = guard.as_mut() else {
                        return;
                    };
                    match pick {
                        Some(ch) => {
                            mono.clear();
                            mono.extend(data.iter().skip(ch).step_by(stride));
                            cb(&mono);
                        }
                        None => cb(data),
                    }
                },
                err_callback,
                None,
            )
            .map_err(|e| RtSttError::FormatUnsupported {
                message: format!(
                    "{}ch f32 @ {} Hz on '{}': {}",
                    channels, self.config.sample_rate, self.device_name, e
                ),
            })?;

        Ok(stream)
    }
}

impl AudioCapture for CpalAudioCapture {
    fn set_callback(&mut self, callback: FrameCallback) {
        if let Ok(mut guard) = self.callback.lock() {
            *guard = Some(callback);
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(()); // Already started
        }

        let stream = self.build_stream()?;
        stream.play().map_err(|e| RtSttError::StartFailed {
            message: format!("'{}': {}", self.device_name, e),
        })?;
        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // Dropping the stream tears down the backend callback, so nothing
        // fires after this returns.
        if let Some(stream) = self.stream.take() {
            let _ = stream.0.pause();
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stop()?;
        if let Ok(mut guard) = self.callback.lock() {
            *guard = None;
        }
        Ok(())
    }

    fn native_channels(&self) -> u16 {
        self.native_channels
    }
}

/// List available input devices by name.
pub fn list_devices() -> Result<Vec<String>> {
    let devices = quiet_stderr(|| {
        let host = cpal::default_host();
        host.input_devices()
    })
    .map_err(|e| RtSttError::DeviceOpenFailed {
        device: "default".to_string(),
        message: format!("failed to enumerate input devices: {}", e),
    })?;

    Ok(devices.filter_map(|d| d.name().ok()).collect())
}
