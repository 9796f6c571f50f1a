//! Voice Activity Detection (VAD).
//!
//! Segments a continuous 16 kHz sample stream into complete utterances using
//! frame-wise RMS energy, an adaptive noise floor, and a four-state machine.
//! The detector also maintains a pre-roll ring of recent audio that is
//! prepended to each utterance so the first phoneme is not clipped.
//!
//! `process` runs on the audio callback thread: it takes no locks and
//! allocates only through amortized `Vec` growth of the utterance buffer.

use crate::config::VadConfig;
use crate::defaults;

/// Current state of voice activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected.
    Silence,
    /// Energy above the start threshold, not yet long enough to confirm.
    SpeechMaybe,
    /// Confirmed speech.
    Speech,
    /// Energy below the end threshold, not yet long enough to confirm.
    SpeechEnding,
}

/// A complete voiced segment, pre-roll included.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub samples: Vec<f32>,
}

impl Utterance {
    /// Duration in milliseconds at the pipeline sample rate.
    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() / defaults::SAMPLES_PER_MS) as u64
    }
}

/// Result of feeding one frame through the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// No utterance boundary was crossed.
    Continue,
    /// An utterance ended and met the minimum length.
    Utterance(Utterance),
    /// An utterance ended but was shorter than `min_speech_ms`.
    DiscardedShort,
}

/// Fixed-capacity ring of the most recent samples, overwritten in place.
#[derive(Debug)]
struct PreRollRing {
    buf: Vec<f32>,
    head: usize,
    len: usize,
}

impl PreRollRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity.max(1)],
            head: 0,
            len: 0,
        }
    }

    fn push_slice(&mut self, samples: &[f32]) {
        for &s in samples {
            self.buf[self.head] = s;
            self.head = (self.head + 1) % self.buf.len();
        }
        self.len = (self.len + samples.len()).min(self.buf.len());
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Contents oldest-first.
    fn snapshot(&self) -> Vec<f32> {
        let cap = self.buf.len();
        let start = (self.head + cap - self.len) % cap;
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            out.push(self.buf[(start + i) % cap]);
        }
        out
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    fn resize(&mut self, capacity: usize) {
        self.buf = vec![0.0; capacity.max(1)];
        self.clear();
    }
}

/// Energy-based VAD with adaptive noise floor and pre-roll buffer.
///
/// At most one utterance is open at any time: the buffer opens on the
/// `Silence -> SpeechMaybe` transition and closes (emitted or discarded) on
/// `SpeechEnding -> Silence`.
pub struct Vad {
    config: VadConfig,
    state: VadState,

    current_energy: f32,
    noise_floor: f32,
    energy_history: Vec<f32>,
    energy_history_idx: usize,

    // Counted in samples; thresholds are converted from ms.
    speech_samples: usize,
    silence_samples: usize,
    samples_per_ms: usize,

    pre_roll: PreRollRing,
    utterance: Vec<f32>,
    max_utterance_samples: usize,
}

impl Vad {
    pub fn new(config: VadConfig) -> Self {
        let samples_per_ms = (config.sample_rate / 1000) as usize;
        let pre_roll_samples = config.pre_speech_buffer_ms as usize * samples_per_ms;
        Self {
            state: VadState::Silence,
            current_energy: 0.0,
            noise_floor: config.energy_threshold,
            energy_history: vec![config.energy_threshold; defaults::ENERGY_HISTORY_LEN],
            energy_history_idx: 0,
            speech_samples: 0,
            silence_samples: 0,
            samples_per_ms,
            pre_roll: PreRollRing::new(pre_roll_samples),
            utterance: Vec::new(),
            max_utterance_samples: defaults::MAX_UTTERANCE_MS as usize * samples_per_ms,
            config,
        }
    }

    /// Feed one frame of samples (typically 20-30 ms worth).
    pub fn process(&mut self, frame: &[f32]) -> FrameOutcome {
        self.current_energy = rms(frame);

        // The noise floor only tracks energy observed during silence.
        if self.config.use_adaptive_threshold && self.state == VadState::Silence {
            self.update_noise_floor(self.current_energy);
        }

        self.pre_roll.push_slice(frame);

        // energy_threshold == 0 disables segmentation: treat everything as
        // speech and cut on the maximum utterance length instead.
        if self.config.energy_threshold == 0.0 {
            return self.process_unsegmented(frame);
        }

        let (start_thr, end_thr) = self.thresholds();
        let n = frame.len();

        let outcome = match self.state {
            VadState::Silence => {
                if self.current_energy > start_thr {
                    self.state = VadState::SpeechMaybe;
                    self.speech_samples = n;
                    self.silence_samples = 0;
                    self.utterance.clear();
                }
                FrameOutcome::Continue
            }
            VadState::SpeechMaybe => {
                if self.current_energy > start_thr {
                    self.speech_samples += n;
                    if self.speech_samples
                        >= self.config.speech_start_ms as usize * self.samples_per_ms
                    {
                        self.state = VadState::Speech;
                        // Prepend pre-roll so the utterance keeps the onset.
                        let mut with_pre_roll = self.pre_roll.snapshot();
                        with_pre_roll.append(&mut self.utterance);
                        self.utterance = with_pre_roll;
                    }
                } else {
                    // False start
                    self.state = VadState::Silence;
                    self.speech_samples = 0;
                    self.utterance.clear();
                }
                FrameOutcome::Continue
            }
            VadState::Speech => {
                if self.current_energy < end_thr {
                    self.state = VadState::SpeechEnding;
                    self.silence_samples = n;
                } else {
                    self.speech_samples += n;
                }
                FrameOutcome::Continue
            }
            VadState::SpeechEnding => {
                if self.current_energy < end_thr {
                    self.silence_samples += n;
                    if self.silence_samples
                        >= self.config.speech_end_ms as usize * self.samples_per_ms
                    {
                        self.close_utterance()
                    } else {
                        FrameOutcome::Continue
                    }
                } else {
                    // Speech resumed
                    self.state = VadState::Speech;
                    self.silence_samples = 0;
                    FrameOutcome::Continue
                }
            }
        };

        if self.state != VadState::Silence {
            self.utterance.extend_from_slice(frame);
        }
        outcome
    }

    /// Segmentation-disabled path: accumulate and cut at the length cap.
    fn process_unsegmented(&mut self, frame: &[f32]) -> FrameOutcome {
        self.state = VadState::Speech;
        self.utterance.extend_from_slice(frame);
        self.speech_samples += frame.len();
        if self.utterance.len() >= self.max_utterance_samples {
            let samples = std::mem::take(&mut self.utterance);
            self.speech_samples = 0;
            FrameOutcome::Utterance(Utterance { samples })
        } else {
            FrameOutcome::Continue
        }
    }

    /// `SpeechEnding -> Silence`: emit or discard the open utterance.
    fn close_utterance(&mut self) -> FrameOutcome {
        self.state = VadState::Silence;
        let long_enough =
            self.speech_samples >= self.config.min_speech_ms as usize * self.samples_per_ms;
        self.speech_samples = 0;
        self.silence_samples = 0;
        let samples = std::mem::take(&mut self.utterance);
        if long_enough {
            FrameOutcome::Utterance(Utterance { samples })
        } else {
            FrameOutcome::DiscardedShort
        }
    }

    /// Effective start/end thresholds for the current noise floor.
    fn thresholds(&self) -> (f32, f32) {
        if self.config.use_adaptive_threshold {
            (
                self.noise_floor * self.config.speech_start_threshold,
                self.noise_floor * self.config.speech_end_threshold,
            )
        } else {
            (
                self.config.speech_start_threshold,
                self.config.speech_end_threshold,
            )
        }
    }

    fn update_noise_floor(&mut self, energy: f32) {
        self.energy_history[self.energy_history_idx] = energy;
        self.energy_history_idx = (self.energy_history_idx + 1) % self.energy_history.len();

        // 20th percentile of the rolling history, exponentially smoothed.
        let mut sorted = self.energy_history.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let p20 = sorted[sorted.len() / 5];

        let rate = self.config.noise_floor_adaptation_rate;
        self.noise_floor = self.noise_floor * (1.0 - rate) + p20 * rate;

        // The floor never drops below half the base threshold.
        self.noise_floor = self.noise_floor.max(self.config.energy_threshold * 0.5);
    }

    /// Replace the configuration and reinitialize the adaptive tables.
    pub fn update_config(&mut self, config: VadConfig) {
        self.config = config;
        self.samples_per_ms = (config.sample_rate / 1000) as usize;
        self.max_utterance_samples = defaults::MAX_UTTERANCE_MS as usize * self.samples_per_ms;
        self.pre_roll
            .resize(config.pre_speech_buffer_ms as usize * self.samples_per_ms);
        self.noise_floor = config.energy_threshold;
        self.energy_history
            .iter_mut()
            .for_each(|e| *e = config.energy_threshold);
        self.energy_history_idx = 0;
    }

    /// Clear all state back to `Silence`.
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_samples = 0;
        self.silence_samples = 0;
        self.current_energy = 0.0;
        self.utterance.clear();
        self.pre_roll.clear();
        self.noise_floor = self.config.energy_threshold;
        self.energy_history
            .iter_mut()
            .for_each(|e| *e = self.config.energy_threshold);
        self.energy_history_idx = 0;
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// RMS energy of the most recent frame (for visualization clients).
    pub fn current_energy(&self) -> f32 {
        self.current_energy
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    #[cfg(test)]
    fn pre_roll_len(&self) -> usize {
        self.pre_roll.len()
    }
}

/// RMS energy of a frame: `sqrt(mean(sample^2))`.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}
