//! The transcription engine: glue between capture, VAD, queue, and worker.
//!
//! [`Engine::start`] wires a preallocated VAD and the utterance queue into an
//! [`AudioFrontend`] (owned by the audio callback) and spawns the single
//! worker thread. Control-surface mutations (pause, language, model swap,
//! VAD updates) go through the `Engine` handle; results flow out through the
//! crossbeam channel the coordinator supplied.

pub mod queue;
pub mod worker;

use crate::audio::vad::{FrameOutcome, Vad};
use crate::config::{Config, ModelConfig, VadConfig};
use crate::defaults;
use crate::error::Result;
use crate::ipc::protocol::TranscriptionResult;
use crate::metrics::Metrics;
use crate::stt::transcriber::Transcriber;
use queue::UtteranceQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

/// Builds a transcriber from a model configuration. Used at startup and for
/// runtime model swaps.
pub type TranscriberFactory =
    Box<dyn Fn(&ModelConfig) -> Result<Arc<dyn Transcriber>> + Send + Sync>;

/// State shared between the engine handle and the worker thread.
pub(crate) struct EngineShared {
    pub(crate) running: AtomicBool,
    pub(crate) paused: AtomicBool,
    pub(crate) transcriber: RwLock<Arc<dyn Transcriber>>,
    pub(crate) model_config: RwLock<ModelConfig>,
    pub(crate) metrics: Arc<Metrics>,
}

/// Control handle for the running engine.
pub struct Engine {
    shared: Arc<EngineShared>,
    factory: TranscriberFactory,
    vad_update_tx: crossbeam_channel::Sender<VadConfig>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// The audio-thread end of the engine: preallocated VAD state, the pre-roll
/// ring, and the producer end of the utterance queue. Owned by the capture
/// callback; takes no locks.
pub struct AudioFrontend {
    vad: Vad,
    queue: UtteranceQueue,
    vad_update_rx: crossbeam_channel::Receiver<VadConfig>,
    metrics: Arc<Metrics>,
}

impl AudioFrontend {
    /// Process one frame of mono samples from the capture callback.
    pub fn process_frame(&mut self, frame: &[f32]) {
        // Config updates arrive through a lock-free mailbox so the audio
        // thread never contends with control-surface locks.
        while let Ok(config) = self.vad_update_rx.try_recv() {
            self.vad.update_config(config);
        }

        self.metrics.add_processed_samples(frame.len() as u64);

        match self.vad.process(frame) {
            FrameOutcome::Continue => {}
            FrameOutcome::DiscardedShort => self.metrics.incr_discarded_short(),
            FrameOutcome::Utterance(utterance) => {
                // Drop-newest on overflow; the queue counts it.
                let _ = self.queue.push(utterance);
            }
        }
    }

    /// RMS energy of the most recent frame.
    pub fn current_energy(&self) -> f32 {
        self.vad.current_energy()
    }

    pub fn noise_floor(&self) -> f32 {
        self.vad.noise_floor()
    }
}

impl Engine {
    /// Spawn the worker and build the audio frontend.
    ///
    /// `result_tx` is where finished transcription records go; the
    /// coordinator bridges it to the IPC broadcaster.
    pub fn start(
        config: &Config,
        transcriber: Arc<dyn Transcriber>,
        factory: TranscriberFactory,
        result_tx: crossbeam_channel::Sender<TranscriptionResult>,
        metrics: Arc<Metrics>,
    ) -> (Arc<Engine>, AudioFrontend) {
        let shared = Arc::new(EngineShared {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            transcriber: RwLock::new(transcriber),
            model_config: RwLock::new(config.model_config.clone()),
            metrics: Arc::clone(&metrics),
        });

        let (queue, queue_rx) = UtteranceQueue::bounded(defaults::MAX_QUEUE_SIZE, Arc::clone(&metrics));
        let (vad_update_tx, vad_update_rx) = crossbeam_channel::unbounded();

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("rt-stt-worker".to_string())
            .spawn(move || worker::run(queue_rx, worker_shared, result_tx))
            .expect("failed to spawn worker thread");

        let engine = Arc::new(Engine {
            shared,
            factory,
            vad_update_tx,
            worker: Mutex::new(Some(handle)),
        });

        let frontend = AudioFrontend {
            vad: Vad::new(config.vad_config),
            queue,
            vad_update_rx,
            metrics,
        };

        (engine, frontend)
    }

    /// Pause: utterances keep flowing into the queue, the worker discards
    /// them at dequeue until resume.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Listening means running and not paused.
    pub fn is_listening(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst) && !self.is_paused()
    }

    /// Identifier (path) of the installed model.
    pub fn model_identifier(&self) -> String {
        self.shared
            .transcriber
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .model_identifier()
            .to_string()
    }

    pub fn language(&self) -> String {
        self.shared
            .model_config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .language
            .clone()
    }

    /// Change the transcription language on the current model. Stored even
    /// if the model is monolingual; the model may ignore it.
    pub fn set_language(&self, language: &str) {
        self.shared
            .model_config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .language = language.to_string();
    }

    /// Replace model parameters that do not require a model swap.
    pub fn set_model_params(&self, config: ModelConfig) {
        *self
            .shared
            .model_config
            .write()
            .unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Swap the installed model, quiescing the worker.
    ///
    /// The replacement is loaded first (no locks held, may take seconds);
    /// the write lock then waits for any in-flight transcription to drain
    /// before the swap. A failed load leaves the previous model installed.
    pub fn set_model(&self, model_path: std::path::PathBuf) -> Result<()> {
        let candidate = {
            let mut config = self
                .shared
                .model_config
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            config.model_path = model_path;
            config
        };

        let replacement = (self.factory)(&candidate)?;

        {
            let mut guard = self
                .shared
                .transcriber
                .write()
                .unwrap_or_else(|e| e.into_inner());
            *guard = replacement;
        }
        *self
            .shared
            .model_config
            .write()
            .unwrap_or_else(|e| e.into_inner()) = candidate;
        Ok(())
    }

    /// Push a new VAD configuration to the audio thread. Applied at the
    /// next frame boundary; the detector reinitializes its adaptive tables.
    pub fn update_vad_config(&self, config: VadConfig) {
        let _ = self.vad_update_tx.send(config);
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Stop the worker and join it. Idempotent.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.worker.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::transcriber::MockTranscriber;
    use std::time::Duration;

    const FRAME: usize = 320; // 20 ms at 16 kHz

    fn mock_factory() -> TranscriberFactory {
        Box::new(|config| {
            Ok(Arc::new(
                MockTranscriber::new(&config.model_path.to_string_lossy())
                    .with_response("swapped"),
            ) as Arc<dyn Transcriber>)
        })
    }

    fn start_engine(
        transcriber: MockTranscriber,
    ) -> (
        Arc<Engine>,
        AudioFrontend,
        crossbeam_channel::Receiver<TranscriptionResult>,
    ) {
        let config = Config::default();
        let metrics = Arc::new(Metrics::new());
        let (result_tx, result_rx) = crossbeam_channel::bounded(64);
        let (engine, frontend) = Engine::start(
            &config,
            Arc::new(transcriber),
            mock_factory(),
            result_tx,
            metrics,
        );
        (engine, frontend, result_rx)
    }

    /// Push one spoken utterance through the frontend: enough speech frames
    /// to clear min_speech_ms, then silence until the VAD closes it.
    fn speak(frontend: &mut AudioFrontend) {
        for _ in 0..100 {
            frontend.process_frame(&[0.1; FRAME]);
        }
        for _ in 0..55 {
            frontend.process_frame(&[0.0; FRAME]);
        }
    }

    #[test]
    fn test_end_to_end_utterance_to_result() {
        let (engine, mut frontend, result_rx) =
            start_engine(MockTranscriber::new("mock-model").with_response("hello world"));

        speak(&mut frontend);

        let result = result_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("worker should produce a result");
        assert_eq!(result.text, "hello world");
        assert_eq!(result.model, "mock-model");
        assert!(result.is_final);
        // 100 speech frames = 2 s plus pre-roll and trailing silence
        assert!(result.audio_duration_ms >= 2000);
        assert!(result.audio_duration_ms <= 4000);
        assert_eq!(engine.metrics().transcriptions_count(), 1);

        engine.shutdown();
    }

    #[test]
    fn test_pause_discards_resume_delivers() {
        let (engine, mut frontend, result_rx) =
            start_engine(MockTranscriber::new("mock-model").with_response("text"));

        engine.pause();
        assert!(!engine.is_listening());
        speak(&mut frontend);
        assert!(
            result_rx.recv_timeout(Duration::from_millis(500)).is_err(),
            "paused engine must not emit results"
        );

        engine.resume();
        assert!(engine.is_listening());
        speak(&mut frontend);
        let result = result_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(result.text, "text");

        engine.shutdown();
    }

    #[test]
    fn test_model_failure_counts_and_worker_survives() {
        let (engine, mut frontend, result_rx) =
            start_engine(MockTranscriber::new("mock-model").with_failure());

        speak(&mut frontend);
        assert!(result_rx.recv_timeout(Duration::from_millis(500)).is_err());

        // The worker is still alive: swap in a working model and speak again
        engine
            .set_model(std::path::PathBuf::from("other-model"))
            .unwrap();
        speak(&mut frontend);
        let result = result_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(result.model, "other-model");

        assert_eq!(engine.metrics().snapshot().model_errors, 1);
        engine.shutdown();
    }

    #[test]
    fn test_set_model_visible_in_next_result() {
        let (engine, mut frontend, result_rx) =
            start_engine(MockTranscriber::new("first-model").with_response("one"));

        speak(&mut frontend);
        let first = result_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.model, "first-model");

        engine
            .set_model(std::path::PathBuf::from("/models/second.bin"))
            .unwrap();

        speak(&mut frontend);
        let second = result_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(second.model, "/models/second.bin");

        engine.shutdown();
    }

    #[test]
    fn test_set_language_stored() {
        let (engine, _frontend, _result_rx) = start_engine(MockTranscriber::new("m"));
        assert_eq!(engine.language(), "en");
        engine.set_language("ja");
        assert_eq!(engine.language(), "ja");
        engine.shutdown();
    }

    #[test]
    fn test_empty_text_is_suppressed() {
        let (engine, mut frontend, result_rx) =
            start_engine(MockTranscriber::new("m").with_response("  .?!  "));

        speak(&mut frontend);
        assert!(
            result_rx.recv_timeout(Duration::from_millis(500)).is_err(),
            "text without alphanumerics must be dropped"
        );
        engine.shutdown();
    }

    #[test]
    fn test_vad_update_applies_on_audio_thread() {
        let (engine, mut frontend, _result_rx) = start_engine(MockTranscriber::new("m"));

        let mut vad_config = VadConfig::default();
        vad_config.energy_threshold = 0.5;
        engine.update_vad_config(vad_config);

        // The next frame applies the update; with the raised threshold the
        // soft speech below never opens a segment.
        for _ in 0..20 {
            frontend.process_frame(&[0.1; FRAME]);
        }
        assert!((frontend.noise_floor() - 0.5).abs() < 1e-6);
        engine.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (engine, _frontend, _result_rx) = start_engine(MockTranscriber::new("m"));
        engine.shutdown();
        engine.shutdown();
    }
}
