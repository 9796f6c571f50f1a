//! The transcription worker: sole consumer of the utterance queue, sole
//! caller of the model.
//!
//! For each utterance it invokes the installed transcriber, normalizes the
//! text, computes confidence from per-token log-probabilities, and hands the
//! result record to the broadcaster channel. Model failures drop the
//! utterance and increment a counter; the worker itself never dies on them.

use crate::audio::vad::Utterance;
use crate::engine::EngineShared;
use crate::ipc::protocol::{Segment, TranscriptionResult};
use crate::stt::transcriber::{ModelOutput, TranscribeParams};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How often the worker wakes to re-check the shutdown flag while idle.
const IDLE_POLL: Duration = Duration::from_millis(100);

pub(crate) fn run(
    rx: Receiver<Utterance>,
    shared: Arc<EngineShared>,
    result_tx: Sender<TranscriptionResult>,
) {
    while shared.running.load(Ordering::SeqCst) {
        let utterance = match rx.recv_timeout(IDLE_POLL) {
            Ok(u) => u,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // Paused: utterances still flow into the queue but are discarded at
        // dequeue time.
        if shared.paused.load(Ordering::SeqCst) {
            continue;
        }

        let t_dequeue = Instant::now();
        let params = {
            let config = shared
                .model_config
                .read()
                .unwrap_or_else(|e| e.into_inner());
            TranscribeParams::from(&*config)
        };

        // The read guard is held across the model call: a model swap takes
        // the write lock and thereby waits for the in-flight call to drain.
        let (model, output) = {
            let guard = shared
                .transcriber
                .read()
                .unwrap_or_else(|e| e.into_inner());
            let model = guard.model_identifier().to_string();
            match guard.transcribe(&utterance.samples, &params) {
                Ok(output) => (model, output),
                Err(e) => {
                    shared.metrics.incr_model_errors();
                    eprintln!("rt-stt: transcription failed: {}", e);
                    continue;
                }
            }
        };

        let text = normalize_text(&output.text());
        if !text.chars().any(|c| c.is_alphanumeric()) {
            // Nothing but whitespace or punctuation came back.
            continue;
        }

        let processing_time_ms = t_dequeue.elapsed().as_millis() as u64;
        let audio_duration_ms = utterance.duration_ms();
        let result = build_result(text, &output, model, processing_time_ms, audio_duration_ms);

        let rtf = if audio_duration_ms > 0 {
            processing_time_ms as f64 / audio_duration_ms as f64
        } else {
            0.0
        };
        shared
            .metrics
            .record_transcription(processing_time_ms as f64, rtf);

        // A closed receiver just means the daemon is shutting down.
        if result_tx.send(result).is_err() {
            break;
        }
    }
}

/// Collapse whitespace runs to single spaces and trim the ends.
pub(crate) fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `clamp(exp(mean(token logprob)), 0, 1)`; 0 when there are no tokens.
pub(crate) fn confidence(output: &ModelOutput) -> f32 {
    let mut sum = 0.0_f64;
    let mut count = 0u32;
    for logprob in output.token_logprobs() {
        sum += logprob as f64;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    ((sum / count as f64).exp() as f32).clamp(0.0, 1.0)
}

fn build_result(
    text: String,
    output: &ModelOutput,
    model: String,
    processing_time_ms: u64,
    audio_duration_ms: u64,
) -> TranscriptionResult {
    let timestamp_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);

    TranscriptionResult {
        text,
        confidence: confidence(output),
        is_final: true,
        language: output.language.clone(),
        language_probability: output.language_probability,
        processing_time_ms,
        audio_duration_ms,
        model,
        timestamp_us,
        segments: output
            .segments
            .iter()
            .map(|s| Segment {
                id: s.id,
                seek: s.seek,
                start_s: s.start_s,
                end_s: s.end_s,
                text: s.text.clone(),
                tokens: s.tokens.clone(),
                temperature: s.temperature,
                avg_logprob: s.avg_logprob,
                compression_ratio: s.compression_ratio,
                no_speech_prob: s.no_speech_prob,
            })
            .collect(),
    }
}
