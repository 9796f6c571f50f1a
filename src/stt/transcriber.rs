//! The model seam: trait, per-call parameters, and raw model output.
//!
//! The neural model is an external collaborator. The core owns its lifecycle
//! and supplies every parameter per call; the model returns segments with
//! per-token log-probabilities, from which the worker computes confidence.

use crate::config::ModelConfig;
use crate::error::{Result, RtSttError};

/// Parameters supplied to the model on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeParams {
    /// Language code, or "auto" for model-side detection.
    pub language: String,
    pub beam_size: i32,
    pub temperature: f32,
    pub translate: bool,
    pub max_context: i32,
    pub n_threads: i32,
}

impl From<&ModelConfig> for TranscribeParams {
    fn from(config: &ModelConfig) -> Self {
        Self {
            language: config.language.clone(),
            beam_size: config.beam_size,
            temperature: config.temperature,
            translate: config.translate,
            max_context: config.max_context,
            n_threads: config.n_threads,
        }
    }
}

/// One decoded segment as reported by the model.
///
/// Fields the model does not report stay `None`; the server never fabricates
/// them downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSegment {
    pub id: i32,
    pub seek: i32,
    pub start_s: f32,
    pub end_s: f32,
    pub text: String,
    pub tokens: Vec<i32>,
    /// Per-token log-probabilities, parallel to `tokens`.
    pub token_logprobs: Vec<f32>,
    pub temperature: f32,
    pub avg_logprob: f32,
    pub compression_ratio: Option<f32>,
    pub no_speech_prob: Option<f32>,
}

/// Raw model output for one utterance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelOutput {
    pub segments: Vec<ModelSegment>,
    pub language: String,
    pub language_probability: Option<f32>,
}

impl ModelOutput {
    /// Concatenated text of all segments.
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// Log-probabilities of every token across all segments.
    pub fn token_logprobs(&self) -> impl Iterator<Item = f32> + '_ {
        self.segments
            .iter()
            .flat_map(|s| s.token_logprobs.iter().copied())
    }
}

/// Trait for speech-to-text transcription.
///
/// A call is synchronous and may take seconds; only the worker thread calls
/// it. Implementations must be shareable so the control surface can swap the
/// installed instance while the worker holds a reference.
pub trait Transcriber: Send + Sync {
    /// Transcribe 16 kHz mono f32 samples.
    fn transcribe(&self, samples: &[f32], params: &TranscribeParams) -> Result<ModelOutput>;

    /// Identifier of the loaded model (its file path).
    fn model_identifier(&self) -> &str;
}

/// Mock transcriber for tests.
#[derive(Debug, Clone)]
pub struct MockTranscriber {
    identifier: String,
    response: String,
    language: String,
    token_logprobs: Vec<f32>,
    delay: Option<std::time::Duration>,
    should_fail: bool,
}

impl MockTranscriber {
    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            response: "mock transcription".to_string(),
            language: "en".to_string(),
            token_logprobs: vec![-0.1, -0.2],
            delay: None,
            should_fail: false,
        }
    }

    /// Configure the text returned for every utterance.
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    /// Configure the per-token log-probabilities of the single segment.
    pub fn with_token_logprobs(mut self, logprobs: Vec<f32>) -> Self {
        self.token_logprobs = logprobs;
        self
    }

    /// Make every call sleep, to exercise quiescence paths.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

impl Transcriber for MockTranscriber {
    fn transcribe(&self, samples: &[f32], params: &TranscribeParams) -> Result<ModelOutput> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.should_fail {
            return Err(RtSttError::ModelInferenceFailed {
                message: "mock inference failure".to_string(),
            });
        }

        let end_s = samples.len() as f32 / 16_000.0;
        let tokens: Vec<i32> = (0..self.token_logprobs.len() as i32).collect();
        Ok(ModelOutput {
            segments: vec![ModelSegment {
                id: 0,
                seek: 0,
                start_s: 0.0,
                end_s,
                text: self.response.clone(),
                tokens,
                token_logprobs: self.token_logprobs.clone(),
                temperature: params.temperature,
                avg_logprob: mean(&self.token_logprobs),
                compression_ratio: None,
                no_speech_prob: None,
            }],
            language: self.language.clone(),
            language_probability: Some(1.0),
        })
    }

    fn model_identifier(&self) -> &str {
        &self.identifier
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TranscribeParams {
        TranscribeParams::from(&ModelConfig::default())
    }

    #[test]
    fn test_params_from_model_config() {
        let config = ModelConfig {
            language: "de".to_string(),
            beam_size: 3,
            temperature: 0.2,
            translate: true,
            n_threads: 8,
            ..Default::default()
        };
        let p = TranscribeParams::from(&config);
        assert_eq!(p.language, "de");
        assert_eq!(p.beam_size, 3);
        assert_eq!(p.temperature, 0.2);
        assert!(p.translate);
        assert_eq!(p.n_threads, 8);
    }

    #[test]
    fn test_mock_returns_configured_response() {
        let transcriber = MockTranscriber::new("mock-model").with_response("hello world");
        let output = transcriber.transcribe(&[0.0; 16_000], &params()).unwrap();
        assert_eq!(output.text(), "hello world");
        assert_eq!(output.language, "en");
        assert_eq!(output.segments.len(), 1);
        assert_eq!(output.segments[0].end_s, 1.0);
    }

    #[test]
    fn test_mock_failure() {
        let transcriber = MockTranscriber::new("mock-model").with_failure();
        let result = transcriber.transcribe(&[0.0; 100], &params());
        assert!(matches!(
            result,
            Err(RtSttError::ModelInferenceFailed { .. })
        ));
    }

    #[test]
    fn test_mock_is_object_safe() {
        let transcriber: Box<dyn Transcriber> = Box::new(MockTranscriber::new("boxed"));
        assert_eq!(transcriber.model_identifier(), "boxed");
    }

    #[test]
    fn test_output_token_logprobs_span_segments() {
        let output = ModelOutput {
            segments: vec![
                ModelSegment {
                    id: 0,
                    seek: 0,
                    start_s: 0.0,
                    end_s: 1.0,
                    text: "a".to_string(),
                    tokens: vec![1],
                    token_logprobs: vec![-0.5],
                    temperature: 0.0,
                    avg_logprob: -0.5,
                    compression_ratio: None,
                    no_speech_prob: None,
                },
                ModelSegment {
                    id: 1,
                    seek: 0,
                    start_s: 1.0,
                    end_s: 2.0,
                    text: "b".to_string(),
                    tokens: vec![2, 3],
                    token_logprobs: vec![-0.25, -0.75],
                    temperature: 0.0,
                    avg_logprob: -0.5,
                    compression_ratio: None,
                    no_speech_prob: None,
                },
            ],
            language: "en".to_string(),
            language_probability: None,
        };
        let logprobs: Vec<f32> = output.token_logprobs().collect();
        assert_eq!(logprobs, vec![-0.5, -0.25, -0.75]);
        assert_eq!(output.text(), "ab");
    }
}
