//! Whisper implementation of the [`Transcriber`] trait using whisper-rs.
//!
//! # Feature Gate
//!
//! Requires the `whisper` feature (enabled by default) and cmake to build
//! whisper.cpp. GPU backends are selected with the `cuda`/`vulkan`/
//! `hipblas`/`openblas` features.

use crate::config::ModelConfig;
use crate::defaults;
use crate::error::{Result, RtSttError};
use crate::stt::transcriber::{ModelOutput, ModelSegment, TranscribeParams, Transcriber};
use std::path::Path;
use std::sync::{Mutex, Once};
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters,
    install_logging_hooks,
};

static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Whisper-based transcriber.
///
/// The context is wrapped in a Mutex; only the worker thread transcribes, but
/// the lock keeps the type `Sync` so the control surface can hold the same
/// `Arc` while swapping models.
pub struct WhisperTranscriber {
    context: Mutex<WhisperContext>,
    identifier: String,
}

impl std::fmt::Debug for WhisperTranscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperTranscriber")
            .field("identifier", &self.identifier)
            .field("context", &"<WhisperContext>")
            .finish()
    }
}

impl WhisperTranscriber {
    /// Load a whisper model from `config.model_path`.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        // Route whisper.cpp logging through hooks so it stops spamming
        // stderr (install only once per process).
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        let path = &config.model_path;
        if !path.exists() {
            return Err(RtSttError::ModelLoadFailed {
                path: path.to_string_lossy().to_string(),
                message: "model file does not exist".to_string(),
            });
        }

        if Self::is_english_only_model(path) && config.language == defaults::AUTO_LANGUAGE {
            eprintln!(
                "rt-stt: English-only model '{}' cannot auto-detect other languages",
                path.display()
            );
        }

        let mut context_params = WhisperContextParameters::default();
        context_params.use_gpu(config.use_gpu);
        context_params.flash_attn(config.use_gpu);

        let path_str = path.to_str().ok_or_else(|| RtSttError::ModelLoadFailed {
            path: path.to_string_lossy().to_string(),
            message: "invalid UTF-8 in model path".to_string(),
        })?;
        let context = WhisperContext::new_with_params(path_str, context_params).map_err(|e| {
            RtSttError::ModelLoadFailed {
                path: path_str.to_string(),
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            context: Mutex::new(context),
            identifier: path_str.to_string(),
        })
    }

    fn build_params<'a>(params: &'a TranscribeParams) -> FullParams<'a, 'a> {
        let strategy = if params.beam_size > 1 {
            SamplingStrategy::BeamSearch {
                beam_size: params.beam_size,
                patience: -1.0,
            }
        } else {
            SamplingStrategy::Greedy { best_of: 1 }
        };
        let mut full_params = FullParams::new(strategy);

        if params.language == defaults::AUTO_LANGUAGE {
            full_params.set_language(None);
        } else {
            full_params.set_language(Some(&params.language));
        }
        full_params.set_n_threads(params.n_threads);
        full_params.set_translate(params.translate);
        full_params.set_temperature(params.temperature);
        full_params.set_n_max_text_ctx(params.max_context);

        full_params.set_print_special(false);
        full_params.set_print_progress(false);
        full_params.set_print_realtime(false);
        full_params.set_print_timestamps(false);
        full_params.set_token_timestamps(true);
        full_params.set_suppress_blank(true);

        full_params
    }

    /// Check if a model path points to an English-only model variant.
    pub fn is_english_only_model(path: &Path) -> bool {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| stem.ends_with(".en"))
            .unwrap_or(false)
    }
}

impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, samples: &[f32], params: &TranscribeParams) -> Result<ModelOutput> {
        let context = self
            .context
            .lock()
            .map_err(|e| RtSttError::ModelInferenceFailed {
                message: format!("failed to acquire context lock: {}", e),
            })?;

        let mut state = context
            .create_state()
            .map_err(|e| RtSttError::ModelInferenceFailed {
                message: format!("failed to create state: {}", e),
            })?;

        let full_params = Self::build_params(params);
        state
            .full(full_params, samples)
            .map_err(|e| RtSttError::ModelInferenceFailed {
                message: format!("inference failed: {}", e),
            })?;

        let language = if params.language == defaults::AUTO_LANGUAGE {
            let lang_id = state.full_lang_id_from_state();
            whisper_rs::get_lang_str(lang_id)
                .unwrap_or("")
                .to_string()
        } else {
            params.language.clone()
        };

        let mut segments = Vec::new();
        for (i, segment) in state.as_iter().enumerate() {
            let text = match segment.to_str_lossy() {
                Ok(t) => t.into_owned(),
                Err(_) => continue,
            };

            let mut tokens = Vec::new();
            let mut token_logprobs = Vec::new();
            for j in 0..segment.n_tokens() {
                if let Some(token) = segment.get_token(j) {
                    let data = token.token_data();
                    tokens.push(data.id);
                    token_logprobs.push(data.plog);
                }
            }
            let avg_logprob = if token_logprobs.is_empty() {
                0.0
            } else {
                token_logprobs.iter().sum::<f32>() / token_logprobs.len() as f32
            };

            segments.push(ModelSegment {
                id: i as i32,
                seek: 0,
                // Segment timestamps are reported in centiseconds.
                start_s: segment.start_timestamp() as f32 / 100.0,
                end_s: segment.end_timestamp() as f32 / 100.0,
                text,
                tokens,
                token_logprobs,
                temperature: params.temperature,
                avg_logprob,
                // whisper.cpp does not report these per segment.
                compression_ratio: None,
                no_speech_prob: None,
            });
        }

        Ok(ModelOutput {
            segments,
            language,
            language_probability: None,
        })
    }

    fn model_identifier(&self) -> &str {
        &self.identifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_model_file_errors() {
        let config = ModelConfig {
            model_path: PathBuf::from("/nonexistent/model.bin"),
            ..Default::default()
        };
        match WhisperTranscriber::new(&config) {
            Err(RtSttError::ModelLoadFailed { path, .. }) => {
                assert_eq!(path, "/nonexistent/model.bin");
            }
            other => panic!("expected ModelLoadFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_model_file_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ggml-bogus.bin");
        std::fs::write(&path, b"not a model").unwrap();

        let config = ModelConfig {
            model_path: path,
            use_gpu: false,
            ..Default::default()
        };
        assert!(WhisperTranscriber::new(&config).is_err());
    }

    #[test]
    fn test_english_only_detection() {
        assert!(WhisperTranscriber::is_english_only_model(Path::new(
            "models/ggml-small.en.bin"
        )));
        assert!(!WhisperTranscriber::is_english_only_model(Path::new(
            "models/ggml-small.bin"
        )));
    }
}
