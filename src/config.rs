//! Daemon configuration: schema, defaults, validation, and merge-patching.
//!
//! The configuration file is JSON with four recognized top-level keys
//! (`model_config`, `vad_config`, `audio_capture_config`, `ipc_socket_path`).
//! Unknown fields are ignored; missing fields fall back to defaults.

use crate::defaults;
use crate::error::{Result, RtSttError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub model_config: ModelConfig,
    pub vad_config: VadConfig,
    pub audio_capture_config: AudioCaptureConfig,
    pub ipc_socket_path: SocketPath,
}

/// Newtype so the socket path serializes as a bare string with a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SocketPath(pub PathBuf);

impl Default for SocketPath {
    fn default() -> Self {
        Self(PathBuf::from(defaults::SOCKET_PATH))
    }
}

/// Transcription model configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    /// Language code, or "auto" for model-side detection.
    pub language: String,
    pub n_threads: i32,
    pub use_gpu: bool,
    pub beam_size: i32,
    pub temperature: f32,
    pub translate: bool,
    /// Maximum text context tokens carried between decoder steps.
    pub max_context: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(defaults::DEFAULT_MODEL_PATH),
            language: defaults::DEFAULT_LANGUAGE.to_string(),
            n_threads: defaults::N_THREADS,
            use_gpu: true,
            beam_size: defaults::BEAM_SIZE,
            temperature: 0.0,
            translate: false,
            max_context: 16_384,
        }
    }
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadConfig {
    /// Base RMS threshold; 0.0 disables segmentation entirely.
    pub energy_threshold: f32,
    pub speech_start_threshold: f32,
    pub speech_end_threshold: f32,
    pub speech_start_ms: u32,
    pub speech_end_ms: u32,
    pub min_speech_ms: u32,
    pub pre_speech_buffer_ms: u32,
    pub use_adaptive_threshold: bool,
    pub noise_floor_adaptation_rate: f32,
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: defaults::ENERGY_THRESHOLD,
            speech_start_threshold: defaults::SPEECH_START_THRESHOLD,
            speech_end_threshold: defaults::SPEECH_END_THRESHOLD,
            speech_start_ms: defaults::SPEECH_START_MS,
            speech_end_ms: defaults::SPEECH_END_MS,
            min_speech_ms: defaults::MIN_SPEECH_MS,
            pre_speech_buffer_ms: defaults::PRE_SPEECH_BUFFER_MS,
            use_adaptive_threshold: true,
            noise_floor_adaptation_rate: defaults::NOISE_FLOOR_ADAPTATION_RATE,
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

/// Audio capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioCaptureConfig {
    /// Device name; empty selects the system default.
    pub device_name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_size_ms: u32,
    /// Capture all native channels but deliver only `input_channel_index`.
    pub force_single_channel: bool,
    pub input_channel_index: u16,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            sample_rate: defaults::SAMPLE_RATE,
            channels: 1,
            buffer_size_ms: defaults::BUFFER_SIZE_MS,
            force_single_channel: true,
            input_channel_index: 1,
        }
    }
}

/// Outcome of a merge-patch: which top-level sub-records applied, and the
/// errors for those that did not. Sub-records succeed or fail independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliedPatch {
    pub model_updated: bool,
    pub vad_updated: bool,
    pub audio_updated: bool,
    pub socket_updated: bool,
    /// One message per sub-record that was rejected and left unchanged.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
}

impl AppliedPatch {
    /// True if at least one sub-record applied.
    pub fn any_applied(&self) -> bool {
        self.model_updated || self.vad_updated || self.audio_updated || self.socket_updated
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// Missing fields use default values; unknown fields are ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config =
            serde_json::from_str(&contents).map_err(|e| RtSttError::ConfigParse {
                message: format!("{}: {}", path.display(), e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if it doesn't exist.
    ///
    /// Invalid JSON or invalid values are still errors; only a missing file
    /// falls back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self).map_err(|e| RtSttError::ConfigParse {
            message: e.to_string(),
        })?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path (~/.config/rt-stt/config.json).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("rt-stt")
            .join("config.json")
    }

    /// Validate all sub-records.
    pub fn validate(&self) -> Result<()> {
        self.model_config.validate()?;
        self.vad_config.validate()?;
        self.audio_capture_config.validate()?;
        Ok(())
    }

    /// Merge a JSON patch into this configuration.
    ///
    /// Only the four recognized top-level keys are considered. Each present
    /// sub-record is merged field-by-field over the current values, validated
    /// on its own, and applied or rejected independently of the others: a
    /// sub-record either fully applies or fully fails. Rejections are
    /// reported in [`AppliedPatch::rejected`]; the whole call errors only
    /// when the patch itself is not a JSON object.
    pub fn apply_patch(&mut self, patch: &serde_json::Value) -> Result<AppliedPatch> {
        let obj = patch.as_object().ok_or_else(|| RtSttError::ConfigInvalid {
            key: "config".to_string(),
            message: "patch must be a JSON object".to_string(),
        })?;

        let mut applied = AppliedPatch::default();

        for (key, value) in obj {
            match key.as_str() {
                "model_config" => {
                    match merge_sub_record(&self.model_config, value, key, ModelConfig::validate) {
                        Ok(candidate) => {
                            self.model_config = candidate;
                            applied.model_updated = true;
                        }
                        Err(e) => applied.rejected.push(e.to_string()),
                    }
                }
                "vad_config" => {
                    match merge_sub_record(&self.vad_config, value, key, VadConfig::validate) {
                        Ok(candidate) => {
                            self.vad_config = candidate;
                            applied.vad_updated = true;
                        }
                        Err(e) => applied.rejected.push(e.to_string()),
                    }
                }
                "audio_capture_config" => {
                    match merge_sub_record(
                        &self.audio_capture_config,
                        value,
                        key,
                        AudioCaptureConfig::validate,
                    ) {
                        Ok(candidate) => {
                            self.audio_capture_config = candidate;
                            applied.audio_updated = true;
                        }
                        Err(e) => applied.rejected.push(e.to_string()),
                    }
                }
                "ipc_socket_path" => match serde_json::from_value(value.clone()) {
                    Ok(path) => {
                        self.ipc_socket_path = path;
                        applied.socket_updated = true;
                    }
                    Err(e) => applied.rejected.push(
                        RtSttError::ConfigInvalid {
                            key: key.clone(),
                            message: e.to_string(),
                        }
                        .to_string(),
                    ),
                },
                // Unknown top-level keys are ignored, matching file loading.
                _ => {}
            }
        }

        Ok(applied)
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_threads <= 0 {
            return Err(RtSttError::ConfigInvalid {
                key: "model_config.n_threads".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.beam_size <= 0 {
            return Err(RtSttError::ConfigInvalid {
                key: "model_config.beam_size".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.speech_start_threshold <= self.speech_end_threshold {
            return Err(RtSttError::ConfigInvalid {
                key: "vad_config.speech_start_threshold".to_string(),
                message: format!(
                    "must exceed speech_end_threshold ({} <= {})",
                    self.speech_start_threshold, self.speech_end_threshold
                ),
            });
        }
        if self.energy_threshold < 0.0 {
            return Err(RtSttError::ConfigInvalid {
                key: "vad_config.energy_threshold".to_string(),
                message: "must not be negative".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.noise_floor_adaptation_rate) {
            return Err(RtSttError::ConfigInvalid {
                key: "vad_config.noise_floor_adaptation_rate".to_string(),
                message: "must be within [0, 1]".to_string(),
            });
        }
        if self.sample_rate != defaults::SAMPLE_RATE {
            return Err(RtSttError::ConfigInvalid {
                key: "vad_config.sample_rate".to_string(),
                message: format!("only {} Hz is supported", defaults::SAMPLE_RATE),
            });
        }
        Ok(())
    }
}

impl AudioCaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate != defaults::SAMPLE_RATE {
            return Err(RtSttError::ConfigInvalid {
                key: "audio_capture_config.sample_rate".to_string(),
                message: format!("only {} Hz is supported", defaults::SAMPLE_RATE),
            });
        }
        Ok(())
    }
}

/// Merge a one-level JSON patch over one sub-record and validate the result.
/// The caller's sub-record is untouched unless the merge and the validation
/// both succeed.
fn merge_sub_record<T, V>(current: &T, patch: &serde_json::Value, key: &str, validate: V) -> Result<T>
where
    T: Serialize + serde::de::DeserializeOwned,
    V: Fn(&T) -> Result<()>,
{
    let patch_obj = patch.as_object().ok_or_else(|| RtSttError::ConfigInvalid {
        key: key.to_string(),
        message: "must be a JSON object".to_string(),
    })?;

    let mut merged = serde_json::to_value(current).map_err(|e| RtSttError::ConfigParse {
        message: e.to_string(),
    })?;
    let merged_obj = merged
        .as_object_mut()
        .ok_or_else(|| RtSttError::ConfigInvalid {
            key: key.to_string(),
            message: "not a mergeable object".to_string(),
        })?;
    for (field, value) in patch_obj {
        merged_obj.insert(field.clone(), value.clone());
    }

    let candidate: T = serde_json::from_value(merged).map_err(|e| RtSttError::ConfigInvalid {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    validate(&candidate)?;
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.model_config.language, "en");
        assert_eq!(config.model_config.n_threads, 4);
        assert_eq!(config.model_config.beam_size, 5);
        assert_eq!(config.model_config.temperature, 0.0);
        assert!(config.model_config.use_gpu);
        assert!(!config.model_config.translate);

        assert_eq!(config.vad_config.energy_threshold, 0.001);
        assert_eq!(config.vad_config.speech_start_threshold, 1.08);
        assert_eq!(config.vad_config.speech_end_threshold, 0.85);
        assert_eq!(config.vad_config.speech_start_ms, 150);
        assert_eq!(config.vad_config.speech_end_ms, 1000);
        assert_eq!(config.vad_config.min_speech_ms, 500);
        assert_eq!(config.vad_config.pre_speech_buffer_ms, 500);
        assert!(config.vad_config.use_adaptive_threshold);

        assert_eq!(config.audio_capture_config.sample_rate, 16000);
        assert_eq!(config.audio_capture_config.buffer_size_ms, 30);
        assert!(config.audio_capture_config.force_single_channel);
        assert_eq!(config.audio_capture_config.input_channel_index, 1);

        assert_eq!(
            config.ipc_socket_path.0,
            PathBuf::from("/tmp/rt-stt.sock")
        );
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "model_config": { "model_path": "/models/ggml-base.bin", "language": "de" },
                "vad_config": { "min_speech_ms": 250 },
                "ipc_socket_path": "/tmp/test-rt-stt.sock"
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.model_config.model_path,
            PathBuf::from("/models/ggml-base.bin")
        );
        assert_eq!(config.model_config.language, "de");
        assert_eq!(config.vad_config.min_speech_ms, 250);
        // Untouched fields keep defaults
        assert_eq!(config.vad_config.speech_end_ms, 1000);
        assert_eq!(
            config.ipc_socket_path.0,
            PathBuf::from("/tmp/test-rt-stt.sock")
        );
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "vad_config": { "min_speech_ms": 300, "flux_capacitor": true }, "telemetry": {} }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.vad_config.min_speech_ms, 300);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(RtSttError::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_hysteresis_violation_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "vad_config": { "speech_start_threshold": 0.8, "speech_end_threshold": 0.9 } }"#,
        )
        .unwrap();

        match Config::load(&path) {
            Err(RtSttError::ConfigInvalid { key, .. }) => {
                assert_eq!(key, "vad_config.speech_start_threshold");
            }
            other => panic!("expected ConfigInvalid, got {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_sample_rate_rejected() {
        let mut config = Config::default();
        config.vad_config.sample_rate = 44_100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub").join("config.json");

        let mut config = Config::default();
        config.model_config.language = "ja".to_string();
        config.vad_config.min_speech_ms = 400;
        config.save(&path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_apply_patch_merges_single_field() {
        let mut config = Config::default();
        let applied = config
            .apply_patch(&json!({ "vad_config": { "speech_start_threshold": 1.5 } }))
            .unwrap();

        assert!(applied.vad_updated);
        assert!(!applied.model_updated);
        assert_eq!(config.vad_config.speech_start_threshold, 1.5);
        // Other VAD fields untouched
        assert_eq!(config.vad_config.speech_end_threshold, 0.85);
    }

    #[test]
    fn test_apply_patch_sub_records_fail_independently() {
        let mut config = Config::default();

        // Valid model change rides along with an invalid VAD change: the
        // model sub-record applies, the VAD sub-record is rejected whole.
        let applied = config
            .apply_patch(&json!({
                "model_config": { "language": "fr" },
                "vad_config": { "speech_start_threshold": 0.1 }
            }))
            .unwrap();

        assert!(applied.model_updated);
        assert!(!applied.vad_updated);
        assert_eq!(applied.rejected.len(), 1);
        assert!(applied.rejected[0].contains("speech_start_threshold"));

        assert_eq!(config.model_config.language, "fr");
        assert_eq!(config.vad_config, VadConfig::default());
    }

    #[test]
    fn test_apply_patch_rejected_sub_record_is_all_or_nothing() {
        let mut config = Config::default();

        // One valid field and one invalid field in the same sub-record: the
        // whole sub-record fails, the valid field does not sneak in.
        let applied = config
            .apply_patch(&json!({
                "vad_config": { "min_speech_ms": 250, "speech_start_threshold": 0.1 }
            }))
            .unwrap();

        assert!(!applied.vad_updated);
        assert_eq!(applied.rejected.len(), 1);
        assert_eq!(config.vad_config, VadConfig::default());
    }

    #[test]
    fn test_apply_patch_rejects_non_object() {
        let mut config = Config::default();
        assert!(config.apply_patch(&json!("model_config")).is_err());

        // A non-object sub-record is rejected without touching anything else
        let applied = config.apply_patch(&json!({ "vad_config": 42 })).unwrap();
        assert!(!applied.any_applied());
        assert_eq!(applied.rejected.len(), 1);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_apply_patch_ignores_unknown_keys() {
        let mut config = Config::default();
        let applied = config.apply_patch(&json!({ "frobnicator": { "x": 1 } })).unwrap();
        assert_eq!(applied, AppliedPatch::default());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_apply_patch_socket_path() {
        let mut config = Config::default();
        let applied = config
            .apply_patch(&json!({ "ipc_socket_path": "/run/user/1000/rt-stt.sock" }))
            .unwrap();
        assert!(applied.socket_updated);
        assert_eq!(
            config.ipc_socket_path.0,
            PathBuf::from("/run/user/1000/rt-stt.sock")
        );
    }
}
