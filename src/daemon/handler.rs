//! The control surface: dispatches IPC command actions onto the engine and
//! the runtime configuration.
//!
//! Holds the authoritative configuration snapshot. Reads return consistent
//! copies; mutations apply atomically per top-level sub-record and are pushed
//! into the engine (VAD mailbox, model params, model swap) as side effects.

use crate::config::Config;
use crate::defaults;
use crate::engine::Engine;
use crate::error::{Result, RtSttError};
use crate::ipc::server::CommandHandler;
use crate::metrics::Metrics;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Command handler wired to the engine and runtime state.
pub struct ControlHandler {
    engine: Arc<Engine>,
    config: RwLock<Config>,
    config_path: PathBuf,
    metrics: Arc<Metrics>,
    client_count: Arc<AtomicUsize>,
}

impl ControlHandler {
    pub fn new(
        engine: Arc<Engine>,
        config: Config,
        config_path: PathBuf,
        client_count: Arc<AtomicUsize>,
    ) -> Self {
        let metrics = engine.metrics();
        Self {
            engine,
            config: RwLock::new(config),
            config_path,
            metrics,
            client_count,
        }
    }

    fn config_snapshot(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn status(&self) -> Value {
        let config = self.config_snapshot();
        json!({
            "listening": self.engine.is_listening(),
            "model": self.engine.model_identifier(),
            "language": self.engine.language(),
            "vad_enabled": config.vad_config.energy_threshold > 0.0,
            "clients": self.client_count.load(Ordering::SeqCst),
        })
    }

    /// Swap the model on a blocking thread; loading can take seconds.
    async fn swap_model(&self, model_path: PathBuf) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || engine.set_model(model_path))
            .await
            .map_err(|e| RtSttError::Other(format!("model swap task failed: {}", e)))?
    }

    async fn handle_set_config(&self, params: Value) -> Result<Value> {
        let patch = params
            .get("config")
            .cloned()
            .ok_or_else(|| RtSttError::ConfigInvalid {
                key: "config".to_string(),
                message: "missing 'config' parameter".to_string(),
            })?;
        let save = params
            .get("save")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        // Each top-level sub-record applies or fails on its own; rejections
        // come back in `applied.rejected`.
        let (mut applied, old_model, new_config) = {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            let old_model = config.model_config.clone();
            let applied = config.apply_patch(&patch)?;
            (applied, old_model, config.clone())
        };

        // Side effects, per sub-record.
        if applied.vad_updated {
            self.engine.update_vad_config(new_config.vad_config);
        }
        if applied.model_updated {
            let mut swap_failed = None;
            if new_config.model_config.model_path != old_model.model_path {
                swap_failed = self
                    .swap_model(new_config.model_config.model_path.clone())
                    .await
                    .err();
            }
            match swap_failed {
                Some(e) => {
                    // The previous model is still installed; roll the whole
                    // sub-record back and report it as rejected.
                    let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
                    config.model_config = old_model;
                    applied.model_updated = false;
                    applied.rejected.push(e.to_string());
                }
                None => {
                    self.engine
                        .set_model_params(new_config.model_config.clone());
                }
            }
        }

        // Nothing applied at all: the command failed outright.
        if !applied.any_applied() && !applied.rejected.is_empty() {
            return Err(RtSttError::ConfigInvalid {
                key: "config".to_string(),
                message: applied.rejected.join("; "),
            });
        }

        let saved = if save {
            self.config_snapshot().save(&self.config_path).is_ok()
        } else {
            false
        };

        let mut result = serde_json::to_value(applied).map_err(|e| RtSttError::Other(e.to_string()))?;
        result["saved"] = json!(saved);
        Ok(result)
    }

    async fn handle_set_language(&self, params: Value) -> Result<Value> {
        let language = params
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or(defaults::DEFAULT_LANGUAGE)
            .to_string();

        // Accepted even for monolingual models; the model may ignore it.
        self.engine.set_language(&language);
        self.config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .model_config
            .language = language.clone();

        Ok(json!({ "language": language }))
    }

    async fn handle_set_model(&self, params: Value) -> Result<Value> {
        let model = params
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| RtSttError::ConfigInvalid {
                key: "model".to_string(),
                message: "missing 'model' parameter".to_string(),
            })?
            .to_string();

        self.swap_model(PathBuf::from(&model)).await?;
        self.config
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .model_config
            .model_path = PathBuf::from(&model);

        Ok(json!({ "model": model, "model_updated": true }))
    }

    fn handle_set_vad_sensitivity(&self, params: Value) -> Result<Value> {
        let sensitivity = params
            .get("sensitivity")
            .and_then(Value::as_f64)
            .unwrap_or(defaults::SPEECH_START_THRESHOLD as f64) as f32;

        let vad_config = {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            let mut vad_config = config.vad_config;
            vad_config.speech_start_threshold = sensitivity;
            if vad_config.speech_start_threshold <= vad_config.speech_end_threshold {
                return Err(RtSttError::ConfigInvalid {
                    key: "sensitivity".to_string(),
                    message: format!(
                        "must exceed speech_end_threshold ({})",
                        vad_config.speech_end_threshold
                    ),
                });
            }
            config.vad_config = vad_config;
            vad_config
        };
        self.engine.update_vad_config(vad_config);

        Ok(json!({ "sensitivity": sensitivity }))
    }
}

#[async_trait]
impl CommandHandler for ControlHandler {
    async fn handle(&self, action: &str, params: Value) -> Result<Value> {
        match action {
            "pause" => {
                self.engine.pause();
                Ok(json!({ "status": "paused", "listening": false }))
            }
            "resume" => {
                self.engine.resume();
                Ok(json!({ "status": "listening", "listening": true }))
            }
            "get_status" => Ok(self.status()),
            "get_config" => serde_json::to_value(self.config_snapshot())
                .map_err(|e| RtSttError::Other(e.to_string())),
            "set_config" => self.handle_set_config(params).await,
            "set_language" => self.handle_set_language(params).await,
            "set_model" => self.handle_set_model(params).await,
            "set_vad_sensitivity" => self.handle_set_vad_sensitivity(params),
            "get_metrics" => serde_json::to_value(self.metrics.snapshot())
                .map_err(|e| RtSttError::Other(e.to_string())),
            _ => Err(RtSttError::UnknownAction {
                action: action.to_string(),
            }),
        }
    }
}
