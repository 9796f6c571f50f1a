//! The daemon coordinator.
//!
//! Owns every subsystem and wires them with channels: the capture callback
//! feeds the engine's audio frontend, the worker publishes results to a
//! crossbeam channel, a bridge thread fans them out through the IPC server,
//! and commands flow from the server's reader tasks into the control
//! handler. No subsystem holds a reference to another's internals.

pub mod handler;

use crate::audio::capture::{AudioCapture, CpalAudioCapture, suppress_audio_warnings};
use crate::config::Config;
use crate::defaults;
use crate::engine::{Engine, TranscriberFactory};
use crate::error::Result;
use crate::ipc::server::IpcServer;
use crate::metrics::Metrics;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};

/// Build the transcriber factory for the compiled model backend.
pub fn transcriber_factory() -> TranscriberFactory {
    Box::new(|model_config| {
        #[cfg(feature = "whisper")]
        {
            use crate::stt::transcriber::Transcriber;
            let transcriber = crate::stt::whisper::WhisperTranscriber::new(model_config)?;
            Ok(Arc::new(transcriber) as Arc<dyn Transcriber>)
        }
        #[cfg(not(feature = "whisper"))]
        {
            Err(crate::error::RtSttError::ModelLoadFailed {
                path: model_config.model_path.to_string_lossy().to_string(),
                message: "this build has no model backend (whisper feature disabled)".to_string(),
            })
        }
    })
}

/// Run the daemon until SIGINT or SIGTERM.
///
/// # Arguments
/// * `config` - Full configuration
/// * `socket_override` - Socket path overriding the configured one
/// * `config_path` - Where `set_config` persists to
/// * `quiet` - Suppress startup and transcription logging
pub async fn run_daemon(
    config: Config,
    socket_override: Option<PathBuf>,
    config_path: PathBuf,
    quiet: bool,
) -> Result<()> {
    suppress_audio_warnings();

    let metrics = Arc::new(Metrics::new());

    // Model load is startup-fatal; at runtime set_model failures are
    // recoverable and handled in the control surface.
    let factory = transcriber_factory();
    if !quiet {
        eprintln!(
            "Loading model '{}'...",
            config.model_config.model_path.display()
        );
    }
    let transcriber = factory(&config.model_config)?;

    let (result_tx, result_rx) = crossbeam_channel::bounded(64);
    let (engine, mut frontend) = Engine::start(
        &config,
        transcriber,
        factory,
        result_tx,
        Arc::clone(&metrics),
    );

    let mut capture = CpalAudioCapture::new(config.audio_capture_config.clone())?;
    let device_name = capture.device_name().to_string();
    capture.set_callback(Box::new(move |frame| frontend.process_frame(frame)));
    capture.start()?;

    let socket_path = socket_override.unwrap_or_else(|| config.ipc_socket_path.0.clone());
    let client_count = Arc::new(AtomicUsize::new(0));
    let (server, mut status_rx) = IpcServer::new(Arc::clone(&metrics), Arc::clone(&client_count));
    server.initialize(&socket_path)?;

    let control = Arc::new(handler::ControlHandler::new(
        Arc::clone(&engine),
        config,
        config_path,
        client_count,
    ));
    server.start(control)?;

    if !quiet {
        eprintln!("Listening on: {}", socket_path.display());
        eprintln!("Audio device: {}", device_name);
        eprintln!("Model: {}", engine.model_identifier());
        eprintln!("Backend: {}", defaults::gpu_backend());
        eprintln!("Press Ctrl+C to stop");
    }

    // Bridge thread: worker results -> IPC broadcast. broadcast_* never
    // blocks, so a plain thread is enough.
    let bridge_server = server.clone();
    let bridge = std::thread::spawn(move || {
        while let Ok(result) = result_rx.recv() {
            if !quiet {
                eprintln!("[{}] {}", result.language, result.text);
            }
            let _ = bridge_server.broadcast_transcription(&result);
        }
    });

    // STATUS goes out every 30 s and on every subscription change.
    let status_server = server.clone();
    let status_engine = Arc::clone(&engine);
    let started = Instant::now();
    let status_task = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(defaults::STATUS_INTERVAL_SECS));
        interval.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = status_rx.recv() => {
                    if changed.is_none() {
                        break;
                    }
                }
            }
            let status = json!({
                "listening": status_engine.is_listening(),
                "clients": status_server.client_count(),
                "uptime_s": started.elapsed().as_secs(),
            });
            let _ = status_server.broadcast_status(status);
        }
    });

    wait_for_shutdown(quiet).await;

    // Teardown, leaves first: capture stops feeding, the engine drains,
    // then the server goes away.
    let _ = capture.stop();
    let _ = capture.shutdown();
    engine.shutdown();
    server.stop().await;
    status_task.abort();
    // The worker dropped its result sender; the bridge drains and exits.
    let _ = bridge.join();

    if !quiet {
        eprintln!("rt-stt daemon stopped");
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown(quiet: bool) {
    let sigterm = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    eprintln!("rt-stt: failed to register SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            if !quiet {
                eprintln!("\nReceived SIGINT, shutting down...");
            }
        }
        _ = sigterm => {
            if !quiet {
                eprintln!("\nReceived SIGTERM, shutting down...");
            }
        }
    }
}
