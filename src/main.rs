use std::sync::Arc;

use anyhow::Context;
use lark_voice::settings::{default_settings_path, load_settings};
use lark_voice::streaming::{get_api_key, StreamingEngine};
use lark_voice::{
    ConnectivityProbe, DefaultBackendFactory, DevicePermissionProvider, ErrorLog,
    MicrophoneSource, RealtimeEngine, ServiceDeps, VoiceEvent, VoiceService, WhisperClient,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lark_voice=info")),
        )
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let settings_path = default_settings_path().context("resolving settings path")?;
    let mut settings = load_settings(&settings_path);
    log::info!("Settings loaded from {:?}", settings_path);

    let api_key = get_api_key();
    if api_key.is_none() && !settings.offline_mode {
        log::warn!("OPENAI_API_KEY not set, running in offline mode");
        settings.offline_mode = true;
    }

    let source = Arc::new(MicrophoneSource::new());
    let engine = api_key
        .clone()
        .map(|key| Arc::new(RealtimeEngine::new(key)) as Arc<dyn StreamingEngine>);
    let transcriber = WhisperClient::new(
        settings.transcription_url.clone(),
        settings.transcription_model.clone(),
        api_key,
    )
    .context("building transcription client")?;
    log::info!("Batch transcription endpoint: {}", transcriber.endpoint());

    let factory = DefaultBackendFactory::new(
        source.clone(),
        engine,
        Arc::new(transcriber),
        &settings,
    );
    let probe = ConnectivityProbe::default();
    let online = probe.is_reachable().await;

    let service = VoiceService::init(
        settings,
        ServiceDeps {
            factory: Arc::new(factory),
            permissions: Arc::new(DevicePermissionProvider::new(source)),
            error_log: Arc::new(ErrorLog::new(ErrorLog::default_path())),
            online,
        },
    );

    let cancel = CancellationToken::new();
    let probe_task = probe.spawn(service.clone(), cancel.clone());

    let mut events = service.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                VoiceEvent::CommandDetected { command } => println!("{}", command),
                VoiceEvent::Error {
                    kind,
                    message,
                    recoverable,
                } => {
                    eprintln!("[{}{}] {}", kind, if recoverable { "" } else { ", fatal" }, message)
                }
                VoiceEvent::PermissionRequired => {
                    eprintln!("Microphone access required; listening resumes once it is granted")
                }
                _ => {}
            }
        }
    });

    service
        .start_listening()
        .await
        .context("starting recognition")?;
    log::info!("Listening. Press Ctrl+C to exit.");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;

    log::info!("Shutting down");
    cancel.cancel();
    service.dispose().await;
    let _ = probe_task.await;
    printer.abort();
    Ok(())
}
