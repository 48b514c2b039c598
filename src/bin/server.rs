//! kokoro-serve: HTTP API for Kokoro text-to-speech.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kokoro_serve::{
    phonemize::{self, EspeakPhonemizer},
    provider::{detect_providers, select_providers},
    server,
    session::{build_session, OrtSessionFactory},
    AppState, KokoroOnnx, ServerConfig, SpeechEngine, StartupError, Synthesizer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kokoro_serve=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::parse();
    info!("Starting kokoro-serve");

    if let Err(e) = config.check_artifacts() {
        error!("{e}");
        std::process::exit(1);
    }

    let (engine, provider) = match load_engine(&config).await {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    info!(provider = %provider, sample_rate = engine.sample_rate(), "engine ready");

    let state = AppState {
        synth: Synthesizer::new(engine, config.max_concurrent_inferences),
        default_voice: config.default_voice.clone(),
        provider,
    };
    let app = server::router(state, server::cors_layer(&config.cors_origins)?);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot bind {addr}"))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Detect providers, bind a session and assemble the engine.
///
/// Runs on the blocking pool: session creation compiles the graph.
async fn load_engine(
    config: &ServerConfig,
) -> Result<(Arc<dyn SpeechEngine>, String), StartupError> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || {
        let available = detect_providers();
        let chain = select_providers(&available, &config.provider_options());

        let factory = OrtSessionFactory { cpu_threads: config.threads };
        let bound = build_session(&factory, &config.model, &chain)?;

        if let Some(dir) = &config.espeak_data {
            phonemize::set_data_path(dir);
        }
        let phonemizer = EspeakPhonemizer::new(&config.language)
            .map_err(|e| StartupError::EngineLoad { message: format!("{e:#}") })?;

        let engine = KokoroOnnx::load(bound.session, &config.voices, Box::new(phonemizer))
            .map_err(|e| StartupError::EngineLoad { message: format!("{e:#}") })?;

        Ok((Arc::new(engine) as Arc<dyn SpeechEngine>, bound.provider.to_string()))
    })
    .await
    .map_err(|e| StartupError::EngineLoad { message: format!("loader task failed: {e}") })?
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
