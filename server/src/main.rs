use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, head, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatrelay_server::{
    auth,
    chat::{ChatOptions, ChatServer},
    metrics::{metrics_handler, MetricsRecorder},
    notifier::{self, EventNotifier, NotifierOptions},
    rest,
    settings::Settings,
    watchdog, ws,
};

fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Default to warn in production, debug in development
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let mut config_path: Option<String> = None;
    let mut check_only = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--check" | "-T" => check_only = true,
            other => config_path = Some(other.to_string()),
        }
    }
    let config_path = config_path
        .or_else(|| std::env::var("CHATRELAY_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());

    let settings = Settings::load(&config_path)?;

    // the pool is sized before the runtime exists, so no #[tokio::main] here
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.server.worker_threads())
        .enable_all()
        .build()?;
    runtime.block_on(run(settings, check_only))
}

async fn run(settings: Settings, check_only: bool) -> anyhow::Result<()> {
    tracing::info!("starting chat relay server");

    let authenticator = auth::from_config(&settings.server.auth)?;

    let options = ChatOptions {
        max_message_size: settings.chat.message.max_size_bytes()?,
        enable_delivery_status: settings.chat.message.enable_delivery_status,
        enable_send_back: settings.chat.message.enable_send_back,
        ignored_types_send_back: settings.chat.message.ignored_types_send_back.clone(),
        enable_undelivered_queue: settings.chat.enable_undelivered_queue,
        preserve_api_timestamps: settings.chat.message.enable_timestamp_override_api,
        idle_timeout: settings.server.idle_timeout(),
    };
    let chat = Arc::new(ChatServer::new(options, authenticator));
    let shutdown = CancellationToken::new();

    // target construction is part of config validation: failures are fatal
    let event_notifier: Option<Arc<EventNotifier>> = if settings.event.enabled {
        let mut targets = Vec::with_capacity(settings.event.targets.len());
        for target_config in &settings.event.targets {
            targets.push(notifier::build_target(target_config)?);
        }
        let notifier = EventNotifier::new(
            NotifierOptions::from(&settings.event),
            targets,
            shutdown.clone(),
        );
        notifier.subscribe(&chat);
        Some(notifier)
    } else {
        None
    };

    if check_only {
        println!("Configuration verified - everything is ok!");
        return Ok(());
    }

    if settings.server.watchdog.enabled {
        tokio::spawn(watchdog::run_watchdog(
            chat.registry().clone(),
            watchdog::SWEEP_INTERVAL,
            shutdown.clone(),
        ));
        tracing::info!("watchdog started with a 1 minute interval");
    }

    if let Some(notifier) = &event_notifier {
        tokio::spawn(notifier.clone().run_worker());
        tracing::info!("event notifier worker started");
    }

    // Only expose metrics when explicitly enabled
    let metrics_router = if matches!(
        std::env::var("ENABLE_METRICS").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    ) {
        let recorder = MetricsRecorder::new();
        let handle = recorder.handle().clone();
        tracing::info!("metrics endpoint enabled");
        Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(handle)
    } else {
        Router::new()
    };

    let ws_router = Router::new()
        .route(&settings.server.endpoint, get(ws::chat_upgrade))
        .with_state(chat.clone());

    let rest_router = if settings.rest_api.enabled {
        Router::new()
            .route("/stats", get(rest::stats))
            .route("/stat", get(rest::stat))
            .route("/check-online", get(rest::check_online))
            .route("/send-message", post(rest::send_message))
            .route("/status", head(rest::status))
            .with_state(chat.clone())
    } else {
        Router::new()
    };

    let app = ws_router
        .merge(rest_router)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr =
        format!("{}:{}", settings.server.bind_address(), settings.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        "chat relay listening on ws://{}{}",
        addr,
        settings.server.endpoint
    );

    // signals cancel the token and close every live connection so the
    // graceful shutdown below can finish
    let signal_chat = chat.clone();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, stopping server");
        signal_token.cancel();
        signal_chat.stop();
    });

    let serve_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await?;

    tracing::info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
