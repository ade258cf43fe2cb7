use std::sync::Arc;

use hostedpay_api::{
    app_router, cache::CacheFactory, config, db, events, psp::MockPsp, spawn_background_tasks,
    AppState,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = Arc::new(config::load_config()?);
    config::init_tracing(&app_config);

    info!(
        environment = %app_config.environment,
        "starting hostedpay-api v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db_pool = Arc::new(db::establish_connection_from_app_config(&app_config).await?);
    if app_config.auto_migrate {
        db::run_migrations(&db_pool).await?;
    }

    let cache = CacheFactory::create_cache(&app_config.cache).await;

    // The in-tree provider adapter; a real deployment swaps this for the
    // live PSP client behind the same trait.
    let webhook_secret = app_config
        .psp_webhook_secret
        .clone()
        .unwrap_or_else(|| "whsec_development_only".to_string());
    let psp = Arc::new(MockPsp::new(webhook_secret));

    let (event_sender, event_receiver) = events::channel(app_config.event_channel_capacity);
    let event_logger = events::spawn_event_logger(event_receiver);

    let state = AppState::new(db_pool, app_config.clone(), cache, psp, event_sender);
    let background_tasks = spawn_background_tasks(&state);

    let addr = format!("{}:{}", app_config.host, app_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    let result = axum::serve(listener, app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    if let Err(e) = &result {
        error!("server error: {}", e);
    }

    for task in background_tasks {
        task.abort();
    }
    event_logger.abort();

    result.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("failed to install terminate handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}
