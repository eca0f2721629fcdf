use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use dotenvy::dotenv;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use bookserver::api_router::configure_api_routes;
use bookserver::config::AppConfig;
use bookserver::notify::{self, TracingSink};
use bookserver::payments::gateway::GatewayRegistry;
use bookserver::payments::webhook;
use bookserver::shared::state::AppState;
use bookserver::shared::utils::create_conn;
use bookserver::sweeper;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const QUEUE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bookserver=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env()?;
    let pool = create_conn(&config.database_url)?;

    {
        let mut conn = pool.get()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("migrations failed: {e}"))?;
    }
    info!("database ready");

    let gateways = Arc::new(GatewayRegistry::from_config(&config.payments)?);
    info!(providers = ?gateways.names(), "payment gateways registered");

    let (notifications, notify_worker) = notify::start(Arc::new(TracingSink), QUEUE_CAPACITY);
    let (webhooks, webhook_rx) = webhook::channel(QUEUE_CAPACITY);
    let webhook_worker = webhook::spawn_worker(
        pool.clone(),
        config.payments.clone(),
        notifications.clone(),
        webhook_rx,
    );

    let state = Arc::new(AppState {
        conn: pool,
        config: config.clone(),
        gateways,
        webhooks,
        notifications,
    });

    let sweeper = sweeper::spawn(state.as_ref().clone());

    let app = configure_api_routes()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining background workers");
    sweeper.stop().await;
    drop(state);
    webhook_worker.stop().await;
    notify_worker.stop().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::error!("failed to listen for SIGTERM: {err}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
