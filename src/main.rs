use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::HeaderValue;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};
use tracing::{error, info, warn};

use eventhub_payments as api;
use eventhub_payments::gateway::PaymentGateway;
use eventhub_payments::notifications::{
    LoggingNotificationSink, NotificationSink, RedisNotificationSink,
};

/// Upper bound for one request, inside the gateway's webhook retry window
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    if std::env::args().nth(1).as_deref() == Some("migrate") {
        return api::migrator::run_migration(cfg.database_url()).await;
    }

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    let gateway: Arc<dyn PaymentGateway> = Arc::new(
        api::gateway::StripeGateway::from_config(&cfg)
            .context("failed to build payment gateway client")?,
    );
    if cfg.gateway_api_key.is_none() {
        warn!("No gateway API key configured; checkout and verification will fail");
    }
    if cfg.payment_webhook_secret.is_none() {
        warn!("No webhook signing secret configured; every webhook delivery will be rejected");
    }

    let notifier: Arc<dyn NotificationSink> = match cfg.notification_redis_url.as_deref() {
        Some(url) => {
            info!("Publishing notifications on channel {}", cfg.notification_channel);
            Arc::new(
                RedisNotificationSink::new(url, cfg.notification_channel.clone())
                    .context("invalid notification redis url")?,
            )
        }
        None => {
            info!("Notification broker not configured; notifications are logged only");
            Arc::new(LoggingNotificationSink)
        }
    };

    let cors_layer = cors_layer(&cfg);
    let addr = SocketAddr::new(
        cfg.host.parse().context("invalid listen host")?,
        cfg.port,
    );

    let app_state = api::AppState::new(db_arc, cfg, gateway, notifier);
    let app = api::app_router(app_state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors_layer);

    info!("eventhub-payments listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn cors_layer(cfg: &api::config::AppConfig) -> CorsLayer {
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .filter_map(|origin| HeaderValue::from_str(origin).ok())
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    match configured_origins {
        Some(origins) => CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any),
        None if cfg.is_development() => {
            info!("Using permissive CORS in development");
            CorsLayer::permissive()
        }
        None => {
            warn!("APP__CORS_ALLOWED_ORIGINS not set; cross-origin browser calls are refused");
            CorsLayer::new()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
