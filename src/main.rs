//! memalerts-ledger server entry point.
//!
//! Starts the Axum HTTP server with REST and WebSocket endpoints and one
//! outbox dispatcher per configured chat bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use memalerts_ledger::api;
use memalerts_ledger::app_state::{AppState, Collaborators};
use memalerts_ledger::config::LedgerConfig;
use memalerts_ledger::domain::EventBus;
use memalerts_ledger::persistence::LedgerStore;
use memalerts_ledger::persistence::memory::MemoryStore;
use memalerts_ledger::persistence::postgres::PostgresStore;
use memalerts_ledger::resilience::CircuitBreakerRegistry;
use memalerts_ledger::service::{
    BalanceRelay, ChannelSettingsSource, ChatSender, HttpChatSender, IdentityResolver,
    InMemoryChannelSettings, InMemoryIdentityResolver, InMemoryStreamStatus, OutboxDispatcher,
    StreamStatusSource,
};
use memalerts_ledger::ws::handler::ws_handler;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_store(config: &LedgerConfig) -> anyhow::Result<(Arc<dyn LedgerStore>, Collaborators)> {
    if !config.persistence_enabled {
        tracing::warn!("persistence disabled; running on the in-memory store");
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        return Ok((
            store,
            Collaborators {
                identities: Arc::new(InMemoryIdentityResolver::new()),
                streams: Arc::new(InMemoryStreamStatus::new()),
                channels: Arc::new(InMemoryChannelSettings::new()),
            },
        ));
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("running migrations")?;
    tracing::info!("database ready");

    let store = Arc::new(PostgresStore::new(pool));
    let identities = Arc::clone(&store) as Arc<dyn IdentityResolver>;
    let streams = Arc::clone(&store) as Arc<dyn StreamStatusSource>;
    let channels = Arc::clone(&store) as Arc<dyn ChannelSettingsSource>;
    let store: Arc<dyn LedgerStore> = store;
    Ok((
        store,
        Collaborators {
            identities,
            streams,
            channels,
        },
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = LedgerConfig::from_env().context("loading configuration")?;
    tracing::info!(
        addr = %config.listen_addr,
        instance = %config.instance_id,
        peers = config.relay_peers.len(),
        "starting memalerts-ledger"
    );
    if !config.relay_peers.is_empty() && config.relay_secret.is_none() {
        tracing::warn!("RELAY_PEERS set without INTERNAL_RELAY_SECRET; peer relay disabled");
    }

    let (store, collaborators) = open_store(&config).await?;
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker));
    let relay = BalanceRelay::new(
        EventBus::new(config.event_bus_capacity),
        config.relay_settings(),
        Arc::clone(&breakers),
    )?;

    let app_state = AppState::new(
        Arc::clone(&store),
        collaborators,
        relay,
        Arc::clone(&breakers),
        config.retry,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut dispatchers = Vec::new();
    for (platform, url) in &config.chat_bridges {
        let sender: Arc<dyn ChatSender> = Arc::new(HttpChatSender::new(url, config.outbound_timeout)?);
        let dispatcher = OutboxDispatcher::new(
            *platform,
            Arc::clone(&store),
            sender,
            &breakers,
            config.dispatcher,
        );
        dispatchers.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));
    }

    let app = Router::new()
        .merge(api::build_router())
        .route("/ws", get(ws_handler))
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in dispatchers {
        let _ = handle.await;
    }
    tracing::info!("stopped");
    Ok(())
}
