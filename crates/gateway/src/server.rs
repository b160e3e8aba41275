//! Router construction and server startup/shutdown orchestration.

use std::sync::Arc;

use {
    axum::{
        Router,
        routing::{get, post},
    },
    livedesk_broker::Broker,
    livedesk_chat::ChatService,
    livedesk_config::LivedeskConfig,
    livedesk_dispatch::{Dispatcher, IdleReaper},
    livedesk_presence::PresenceRegistry,
    livedesk_store::ChatStore,
    tokio_util::sync::CancellationToken,
    tower_http::{cors::CorsLayer, trace::TraceLayer},
    tracing::info,
};

use crate::{
    auth::{Authenticator, StoreAuthenticator},
    routes,
    state::GatewayState,
    ws,
};

/// Wire every service onto a connected pool. Shared by production startup
/// and the integration tests.
pub async fn build_state(
    config: LivedeskConfig,
    pool: sqlx::SqlitePool,
) -> anyhow::Result<Arc<GatewayState>> {
    livedesk_store::run_migrations(&pool).await?;
    let store = ChatStore::new(pool);

    let presence = Arc::new(PresenceRegistry::new());
    presence.rehydrate(&store).await?;

    let broker = Arc::new(Broker::new());
    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::clone(&presence),
        Arc::clone(&broker),
        config.chat.clone(),
    );
    let chat = ChatService::new(
        store.clone(),
        Arc::clone(&presence),
        Arc::clone(&broker),
        Arc::clone(&dispatcher),
        config.chat.clone(),
    );
    let authenticator: Arc<dyn Authenticator> = Arc::new(StoreAuthenticator::new(store.clone()));

    Ok(GatewayState::new(
        store,
        presence,
        broker,
        dispatcher,
        chat,
        authenticator,
        config,
    ))
}

/// Build the gateway router (shared between production startup and tests).
pub fn build_app(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ws/customer", get(ws::customer_upgrade))
        .route("/ws/cs", get(ws::cs_upgrade))
        .route("/ws/admin", get(ws::admin_upgrade))
        .route("/api/chat/init", post(routes::chat_init))
        .route("/api/chat/session/{token}", get(routes::chat_session))
        .route("/api/chat/rating", post(routes::chat_rating))
        .route("/api/agent/chats", get(routes::agent_chats))
        .route("/api/agent/queue", get(routes::agent_queue))
        .route("/api/agent/history", get(routes::agent_history))
        .route("/api/agent/canned", get(routes::agent_canned))
        .route("/api/admin/activity", get(routes::admin_activity))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Spawn the dispatcher, the reaper and the presence feed, returning the
/// token that stops them.
pub fn spawn_background_tasks(state: &Arc<GatewayState>) -> CancellationToken {
    let shutdown = CancellationToken::new();

    tokio::spawn(Arc::clone(&state.dispatcher).run(shutdown.clone()));

    // Presence/capacity changes stream to the dashboards as incremental
    // stats frames; the broker treats them as lossy.
    let mut presence_feed = state.presence.subscribe();
    let feed_broker = Arc::clone(&state.broker);
    let feed_shutdown = shutdown.clone();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            tokio::select! {
                change = presence_feed.recv() => match change {
                    Ok(change) => feed_broker.publish(
                        &livedesk_broker::Topic::admin_stats(),
                        &livedesk_protocol::Envelope::new(
                            livedesk_protocol::server_events::STATS_UPDATE,
                            serde_json::json!({ "agent": change.agent }),
                        ),
                    ),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                },
                _ = feed_shutdown.cancelled() => return,
            }
        }
    });

    let reaper = IdleReaper::new(
        state.store.clone(),
        Arc::clone(&state.presence),
        Arc::clone(&state.broker),
        Arc::clone(&state.dispatcher),
        state.config.chat.clone(),
    );
    tokio::spawn(reaper.run(shutdown.clone()));

    // Pick up any backlog left from before the restart.
    state.dispatcher.trigger();
    shutdown
}

/// Run the broker until ctrl-c: open the database, start the background
/// tasks, serve, then flush presence on the way out.
pub async fn start(config: LivedeskConfig) -> anyhow::Result<()> {
    let pool = livedesk_store::connect(&config.database.url).await?;
    let bind = format!("{}:{}", config.server.host, config.server.port);
    let state = build_state(config, pool).await?;
    let shutdown = spawn_background_tasks(&state);

    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    shutdown.cancel();
    state.presence.flush_offline(&state.store).await?;
    info!("presence flushed; goodbye");
    Ok(())
}
