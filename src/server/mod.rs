pub mod api;
pub mod ws;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    routing::{get, patch},
    Json, Router,
};
use colored::*;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::feed::ChangeFeedWatcher;
use crate::hub::BroadcastHub;
use crate::session::SessionManager;
use crate::storage::{self, ChangeLogCursor, OrderStore, SqliteChangeFeed};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: OrderStore,
    pub sessions: SessionManager,
    pub watcher: Arc<ChangeFeedWatcher>,
    /// Read position of the watcher's change feed
    pub feed_cursor: ChangeLogCursor,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    /// Open the database and wire store, hub, sessions and watcher together.
    /// The watcher is not started.
    pub async fn build(config: RelayConfig) -> Result<Self> {
        let db = storage::init(&config.database_path).await?;
        let store = OrderStore::new(db.clone());
        let hub = Arc::new(BroadcastHub::new());

        let sessions = SessionManager::new(
            hub.clone(),
            Arc::new(store.clone()),
            config.session_options(),
        );
        let feed = Arc::new(SqliteChangeFeed::new(db, config.feed_poll_interval));
        let feed_cursor = feed.consumed();
        let watcher = Arc::new(ChangeFeedWatcher::new(feed, hub, config.feed_backoff()));

        Ok(Self {
            store,
            sessions,
            watcher,
            feed_cursor,
            config: Arc::new(config),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Orderfeed change relay" }))
        .route("/health", get(health))
        .route("/api/orders", get(api::list_orders).post(api::create_order))
        .route("/api/orders/stats/summary", get(api::stats))
        .route(
            "/api/orders/{id}",
            get(api::get_order)
                .put(api::update_order)
                .delete(api::delete_order),
        )
        .route("/api/orders/{id}/status", patch(api::update_status))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let watcher = state.watcher.state();
    Json(json!({
        "status": "ok",
        "feed": {
            "status": watcher.status,
            "retryCount": watcher.retry_count,
            "lastError": watcher.last_error,
        },
        "sessions": state.sessions.active_sessions(),
    }))
}

/// Run the relay on `listener` until `shutdown` resolves.
pub async fn run(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    state.watcher.start();

    let compaction = {
        let store = state.store.clone();
        let cursor = state.feed_cursor.clone();
        let retain = state.config.change_log_retention;
        let period = state.config.compaction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.compact_change_log(retain, cursor.get()).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, retain, "change log compacted"),
                    Err(err) => warn!(error = %err, "change log compaction failed"),
                }
            }
        })
    };

    let app = router(state.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    compaction.abort();
    state.sessions.close_all();
    state.watcher.shutdown().await;
    info!("relay stopped");

    served.map_err(Into::into)
}

pub async fn serve(config: RelayConfig) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.port);
    let state = AppState::build(config).await?;
    let listener = TcpListener::bind(&addr).await?;

    println!(
        "{} Relay running at {}",
        "✓".green(),
        format!("http://{}", addr).bright_blue()
    );
    println!(
        "{} Observers connect to {}",
        "→".bright_black(),
        format!("ws://{}/ws", addr).bright_blue()
    );

    run(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
}
