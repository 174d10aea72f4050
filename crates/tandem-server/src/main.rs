mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use tandem_api::{AppStateInner, decode_token};
use tandem_chat::{
    BufferConfig, MatchingConfig, MatchingQueue, MessageBuffer, NameCache, PresenceConfig,
    PresenceTracker, RoomLifecycle, SqliteStore,
};
use tandem_crypto::MessageCipher;
use tandem_db::Database;
use tandem_gateway::{ChatContext, Dispatcher, Fanout, connection};
use tandem_kv::{KvStore, MemoryStore, RedisStore};

use crate::config::Config;

#[derive(Clone)]
struct GatewayState {
    chat: ChatContext,
    jwt_secret: String,
}

#[derive(serde::Deserialize)]
struct GatewayQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.uses_dev_secret() {
        warn!("TANDEM_JWT_SECRET is not set, using the development secret");
    }

    // Persistent store
    let db = Arc::new(Database::open(&PathBuf::from(&config.db_path))?);
    let store = Arc::new(SqliteStore::new(db));

    // Shared KV: queues, buffer, presence, pub/sub
    let kv: Arc<dyn KvStore> = if config.uses_memory_store() {
        info!("Using in-process KV store; run a single process only");
        Arc::new(MemoryStore::new())
    } else {
        let redis = RedisStore::connect(&config.redis_url).await?;
        redis.ping().await?;
        Arc::new(redis)
    };

    let cipher = config.message_key.as_ref().map(MessageCipher::new);
    if cipher.is_none() {
        warn!("TANDEM_MESSAGE_KEY is not set, messages are stored in plaintext");
    }

    // Core services
    let dispatcher = Dispatcher::new();
    let fanout = Fanout::new(kv.clone(), dispatcher.clone());
    let subscriber = fanout.subscribe().await?;
    let events = Arc::new(fanout);

    let lifecycle = RoomLifecycle::new(store.clone());
    let buffer = MessageBuffer::new(
        kv.clone(),
        store.clone(),
        BufferConfig {
            batch_size: config.flush_batch,
            flush_interval: config.flush_interval,
            ..BufferConfig::default()
        },
    );
    let presence = Arc::new(PresenceTracker::new(
        kv.clone(),
        PresenceConfig {
            ttl: config.presence_ttl,
        },
    ));
    let names = Arc::new(NameCache::new(store.clone(), config.name_cache_ttl));
    let matching = Arc::new(MatchingQueue::new(
        kv.clone(),
        store.clone(),
        lifecycle.clone(),
        events.clone(),
        buffer.clone(),
        MatchingConfig {
            pairing_interval: config.pairing_interval,
            match_timeout: config.match_timeout,
            ..MatchingConfig::default()
        },
    ));

    let chat = ChatContext {
        store,
        lifecycle,
        buffer: buffer.clone(),
        presence,
        names,
        events,
        dispatcher,
        cipher,
    };

    // Background loops
    let cancel = CancellationToken::new();
    let fanout_task = tokio::spawn(subscriber.run(cancel.clone()));
    let matching_task = tokio::spawn(matching.clone().run(cancel.clone()));
    let flush_task = tokio::spawn(buffer.run(cancel.clone()));

    // Routes
    let app_state = Arc::new(AppStateInner {
        chat: chat.clone(),
        matching,
        jwt_secret: config.jwt_secret.clone(),
    });

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(GatewayState {
            chat,
            jwt_secret: config.jwt_secret.clone(),
        });

    let app = Router::new()
        .merge(tandem_api::routes(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Tandem server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the loops; the flush loop persists whatever is still buffered.
    cancel.cancel();
    for (name, task) in [("fan-out", fanout_task), ("matching", matching_task), ("flush", flush_task)] {
        if let Err(e) = task.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
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
    info!("Shutdown signal received");
}

/// JWT-authenticated WebSocket upgrade. The token travels in the query
/// string.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(claims) = decode_token(&query.token, &state.jwt_secret) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.chat, claims.sub))
}
