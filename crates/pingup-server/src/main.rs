mod connection;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use pingup_engine::{
    ConversationStore, InboxAggregator, NotificationDispatcher, NtfyTransport, PresenceTracker,
    TypingSignal, UserDirectory,
};
use pingup_store::Store;

#[derive(Clone)]
pub struct AppState {
    pub users: UserDirectory,
    pub presence: PresenceTracker,
    pub conversations: Arc<ConversationStore>,
    pub inbox: InboxAggregator,
    pub typing: Arc<TypingSignal>,
    pub dispatcher: Arc<NotificationDispatcher<NtfyTransport>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pingup=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("PINGUP_DB_PATH").unwrap_or_else(|_| "pingup.db".into());
    let host = std::env::var("PINGUP_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PINGUP_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let ntfy_url =
        std::env::var("PINGUP_NTFY_URL").unwrap_or_else(|_| "https://ntfy.sh/PingUP".into());

    let store = Store::open(&PathBuf::from(&db_path))?;

    let state = AppState {
        users: UserDirectory::new(store.clone()),
        presence: PresenceTracker::new(store.clone()),
        conversations: Arc::new(ConversationStore::new(store.clone())),
        inbox: InboxAggregator::new(store.clone()),
        typing: Arc::new(TypingSignal::new(store.clone())),
        dispatcher: Arc::new(NotificationDispatcher::new(
            store.clone(),
            NtfyTransport::new(ntfy_url),
        )),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/gateway", get(ws_upgrade))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("pingup gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Authentication is an external collaborator; the uid arriving here is
/// already vetted by the excluded auth layer.
#[derive(Debug, Deserialize)]
struct GatewayQuery {
    uid: String,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state, query.uid))
}
