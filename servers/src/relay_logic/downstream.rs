use crate::relay_logic::model::{HealthReport, ServerMessage};
use crate::relay_logic::state::AppState;
use axum::{
    extract::{
        ConnectInfo, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use lib_relay::{SessionId, SessionInbox, session_channel};
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tower_http::cors::{Any, CorsLayer};

const INDEX_HTML: &str = include_str!("../../static/index.html");

pub fn router(app_state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(app_state)
}

pub async fn run(
    port: u16,
    app_state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Viewer server listening on http://{}", addr);

    axum::serve(
        listener,
        router(app_state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.recv().await.ok();
        log::info!("Viewer server shutting down.");
    })
    .await?;

    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        broker: state.broker_state(),
        sessions: state.registry.len(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        relay: state.stats.snapshot(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (handle, inbox) = session_channel(state.session_queue);
    let session_id = match state.registry.register(handle) {
        Ok(id) => id,
        Err(e) => {
            log::warn!("Refusing viewer {}: {}", addr, e);
            let close = Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: e.to_string().into(),
            }));
            let _ = timeout(state.send_timeout, socket.send(close)).await;
            return;
        }
    };
    log::info!("Viewer {} connected as session {}", addr, session_id);

    let (sink, stream) = socket.split();
    run_session(sink, stream, inbox, &state, session_id).await;
    log::info!("Viewer {} (session {}) disconnected", addr, session_id);
}

/// Pumps records to one viewer until either direction ends, then unregisters it.
async fn run_session<S, R, E>(
    sink: S,
    stream: R,
    inbox: SessionInbox,
    state: &AppState,
    session_id: SessionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    // Whichever side finishes first ends the session.
    tokio::select! {
        _ = write_records(sink, inbox, state.send_timeout, session_id) => {}
        _ = read_until_closed(stream, session_id) => {}
    }

    state.registry.unregister(session_id);
}

async fn write_records<S>(
    mut sink: S,
    mut inbox: SessionInbox,
    send_timeout: Duration,
    session_id: SessionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(record) = inbox.recv().await {
        let text = match serde_json::to_string(&ServerMessage::telemetry(&record)) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize record for session {}: {}", session_id, e);
                continue;
            }
        };

        match timeout(send_timeout, sink.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("Session {} send failed: {}", session_id, e);
                return;
            }
            Err(_) => {
                log::warn!("Session {} send timed out after {:?}", session_id, send_timeout);
                return;
            }
        }
    }

    // Inbox closed: the registry dropped this session (stalled, or relay shutdown).
    let close = Message::Close(Some(CloseFrame {
        code: close_code::AWAY,
        reason: "relay closed the session".into(),
    }));
    let _ = timeout(send_timeout, sink.send(close)).await;
}

async fn read_until_closed<R, E>(mut stream: R, session_id: SessionId)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Close(_)) => break,
            Ok(Message::Text(text)) => {
                log::debug!("Ignoring viewer message on session {}: {}", session_id, text.as_str());
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("Session {} read error: {}", session_id, e);
                break;
            }
        }
    }
}
