//! # Lobby Example
//!
//! Demonstrates the realtime channel lifecycle of one game session:
//!
//! 1. Connect to the BBTronic broker over STOMP/WebSocket
//! 2. Subscribe to the session topic with an event router
//! 3. Announce ourselves and react to lobby events
//! 4. Recover automatically when the connection drops
//! 5. Disconnect on Ctrl+C or when the session creator leaves
//!
//! ## Running
//!
//! ```sh
//! cargo run --example lobby -- ABC123
//!
//! # Point at a local backend:
//! BBTRONIC_API_BASE_URL=http://localhost:8080 cargo run --example lobby -- ABC123
//! ```

use std::sync::Arc;

use bbtronic_realtime::events::{EventRouter, GAME_STARTED, USER_LEFT, USER_UPDATE};
use bbtronic_realtime::{hook_fns, ConnectionManager, ManagerConfig};
use serde_json::json;
use tokio::sync::Notify;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` to see every frame.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let session = std::env::args().nth(1).unwrap_or_else(|| "ABC123".to_string());
    let config = ManagerConfig::from_env();
    tracing::info!("Connecting to {} for session {session}", config.endpoint);

    let manager = ConnectionManager::websocket(config);
    manager.set_recovery_hook(hook_fns(
        || async { tracing::warn!("Connection lost; retrying") },
        || async {
            tracing::info!("Channel recovered; a real client would re-fetch the lobby here");
        },
    ));

    // ── Connect and subscribe ───────────────────────────────────────
    manager.connect().await?;

    let session_over = Arc::new(Notify::new());
    let notify = Arc::clone(&session_over);
    let router = EventRouter::new()
        .on(USER_UPDATE, |msg| {
            tracing::info!("Player update: {:?}", msg.fields);
        })
        .on(USER_LEFT, |msg| {
            tracing::info!("Player left: {:?}", msg.get("userId"));
        })
        .on(GAME_STARTED, |_| {
            tracing::info!("Game started!");
        })
        .on_creator_left(move |farewell| {
            tracing::warn!(
                "Session closed by its creator: {}",
                farewell.as_deref().unwrap_or("no message")
            );
            notify.notify_one();
        })
        .on_unhandled(|msg| tracing::debug!("Other event: {}", msg.event));
    manager.subscribe(&session, router)?;

    manager.send(&session, USER_UPDATE, json!({ "userName": "RustPlayer" }))?;

    // ── Wait ────────────────────────────────────────────────────────
    tokio::select! {
        () = session_over.notified() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received, shutting down…");
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    manager.disconnect().await;
    tracing::info!("Disconnected. Goodbye!");
    Ok(())
}
