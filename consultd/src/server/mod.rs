//! consultd server: one process owning every wallet and session.
//!
//! Architecture:
//! - `consultd serve` runs here, writing PID/port files under ~/.consultd
//! - Ledger and session snapshots are journaled under the data directory
//! - Other subcommands are thin HTTP clients of this server
//!
//! Endpoints:
//! - POST /api/sessions - Start a session (reserves funds)
//! - GET /api/sessions - Sessions of the calling participant
//! - GET /api/sessions/{id} - Session status
//! - POST /api/sessions/{id}/accept|decline|end|heartbeat
//! - PUT /api/wallets/{id} - Open a wallet
//! - GET /api/wallets/{id} - Wallet balance
//! - POST /api/wallets/{id}/recharge - Credit from the payment gateway
//! - POST /api/wallets/{id}/refund - Return captured funds
//! - GET /api/wallets/{id}/entries - Ledger entries
//! - WS /ws?session_id= - Join a session's room
//!
//! Callers identify themselves with the `x-participant-id` header, set by
//! the authenticating proxy in front of this server. Wallet routes admit
//! the owner and the configured gateway ids; recharge and refund admit
//! gateways only.

mod error;
mod handlers;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::clock::Clock;
use crate::config::{self, Config};
use crate::ledger::{Ledger, LedgerCommit};
use crate::models::{ParticipantId, Session};
use crate::relay::Relay;
use crate::session::{SessionManager, SessionSettings};
use crate::store::{JournalStore, MemoryStore, Store};

pub use error::ApiError;
pub use handlers::{
    OpenWalletRequest, RechargeRequest, StartSessionRequest, WalletView, PARTICIPANT_HEADER,
};

const PID_FILE: &str = "server.pid";
const PORT_FILE: &str = "server.port";
const LEDGER_JOURNAL: &str = "ledger.jsonl";
const SESSION_JOURNAL: &str = "sessions.jsonl";

/// Shared server state.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub ledger: Arc<Ledger>,
    pub relay: Arc<Relay>,
    /// Outbound queue depth per WebSocket endpoint.
    pub channel_capacity: usize,
    pub default_currency: String,
    /// Identities trusted to move money in and out of any wallet.
    pub gateway_ids: Vec<ParticipantId>,
}

impl AppState {
    /// Open the stores, rebuild ledger and sessions, and start listening
    /// for relay presence hints. Must run inside a Tokio runtime.
    pub fn open(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let commits: Arc<dyn Store<LedgerCommit>>;
        let snapshots: Arc<dyn Store<Session>>;
        if config.storage.in_memory {
            commits = Arc::new(MemoryStore::<LedgerCommit>::new());
            snapshots = Arc::new(MemoryStore::<Session>::new());
        } else {
            let dir = config.data_dir()?;
            let ledger_path = dir.join(LEDGER_JOURNAL);
            let session_path = dir.join(SESSION_JOURNAL);
            commits = Arc::new(
                JournalStore::<LedgerCommit>::open_at(&ledger_path).with_context(|| {
                    format!("Failed to open ledger journal at {}", ledger_path.display())
                })?,
            );
            snapshots = Arc::new(
                JournalStore::<Session>::open_at(&session_path).with_context(|| {
                    format!("Failed to open session journal at {}", session_path.display())
                })?,
            );
        }

        let ledger = Arc::new(
            Ledger::open(commits, clock.clone(), &config.ledger.default_currency)
                .context("Failed to restore ledger")?,
        );
        let (relay, hints) = Relay::new();
        let manager = SessionManager::new(
            ledger.clone(),
            relay.clone(),
            snapshots,
            clock,
            SessionSettings::from_config(config),
        );
        manager.listen(hints);
        manager.resume().context("Failed to restore sessions")?;

        Ok(Arc::new(Self {
            manager,
            ledger,
            relay,
            channel_capacity: config.server.channel_capacity.max(1),
            default_currency: config.ledger.default_currency.clone(),
            gateway_ids: config.ledger.gateway_ids.clone(),
        }))
    }

    pub fn is_gateway(&self, participant: &str) -> bool {
        self.gateway_ids.iter().any(|id| id == participant)
    }
}

/// Build the HTTP/WebSocket router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/sessions",
            post(handlers::start_session).get(handlers::list_sessions),
        )
        .route("/api/sessions/{id}", get(handlers::get_session))
        .route("/api/sessions/{id}/accept", post(handlers::accept_session))
        .route("/api/sessions/{id}/decline", post(handlers::decline_session))
        .route("/api/sessions/{id}/end", post(handlers::end_session))
        .route("/api/sessions/{id}/heartbeat", post(handlers::heartbeat))
        .route(
            "/api/wallets/{id}",
            get(handlers::get_wallet).put(handlers::open_wallet),
        )
        .route("/api/wallets/{id}/recharge", post(handlers::recharge))
        .route("/api/wallets/{id}/refund", post(handlers::refund))
        .route("/api/wallets/{id}/entries", get(handlers::list_entries))
        .route("/ws", get(ws::websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// === Server Lifecycle ===

/// Run the server until Ctrl-C.
pub async fn start_server(config: Config, clock: Arc<dyn Clock>) -> Result<()> {
    let server_dir = config::home_dir()?;
    std::fs::create_dir_all(&server_dir)
        .with_context(|| format!("Failed to create {}", server_dir.display()))?;

    let port = config.server.port;
    let state = AppState::open(&config, clock)?;
    let app = router(state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    std::fs::write(server_dir.join(PID_FILE), std::process::id().to_string())?;
    std::fs::write(server_dir.join(PORT_FILE), port.to_string())?;
    info!(%addr, in_memory = config.storage.in_memory, "consultd listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    state.manager.shutdown();
    let _ = std::fs::remove_file(server_dir.join(PID_FILE));
    let _ = std::fs::remove_file(server_dir.join(PORT_FILE));
    info!("consultd stopped");
    served
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Port of the running server, if its PID file points at a live process.
pub fn get_server_port() -> Option<u16> {
    let server_dir = config::home_dir().ok()?;
    let pid: u32 = std::fs::read_to_string(server_dir.join(PID_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()?;

    #[cfg(unix)]
    {
        use std::process::Command;
        let alive = Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !alive {
            return None;
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    std::fs::read_to_string(server_dir.join(PORT_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}
