//! REST handlers.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::ledger::Receipt;
use crate::models::{Channel, LedgerEntry, ParticipantId, PriceModel, Wallet};
use crate::session::{SessionView, StartRequest};

/// Header carrying the authenticated caller.
pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// The caller, as vouched for by the fronting auth proxy.
#[derive(Debug, Clone)]
pub struct Participant(pub ParticipantId);

impl<S: Send + Sync> FromRequestParts<S> for Participant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(PARTICIPANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Self(v.to_string()))
            .ok_or_else(ApiError::unauthenticated)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// === Request/Response Types ===

/// Body of a session start. The client is the calling participant.
#[derive(Debug, Deserialize, Serialize)]
pub struct StartSessionRequest {
    pub consultant_id: ParticipantId,
    #[serde(default)]
    pub channel: Channel,
    pub price: PriceModel,
    #[serde(default)]
    pub max_minutes: Option<u32>,
    #[serde(default)]
    pub budget: Option<i64>,
    pub idempotency_key: String,
}

/// Gateway notification of a completed payment.
#[derive(Debug, Deserialize, Serialize)]
pub struct RechargeRequest {
    pub amount: i64,
    /// Gateway transaction id; doubles as the idempotency key.
    pub transaction_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RefundRequest {
    pub session_id: String,
    pub amount: i64,
    pub idempotency_key: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct OpenWalletRequest {
    pub currency: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntriesQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletView {
    #[serde(flatten)]
    pub wallet: Wallet,
    /// Folding the entry log reproduces the cached balance.
    pub consistent: bool,
}

// === Handlers ===

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Participant(client_id): Participant,
    Json(req): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    if req.idempotency_key.trim().is_empty() {
        return Err(ApiError::bad_request("idempotency_key must not be empty"));
    }
    let view = state.manager.start(StartRequest {
        client_id,
        consultant_id: req.consultant_id,
        channel: req.channel,
        price: req.price,
        max_minutes: req.max_minutes,
        budget: req.budget,
        idempotency_key: req.idempotency_key,
    })?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
) -> Json<Vec<SessionView>> {
    Json(state.manager.list_for(&participant))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    Ok(Json(state.manager.status(&id, Some(&participant))?))
}

pub async fn accept_session(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    Ok(Json(state.manager.accept(&id, &participant)?))
}

pub async fn decline_session(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    Ok(Json(state.manager.decline(&id, &participant)?))
}

pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    Ok(Json(state.manager.end(&id, &participant)?))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
) -> ApiResult<SessionView> {
    Ok(Json(state.manager.heartbeat(&id, &participant)?))
}

pub async fn open_wallet(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
    body: Option<Json<OpenWalletRequest>>,
) -> ApiResult<Wallet> {
    require_owner(&state, &participant, &id)?;
    let currency = body
        .and_then(|Json(req)| req.currency)
        .unwrap_or_else(|| state.default_currency.clone());
    Ok(Json(state.ledger.open_wallet(&id, &currency)?))
}

pub async fn get_wallet(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
) -> ApiResult<WalletView> {
    require_owner(&state, &participant, &id)?;
    let wallet = state.ledger.wallet(&id)?;
    let consistent = state.ledger.verify(&id)?;
    Ok(Json(WalletView { wallet, consistent }))
}

pub async fn recharge(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
    Json(req): Json<RechargeRequest>,
) -> ApiResult<Receipt> {
    require_gateway(&state, &participant)?;
    if req.transaction_id.trim().is_empty() {
        return Err(ApiError::bad_request("transaction_id must not be empty"));
    }
    Ok(Json(state.ledger.credit(&id, req.amount, &req.transaction_id)?))
}

pub async fn refund(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Receipt> {
    require_gateway(&state, &participant)?;
    Ok(Json(state.ledger.refund(
        &id,
        &req.session_id,
        req.amount,
        &req.idempotency_key,
    )?))
}

pub async fn list_entries(
    State(state): State<Arc<AppState>>,
    Participant(participant): Participant,
    Path(id): Path<String>,
    Query(query): Query<EntriesQuery>,
) -> ApiResult<Vec<LedgerEntry>> {
    require_owner(&state, &participant, &id)?;
    let entries = match query.session_id {
        Some(session_id) => state.ledger.session_entries(&id, &session_id)?,
        None => state.ledger.entries(&id)?,
    };
    Ok(Json(entries))
}

/// Wallets are visible to their owner and to gateways.
fn require_owner(state: &AppState, participant: &str, wallet_id: &str) -> Result<(), ApiError> {
    if participant == wallet_id || state.is_gateway(participant) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!(
            "{participant} may not access wallet {wallet_id}"
        )))
    }
}

fn require_gateway(state: &AppState, participant: &str) -> Result<(), ApiError> {
    if state.is_gateway(participant) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!(
            "{participant} is not a payment gateway"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::Config;
    use crate::models::{EntryKind, SessionState};
    use axum::http::Request;

    fn state() -> Arc<AppState> {
        let mut config = Config::default();
        config.storage.in_memory = true;
        AppState::open(&config, Arc::new(SystemClock)).unwrap()
    }

    async fn recharge_alice(state: &Arc<AppState>, amount: i64, txn: &str) -> Receipt {
        recharge(
            State(state.clone()),
            Participant("gateway".into()),
            Path("alice".into()),
            Json(RechargeRequest {
                amount,
                transaction_id: txn.into(),
            }),
        )
        .await
        .unwrap()
        .0
    }

    async fn start(state: &Arc<AppState>, key: &str) -> Result<SessionView, ApiError> {
        start_session(
            State(state.clone()),
            Participant("alice".into()),
            Json(StartSessionRequest {
                consultant_id: "bob".into(),
                channel: Channel::Chat,
                price: PriceModel::PerMinute { rate: 100 },
                max_minutes: None,
                budget: Some(250),
                idempotency_key: key.into(),
            }),
        )
        .await
        .map(|(status, Json(view))| {
            assert_eq!(status, StatusCode::CREATED);
            view
        })
    }

    #[tokio::test]
    async fn gateway_retry_credits_once() {
        let state = state();
        let first = recharge_alice(&state, 500, "gw-123").await;
        let retry = recharge_alice(&state, 500, "gw-123").await;
        assert!(!first.replayed);
        assert!(retry.replayed);

        let Json(view) = get_wallet(
            State(state.clone()),
            Participant("alice".into()),
            Path("alice".into()),
        )
        .await
        .unwrap();
        assert_eq!(view.wallet.available, 500);
        assert!(view.consistent);
    }

    #[tokio::test]
    async fn session_round_trip_over_http_handlers() {
        let state = state();
        recharge_alice(&state, 1000, "gw-1").await;

        let view = start(&state, "req-1").await.unwrap();
        let id = view.session.id.clone();
        assert_eq!(view.session.state, SessionState::Pending);

        let Json(view) = accept_session(
            State(state.clone()),
            Participant("bob".into()),
            Path(id.clone()),
        )
        .await
        .unwrap();
        assert_eq!(view.session.state, SessionState::Active);

        let Json(view) = end_session(
            State(state.clone()),
            Participant("alice".into()),
            Path(id.clone()),
        )
        .await
        .unwrap();
        assert_eq!(view.session.state, SessionState::Completed);

        let Json(entries) = list_entries(
            State(state.clone()),
            Participant("alice".into()),
            Path("alice".into()),
            Query(EntriesQuery {
                session_id: Some(id),
            }),
        )
        .await
        .unwrap();
        let kinds: Vec<_> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntryKind::Reserve, EntryKind::Release]);
    }

    #[tokio::test]
    async fn errors_carry_stable_codes() {
        let state = state();
        let err = start(&state, "req-1").await.unwrap_err();
        assert_eq!(err.code, "wallet_not_found");
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        recharge_alice(&state, 1000, "gw-1").await;
        let id = start(&state, "req-2").await.unwrap().session.id;
        let err = get_session(
            State(state.clone()),
            Participant("mallory".into()),
            Path(id.clone()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        decline_session(State(state.clone()), Participant("bob".into()), Path(id.clone()))
            .await
            .unwrap();
        let err = accept_session(State(state.clone()), Participant("bob".into()), Path(id))
            .await
            .unwrap_err();
        assert_eq!(err.code, "stale_transition");
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn participant_header_is_required() {
        let (mut parts, ()) = Request::builder()
            .uri("/api/sessions")
            .body(())
            .unwrap()
            .into_parts();
        let err = Participant::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let (mut parts, ()) = Request::builder()
            .uri("/api/sessions")
            .header(PARTICIPANT_HEADER, "alice")
            .body(())
            .unwrap()
            .into_parts();
        let Participant(who) = Participant::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(who, "alice");
    }

    #[tokio::test]
    async fn open_wallet_defaults_currency() {
        let state = state();
        let Json(wallet) = open_wallet(
            State(state.clone()),
            Participant("carol".into()),
            Path("carol".into()),
            None,
        )
        .await
        .unwrap();
        assert_eq!(wallet.currency, "USD");
        assert_eq!(wallet.available, 0);
    }

    #[tokio::test]
    async fn wallets_are_private_to_owner_and_gateway() {
        let state = state();
        recharge_alice(&state, 1000, "gw-1").await;

        let err = get_wallet(
            State(state.clone()),
            Participant("mallory".into()),
            Path("alice".into()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let err = list_entries(
            State(state.clone()),
            Participant("mallory".into()),
            Path("alice".into()),
            Query(EntriesQuery::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let err = open_wallet(
            State(state.clone()),
            Participant("mallory".into()),
            Path("alice".into()),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let Json(view) = get_wallet(
            State(state.clone()),
            Participant("gateway".into()),
            Path("alice".into()),
        )
        .await
        .unwrap();
        assert_eq!(view.wallet.available, 1000);
    }

    #[tokio::test]
    async fn only_gateways_move_money() {
        let state = state();
        recharge_alice(&state, 1000, "gw-1").await;

        let err = recharge(
            State(state.clone()),
            Participant("alice".into()),
            Path("alice".into()),
            Json(RechargeRequest {
                amount: 500,
                transaction_id: "self-credit".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.code, "forbidden");

        let id = start(&state, "req-1").await.unwrap().session.id;
        let err = refund(
            State(state.clone()),
            Participant("mallory".into()),
            Path("alice".into()),
            Json(RefundRequest {
                session_id: id,
                amount: 10,
                idempotency_key: "r1".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let Json(view) = get_wallet(
            State(state.clone()),
            Participant("alice".into()),
            Path("alice".into()),
        )
        .await
        .unwrap();
        assert_eq!((view.wallet.available, view.wallet.held), (750, 250));
    }
}
