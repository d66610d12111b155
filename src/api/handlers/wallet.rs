//! Wallet handlers: balance read, bonus claims, spending, admin overrides.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::api::dto::{AdjustmentMode, AdjustmentRequest, SpendRequest, WalletResponse};
use crate::app_state::AppState;
use crate::domain::{ChannelId, UserId, WalletKey};
use crate::error::{ErrorResponse, LedgerError};
use crate::service::ClaimOutcome;

fn wallet_key((channel_id, user_id): (Uuid, Uuid)) -> WalletKey {
    WalletKey::new(UserId::from_uuid(user_id), ChannelId::from_uuid(channel_id))
}

fn claim_response(outcome: ClaimOutcome) -> impl IntoResponse {
    let status = match outcome {
        ClaimOutcome::Granted(_) => StatusCode::OK,
        ClaimOutcome::Rejected(_) => StatusCode::CONFLICT,
    };
    (status, Json(outcome))
}

/// `GET /channels/{channel_id}/wallets/{user_id}`: Read a balance.
///
/// Never creates the wallet; unknown wallets read as zero.
///
/// # Errors
///
/// Returns [`LedgerError::Store`] on persistence failure.
#[utoipa::path(
    get,
    path = "/api/v1/channels/{channel_id}/wallets/{user_id}",
    tag = "Wallets",
    summary = "Get wallet balance",
    params(
        ("channel_id" = uuid::Uuid, Path, description = "Channel UUID"),
        ("user_id" = uuid::Uuid, Path, description = "User UUID"),
    ),
    responses(
        (status = 200, description = "Wallet (zero balance if never written)", body = WalletResponse),
    )
)]
pub async fn get_wallet(
    State(state): State<AppState>,
    Path(ids): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, LedgerError> {
    let wallet = state.ledger.get_or_default(wallet_key(ids)).await?;
    Ok(Json(WalletResponse::from(wallet)))
}

/// `POST …/daily-bonus`: Claim the daily bonus.
///
/// # Errors
///
/// Returns [`LedgerError::Store`] on persistence failure. Cooldown and
/// availability rejections are answered with 409 and a typed body.
#[utoipa::path(
    post,
    path = "/api/v1/channels/{channel_id}/wallets/{user_id}/daily-bonus",
    tag = "Wallets",
    summary = "Claim daily bonus",
    params(
        ("channel_id" = uuid::Uuid, Path, description = "Channel UUID"),
        ("user_id" = uuid::Uuid, Path, description = "User UUID"),
    ),
    responses(
        (status = 200, description = "Bonus granted", body = serde_json::Value),
        (status = 409, description = "Claim rejected (cooldown_active, unavailable)", body = serde_json::Value),
    )
)]
pub async fn claim_daily_bonus(
    State(state): State<AppState>,
    Path(ids): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, LedgerError> {
    let outcome = state.economy.claim_daily_bonus(wallet_key(ids)).await?;
    Ok(claim_response(outcome))
}

/// `POST …/watch-bonus`: Claim the watch bonus of the current stream.
///
/// # Errors
///
/// Returns [`LedgerError::Store`] on persistence failure.
#[utoipa::path(
    post,
    path = "/api/v1/channels/{channel_id}/wallets/{user_id}/watch-bonus",
    tag = "Wallets",
    summary = "Claim watch bonus",
    params(
        ("channel_id" = uuid::Uuid, Path, description = "Channel UUID"),
        ("user_id" = uuid::Uuid, Path, description = "User UUID"),
    ),
    responses(
        (status = 200, description = "Bonus granted", body = serde_json::Value),
        (status = 409, description = "Claim rejected (cooldown_active, limit_reached, unavailable)", body = serde_json::Value),
    )
)]
pub async fn claim_watch_bonus(
    State(state): State<AppState>,
    Path(ids): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, LedgerError> {
    let outcome = state.economy.claim_watch_bonus(wallet_key(ids)).await?;
    Ok(claim_response(outcome))
}

/// `POST …/spend`: Spend coins (meme activation).
///
/// # Errors
///
/// Returns [`LedgerError::InvalidAmount`] for a non-positive cost and
/// [`LedgerError::InsufficientBalance`] when the wallet cannot cover it.
#[utoipa::path(
    post,
    path = "/api/v1/channels/{channel_id}/wallets/{user_id}/spend",
    tag = "Wallets",
    summary = "Spend coins",
    params(
        ("channel_id" = uuid::Uuid, Path, description = "Channel UUID"),
        ("user_id" = uuid::Uuid, Path, description = "User UUID"),
    ),
    request_body = SpendRequest,
    responses(
        (status = 200, description = "Coins spent", body = WalletResponse),
        (status = 400, description = "Invalid cost", body = ErrorResponse),
        (status = 422, description = "Insufficient balance", body = ErrorResponse),
    )
)]
pub async fn spend(
    State(state): State<AppState>,
    Path(ids): Path<(Uuid, Uuid)>,
    Json(req): Json<SpendRequest>,
) -> Result<impl IntoResponse, LedgerError> {
    let wallet = state.economy.spend(wallet_key(ids), req.cost).await?;
    Ok(Json(WalletResponse::from(wallet)))
}

/// `POST …/adjustments`: Admin balance adjustment or override.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidAmount`] for a negative target balance
/// and [`LedgerError::InsufficientBalance`] when a negative delta exceeds
/// the balance.
#[utoipa::path(
    post,
    path = "/api/v1/channels/{channel_id}/wallets/{user_id}/adjustments",
    tag = "Wallets",
    summary = "Adjust balance",
    params(
        ("channel_id" = uuid::Uuid, Path, description = "Channel UUID"),
        ("user_id" = uuid::Uuid, Path, description = "User UUID"),
    ),
    request_body = AdjustmentRequest,
    responses(
        (status = 200, description = "Balance adjusted", body = WalletResponse),
        (status = 400, description = "Invalid amount", body = ErrorResponse),
        (status = 422, description = "Insufficient balance", body = ErrorResponse),
    )
)]
pub async fn adjust(
    State(state): State<AppState>,
    Path(ids): Path<(Uuid, Uuid)>,
    Json(req): Json<AdjustmentRequest>,
) -> Result<impl IntoResponse, LedgerError> {
    let key = wallet_key(ids);
    let wallet = match req.mode {
        AdjustmentMode::Delta => state.economy.admin_adjust(key, req.amount).await?,
        AdjustmentMode::Set => state.economy.admin_set(key, req.amount).await?,
    };
    tracing::info!(wallet = %key, mode = ?req.mode, amount = req.amount, balance = wallet.balance, "admin balance adjustment");
    Ok(Json(WalletResponse::from(wallet)))
}

/// Wallet routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/channels/{channel_id}/wallets/{user_id}", get(get_wallet))
        .route(
            "/channels/{channel_id}/wallets/{user_id}/daily-bonus",
            post(claim_daily_bonus),
        )
        .route(
            "/channels/{channel_id}/wallets/{user_id}/watch-bonus",
            post(claim_watch_bonus),
        )
        .route("/channels/{channel_id}/wallets/{user_id}/spend", post(spend))
        .route(
            "/channels/{channel_id}/wallets/{user_id}/adjustments",
            post(adjust),
        )
}
