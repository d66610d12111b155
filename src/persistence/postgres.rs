//! PostgreSQL implementation of the persistence layer.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{LedgerStore, LedgerTx, RewardEventRecord, StoreError, StoreResult};
use crate::domain::{
    BonusState, ChannelId, ChannelSettings, EconomySettings, OutboxMessage, OutboxStatus,
    Provider, RewardRule, RewardStatus, StreamSnapshot, StreamState, UserId, Wallet, WalletKey,
};
use crate::service::collaborators::{
    ChannelSettingsSource, IdentityResolver, StreamStatusSource,
};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            match db.code().as_deref() {
                Some("40001" | "40P01") => return Self::Conflict(db.message().to_string()),
                Some("23505") => return Self::UniqueViolation(db.message().to_string()),
                _ => {}
            }
        }
        Self::Database(e.to_string())
    }
}

fn parse_column<T: FromStr<Err = String>>(raw: &str) -> StoreResult<T> {
    raw.parse().map_err(StoreError::Decode)
}

const REWARD_COLUMNS: &str = "id, provider, provider_event_id, channel_id, provider_account_id, \
     linked_user_id, event_type, currency, amount, coins_to_grant, status, reason, event_at, \
     raw_payload, created_at, claimed_at";

const OUTBOX_COLUMNS: &str = "id, platform, channel_id, destination, payload, status, attempts, \
     created_at, processing_at, sent_at, failed_at, last_error";

fn wallet_from_row(
    (user_id, channel_id, balance, updated_at): (Uuid, Uuid, i64, DateTime<Utc>),
) -> Wallet {
    Wallet {
        user_id: UserId::from_uuid(user_id),
        channel_id: ChannelId::from_uuid(channel_id),
        balance,
        updated_at,
    }
}

fn reward_from_row(row: &PgRow) -> StoreResult<RewardEventRecord> {
    let provider: String = row.try_get("provider")?;
    let status: String = row.try_get("status")?;
    let linked: Option<Uuid> = row.try_get("linked_user_id")?;
    Ok(RewardEventRecord {
        id: row.try_get("id")?,
        provider: parse_column(&provider)?,
        provider_event_id: row.try_get("provider_event_id")?,
        channel_id: ChannelId::from_uuid(row.try_get("channel_id")?),
        provider_account_id: row.try_get("provider_account_id")?,
        linked_user_id: linked.map(UserId::from_uuid),
        event_type: row.try_get("event_type")?,
        currency: row.try_get("currency")?,
        amount: row.try_get("amount")?,
        coins_to_grant: row.try_get("coins_to_grant")?,
        status: parse_column::<RewardStatus>(&status)?,
        reason: row.try_get("reason")?,
        event_at: row.try_get("event_at")?,
        raw_payload: row.try_get("raw_payload")?,
        created_at: row.try_get("created_at")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

fn outbox_from_row(row: &PgRow) -> StoreResult<OutboxMessage> {
    let platform: String = row.try_get("platform")?;
    let status: String = row.try_get("status")?;
    Ok(OutboxMessage {
        id: row.try_get("id")?,
        platform: parse_column(&platform)?,
        channel_id: ChannelId::from_uuid(row.try_get("channel_id")?),
        destination: row.try_get("destination")?,
        payload: row.try_get("payload")?,
        status: parse_column::<OutboxStatus>(&status)?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        processing_at: row.try_get("processing_at")?,
        sent_at: row.try_get("sent_at")?,
        failed_at: row.try_get("failed_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn count_to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// PostgreSQL-backed store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store over the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn find_wallet_for_update(&mut self, key: WalletKey) -> StoreResult<Option<Wallet>> {
        let row = sqlx::query_as::<_, (Uuid, Uuid, i64, DateTime<Utc>)>(
            "SELECT user_id, channel_id, balance, updated_at FROM wallets \
             WHERE user_id = $1 AND channel_id = $2 FOR UPDATE",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.channel_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(wallet_from_row))
    }

    async fn insert_wallet_if_absent(
        &mut self,
        key: WalletKey,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "INSERT INTO wallets (user_id, channel_id, balance, updated_at) \
             VALUES ($1, $2, 0, $3) ON CONFLICT (user_id, channel_id) DO NOTHING",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.channel_id.as_uuid())
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn write_balance(
        &mut self,
        key: WalletKey,
        balance: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Wallet> {
        let row = sqlx::query_as::<_, (Uuid, Uuid, i64, DateTime<Utc>)>(
            "UPDATE wallets SET balance = $3, updated_at = $4 \
             WHERE user_id = $1 AND channel_id = $2 \
             RETURNING user_id, channel_id, balance, updated_at",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.channel_id.as_uuid())
        .bind(balance)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(wallet_from_row(row))
    }

    async fn insert_delivery(
        &mut self,
        provider: Provider,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "INSERT INTO external_reward_deliveries (provider, delivery_id, received_at) \
             VALUES ($1, $2, $3) ON CONFLICT (provider, delivery_id) DO NOTHING",
        )
        .bind(provider.as_str())
        .bind(delivery_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn link_delivery_event(
        &mut self,
        provider: Provider,
        delivery_id: &str,
        event_id: Uuid,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE external_reward_deliveries SET external_event_id = $3 \
             WHERE provider = $1 AND delivery_id = $2",
        )
        .bind(provider.as_str())
        .bind(delivery_id)
        .bind(event_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_reward_event(&mut self, event: &RewardEventRecord) -> StoreResult<u64> {
        let result = sqlx::query(
            "INSERT INTO external_reward_events (id, provider, provider_event_id, channel_id, \
             provider_account_id, linked_user_id, event_type, currency, amount, coins_to_grant, \
             status, reason, event_at, raw_payload, created_at, claimed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT (provider, provider_event_id) DO NOTHING",
        )
        .bind(event.id)
        .bind(event.provider.as_str())
        .bind(&event.provider_event_id)
        .bind(event.channel_id.as_uuid())
        .bind(&event.provider_account_id)
        .bind(event.linked_user_id.map(Uuid::from))
        .bind(&event.event_type)
        .bind(&event.currency)
        .bind(event.amount)
        .bind(event.coins_to_grant)
        .bind(event.status.as_str())
        .bind(&event.reason)
        .bind(event.event_at)
        .bind(&event.raw_payload)
        .bind(event.created_at)
        .bind(event.claimed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_reward_event(
        &mut self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<RewardEventRecord>> {
        let sql = format!(
            "SELECT {REWARD_COLUMNS} FROM external_reward_events \
             WHERE provider = $1 AND provider_event_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(provider.as_str())
            .bind(provider_event_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(reward_from_row).transpose()
    }

    async fn mark_reward_claimed(&mut self, id: Uuid, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE external_reward_events SET status = 'claimed', claimed_at = $2 \
             WHERE id = $1 AND status = 'eligible'",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_bonus_state(&mut self, key: WalletKey) -> StoreResult<Option<BonusState>> {
        let row = sqlx::query_as::<
            _,
            (bool, Option<DateTime<Utc>>, i32, Option<DateTime<Utc>>, Option<String>, i32),
        >(
            "SELECT start_bonus_granted, last_daily_claim_at, daily_streak, \
             last_watch_claim_at, watch_session_id, watch_claims_in_session \
             FROM wallet_bonus_states WHERE user_id = $1 AND channel_id = $2",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.channel_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(
            |(granted, last_daily, streak, last_watch, session, claims)| BonusState {
                key,
                start_bonus_granted: granted,
                last_daily_claim_at: last_daily,
                daily_streak: count_to_u32(streak),
                last_watch_claim_at: last_watch,
                watch_session_id: session,
                watch_claims_in_session: count_to_u32(claims),
            },
        ))
    }

    async fn save_bonus_state(&mut self, state: &BonusState) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO wallet_bonus_states (user_id, channel_id, start_bonus_granted, \
             last_daily_claim_at, daily_streak, last_watch_claim_at, watch_session_id, \
             watch_claims_in_session) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (user_id, channel_id) DO UPDATE SET \
             start_bonus_granted = EXCLUDED.start_bonus_granted, \
             last_daily_claim_at = EXCLUDED.last_daily_claim_at, \
             daily_streak = EXCLUDED.daily_streak, \
             last_watch_claim_at = EXCLUDED.last_watch_claim_at, \
             watch_session_id = EXCLUDED.watch_session_id, \
             watch_claims_in_session = EXCLUDED.watch_claims_in_session",
        )
        .bind(state.key.user_id.as_uuid())
        .bind(state.key.channel_id.as_uuid())
        .bind(state.start_bonus_granted)
        .bind(state.last_daily_claim_at)
        .bind(i32::try_from(state.daily_streak).unwrap_or(i32::MAX))
        .bind(state.last_watch_claim_at)
        .bind(&state.watch_session_id)
        .bind(i32::try_from(state.watch_claims_in_session).unwrap_or(i32::MAX))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn find_wallet(&self, key: WalletKey) -> StoreResult<Option<Wallet>> {
        let row = sqlx::query_as::<_, (Uuid, Uuid, i64, DateTime<Utc>)>(
            "SELECT user_id, channel_id, balance, updated_at FROM wallets \
             WHERE user_id = $1 AND channel_id = $2",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.channel_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(wallet_from_row))
    }

    async fn get_or_create_wallet(
        &self,
        key: WalletKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Wallet> {
        sqlx::query(
            "INSERT INTO wallets (user_id, channel_id, balance, updated_at) \
             VALUES ($1, $2, 0, $3) ON CONFLICT (user_id, channel_id) DO NOTHING",
        )
        .bind(key.user_id.as_uuid())
        .bind(key.channel_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find_wallet(key)
            .await?
            .ok_or_else(|| StoreError::Database(format!("wallet {key} vanished after insert")))
    }

    async fn reward_event(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<RewardEventRecord>> {
        let sql = format!(
            "SELECT {REWARD_COLUMNS} FROM external_reward_events \
             WHERE provider = $1 AND provider_event_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(provider.as_str())
            .bind(provider_event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(reward_from_row).transpose()
    }

    async fn insert_outbox(&self, message: &OutboxMessage) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO chat_outbox (id, platform, channel_id, destination, payload, status, \
             attempts, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(message.id)
        .bind(message.platform.as_str())
        .bind(message.channel_id.as_uuid())
        .bind(&message.destination)
        .bind(&message.payload)
        .bind(message.status.as_str())
        .bind(message.attempts)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn outbox_candidates(
        &self,
        platform: Provider,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM chat_outbox WHERE platform = $1 \
             AND (status = 'pending' OR (status = 'processing' AND processing_at < $2)) \
             ORDER BY created_at ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(platform.as_str())
            .bind(stale_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn claim_outbox(
        &self,
        id: Uuid,
        observed_status: OutboxStatus,
        observed_processing_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE chat_outbox SET status = 'processing', processing_at = $4 \
             WHERE id = $1 AND status = $2 AND processing_at IS NOT DISTINCT FROM $3",
        )
        .bind(id)
        .bind(observed_status.as_str())
        .bind(observed_processing_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_outbox_sent(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE chat_outbox SET status = 'sent', sent_at = $3, attempts = attempts + 1, \
             last_error = NULL \
             WHERE id = $1 AND status = 'processing' AND processing_at = $2",
        )
        .bind(id)
        .bind(claimed_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_outbox(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE chat_outbox SET status = 'pending', processing_at = NULL, \
             attempts = attempts + 1, last_error = $3 \
             WHERE id = $1 AND status = 'processing' AND processing_at = $2",
        )
        .bind(id)
        .bind(claimed_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unclaim_outbox(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE chat_outbox SET status = 'pending', processing_at = NULL, last_error = $3 \
             WHERE id = $1 AND status = 'processing' AND processing_at = $2",
        )
        .bind(id)
        .bind(claimed_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_outbox(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE chat_outbox SET status = 'failed', failed_at = $4, \
             attempts = attempts + 1, last_error = $3 \
             WHERE id = $1 AND status = 'processing' AND processing_at = $2",
        )
        .bind(id)
        .bind(claimed_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_outbox(&self, id: Uuid) -> StoreResult<Option<OutboxMessage>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM chat_outbox WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(outbox_from_row).transpose()
    }
}

#[async_trait]
impl IdentityResolver for PostgresStore {
    async fn resolve_internal_user_id(
        &self,
        provider: Provider,
        platform_account_id: &str,
    ) -> StoreResult<Option<UserId>> {
        let user = sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM external_accounts \
             WHERE provider = $1 AND provider_account_id = $2",
        )
        .bind(provider.as_str())
        .bind(platform_account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user.map(UserId::from_uuid))
    }
}

#[async_trait]
impl StreamStatusSource for PostgresStore {
    async fn stream_status(&self, channel_slug: &str) -> StoreResult<StreamSnapshot> {
        let row = sqlx::query_as::<_, (String, Option<String>, i64)>(
            "SELECT status, session_id, recent_stream_minutes FROM stream_status \
             WHERE channel_slug = $1",
        )
        .bind(channel_slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((status, session_id, recent_stream_minutes)) => StreamSnapshot {
                status: if status == "online" {
                    StreamState::Online
                } else {
                    StreamState::Offline
                },
                session_id,
                recent_stream_minutes,
            },
            None => StreamSnapshot::default(),
        })
    }
}

#[async_trait]
impl ChannelSettingsSource for PostgresStore {
    async fn channel_settings(
        &self,
        channel_id: ChannelId,
    ) -> StoreResult<Option<ChannelSettings>> {
        let row = sqlx::query_as::<_, (String, serde_json::Value, serde_json::Value)>(
            "SELECT slug, reward_rules, economy_settings FROM channels WHERE id = $1",
        )
        .bind(channel_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        let Some((slug, rules_json, economy_json)) = row else {
            return Ok(None);
        };
        let reward_rules: Vec<RewardRule> = serde_json::from_value(rules_json)
            .map_err(|e| StoreError::Decode(format!("channel {channel_id} reward_rules: {e}")))?;
        let economy: EconomySettings = serde_json::from_value(economy_json)
            .map_err(|e| StoreError::Decode(format!("channel {channel_id} economy: {e}")))?;
        Ok(Some(ChannelSettings {
            slug,
            reward_rules,
            economy,
        }))
    }
}
