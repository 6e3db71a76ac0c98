//! Position and preference persistence.
//!
//! `PositionStore` is the narrow port the engine writes through. The
//! production implementation talks to a Supabase/PostgREST endpoint; the
//! in-memory implementation backs tests and dry runs. Both enforce the two
//! write-side invariants: at most one ACTIVE row per (user, symbol), and a
//! trailing level that never regresses while a position is ACTIVE.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::types::{ExitSignal, Position, PositionStatus, UserPrefs};

/// Result of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An ACTIVE row for (user, symbol) already exists; treated as a skip,
    /// not an error.
    DuplicateActive,
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// All ACTIVE positions across users.
    async fn open_positions(&self) -> Result<Vec<Position>>;

    async fn open_positions_for_user(&self, user_id: &str) -> Result<Vec<Position>>;

    async fn find_active(&self, user_id: &str, symbol: &str) -> Result<Option<Position>>;

    /// Insert a new ACTIVE position. Duplicate (user, symbol, ACTIVE) maps
    /// to `DuplicateActive`.
    async fn insert_position(&self, position: &Position) -> Result<InsertOutcome>;

    /// Per-cycle monitoring write: price, P&L and trailing level. The
    /// persisted level is `max(stored, proposed)` (high-water-mark ratchet);
    /// the level actually persisted is returned.
    async fn update_monitoring(
        &self,
        id: Uuid,
        current_price: f64,
        pnl_amount: f64,
        pnl_percentage: f64,
        trailing_level: u8,
    ) -> Result<u8>;

    /// Flip an ACTIVE position to a terminal status. Returns false when the
    /// position was already terminal (duplicate invocation; a no-op).
    async fn mark_exited(
        &self,
        id: Uuid,
        status: PositionStatus,
        exit: &ExitSignal,
        exit_time: DateTime<Utc>,
    ) -> Result<bool>;

    async fn user_prefs(&self, user_id: &str) -> Result<Option<UserPrefs>>;

    /// Users with auto-trade enabled, eligible for scanner-driven entries.
    async fn auto_trade_users(&self) -> Result<Vec<UserPrefs>>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    positions: RwLock<HashMap<Uuid, Position>>,
    prefs: RwLock<HashMap<String, UserPrefs>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_prefs(&self, prefs: UserPrefs) {
        self.prefs.write().await.insert(prefs.user_id.clone(), prefs);
    }

    /// Direct read-back for assertions.
    pub async fn get(&self, id: Uuid) -> Option<Position> {
        self.positions.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn open_positions(&self) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.status == PositionStatus::Active)
            .cloned()
            .collect())
    }

    async fn open_positions_for_user(&self, user_id: &str) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.status == PositionStatus::Active && p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_active(&self, user_id: &str, symbol: &str) -> Result<Option<Position>> {
        Ok(self
            .positions
            .read()
            .await
            .values()
            .find(|p| {
                p.status == PositionStatus::Active
                    && p.user_id == user_id
                    && p.symbol == symbol
            })
            .cloned())
    }

    async fn insert_position(&self, position: &Position) -> Result<InsertOutcome> {
        let mut positions = self.positions.write().await;
        // Uniqueness check and insert under one write lock
        let duplicate = positions.values().any(|p| {
            p.status == PositionStatus::Active
                && p.user_id == position.user_id
                && p.symbol == position.symbol
        });
        if duplicate {
            return Ok(InsertOutcome::DuplicateActive);
        }
        positions.insert(position.id, position.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update_monitoring(
        &self,
        id: Uuid,
        current_price: f64,
        pnl_amount: f64,
        pnl_percentage: f64,
        trailing_level: u8,
    ) -> Result<u8> {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("position {} not found", id))?;
        if position.status.is_terminal() {
            return Ok(position.trailing_level);
        }
        position.current_price = current_price;
        position.pnl_amount = pnl_amount;
        position.pnl_percentage = pnl_percentage;
        // Ratchet: a stale update can never roll protection back
        position.trailing_level = position.trailing_level.max(trailing_level);
        Ok(position.trailing_level)
    }

    async fn mark_exited(
        &self,
        id: Uuid,
        status: PositionStatus,
        exit: &ExitSignal,
        exit_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("position {} not found", id))?;
        if position.status.is_terminal() {
            return Ok(false);
        }
        position.status = status;
        position.current_price = exit.current_price;
        position.pnl_amount = exit.pnl_amount;
        position.pnl_percentage = exit.pnl_percentage;
        position.exit_price = Some(exit.current_price);
        position.exit_time = Some(exit_time);
        position.exit_reason = Some(exit.exit_reason.clone());
        Ok(true)
    }

    async fn user_prefs(&self, user_id: &str) -> Result<Option<UserPrefs>> {
        Ok(self.prefs.read().await.get(user_id).cloned())
    }

    async fn auto_trade_users(&self) -> Result<Vec<UserPrefs>> {
        Ok(self
            .prefs
            .read()
            .await
            .values()
            .filter(|p| p.auto_trade_enabled)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Supabase (PostgREST) store
// ============================================================================

/// PostgREST-backed store. The database carries a partial unique index on
/// (user_id, symbol) where status = 'ACTIVE' as the authoritative duplicate
/// guard; the application-level check alone is not atomic.
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    service_key: String,
}

impl SupabaseStore {
    /// Create from `SUPABASE_URL` and `SUPABASE_SERVICE_KEY`.
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("SUPABASE_URL").context("SUPABASE_URL environment variable not set")?;
        let service_key = std::env::var("SUPABASE_SERVICE_KEY")
            .context("SUPABASE_SERVICE_KEY environment variable not set")?;
        Ok(Self::new(base_url, service_key))
    }

    pub fn new(base_url: String, service_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url,
            service_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, path))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn select_positions(&self, filter: &str) -> Result<Vec<Position>> {
        let response = self
            .request(reqwest::Method::GET, &format!("positions?{filter}"))
            .send()
            .await
            .context("Failed to query positions")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Position query failed ({}): {}", status, body));
        }
        response
            .json()
            .await
            .context("Failed to parse position rows")
    }
}

#[async_trait]
impl PositionStore for SupabaseStore {
    async fn open_positions(&self) -> Result<Vec<Position>> {
        self.select_positions("status=eq.ACTIVE&order=entry_time.asc")
            .await
    }

    async fn open_positions_for_user(&self, user_id: &str) -> Result<Vec<Position>> {
        self.select_positions(&format!("status=eq.ACTIVE&user_id=eq.{user_id}"))
            .await
    }

    async fn find_active(&self, user_id: &str, symbol: &str) -> Result<Option<Position>> {
        let rows = self
            .select_positions(&format!(
                "status=eq.ACTIVE&user_id=eq.{user_id}&symbol=eq.{symbol}&limit=1"
            ))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_position(&self, position: &Position) -> Result<InsertOutcome> {
        let response = self
            .request(reqwest::Method::POST, "positions")
            .header("Prefer", "return=minimal")
            .json(position)
            .send()
            .await
            .context("Failed to insert position")?;

        let status = response.status();
        if status.is_success() {
            Ok(InsertOutcome::Inserted)
        } else if status == reqwest::StatusCode::CONFLICT {
            // Unique-index violation on (user_id, symbol, ACTIVE)
            debug!(
                "Duplicate ACTIVE position for ({}, {}), skipping insert",
                position.user_id, position.symbol
            );
            Ok(InsertOutcome::DuplicateActive)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(anyhow!("Position insert failed ({}): {}", status, body))
        }
    }

    async fn update_monitoring(
        &self,
        id: Uuid,
        current_price: f64,
        pnl_amount: f64,
        pnl_percentage: f64,
        trailing_level: u8,
    ) -> Result<u8> {
        // The lte filter makes the ratchet authoritative server-side: a
        // concurrent writer that already advanced the level leaves this
        // PATCH matching zero rows.
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!(
                    "positions?id=eq.{id}&status=eq.ACTIVE&trailing_level=lte.{trailing_level}"
                ),
            )
            .header("Prefer", "return=representation")
            .json(&serde_json::json!({
                "current_price": current_price,
                "pnl_amount": pnl_amount,
                "pnl_percentage": pnl_percentage,
                "trailing_level": trailing_level,
            }))
            .send()
            .await
            .context("Failed to update position")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Position update failed ({}): {}", status, body));
        }

        let rows: Vec<Position> = response.json().await.unwrap_or_default();
        match rows.into_iter().next() {
            Some(row) => Ok(row.trailing_level),
            // Filter matched nothing: another writer holds a higher level
            None => {
                let current = self
                    .select_positions(&format!("id=eq.{id}&limit=1"))
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("position {} not found", id))?;
                Ok(current.trailing_level)
            }
        }
    }

    async fn mark_exited(
        &self,
        id: Uuid,
        status: PositionStatus,
        exit: &ExitSignal,
        exit_time: DateTime<Utc>,
    ) -> Result<bool> {
        // status=eq.ACTIVE filter makes duplicate exits no-ops
        let response = self
            .request(
                reqwest::Method::PATCH,
                &format!("positions?id=eq.{id}&status=eq.ACTIVE"),
            )
            .header("Prefer", "return=representation")
            .json(&serde_json::json!({
                "status": status,
                "current_price": exit.current_price,
                "pnl_amount": exit.pnl_amount,
                "pnl_percentage": exit.pnl_percentage,
                "exit_price": exit.current_price,
                "exit_time": exit_time,
                "exit_reason": exit.exit_reason,
            }))
            .send()
            .await
            .context("Failed to mark position exited")?;

        let http_status = response.status();
        if !http_status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Position exit failed ({}): {}", http_status, body));
        }

        let rows: Vec<Position> = response.json().await.unwrap_or_default();
        Ok(!rows.is_empty())
    }

    async fn user_prefs(&self, user_id: &str) -> Result<Option<UserPrefs>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("user_prefs?user_id=eq.{user_id}&limit=1"),
            )
            .send()
            .await
            .context("Failed to query user prefs")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("User prefs query failed ({}): {}", status, body));
        }
        let rows: Vec<UserPrefs> = response.json().await.context("Failed to parse prefs")?;
        Ok(rows.into_iter().next())
    }

    async fn auto_trade_users(&self) -> Result<Vec<UserPrefs>> {
        let response = self
            .request(reqwest::Method::GET, "user_prefs?auto_trade_enabled=eq.true")
            .send()
            .await
            .context("Failed to query auto-trade users")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Auto-trade user query failed ({}): {}", status, body));
        }
        response.json().await.context("Failed to parse prefs rows")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(user: &str, symbol: &str) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            symbol: symbol.to_string(),
            entry_price: 100.0,
            entry_quantity: 10,
            entry_time: Utc::now(),
            current_price: 100.0,
            status: PositionStatus::Active,
            trailing_level: 0,
            pnl_amount: 0.0,
            pnl_percentage: 0.0,
            leverage: 5.0,
            margin_required: 200.0,
            margin_estimated: false,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        }
    }

    fn sample_exit() -> ExitSignal {
        ExitSignal {
            exit_type: crate::types::ExitType::TrailingStop,
            exit_reason: "trailing stop".to_string(),
            current_price: 102.0,
            pnl_amount: 20.0,
            pnl_percentage: 2.0,
        }
    }

    #[tokio::test]
    async fn test_idempotent_position_creation() {
        let store = MemoryStore::new();
        let first = sample_position("u1", "TCS");
        let second = sample_position("u1", "TCS");

        assert_eq!(
            store.insert_position(&first).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_position(&second).await.unwrap(),
            InsertOutcome::DuplicateActive
        );
        assert_eq!(store.open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_symbol_different_user_allowed() {
        let store = MemoryStore::new();
        store
            .insert_position(&sample_position("u1", "TCS"))
            .await
            .unwrap();
        let outcome = store
            .insert_position(&sample_position("u2", "TCS"))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_trailing_level_ratchet() {
        let store = MemoryStore::new();
        let position = sample_position("u1", "INFY");
        let id = position.id;
        store.insert_position(&position).await.unwrap();

        let level = store.update_monitoring(id, 103.0, 30.0, 3.0, 3).await.unwrap();
        assert_eq!(level, 3);

        // Stale update proposing a lower level must not regress
        let level = store.update_monitoring(id, 101.0, 10.0, 1.0, 1).await.unwrap();
        assert_eq!(level, 3);
        assert_eq!(store.get(id).await.unwrap().trailing_level, 3);

        let level = store.update_monitoring(id, 105.0, 50.0, 5.0, 5).await.unwrap();
        assert_eq!(level, 5);
    }

    #[tokio::test]
    async fn test_exit_is_once_only() {
        let store = MemoryStore::new();
        let position = sample_position("u1", "INFY");
        let id = position.id;
        store.insert_position(&position).await.unwrap();

        let exit = sample_exit();
        assert!(store
            .mark_exited(id, PositionStatus::Exited, &exit, Utc::now())
            .await
            .unwrap());
        // Second invocation is a no-op
        assert!(!store
            .mark_exited(id, PositionStatus::Stopped, &exit, Utc::now())
            .await
            .unwrap());

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.status, PositionStatus::Exited);
        assert_eq!(stored.exit_reason.as_deref(), Some("trailing stop"));
        assert!(store.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_writes_after_terminal() {
        let store = MemoryStore::new();
        let position = sample_position("u1", "INFY");
        let id = position.id;
        store.insert_position(&position).await.unwrap();
        store
            .mark_exited(id, PositionStatus::Exited, &sample_exit(), Utc::now())
            .await
            .unwrap();

        // Monitoring update against a terminal row changes nothing
        store.update_monitoring(id, 90.0, -100.0, -10.0, 7).await.unwrap();
        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.current_price, 102.0);
        assert_eq!(stored.trailing_level, 0);
    }

    #[tokio::test]
    async fn test_auto_trade_users_filtered() {
        let store = MemoryStore::new();
        store
            .put_prefs(UserPrefs {
                user_id: "u1".to_string(),
                auto_trade_enabled: true,
                ..UserPrefs::default()
            })
            .await;
        store
            .put_prefs(UserPrefs {
                user_id: "u2".to_string(),
                auto_trade_enabled: false,
                ..UserPrefs::default()
            })
            .await;

        let users = store.auto_trade_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, "u1");
    }
}
