//! Order and position lifecycle.
//!
//! `PositionManager` owns every state transition a position goes through:
//! sizing and placing the entry order, recording the row, and closing out
//! on an exit decision. Orders are never retried; a broker rejection is
//! surfaced verbatim. A failed closing order leaves the row ACTIVE so the
//! next cycle tries again.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{order_tag, OrderGateway, OrderSide, PlaceOrderRequest, ProductType};
use crate::engine::config::EngineConfig;
use crate::notify::{self, Notifier};
use crate::retry;
use crate::sizing::{self, SizeOutcome};
use crate::store::{InsertOutcome, PositionStore};
use crate::types::{ExitSignal, ExitType, Position, PositionStatus, UserPrefs};

/// Outcome of an entry attempt for one (user, symbol).
#[derive(Debug)]
pub enum EntryOutcome {
    Opened(Position),
    /// Entry not taken; the reason is informational, not an error.
    Skipped { reason: String },
}

pub struct PositionManager {
    gateway: Arc<dyn OrderGateway>,
    store: Arc<dyn PositionStore>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl PositionManager {
    pub fn new(
        gateway: Arc<dyn OrderGateway>,
        store: Arc<dyn PositionStore>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            notifier,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Open an MTF position for a user at the given price.
    ///
    /// The sequence is: risk checks, margin quote (with fallback), sizing,
    /// BUY order, insert, notify. Only the order placement step is
    /// irreversible; everything before it can skip cheaply.
    pub async fn open_position(
        &self,
        prefs: &UserPrefs,
        symbol: &str,
        price: f64,
    ) -> Result<EntryOutcome> {
        let open = self.store.open_positions_for_user(&prefs.user_id).await?;
        if open.len() >= prefs.max_open_positions as usize {
            return Ok(EntryOutcome::Skipped {
                reason: format!(
                    "{} open positions at user limit {}",
                    open.len(),
                    prefs.max_open_positions
                ),
            });
        }
        if self.store.find_active(&prefs.user_id, symbol).await?.is_some() {
            return Ok(EntryOutcome::Skipped {
                reason: format!("already holding {}", symbol),
            });
        }

        // Quote failures degrade to the fallback margin, they do not block
        let quote = match retry::with_backoff(self.config.retry, "margin quote", || {
            self.gateway.mtf_margin_per_share(symbol, price)
        })
        .await
        {
            Ok(quote) => quote,
            Err(e) => {
                warn!("Margin quote for {} unavailable ({:#}), using fallback", symbol, e);
                None
            }
        };
        let (margin_per_share, margin_estimated) =
            sizing::margin_with_fallback(quote, price, self.config.fallback_margin_pct);

        let size = match sizing::size_position(
            prefs.capital_allocation,
            margin_per_share,
            price,
            margin_estimated,
        ) {
            SizeOutcome::Sized(size) => size,
            SizeOutcome::CannotEnter { reason } => {
                return Ok(EntryOutcome::Skipped { reason });
            }
        };

        // Point of no return: a rejection here is final, never retried
        let order = PlaceOrderRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            quantity: size.quantity,
            product: ProductType::Mtf,
            client_tag: order_tag(),
        };
        let ack = self
            .gateway
            .place_order(&order)
            .await
            .with_context(|| format!("Entry order for {} failed", symbol))?;

        let position = Position {
            id: Uuid::new_v4(),
            user_id: prefs.user_id.clone(),
            symbol: symbol.to_string(),
            entry_price: price,
            entry_quantity: size.quantity,
            entry_time: Utc::now(),
            current_price: price,
            status: PositionStatus::Active,
            trailing_level: 0,
            pnl_amount: 0.0,
            pnl_percentage: 0.0,
            leverage: size.leverage,
            margin_required: size.margin_required,
            margin_estimated: size.margin_estimated,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        };

        match self.store.insert_position(&position).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::DuplicateActive => {
                // A concurrent entry won the race after our order went
                // through; the row exists, so do not fail the caller.
                error!(
                    "Order {} placed but ({}, {}) already ACTIVE; manual reconciliation needed",
                    ack.order_id, prefs.user_id, symbol
                );
                return Ok(EntryOutcome::Skipped {
                    reason: format!("duplicate position for {}", symbol),
                });
            }
        }

        info!(
            "Opened {} x{} @ {:.2} for {} (order {}, leverage {:.1}x)",
            symbol, size.quantity, price, prefs.user_id, ack.order_id, size.leverage
        );
        notify::send_best_effort(
            self.notifier.as_ref(),
            prefs.whatsapp_number.as_deref().unwrap_or(""),
            &notify::entry_message(&position),
        )
        .await;

        Ok(EntryOutcome::Opened(position))
    }

    /// Close an ACTIVE position on an exit decision.
    ///
    /// The SELL order is placed first; the row flips to a terminal status
    /// only after the broker confirms. On broker failure the position stays
    /// ACTIVE at its current trailing level and the error propagates so the
    /// next cycle retries.
    pub async fn close_position(&self, position: &Position, exit: &ExitSignal) -> Result<()> {
        let order = PlaceOrderRequest {
            symbol: position.symbol.clone(),
            side: OrderSide::Sell,
            quantity: position.entry_quantity,
            product: ProductType::Mtf,
            client_tag: order_tag(),
        };
        let ack = self
            .gateway
            .place_order(&order)
            .await
            .with_context(|| format!("Exit order for {} failed", position.symbol))?;

        let status = match exit.exit_type {
            ExitType::StopLoss => PositionStatus::Stopped,
            ExitType::RsiReversal | ExitType::TrailingStop => PositionStatus::Exited,
        };

        let flipped = self
            .store
            .mark_exited(position.id, status, exit, Utc::now())
            .await?;
        if !flipped {
            warn!(
                "Position {} already terminal when recording exit (order {})",
                position.id, ack.order_id
            );
            return Ok(());
        }

        info!(
            "Closed {} x{} @ {:.2} for {} ({}): {}",
            position.symbol,
            position.entry_quantity,
            exit.current_price,
            position.user_id,
            exit.exit_type,
            exit.exit_reason
        );

        let recipient = self
            .store
            .user_prefs(&position.user_id)
            .await
            .ok()
            .flatten()
            .and_then(|p| p.whatsapp_number)
            .unwrap_or_default();
        notify::send_best_effort(
            self.notifier.as_ref(),
            &recipient,
            &notify::exit_message(position, exit),
        )
        .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::models::OrderAck;
    use crate::notify::MemoryNotifier;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct FakeGateway {
        margin: Option<f64>,
        quote_fails: bool,
        reject_orders: bool,
        orders: Mutex<Vec<(String, OrderSide, u32)>>,
    }

    impl FakeGateway {
        fn new(margin: Option<f64>) -> Self {
            Self {
                margin,
                quote_fails: false,
                reject_orders: false,
                orders: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OrderGateway for FakeGateway {
        async fn mtf_margin_per_share(&self, _symbol: &str, _price: f64) -> Result<Option<f64>> {
            if self.quote_fails {
                return Err(anyhow!("gateway down"));
            }
            Ok(self.margin)
        }

        async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck> {
            if self.reject_orders {
                return Err(anyhow!("Order rejected: insufficient margin"));
            }
            self.orders
                .lock()
                .await
                .push((request.symbol.clone(), request.side, request.quantity));
            Ok(OrderAck {
                order_id: "ORD1".to_string(),
                status: "PLACED".to_string(),
            })
        }
    }

    fn prefs(allocation: f64) -> UserPrefs {
        UserPrefs {
            user_id: "u1".to_string(),
            capital_allocation: allocation,
            stop_loss_pct: 2.5,
            auto_trade_enabled: true,
            max_open_positions: 5,
            whatsapp_number: Some("+911234567890".to_string()),
        }
    }

    fn make_manager(
        gateway: Arc<FakeGateway>,
        store: Arc<MemoryStore>,
    ) -> (PositionManager, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::default());
        let mut config = EngineConfig::default();
        config.retry = RetryPolicy::new(1, Duration::from_millis(1));
        let manager = PositionManager::new(gateway, store, notifier.clone(), config);
        (manager, notifier)
    }

    #[tokio::test]
    async fn test_entry_with_quoted_margin() {
        let gateway = Arc::new(FakeGateway::new(Some(700.0)));
        let store = Arc::new(MemoryStore::new());
        let (manager, notifier) = make_manager(gateway.clone(), store.clone());

        let outcome = manager.open_position(&prefs(5000.0), "TCS", 3500.0).await.unwrap();
        let position = match outcome {
            EntryOutcome::Opened(p) => p,
            other => panic!("expected open, got {:?}", other),
        };
        assert_eq!(position.entry_quantity, 7);
        assert_eq!(position.leverage, 5.0);
        assert!(!position.margin_estimated);
        assert_eq!(gateway.orders.lock().await.len(), 1);
        assert_eq!(notifier.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_entry_margin_fallback() {
        // No quote: price 2500 at 20% fallback gives 500/share, so 5000
        // allocation buys 10 shares at 5x leverage
        let gateway = Arc::new(FakeGateway::new(None));
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = make_manager(gateway, store);

        let outcome = manager.open_position(&prefs(5000.0), "RELIANCE", 2500.0).await.unwrap();
        match outcome {
            EntryOutcome::Opened(p) => {
                assert_eq!(p.entry_quantity, 10);
                assert_eq!(p.leverage, 5.0);
                assert!(p.margin_estimated);
                assert_eq!(p.margin_required, 5000.0);
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_allocation_too_small_skips_without_order() {
        let gateway = Arc::new(FakeGateway::new(Some(700.0)));
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = make_manager(gateway.clone(), store);

        let outcome = manager.open_position(&prefs(500.0), "TCS", 3500.0).await.unwrap();
        assert!(matches!(outcome, EntryOutcome::Skipped { .. }));
        assert!(gateway.orders.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_symbol_skips_before_order() {
        let gateway = Arc::new(FakeGateway::new(Some(700.0)));
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = make_manager(gateway.clone(), store);

        manager.open_position(&prefs(5000.0), "TCS", 3500.0).await.unwrap();
        let second = manager.open_position(&prefs(5000.0), "TCS", 3500.0).await.unwrap();
        assert!(matches!(second, EntryOutcome::Skipped { .. }));
        assert_eq!(gateway.orders.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_order_rejection_surfaces_and_stores_nothing() {
        let gateway = Arc::new(FakeGateway {
            reject_orders: true,
            ..FakeGateway::new(Some(700.0))
        });
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = make_manager(gateway, store.clone());

        let result = manager.open_position(&prefs(5000.0), "TCS", 3500.0).await;
        assert!(result.is_err());
        assert!(store.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_close_leaves_position_active() {
        let gateway = Arc::new(FakeGateway::new(Some(700.0)));
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = make_manager(gateway.clone(), store.clone());

        let position = match manager.open_position(&prefs(5000.0), "TCS", 3500.0).await.unwrap() {
            EntryOutcome::Opened(p) => p,
            other => panic!("expected open, got {:?}", other),
        };

        // Broker goes down before the exit order
        let down = Arc::new(FakeGateway {
            reject_orders: true,
            ..FakeGateway::new(Some(700.0))
        });
        let (broken_manager, _) = make_manager(down, store.clone());

        let exit = ExitSignal {
            exit_type: ExitType::TrailingStop,
            exit_reason: "trailing stop".to_string(),
            current_price: 3570.0,
            pnl_amount: 490.0,
            pnl_percentage: 2.0,
        };
        assert!(broken_manager.close_position(&position, &exit).await.is_err());

        let stored = store.get(position.id).await.unwrap();
        assert_eq!(stored.status, PositionStatus::Active);
        assert!(stored.exit_time.is_none());
    }

    #[tokio::test]
    async fn test_stop_loss_close_marks_stopped() {
        let gateway = Arc::new(FakeGateway::new(Some(700.0)));
        let store = Arc::new(MemoryStore::new());
        let (manager, _) = make_manager(gateway.clone(), store.clone());

        let position = match manager.open_position(&prefs(5000.0), "TCS", 3500.0).await.unwrap() {
            EntryOutcome::Opened(p) => p,
            other => panic!("expected open, got {:?}", other),
        };

        let exit = ExitSignal {
            exit_type: ExitType::StopLoss,
            exit_reason: "stop loss hit".to_string(),
            current_price: 3412.5,
            pnl_amount: -612.5,
            pnl_percentage: -2.5,
        };
        manager.close_position(&position, &exit).await.unwrap();

        let stored = store.get(position.id).await.unwrap();
        assert_eq!(stored.status, PositionStatus::Stopped);
        assert_eq!(stored.exit_price, Some(3412.5));
        // SELL order went to the broker
        let orders = gateway.orders.lock().await;
        assert_eq!(orders.last().unwrap().1, OrderSide::Sell);
    }
}
