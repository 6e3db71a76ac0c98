//! Position sizing and margin math for MTF (margin trade funding) entries.
//!
//! Quantity is whatever the user's capital allocation covers at the broker's
//! quoted margin per share. When the broker cannot quote (market closed, API
//! failure) a conservative fallback margin applies and the result is flagged
//! so downstream records can tell real from estimated margin.

use serde::{Deserialize, Serialize};

/// Fallback margin as percent of price when no broker quote is available.
/// 20% margin is 5x leverage.
pub const FALLBACK_MARGIN_PCT: f64 = 20.0;

/// A computed entry size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSize {
    pub quantity: u32,
    /// Notional value: quantity x price.
    pub amount: f64,
    pub margin_per_share: f64,
    /// Margin the broker will block: quantity x margin per share.
    pub margin_required: f64,
    /// price / margin per share.
    pub leverage: f64,
    /// True when the fallback margin policy was used.
    pub margin_estimated: bool,
}

/// Sizing outcome. `CannotEnter` is a normal, non-fatal result (allocation
/// too small for one share's margin, or no usable margin figure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SizeOutcome {
    Sized(PositionSize),
    CannotEnter { reason: String },
}

impl SizeOutcome {
    pub fn sized(&self) -> Option<&PositionSize> {
        match self {
            Self::Sized(s) => Some(s),
            Self::CannotEnter { .. } => None,
        }
    }
}

/// Resolve margin per share from an optional broker quote, falling back to
/// `fallback_pct` percent of price. Returns (margin, estimated).
pub fn margin_with_fallback(quote: Option<f64>, price: f64, fallback_pct: f64) -> (f64, bool) {
    match quote {
        Some(margin) if margin > 0.0 => (margin, false),
        _ => (price * fallback_pct / 100.0, true),
    }
}

/// Size an entry from the user's capital allocation.
pub fn size_position(
    allocation: f64,
    margin_per_share: f64,
    price: f64,
    margin_estimated: bool,
) -> SizeOutcome {
    if margin_per_share <= 0.0 || price <= 0.0 {
        return SizeOutcome::CannotEnter {
            reason: format!(
                "unusable margin quote: margin/share {margin_per_share}, price {price}"
            ),
        };
    }

    let quantity = (allocation / margin_per_share).floor() as u32;
    if quantity == 0 {
        return SizeOutcome::CannotEnter {
            reason: format!(
                "allocation {allocation:.2} below margin for one share ({margin_per_share:.2})"
            ),
        };
    }

    SizeOutcome::Sized(PositionSize {
        quantity,
        amount: quantity as f64 * price,
        margin_per_share,
        margin_required: quantity as f64 * margin_per_share,
        leverage: price / margin_per_share,
        margin_estimated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_sizing() {
        // 10000 allocation, 250/share margin, price 1000: 40 shares at 4x
        let outcome = size_position(10_000.0, 250.0, 1000.0, false);
        let size = outcome.sized().unwrap();
        assert_eq!(size.quantity, 40);
        assert_eq!(size.amount, 40_000.0);
        assert_eq!(size.margin_required, 10_000.0);
        assert_eq!(size.leverage, 4.0);
        assert!(!size.margin_estimated);
    }

    #[test]
    fn test_margin_fallback_scenario() {
        // Broker quote unavailable, price 2500, fallback 20% -> 500/share.
        // Allocation 5000 -> 10 shares at 5x leverage, flagged estimated.
        let (margin, estimated) = margin_with_fallback(None, 2500.0, FALLBACK_MARGIN_PCT);
        assert_eq!(margin, 500.0);
        assert!(estimated);

        let outcome = size_position(5000.0, margin, 2500.0, estimated);
        let size = outcome.sized().unwrap();
        assert_eq!(size.quantity, 10);
        assert_eq!(size.leverage, 5.0);
        assert!(size.margin_estimated);
    }

    #[test]
    fn test_real_quote_not_flagged() {
        let (margin, estimated) = margin_with_fallback(Some(400.0), 2500.0, FALLBACK_MARGIN_PCT);
        assert_eq!(margin, 400.0);
        assert!(!estimated);
    }

    #[test]
    fn test_zero_or_negative_quote_falls_back() {
        let (margin, estimated) = margin_with_fallback(Some(0.0), 1000.0, FALLBACK_MARGIN_PCT);
        assert_eq!(margin, 200.0);
        assert!(estimated);
    }

    #[test]
    fn test_allocation_too_small_is_cannot_enter() {
        let outcome = size_position(100.0, 250.0, 1000.0, false);
        match outcome {
            SizeOutcome::CannotEnter { reason } => {
                assert!(reason.contains("below margin"));
            }
            SizeOutcome::Sized(_) => panic!("expected CannotEnter"),
        }
    }

    #[test]
    fn test_quantity_floors() {
        // 999 / 250 = 3.996 -> 3 shares
        let outcome = size_position(999.0, 250.0, 1000.0, false);
        assert_eq!(outcome.sized().unwrap().quantity, 3);
    }

    #[test]
    fn test_bad_margin_is_cannot_enter() {
        assert!(matches!(
            size_position(5000.0, 0.0, 1000.0, false),
            SizeOutcome::CannotEnter { .. }
        ));
        assert!(matches!(
            size_position(5000.0, -5.0, 1000.0, false),
            SizeOutcome::CannotEnter { .. }
        ));
    }
}
