//! Support/resistance channel detection.
//!
//! Pivot highs/lows over a symmetric window are merged into price bands no
//! wider than a fraction of the analysis window's range. Bands are scored by
//! pivot count plus historical touches, then the strongest non-overlapping
//! bands are kept. The entry evaluator uses the nearest resistance band to
//! reject entries too close to overhead supply.

use serde::{Deserialize, Serialize};

use crate::types::Candle;

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bars on each side of a pivot candidate.
    pub pivot_radius: usize,
    /// Max band width as percent of the window's high-low range.
    pub max_channel_width_pct: f64,
    /// Bands scoring below this are discarded.
    pub min_strength: u32,
    /// Max non-overlapping bands retained.
    pub max_channels: usize,
    /// Most recent candles considered.
    pub lookback: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pivot_radius: 10,
            max_channel_width_pct: 5.0,
            min_strength: 1,
            max_channels: 6,
            lookback: 290,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PivotKind {
    High,
    Low,
}

/// A local extreme relative to its neighborhood.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotPoint {
    /// Index into the analysis window (not the full input series).
    pub index: usize,
    pub price: f64,
    pub kind: PivotKind,
    /// Bars in the window strictly dominated by this pivot.
    pub strength: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    Support,
    Resistance,
}

/// A merged price band acting as support or resistance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub top_price: f64,
    pub bottom_price: f64,
    pub kind: ChannelKind,
    /// 20 per contained pivot plus 1 per extra historical touch.
    pub strength: u32,
    pub touch_count: u32,
    /// Window index of the band's most recent pivot, used for tie-breaking.
    pub last_pivot_index: usize,
}

impl Channel {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.bottom_price && price <= self.top_price
    }

    fn overlaps(&self, other: &Channel) -> bool {
        self.bottom_price <= other.top_price && other.bottom_price <= self.top_price
    }
}

/// Detect pivot highs and lows over the candle window.
///
/// A bar is a pivot high when its high is >= every high in
/// `[i - radius, i + radius]`; equal highs are awarded to the earliest bar
/// that can itself carry a pivot (bars inside the edge padding never can).
/// Mirrored for lows. Deterministic for a fixed input.
pub fn detect_pivots(candles: &[Candle], radius: usize) -> Vec<PivotPoint> {
    let n = candles.len();
    let mut pivots = Vec::new();
    if radius == 0 || n < 2 * radius + 1 {
        return pivots;
    }

    for i in radius..(n - radius) {
        let window = &candles[i - radius..=i + radius];
        let high = candles[i].high;
        let low = candles[i].low;

        // An earlier eligible equal extreme claims the pivot; later ones
        // are skipped.
        let is_high = window.iter().enumerate().all(|(j, c)| {
            let abs = i - radius + j;
            c.high < high || (c.high == high && (abs >= i || abs < radius))
        });
        let is_low = window.iter().enumerate().all(|(j, c)| {
            let abs = i - radius + j;
            c.low > low || (c.low == low && (abs >= i || abs < radius))
        });

        if is_high {
            let strength = window.iter().filter(|c| c.high < high).count() as u32;
            pivots.push(PivotPoint {
                index: i,
                price: high,
                kind: PivotKind::High,
                strength,
            });
        }
        if is_low {
            let strength = window.iter().filter(|c| c.low > low).count() as u32;
            pivots.push(PivotPoint {
                index: i,
                price: low,
                kind: PivotKind::Low,
                strength,
            });
        }
    }
    pivots
}

/// Open band being formed from nearby pivots.
struct Band {
    top: f64,
    bottom: f64,
    pivot_indices: Vec<usize>,
}

impl Band {
    fn mid(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }

    /// Width if `price` joined the band.
    fn width_with(&self, price: f64) -> f64 {
        self.top.max(price) - self.bottom.min(price)
    }
}

/// Detect support/resistance channels over the most recent
/// `config.lookback` candles.
///
/// Returns channels sorted strongest-first. Fewer than `2 * radius + 1`
/// candles yields an empty set ("no resistance data", not an error).
pub fn detect(candles: &[Candle], config: &ChannelConfig) -> Vec<Channel> {
    let start = candles.len().saturating_sub(config.lookback);
    let window = &candles[start..];
    let n = window.len();
    if n < 2 * config.pivot_radius + 1 {
        return Vec::new();
    }

    let pivots = detect_pivots(window, config.pivot_radius);
    if pivots.is_empty() {
        return Vec::new();
    }

    let window_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let window_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let range = window_high - window_low;
    // Degenerate window (high == low throughout): all widths are zero and
    // zero-width bands are always within limit.
    let max_width = range * config.max_channel_width_pct / 100.0;

    // Greedy band formation: each pivot joins the nearest compatible open
    // band, else opens a new one.
    let mut bands: Vec<Band> = Vec::new();
    for pivot in &pivots {
        let candidate = bands
            .iter_mut()
            .filter(|b| b.width_with(pivot.price) <= max_width)
            .min_by(|a, b| {
                let da = (a.mid() - pivot.price).abs();
                let db = (b.mid() - pivot.price).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            });
        match candidate {
            Some(band) => {
                band.top = band.top.max(pivot.price);
                band.bottom = band.bottom.min(pivot.price);
                band.pivot_indices.push(pivot.index);
            }
            None => bands.push(Band {
                top: pivot.price,
                bottom: pivot.price,
                pivot_indices: vec![pivot.index],
            }),
        }
    }

    let current_price = window[n - 1].close;

    // Score: 20 per forming pivot, 1 per extra candle touching the band.
    let channels: Vec<Channel> = bands
        .into_iter()
        .map(|band| {
            let touches = window
                .iter()
                .enumerate()
                .filter(|(i, c)| {
                    !band.pivot_indices.contains(i)
                        && ((c.high >= band.bottom && c.high <= band.top)
                            || (c.low >= band.bottom && c.low <= band.top))
                })
                .count() as u32;
            let kind = if band.mid() <= current_price {
                ChannelKind::Support
            } else {
                ChannelKind::Resistance
            };
            Channel {
                top_price: band.top,
                bottom_price: band.bottom,
                kind,
                strength: 20 * band.pivot_indices.len() as u32 + touches,
                touch_count: touches,
                last_pivot_index: band.pivot_indices.iter().copied().max().unwrap_or(0),
            }
        })
        .filter(|c| c.strength >= config.min_strength)
        .collect();

    select_channels(channels, config)
}

/// Rank candidate bands and keep the strongest non-overlapping ones.
///
/// Strongest first; equal strength prefers more touches, then the band whose
/// latest pivot is more recent. Overlap losers are dropped in rank order.
fn select_channels(mut channels: Vec<Channel>, config: &ChannelConfig) -> Vec<Channel> {
    channels.sort_by(|a, b| {
        b.strength
            .cmp(&a.strength)
            .then(b.touch_count.cmp(&a.touch_count))
            .then(b.last_pivot_index.cmp(&a.last_pivot_index))
    });

    let mut accepted: Vec<Channel> = Vec::new();
    for channel in channels {
        if accepted.len() >= config.max_channels {
            break;
        }
        if accepted.iter().all(|a| !a.overlaps(&channel)) {
            accepted.push(channel);
        }
    }
    accepted
}

/// Highest accepted band entirely below `price`.
pub fn nearest_support(channels: &[Channel], price: f64) -> Option<&Channel> {
    channels
        .iter()
        .filter(|c| c.top_price < price)
        .max_by(|a, b| {
            a.top_price
                .partial_cmp(&b.top_price)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Lowest accepted band entirely above `price`.
pub fn nearest_resistance(channels: &[Channel], price: f64) -> Option<&Channel> {
    channels
        .iter()
        .filter(|c| c.bottom_price > price)
        .min_by(|a, b| {
            a.bottom_price
                .partial_cmp(&b.bottom_price)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    /// Build candles from (high, low) pairs; close sits mid-range.
    fn make_candles(bars: &[(f64, f64)]) -> Vec<Candle> {
        let t0 = Utc::now();
        bars.iter()
            .enumerate()
            .map(|(i, &(high, low))| Candle {
                timestamp: t0 + Duration::minutes(i as i64 * 5),
                open: (high + low) / 2.0,
                high,
                low,
                close: (high + low) / 2.0,
                volume: 1000,
            })
            .collect()
    }

    /// Oscillating series with repeated peaks near `peak` and troughs near
    /// `trough`, enough bars for the default pivot radius.
    fn oscillating(peak: f64, trough: f64, bars: usize) -> Vec<Candle> {
        let mid = (peak + trough) / 2.0;
        let amp = (peak - trough) / 2.0;
        let pairs: Vec<(f64, f64)> = (0..bars)
            .map(|i| {
                let phase = (i as f64 * std::f64::consts::PI / 15.0).sin();
                let c = mid + amp * phase;
                (c + 0.2, c - 0.2)
            })
            .collect();
        make_candles(&pairs)
    }

    fn small_config() -> ChannelConfig {
        ChannelConfig {
            pivot_radius: 3,
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn test_insufficient_candles_returns_empty() {
        let candles = make_candles(&[(101.0, 99.0); 5]);
        let channels = detect(&candles, &ChannelConfig::default());
        assert!(channels.is_empty());
    }

    #[test]
    fn test_pivot_detection_deterministic() {
        let candles = oscillating(110.0, 90.0, 120);
        let a = detect_pivots(&candles, 10);
        let b = detect_pivots(&candles, 10);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.index, y.index);
            assert_eq!(x.price, y.price);
            assert_eq!(x.kind, y.kind);
        }
        assert!(!a.is_empty());
    }

    #[test]
    fn test_pivot_tie_breaks_to_earliest() {
        // Two equal highs at indices 4 and 6 within each other's window:
        // only the earlier bar is a pivot high.
        let mut bars = vec![(100.0, 99.0); 13];
        bars[4] = (105.0, 99.0);
        bars[6] = (105.0, 99.0);
        let candles = make_candles(&bars);
        let pivots = detect_pivots(&candles, 3);
        let highs: Vec<usize> = pivots
            .iter()
            .filter(|p| p.kind == PivotKind::High)
            .map(|p| p.index)
            .collect();
        assert_eq!(highs, vec![4]);
    }

    #[test]
    fn test_channel_width_invariant() {
        let candles = oscillating(110.0, 90.0, 290);
        let config = ChannelConfig::default();
        let channels = detect(&candles, &config);
        assert!(!channels.is_empty());

        let window_high = candles.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let window_low = candles.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let range = window_high - window_low;
        for c in &channels {
            let width_pct = (c.top_price - c.bottom_price) / range * 100.0;
            assert!(
                width_pct <= config.max_channel_width_pct + 1e-9,
                "channel {:?} too wide: {width_pct}%",
                c
            );
        }
    }

    #[test]
    fn test_non_overlap_invariant() {
        let candles = oscillating(110.0, 90.0, 290);
        let channels = detect(&candles, &ChannelConfig::default());
        for (i, a) in channels.iter().enumerate() {
            for b in channels.iter().skip(i + 1) {
                assert!(
                    !a.overlaps(b),
                    "channels overlap: [{}, {}] and [{}, {}]",
                    a.bottom_price,
                    a.top_price,
                    b.bottom_price,
                    b.top_price
                );
            }
        }
    }

    #[test]
    fn test_flat_series_degenerates_without_panic() {
        // high == low == close throughout: window range is 0, width% is
        // defined as 0 and must not divide by zero.
        let candles = make_candles(&[(100.0, 100.0); 60]);
        let channels = detect(&candles, &small_config());
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].top_price, 100.0);
        assert_eq!(channels[0].bottom_price, 100.0);
    }

    #[test]
    fn test_max_channels_cap() {
        let candles = oscillating(150.0, 50.0, 290);
        let config = ChannelConfig {
            max_channels: 2,
            ..ChannelConfig::default()
        };
        let channels = detect(&candles, &config);
        assert!(channels.len() <= 2);
    }

    #[test]
    fn test_nearest_support_and_resistance() {
        let channels = vec![
            Channel {
                top_price: 95.0,
                bottom_price: 93.0,
                kind: ChannelKind::Support,
                strength: 40,
                touch_count: 2,
                last_pivot_index: 10,
            },
            Channel {
                top_price: 90.0,
                bottom_price: 88.0,
                kind: ChannelKind::Support,
                strength: 20,
                touch_count: 1,
                last_pivot_index: 5,
            },
            Channel {
                top_price: 107.0,
                bottom_price: 105.0,
                kind: ChannelKind::Resistance,
                strength: 60,
                touch_count: 3,
                last_pivot_index: 20,
            },
            Channel {
                top_price: 112.0,
                bottom_price: 110.0,
                kind: ChannelKind::Resistance,
                strength: 20,
                touch_count: 0,
                last_pivot_index: 2,
            },
        ];
        let support = nearest_support(&channels, 100.0).unwrap();
        assert_eq!(support.top_price, 95.0);
        let resistance = nearest_resistance(&channels, 100.0).unwrap();
        assert_eq!(resistance.bottom_price, 105.0);
        assert!(nearest_resistance(&channels, 120.0).is_none());
    }

    #[test]
    fn test_equal_strength_tie_break() {
        fn band(bottom: f64, top: f64, strength: u32, touches: u32, last: usize) -> Channel {
            Channel {
                top_price: top,
                bottom_price: bottom,
                kind: ChannelKind::Support,
                strength,
                touch_count: touches,
                last_pivot_index: last,
            }
        }
        let config = ChannelConfig::default();

        // Equal strength: more touches ranks first
        let ranked = select_channels(
            vec![band(90.0, 91.0, 40, 1, 50), band(95.0, 96.0, 40, 3, 10)],
            &config,
        );
        assert_eq!(ranked[0].bottom_price, 95.0);
        assert_eq!(ranked[1].bottom_price, 90.0);

        // Equal strength and touches: the more recent latest pivot wins
        let ranked = select_channels(
            vec![band(90.0, 91.0, 40, 2, 10), band(95.0, 96.0, 40, 2, 50)],
            &config,
        );
        assert_eq!(ranked[0].bottom_price, 95.0);

        // Overlapping equal-strength candidates: only the tie-break winner
        // survives selection
        let ranked = select_channels(
            vec![band(90.0, 92.0, 40, 1, 50), band(91.0, 93.0, 40, 3, 10)],
            &config,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].bottom_price, 91.0);
    }

    #[test]
    fn test_strength_scoring_counts_pivots_and_touches() {
        let candles = oscillating(110.0, 90.0, 290);
        let channels = detect(&candles, &ChannelConfig::default());
        for c in &channels {
            // strength = 20 * pivots + touches, so subtracting touches
            // leaves a multiple of 20
            assert_eq!((c.strength - c.touch_count) % 20, 0);
            assert!(c.strength >= 20);
        }
    }
}
