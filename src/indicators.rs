//! Technical indicator math: EMA, SMA, RSI, MACD.
//!
//! All functions are pure and operate on close-price series. Output vectors
//! are aligned with the input; positions before the indicator's warm-up are
//! NaN so callers can index by bar without offset bookkeeping.

/// Simple moving average. NaN until `period - 1`.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period {
        return result;
    }

    let mut sum: f64 = values[..period].iter().sum();
    result[period - 1] = sum / period as f64;
    for i in period..n {
        sum += values[i] - values[i - period];
        result[i] = sum / period as f64;
    }
    result
}

/// Exponential moving average seeded with the SMA of the first `period`
/// values. NaN until `period - 1`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period {
        return result;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    result[period - 1] = seed;

    let mut prev = seed;
    for i in period..n {
        let v = alpha * values[i] + (1.0 - alpha) * prev;
        result[i] = v;
        prev = v;
    }
    result
}

/// Relative Strength Index with Wilder smoothing. NaN until `period`.
///
/// Edge cases: no losses → 100, no gains → 0, no movement at all → 50.
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return result;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    result[period] = rsi_from_averages(avg_gain, avg_loss);

    let alpha = 1.0 / period as f64;
    for i in (period + 1)..n {
        let change = values[i] - values[i - 1];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = alpha * gain + (1.0 - alpha) * avg_gain;
        avg_loss = alpha * loss + (1.0 - alpha) * avg_loss;
        result[i] = rsi_from_averages(avg_gain, avg_loss);
    }
    result
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// SMA of an RSI series, skipping the RSI warm-up NaNs.
///
/// Entry rule and reversal exit both compare RSI against this smoothing.
pub fn rsi_sma(rsi_values: &[f64], period: usize) -> Vec<f64> {
    let n = rsi_values.len();
    let mut result = vec![f64::NAN; n];
    if period == 0 {
        return result;
    }
    let first_valid = match rsi_values.iter().position(|v| !v.is_nan()) {
        Some(i) => i,
        None => return result,
    };
    let smoothed = sma(&rsi_values[first_valid..], period);
    for (i, v) in smoothed.into_iter().enumerate() {
        result[first_valid + i] = v;
    }
    result
}

/// MACD output: line, signal and histogram series, all input-aligned.
#[derive(Debug, Clone)]
pub struct MacdSeries {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// MACD(fast, slow, signal): EMA(fast) - EMA(slow), signal = EMA of the MACD
/// line, histogram = line - signal.
pub fn macd(values: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdSeries {
    let n = values.len();
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);

    let mut line = vec![f64::NAN; n];
    for i in 0..n {
        if !fast_ema[i].is_nan() && !slow_ema[i].is_nan() {
            line[i] = fast_ema[i] - slow_ema[i];
        }
    }

    // Signal EMA starts where the MACD line becomes valid
    let mut signal = vec![f64::NAN; n];
    if let Some(first_valid) = line.iter().position(|v| !v.is_nan()) {
        let tail = ema(&line[first_valid..], signal_period);
        for (i, v) in tail.into_iter().enumerate() {
            signal[first_valid + i] = v;
        }
    }

    let mut histogram = vec![f64::NAN; n];
    for i in 0..n {
        if !line[i].is_nan() && !signal[i].is_nan() {
            histogram[i] = line[i] - signal[i];
        }
    }

    MacdSeries {
        macd: line,
        signal,
        histogram,
    }
}

/// Count of consecutive positive histogram bars ending at the latest bar.
/// NaN bars terminate the run.
pub fn consecutive_positive_histogram(histogram: &[f64]) -> usize {
    histogram
        .iter()
        .rev()
        .take_while(|v| !v.is_nan() && **v > 0.0)
        .count()
}
