use anyhow::Result;
use bitquant_ops::{
    HT_LOOKBACK, bollinger_bands, bollinger_position, delta, ht_trendmode, midpoint, natr,
    rolling_max_finite,
};

fn sample_bars(len: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let close: Vec<f64> = (0..len)
        .map(|i| 100.0 + (i as f64 * 0.21).sin() * 3.0 + i as f64 * 0.1)
        .collect();
    let high = close.iter().map(|c| c + 1.0).collect();
    let low = close.iter().map(|c| c - 1.0).collect();
    (high, low, close)
}

#[test]
fn nested_reference_factor_warmup_matches_window_arithmetic() -> Result<()> {
    // ts_midpoint(ts_natr(high,low,close,7),14)
    let (high, low, close) = sample_bars(60);
    let inner = natr(&high, &low, &close, 7);
    let outer = midpoint(&inner, 14);
    let first_inner = inner.iter().position(|v| v.is_finite()).unwrap_or(usize::MAX);
    let first_outer = outer.iter().position(|v| v.is_finite()).unwrap_or(usize::MAX);
    assert_eq!(first_inner, 7);
    assert_eq!(first_outer, 7 + 13);
    assert!(outer[first_outer..].iter().all(|v| v.is_finite() && *v > 0.0));
    Ok(())
}

#[test]
fn delta_of_dynamic_max_over_bbands_position() -> Result<()> {
    // ts_delta(dynamic_ts_max(ts_bbands(close,20),28),7)
    let (_, _, close) = sample_bars(90);
    let (_, upper, lower) = bollinger_bands(&close, 20, 2.0);
    let position = bollinger_position(&close, &lower, &upper);
    let rolled = rolling_max_finite(&position, 28);
    let out = delta(&rolled, 7);
    // the NaN-skipping max starts as soon as one band value exists
    assert_eq!(rolled.iter().position(|v| v.is_finite()), Some(27));
    assert_eq!(out.iter().position(|v| v.is_finite()), Some(34));
    Ok(())
}

#[test]
fn trend_mode_restarts_after_gap() -> Result<()> {
    let (_, _, mut close) = sample_bars(200);
    close[100] = f64::NAN;
    let out = ht_trendmode(&close);
    assert!(out[100].is_nan());
    assert!(out[101..101 + HT_LOOKBACK].iter().all(|v| v.is_nan()));
    assert!(out[101 + HT_LOOKBACK].is_finite());
    assert!(out[HT_LOOKBACK..100].iter().all(|v| v.is_finite()));
    Ok(())
}
