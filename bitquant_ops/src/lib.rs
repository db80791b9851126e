//! Numeric building blocks for factor expressions.
//!
//! All operators work on plain `&[f64]` series and mark values that cannot be
//! computed yet (warm-up windows, missing inputs) as `NaN`.

pub mod hilbert;
pub mod indicators;
pub mod rolling;
pub mod stats;

pub use hilbert::{HT_LOOKBACK, ht_trendmode};
pub use indicators::{atr, bollinger_bands, bollinger_position, natr, true_range, wilder};
pub use rolling::{
    backward_fill, delay, delta, fill_non_finite, forward_fill, midpoint, rolling_corr,
    rolling_max, rolling_max_finite, rolling_min, rolling_min_finite, rolling_pstd, rolling_rank,
    rolling_sum, rolling_zscore, sma,
};
