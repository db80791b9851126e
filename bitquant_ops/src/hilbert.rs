//! Hilbert-transform trend mode (Ehlers), following the TA-Lib formulation.
//!
//! The output is 1.0 while the series is trending and 0.0 while it is in a
//! cycle. The first [`HT_LOOKBACK`] values of every finite run are `NaN`.

use std::f64::consts::PI;

pub const HT_LOOKBACK: usize = 63;

const SMOOTH_PRICE_SIZE: usize = 50;
const HILBERT_A: f64 = 0.0962;
const HILBERT_B: f64 = 0.5769;

/// Trend mode for a series that may contain gaps. Each contiguous run of
/// finite values is processed independently.
pub fn ht_trendmode(values: &[f64]) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    let mut start = 0;
    while start < values.len() {
        if !values[start].is_finite() {
            start += 1;
            continue;
        }
        let end = values[start..]
            .iter()
            .position(|v| !v.is_finite())
            .map_or(values.len(), |offset| start + offset);
        let run = trendmode_run(&values[start..end]);
        out[start..end].copy_from_slice(&run);
        start = end;
    }
    out
}

/// Four-bar weighted moving average (weights 4,3,2,1) maintained
/// incrementally.
struct PriceWma {
    sub: f64,
    sum: f64,
    trailing_value: f64,
    trailing_idx: usize,
}

impl PriceWma {
    fn seed(values: &[f64]) -> Self {
        Self {
            sub: values[0] + values[1] + values[2],
            sum: values[0] + values[1] * 2.0 + values[2] * 3.0,
            trailing_value: 0.0,
            trailing_idx: 0,
        }
    }

    fn push(&mut self, values: &[f64], price: f64) -> f64 {
        self.sub += price;
        self.sub -= self.trailing_value;
        self.sum += price * 4.0;
        self.trailing_value = values[self.trailing_idx];
        self.trailing_idx += 1;
        let smoothed = self.sum * 0.1;
        self.sum -= self.sub;
        smoothed
    }
}

/// One Hilbert FIR filter with separate odd/even delay lines.
#[derive(Default)]
struct HilbertFilter {
    odd: [f64; 3],
    even: [f64; 3],
    prev_odd: f64,
    prev_even: f64,
    prev_input_odd: f64,
    prev_input_even: f64,
}

impl HilbertFilter {
    fn even(&mut self, input: f64, idx: usize, adjusted_prev_period: f64) -> f64 {
        let scaled = HILBERT_A * input;
        let mut value = -self.even[idx];
        self.even[idx] = scaled;
        value += scaled;
        value -= self.prev_even;
        self.prev_even = HILBERT_B * self.prev_input_even;
        value += self.prev_even;
        self.prev_input_even = input;
        value * adjusted_prev_period
    }

    fn odd(&mut self, input: f64, idx: usize, adjusted_prev_period: f64) -> f64 {
        let scaled = HILBERT_A * input;
        let mut value = -self.odd[idx];
        self.odd[idx] = scaled;
        value += scaled;
        value -= self.prev_odd;
        self.prev_odd = HILBERT_B * self.prev_input_odd;
        value += self.prev_odd;
        self.prev_input_odd = input;
        value * adjusted_prev_period
    }
}

fn trendmode_run(values: &[f64]) -> Vec<f64> {
    let len = values.len();
    let mut out = vec![f64::NAN; len];
    if len <= HT_LOOKBACK {
        return out;
    }

    let rad2deg = 180.0 / PI;
    let deg2rad = PI / 180.0;
    let two_pi = 2.0 * PI;

    let mut wma = PriceWma::seed(values);
    let mut today = 3;
    for _ in 0..34 {
        wma.push(values, values[today]);
        today += 1;
    }

    let mut detrender_f = HilbertFilter::default();
    let mut q1_f = HilbertFilter::default();
    let mut ji_f = HilbertFilter::default();
    let mut jq_f = HilbertFilter::default();
    let mut hilbert_idx = 0usize;

    let mut period = 0.0f64;
    let mut smooth_period = 0.0f64;
    let (mut prev_i2, mut prev_q2) = (0.0f64, 0.0f64);
    let (mut re, mut im) = (0.0f64, 0.0f64);
    let (mut i1_odd_prev3, mut i1_even_prev3) = (0.0f64, 0.0f64);
    let (mut i1_odd_prev2, mut i1_even_prev2) = (0.0f64, 0.0f64);
    let mut smooth_price = [0.0f64; SMOOTH_PRICE_SIZE];
    let mut smooth_idx = 0usize;
    let mut dc_phase = 0.0f64;
    let (mut sine, mut lead_sine) = (0.0f64, 0.0f64);
    let (mut i_trend1, mut i_trend2, mut i_trend3) = (0.0f64, 0.0f64, 0.0f64);
    let mut days_in_trend = 0usize;

    while today < len {
        let adjusted_prev_period = 0.075 * period + 0.54;
        let smoothed = wma.push(values, values[today]);
        smooth_price[smooth_idx] = smoothed;

        let (q2, i2);
        if today % 2 == 0 {
            let detrender = detrender_f.even(smoothed, hilbert_idx, adjusted_prev_period);
            let q1 = q1_f.even(detrender, hilbert_idx, adjusted_prev_period);
            let ji = ji_f.even(i1_even_prev3, hilbert_idx, adjusted_prev_period);
            let jq = jq_f.even(q1, hilbert_idx, adjusted_prev_period);
            hilbert_idx += 1;
            if hilbert_idx == 3 {
                hilbert_idx = 0;
            }
            q2 = 0.2 * (q1 + ji) + 0.8 * prev_q2;
            i2 = 0.2 * (i1_even_prev3 - jq) + 0.8 * prev_i2;
            i1_odd_prev3 = i1_odd_prev2;
            i1_odd_prev2 = detrender;
        } else {
            let detrender = detrender_f.odd(smoothed, hilbert_idx, adjusted_prev_period);
            let q1 = q1_f.odd(detrender, hilbert_idx, adjusted_prev_period);
            let ji = ji_f.odd(i1_odd_prev3, hilbert_idx, adjusted_prev_period);
            let jq = jq_f.odd(q1, hilbert_idx, adjusted_prev_period);
            q2 = 0.2 * (q1 + ji) + 0.8 * prev_q2;
            i2 = 0.2 * (i1_odd_prev3 - jq) + 0.8 * prev_i2;
            i1_even_prev3 = i1_even_prev2;
            i1_even_prev2 = detrender;
        }

        re = 0.2 * (i2 * prev_i2 + q2 * prev_q2) + 0.8 * re;
        im = 0.2 * (i2 * prev_q2 - q2 * prev_i2) + 0.8 * im;
        prev_q2 = q2;
        prev_i2 = i2;

        let last_period = period;
        if im != 0.0 && re != 0.0 {
            period = 360.0 / ((im / re).atan() * rad2deg);
        }
        period = period.min(1.5 * last_period).max(0.67 * last_period);
        period = period.clamp(6.0, 50.0);
        period = 0.2 * period + 0.8 * last_period;
        smooth_period = 0.33 * period + 0.67 * smooth_period;

        // dominant cycle phase
        let prev_dc_phase = dc_phase;
        let dc_period = (smooth_period + 0.5) as usize;
        let mut real_part = 0.0;
        let mut imag_part = 0.0;
        let mut idx = smooth_idx;
        for i in 0..dc_period {
            let angle = (i as f64 * two_pi) / dc_period as f64;
            let price = smooth_price[idx];
            real_part += angle.sin() * price;
            imag_part += angle.cos() * price;
            idx = if idx == 0 { SMOOTH_PRICE_SIZE - 1 } else { idx - 1 };
        }
        let abs_imag = imag_part.abs();
        if abs_imag > 0.0 {
            dc_phase = (real_part / imag_part).atan() * rad2deg;
        } else if abs_imag <= 0.01 {
            if real_part < 0.0 {
                dc_phase -= 90.0;
            } else if real_part > 0.0 {
                dc_phase += 90.0;
            }
        }
        dc_phase += 90.0;
        if smooth_period != 0.0 {
            // one bar of WMA lag
            dc_phase += 360.0 / smooth_period;
        }
        if imag_part < 0.0 {
            dc_phase += 180.0;
        }
        if dc_phase > 315.0 {
            dc_phase -= 360.0;
        }

        let prev_sine = sine;
        let prev_lead_sine = lead_sine;
        sine = (dc_phase * deg2rad).sin();
        lead_sine = ((dc_phase + 45.0) * deg2rad).sin();

        // instantaneous trendline
        let trend_period = (smooth_period + 0.5) as usize;
        let mut average = values[..=today]
            .iter()
            .rev()
            .take(trend_period)
            .sum::<f64>();
        if trend_period > 0 {
            average /= trend_period as f64;
        }
        let trendline = (4.0 * average + 3.0 * i_trend1 + 2.0 * i_trend2 + i_trend3) / 10.0;
        i_trend3 = i_trend2;
        i_trend2 = i_trend1;
        i_trend1 = average;

        let mut trend = 1.0;
        let crossed_up = sine > lead_sine && prev_sine <= prev_lead_sine;
        let crossed_down = sine < lead_sine && prev_sine >= prev_lead_sine;
        if crossed_up || crossed_down {
            days_in_trend = 0;
            trend = 0.0;
        }
        days_in_trend += 1;
        if (days_in_trend as f64) < 0.5 * smooth_period {
            trend = 0.0;
        }
        let phase_step = dc_phase - prev_dc_phase;
        if smooth_period != 0.0
            && phase_step > 0.67 * 360.0 / smooth_period
            && phase_step < 1.5 * 360.0 / smooth_period
        {
            trend = 0.0;
        }
        let price = smooth_price[smooth_idx];
        if trendline != 0.0 && ((price - trendline) / trendline).abs() >= 0.015 {
            trend = 1.0;
        }

        if today >= HT_LOOKBACK {
            out[today] = trend;
        }

        smooth_idx += 1;
        if smooth_idx > SMOOTH_PRICE_SIZE - 1 {
            smooth_idx = 0;
        }
        today += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_rows_are_nan_and_outputs_are_binary() {
        let values: Vec<f64> = (0..200)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.05)
            .collect();
        let out = ht_trendmode(&values);
        assert!(out[..HT_LOOKBACK].iter().all(|v| v.is_nan()));
        assert!(out[HT_LOOKBACK..].iter().all(|&v| v == 0.0 || v == 1.0));
    }

    #[test]
    fn strong_drift_is_reported_as_trend() {
        let values: Vec<f64> = (0..150).map(|i| 100.0 * 1.02f64.powi(i)).collect();
        let out = ht_trendmode(&values);
        assert_eq!(out[149], 1.0);
    }

    #[test]
    fn short_series_is_all_nan() {
        let out = ht_trendmode(&[1.0; 40]);
        assert!(out.iter().all(|v| v.is_nan()));
    }
}
