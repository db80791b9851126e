#![allow(dead_code)]

use bitquant_rs::matrix::Matrix;
use bitquant_rs::panel::Panel;

pub const HOUR_MS: i64 = 3_600_000;
pub const START_MS: i64 = 1_704_067_200_000;

pub fn symbols(n: usize) -> Vec<String> {
    ["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "ADAUSDT"]
        .iter()
        .take(n)
        .map(|s| s.to_string())
        .collect()
}

/// Hourly panel whose every field derives from `close`.
pub fn panel_from_close(close: &Matrix) -> Panel {
    let rows = close.rows();
    let timestamps = (0..rows as i64).map(|i| START_MS + i * HOUR_MS).collect();
    let open = Matrix::from_columns(
        rows,
        &(0..close.cols())
            .map(|c| {
                let column = close.column(c);
                let mut open = Vec::with_capacity(rows);
                open.push(column[0]);
                open.extend_from_slice(&column[..rows - 1]);
                open
            })
            .collect::<Vec<_>>(),
    );
    let high = open.zip_map(close, |o, c| o.max(c) * 1.001);
    let low = open.zip_map(close, |o, c| o.min(c) * 0.999);
    let volume = close.map(|c| 10.0 + (c * 7.0) % 3.0);
    let quote_volume = volume.zip_map(close, |v, c| v * c);
    let trades = Matrix::filled(rows, close.cols(), 100.0);
    let taker_buy_volume = volume.map(|v| v * 0.4);
    let taker_buy_quote_volume = taker_buy_volume.zip_map(close, |v, c| v * c);
    Panel::from_kline_fields(
        timestamps,
        symbols(close.cols()),
        vec![
            open,
            high,
            low,
            close.clone(),
            volume,
            quote_volume,
            trades,
            taker_buy_volume,
            taker_buy_quote_volume,
        ],
    )
    .expect("synthetic panel")
}

/// Smooth deterministic price paths with distinct phases per symbol.
pub fn wavy_close(rows: usize, cols: usize) -> Matrix {
    Matrix::from_columns(
        rows,
        &(0..cols)
            .map(|c| {
                (0..rows)
                    .map(|i| {
                        let t = i as f64;
                        100.0 * (1.0 + 0.02 * (t * 0.37 + c as f64 * 1.3).sin() + 0.001 * t)
                    })
                    .collect()
            })
            .collect::<Vec<_>>(),
    )
}
