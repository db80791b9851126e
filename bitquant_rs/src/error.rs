use thiserror::Error;

pub type Result<T> = std::result::Result<T, QuantError>;

/// Fatal conditions raised by the signal and simulation pipeline.
///
/// Numerical degeneracies (singular covariance, zero-variance returns) are
/// not errors; they are recovered locally where they occur.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QuantError {
    #[error("data alignment failed: {message}")]
    DataAlignment { message: String },

    #[error("invalid factor expression `{expression}` at offset {position}: {message}")]
    FactorExpression {
        expression: String,
        position: usize,
        message: String,
    },

    #[error("weights are not always delta neutral: row {row} sums to {sum:e} ({context})")]
    DeltaNeutrality {
        row: usize,
        sum: f64,
        context: String,
    },

    #[error("invalid portfolio: {message}")]
    InvalidPortfolio { message: String },

    #[error("{stage} needs at least {required} rows, got {available}")]
    InsufficientHistory {
        stage: &'static str,
        required: usize,
        available: usize,
    },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl QuantError {
    pub fn alignment(message: impl Into<String>) -> Self {
        Self::DataAlignment {
            message: message.into(),
        }
    }

    pub fn expression(
        expression: impl Into<String>,
        position: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::FactorExpression {
            expression: expression.into(),
            position,
            message: message.into(),
        }
    }

    pub fn portfolio(message: impl Into<String>) -> Self {
        Self::InvalidPortfolio {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
