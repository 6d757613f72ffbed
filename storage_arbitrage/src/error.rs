use crate::solver::SolveStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArbitrageError {
    /// Bad parameter bundle or price input; fatal to the current build.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Price data could not be produced for the requested range.
    #[error("Price data error: {0}")]
    DataSource(String),

    /// The sizing solve was not optimal, so nothing can be evaluated.
    #[error("No capital plan found: sizing solve ended {0}")]
    NoCapitalPlan(SolveStatus),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
