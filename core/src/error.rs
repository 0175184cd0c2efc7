/// Error taxonomy for CDE solving.
///
/// Configuration and shape errors are raised during the pre-flight trial evaluation at t[0],
/// before any stepping. Numerical errors come out of the integrator unmodified.
/// Graph errors flag misuse of the tape (double reattach, re-entered boundary).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("graph error: {0}")]
    Graph(String),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CdeError {
    pub fn config(msg: impl Into<String>) -> Self {
        CdeError::Config(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        CdeError::Shape(msg.into())
    }

    pub fn numerical(msg: impl Into<String>) -> Self {
        CdeError::Numerical(msg.into())
    }

    pub fn graph(msg: impl Into<String>) -> Self {
        CdeError::Graph(msg.into())
    }
}

pub type CdeResult<T> = Result<T, CdeError>;
