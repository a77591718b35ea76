use thiserror::Error;

/// The crate-wide error type. All fallible engine operations, from configuration
/// loading through to a running simulation, resolve into one of these variants.
/// Nothing is recovered locally: the simulator is a batch tool, so every error
/// propagates out of `Simulation::run` as a single fatal value.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration invalid: {0:?}")]
    ConfigValidation(Vec<String>),

    #[error("no route found from {origin} to {target}")]
    RouteNotFound { origin: String, target: String },

    #[error("capacity exceeded on {0}")]
    CapacityExceeded(String),

    #[error("primitive {0} is already bound")]
    BindingViolation(String),

    #[error("state {0} received an interrupt without the interrupted flag set")]
    StateInterruptedWithoutFlag(String),

    #[error("invalid distribution parameters: {0}")]
    DistributionParameters(String),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type SimResult<T> = Result<T, SimError>;
