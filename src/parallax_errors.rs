use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParallaxError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("Invalid normalization parameters: {0}")]
    InvalidNormParams(String),

    #[error("Invalid fit parameters: {0}")]
    InvalidFitParams(String),

    #[error("Optimizer did not converge after {iterations} iterations (gradient norm {grad_norm:.3e})")]
    SolverDidNotConverge { iterations: usize, grad_norm: f64 },

    #[error("Line search failed at iteration {iteration} (gradient norm {grad_norm:.3e})")]
    LineSearchFailed { iteration: usize, grad_norm: f64 },

    #[error(
        "Analytic gradient disagrees with finite differences along direction {direction} \
         (relative error {relative_error:.3e}); the loss/gradient pair is inconsistent"
    )]
    GradientMismatch {
        direction: usize,
        relative_error: f64,
    },

    #[error("Batch task {index} failed: {source}")]
    TaskFailed {
        index: usize,
        #[source]
        source: Box<ParallaxError>,
    },

    #[error("Cache key not found: {0}")]
    CacheMiss(String),

    #[error("Query job ended in phase {0}")]
    QueryJobFailed(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP ureq error: {0}")]
    UreqHttpError(#[from] ureq::Error),

    #[error("Serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Coefficient vector for model version {version} has {found} entries, schema expects {expected}")]
    CoefficientLengthMismatch {
        version: String,
        found: usize,
        expected: usize,
    },

    #[error("External service error: {0}")]
    ExternalService(String),
}
