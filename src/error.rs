use thiserror::Error;

/// The error captured in place of a handler's return value when it panics or
/// returns `Err`. Never escapes `trigger` as a propagated error.
#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("handler failed: {0}")]
    Failed(String),
}
