pub mod activation_token;
pub mod recruiting;
pub mod tenant;
pub mod user;

use thiserror::Error;

/// Raised when a text column holds a value outside one of the closed enumerations.
#[derive(Debug, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
