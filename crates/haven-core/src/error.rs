//! Error taxonomy for the crisis core.
//!
//! Moderation (normalize/detect/score) never returns errors: a faulty rule
//! table degrades to the built-in one and a detector fault degrades to "no
//! signals", because failing open on the conversational path is less dangerous
//! than failing the whole message pipeline. Lifecycle and bridge operations
//! return typed errors that the gateway maps to HTTP statuses.

use thiserror::Error;

/// Typed failures surfaced by alert lifecycle, bridge, and storage operations.
#[derive(Debug, Clone, Error)]
pub enum HavenError {
    /// A required field was missing or empty (e.g. no clinician id on acknowledge).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced alert, clinician, or intervention does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A transition was attempted on a terminal or mismatched state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A binding already exists for a different party.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A single notification channel failed. Logged and recorded, never fatal.
    #[error("notification channel '{channel}' failed: {reason}")]
    ChannelFailure { channel: String, reason: String },

    /// The durable store is unreachable. The core degrades to in-memory
    /// retention; callers log loudly and keep serving chat.
    #[error("durable store unavailable: {0}")]
    PersistenceUnavailable(String),
}

pub type HavenResult<T> = Result<T, HavenError>;
