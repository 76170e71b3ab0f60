//! haven-core: crisis detection and human-in-the-loop intervention core.
//!
//! The moderation pipeline (normalize, detect, fuse) classifies free-text
//! messages in real time; qualifying results open a critical alert whose
//! lifecycle guarantees a clinician is notified, escalated to, and bound into
//! the conversation within a bounded window. The gateway crate exposes the
//! HTTP and SSE surfaces on top of this library.

mod bridge;
mod config;
mod error;
mod feedback;
mod notify;
mod shared;

pub mod alerts;
pub mod moderation;

// Shared data model
pub use shared::{
    AlertStats, AlertStatus, ChannelOutcome, ClinicianAvailability, ClinicianSession,
    CriticalAlert, ModerationResult, ModerationSignal, ModerationSummary, RiskLevel, RiskType,
    SignalCategory, REDACTED_PLACEHOLDER,
};

// Configuration
pub use config::HavenConfig;

// Errors
pub use error::{HavenError, HavenResult};

// Moderation pipeline
pub use moderation::{
    lexicon::{CategoryRule, CompiledLexicon, Lexicon, Term, LEXICON_VERSION},
    message_digest,
    normalize::normalize,
    ModerationPipeline,
};

// Alert lifecycle
pub use alerts::{
    store::AlertStore, AlertDetails, AlertEvent, AlertManager, AlertSettings,
};

// Notification fan-out
pub use notify::{
    NotificationChannel, NotificationDispatcher, RosterChannel, SmsChannel, WebhookChannel,
};
#[cfg(feature = "email")]
pub use notify::EmailChannel;

// Realtime bridge
pub use bridge::{RealtimeBridge, RelayMessage, RelaySender, RelaySide};

// Feedback sink
pub use feedback::{FeedbackRecord, FeedbackSink};
