//! Moderation pipeline: normalize, detect, fuse.
//!
//! Stateless and synchronous; the inbound chat path runs it inline before
//! generating any reply. Nothing in here suspends, locks, or errors: a bad
//! rule table falls back to the built-in one, and text that matches nothing
//! simply scores low.

pub mod detect;
pub mod lexicon;
pub mod normalize;
pub mod score;

use crate::shared::ModerationResult;
use lexicon::{CompiledLexicon, Lexicon};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// The built-in table, compiled once per process.
static BUILTIN: Lazy<CompiledLexicon> = Lazy::new(|| Lexicon::builtin().compile());

/// Lowercase-hex SHA-256 of the raw message. Stable per input, effectively
/// collision-free, never reversible; alerts and logs carry this instead of
/// raw text.
pub fn message_digest(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Compiled pipeline. Cheap to clone-by-Arc and share; owns no mutable state.
pub struct ModerationPipeline {
    lexicon: CompiledLexicon,
}

impl Default for ModerationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ModerationPipeline {
    /// Pipeline over the built-in rule table.
    pub fn new() -> Self {
        Self {
            lexicon: BUILTIN.clone(),
        }
    }

    /// Pipeline over a specific rule table.
    pub fn with_lexicon(lexicon: Lexicon) -> Self {
        Self {
            lexicon: lexicon.compile(),
        }
    }

    /// Pipeline with an operator override from `<dir>/crisis_lexicon.toml`
    /// when present, falling back to the built-in table on any fault.
    pub fn from_data_dir(dir: &Path) -> Self {
        Self::with_lexicon(Lexicon::load_or_builtin(Some(dir)))
    }

    /// Rule-table version in use.
    pub fn lexicon_version(&self) -> &str {
        &self.lexicon.version
    }

    /// Scores one raw message. Total: any input yields a result.
    pub fn score(&self, raw: &str) -> ModerationResult {
        let message_digest = message_digest(raw);
        let normalized = normalize::normalize(raw);
        if normalized.is_empty() {
            return ModerationResult::empty(message_digest);
        }
        let signals = detect::detect(&self.lexicon, &normalized);
        let outcome = score::score_signals(&self.lexicon, &signals);
        debug!(
            target: "haven::moderation",
            score = outcome.score,
            level = outcome.level.as_str(),
            signals = signals.len(),
            "message scored"
        );
        ModerationResult {
            risk_level: outcome.level,
            risk_score: outcome.score,
            risk_type: outcome.risk_type,
            signals,
            normalized_text: normalized,
            message_digest,
        }
    }
}
