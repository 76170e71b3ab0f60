//! Signal fusion into a score, a level, and a crisis taxonomy.
//!
//! Precedence of the rules, highest first:
//! 1. direct intent + (plan | means | timeframe) forces `critical`;
//! 2. farewell floors the level at `high`, self-injury at `moderate`/`low`;
//! 3. slang on its own is capped at `low`;
//! 4. otherwise the clamped numeric score maps through the thresholds.
//!
//! Only credible signals (confidence >= 0.5, i.e. not negation-discounted)
//! participate in the combination rule and the floors.

use crate::moderation::lexicon::CompiledLexicon;
use crate::shared::{ModerationSignal, RiskLevel, RiskType, SignalCategory};
use std::collections::HashMap;

/// Confidence below which a signal is treated as a trace only.
const CREDIBLE_CONFIDENCE: f32 = 0.5;

/// Score points added when intent co-occurs with plan, means, or timeframe.
const COMBINATION_BONUS: f32 = 25.0;

/// Fused outcome for one message.
#[derive(Debug, Clone, Copy)]
pub struct ScoreOutcome {
    pub score: f32,
    pub level: RiskLevel,
    pub risk_type: Option<RiskType>,
}

/// Fuses signals into a score and level. Deterministic in the signals and the
/// rule table; no signals means `low` / 0.
pub fn score_signals(lexicon: &CompiledLexicon, signals: &[ModerationSignal]) -> ScoreOutcome {
    if signals.is_empty() {
        return ScoreOutcome {
            score: 0.0,
            level: RiskLevel::Low,
            risk_type: None,
        };
    }

    // Best confidence per distinct category. Summing per-category maxima,
    // not every match, keeps repeated phrases from running the score away.
    let mut best: HashMap<SignalCategory, f32> = HashMap::new();
    for s in signals {
        let entry = best.entry(s.category).or_insert(0.0);
        if s.confidence > *entry {
            *entry = s.confidence;
        }
    }

    let mut score: f32 = best
        .iter()
        .map(|(cat, conf)| conf * lexicon.weight_of(*cat))
        .sum();

    let credible = |cat: SignalCategory| {
        signals
            .iter()
            .any(|s| s.category == cat && !s.negated && s.confidence >= CREDIBLE_CONFIDENCE)
    };

    let combination = credible(SignalCategory::DirectIntent)
        && (credible(SignalCategory::Plan)
            || credible(SignalCategory::Means)
            || credible(SignalCategory::Timeframe));
    if combination {
        score += COMBINATION_BONUS;
    }

    score = score.clamp(0.0, 100.0);
    let mut level = RiskLevel::from_score(score);

    let slang_only = signals.iter().all(|s| s.category == SignalCategory::Slang);
    if slang_only {
        level = RiskLevel::Low;
    } else {
        if credible(SignalCategory::Farewell) {
            level = level.max(RiskLevel::High);
        }
        if signals
            .iter()
            .any(|s| s.category == SignalCategory::SelfInjury && !s.negated)
        {
            let floor = if credible(SignalCategory::SelfInjury) {
                RiskLevel::Moderate
            } else {
                RiskLevel::Low
            };
            level = level.max(floor);
        }
        if combination {
            level = RiskLevel::Critical;
        }
    }

    ScoreOutcome {
        score,
        level,
        risk_type: dominant_risk_type(lexicon, &best),
    }
}

/// Crisis taxonomy of the highest-contributing credible category. Slang is
/// never decisive on its own; a purely negated message still reports the
/// taxonomy of its strongest trace so review queues can route it.
fn dominant_risk_type(
    lexicon: &CompiledLexicon,
    best: &HashMap<SignalCategory, f32>,
) -> Option<RiskType> {
    let pick = |require_credible: bool| {
        best.iter()
            .filter(|(cat, conf)| {
                **cat != SignalCategory::Slang && (!require_credible || **conf >= CREDIBLE_CONFIDENCE)
            })
            .max_by(|(a_cat, a_conf), (b_cat, b_conf)| {
                let a = **a_conf * lexicon.weight_of(**a_cat);
                let b = **b_conf * lexicon.weight_of(**b_cat);
                a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(cat, _)| cat.risk_type())
    };
    pick(true).or_else(|| pick(false))
}
