//! Signal detection over normalized text.
//!
//! Each category's compiled pattern is scanned once; every distinct matched
//! phrase yields one signal. A negation marker ending inside the look-back
//! window discounts the match instead of discarding it, so clinicians always
//! see the trace. Intensity terms raise self-injury confidence.

use crate::moderation::lexicon::CompiledLexicon;
use crate::shared::{ModerationSignal, SignalCategory};

/// Scans normalized text against the rule table.
pub fn detect(lexicon: &CompiledLexicon, normalized: &str) -> Vec<ModerationSignal> {
    if normalized.is_empty() {
        return Vec::new();
    }

    let intensified = lexicon
        .intensity_terms
        .iter()
        .any(|t| normalized.contains(t.as_str()));

    let mut signals = Vec::new();
    for cat in &lexicon.categories {
        // phrase -> (confidence, negated). A repeated phrase keeps its best
        // occurrence: one non-negated hit outweighs any negated repeat.
        let mut hits: Vec<(String, f32, bool)> = Vec::new();
        for m in cat.pattern.find_iter(normalized) {
            let phrase = m.as_str().to_string();
            let base = cat.confidence.get(&phrase).copied().unwrap_or(0.5);
            let negated = is_negated(lexicon, normalized, m.start());
            let mut confidence = if negated {
                base * lexicon.negation_discount
            } else {
                base
            };
            if cat.category == SignalCategory::SelfInjury && intensified && !negated {
                confidence = (confidence + lexicon.intensity_boost).min(1.0);
            }
            match hits.iter_mut().find(|(p, _, _)| *p == phrase) {
                Some(existing) => {
                    if confidence > existing.1 {
                        existing.1 = confidence;
                        existing.2 = negated;
                    }
                }
                None => hits.push((phrase, confidence, negated)),
            }
        }
        for (phrase, confidence, negated) in hits {
            signals.push(ModerationSignal {
                source: lexicon.version.clone(),
                category: cat.category,
                confidence: confidence.clamp(0.0, 1.0),
                matched_terms: vec![phrase],
                negated,
            });
        }
    }
    signals
}

/// True when a negation marker ends inside the window immediately before the
/// match. Normalized text is almost always ASCII, but offsets are re-aligned
/// to char boundaries so mixed-script input cannot panic.
fn is_negated(lexicon: &CompiledLexicon, text: &str, match_start: usize) -> bool {
    if match_start == 0 {
        return false;
    }
    let mut from = match_start.saturating_sub(lexicon.negation_window);
    while from < match_start && !text.is_char_boundary(from) {
        from += 1;
    }
    let window = &text[from..match_start];
    lexicon
        .negation_markers
        .iter()
        .any(|marker| window.contains(marker.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::lexicon::Lexicon;
    use crate::moderation::normalize::normalize;
    use once_cell::sync::Lazy;

    static LEX: Lazy<CompiledLexicon> = Lazy::new(|| Lexicon::builtin().compile());

    #[test]
    fn direct_intent_is_detected() {
        let signals = detect(&LEX, &normalize("Tôi muốn chết"));
        let intent = signals
            .iter()
            .find(|s| s.category == SignalCategory::DirectIntent)
            .expect("direct intent signal");
        assert!(!intent.negated);
        assert!(intent.confidence > 0.8);
        assert_eq!(intent.matched_terms, vec!["muon chet".to_string()]);
    }

    #[test]
    fn negation_discounts_but_keeps_the_signal() {
        let signals = detect(&LEX, &normalize("Tôi không muốn chết, tôi muốn sống"));
        let intent = signals
            .iter()
            .find(|s| s.category == SignalCategory::DirectIntent)
            .expect("trace must remain");
        assert!(intent.negated);
        assert!(intent.confidence < 0.5);
    }

    #[test]
    fn stated_unwillingness_to_live_is_not_self_negated() {
        let signals = detect(&LEX, &normalize("tôi không muốn sống nữa"));
        let intent = signals
            .iter()
            .find(|s| s.category == SignalCategory::DirectIntent)
            .expect("direct intent signal");
        assert!(!intent.negated, "the marker is part of the phrase itself");
        assert!(intent.confidence >= 0.9);
    }

    #[test]
    fn intensity_terms_raise_self_injury_confidence() {
        let plain = detect(&LEX, &normalize("em đã rạch tay"));
        let intense = detect(&LEX, &normalize("em đã rạch tay, chảy máu nhiều lần"));
        let c0 = plain
            .iter()
            .find(|s| s.category == SignalCategory::SelfInjury)
            .unwrap()
            .confidence;
        let c1 = intense
            .iter()
            .find(|s| s.category == SignalCategory::SelfInjury)
            .unwrap()
            .confidence;
        assert!(c1 > c0);
    }

    #[test]
    fn repeated_phrase_yields_one_signal() {
        let signals = detect(&LEX, &normalize("muốn chết muốn chết muốn chết"));
        let intents: Vec<_> = signals
            .iter()
            .filter(|s| s.category == SignalCategory::DirectIntent)
            .collect();
        assert_eq!(intents.len(), 1);
    }
}
