//! Versioned, data-driven crisis rule table.
//!
//! Categories, weighted terms, negation markers, and intensity boosters are
//! plain data so detection can be tuned without touching detector code. The
//! built-in table ships in this file; an operator can override it with
//! `data/crisis_lexicon.toml` under the storage directory. Load failures fall
//! back to the built-in table with a warning; the chat path never breaks on a
//! bad table.

use crate::moderation::normalize::normalize;
use crate::shared::SignalCategory;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// Version tag of the built-in table. Stamped into every signal's `source`.
pub const LEXICON_VERSION: &str = "vi-crisis-2025.08";

/// One weighted phrase. Phrases are stored in canonical (normalized) form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub phrase: String,
    /// Base confidence a hit on this phrase carries, in [0,1].
    pub confidence: f32,
}

impl Term {
    fn new(phrase: &str, confidence: f32) -> Self {
        Self {
            phrase: phrase.to_string(),
            confidence,
        }
    }
}

/// Term list and score weight for one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: SignalCategory,
    /// Score points this category contributes at confidence 1.0.
    pub weight: f32,
    pub terms: Vec<Term>,
}

/// The full rule table, as serialized to/from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lexicon {
    pub version: String,
    /// Markers that discount a match they immediately precede.
    pub negation_markers: Vec<String>,
    /// Look-back window, in characters of normalized text.
    pub negation_window: usize,
    /// Multiplier applied to a negated match's confidence.
    pub negation_discount: f32,
    /// Terms that intensify self-injury matches when co-present.
    pub intensity_terms: Vec<String>,
    /// Confidence added to self-injury signals per intensity co-occurrence.
    pub intensity_boost: f32,
    pub categories: Vec<CategoryRule>,
}

impl Lexicon {
    /// The built-in Vietnamese crisis table.
    pub fn builtin() -> Self {
        Self {
            version: LEXICON_VERSION.to_string(),
            negation_markers: vec![
                "khong".into(),
                "chang".into(),
                "dau co".into(),
                "khong he".into(),
                "khong bao gio".into(),
                "se khong".into(),
            ],
            negation_window: 16,
            negation_discount: 0.35,
            intensity_terms: vec![
                "chay mau".into(),
                "sau hon".into(),
                "nhieu lan".into(),
                "khong dung lai duoc".into(),
            ],
            intensity_boost: 0.15,
            categories: vec![
                CategoryRule {
                    category: SignalCategory::DirectIntent,
                    weight: 80.0,
                    terms: vec![
                        Term::new("muon chet", 0.9),
                        Term::new("muon tu tu", 0.95),
                        Term::new("tu tu", 0.8),
                        Term::new("tu sat", 0.85),
                        Term::new("ket thuc cuoc doi", 0.9),
                        Term::new("muon ket thuc tat ca", 0.85),
                        Term::new("khong muon song", 0.9),
                        Term::new("song lam gi nua", 0.7),
                    ],
                },
                CategoryRule {
                    category: SignalCategory::Plan,
                    weight: 35.0,
                    terms: vec![
                        Term::new("len ke hoach", 0.8),
                        Term::new("viet thu tuyet menh", 0.9),
                        Term::new("thu tuyet menh", 0.85),
                        Term::new("da chuan bi", 0.65),
                        Term::new("chuan bi san sang", 0.6),
                        Term::new("se lam dieu do", 0.7),
                        Term::new("se lam", 0.5),
                    ],
                },
                CategoryRule {
                    category: SignalCategory::Means,
                    weight: 35.0,
                    terms: vec![
                        Term::new("thuoc ngu", 0.7),
                        Term::new("uong het thuoc", 0.75),
                        Term::new("day thung", 0.75),
                        Term::new("nhay lau", 0.8),
                        Term::new("nhay cau", 0.8),
                        Term::new("dao lam", 0.7),
                        Term::new("than hoat tinh", 0.7),
                    ],
                },
                CategoryRule {
                    category: SignalCategory::Timeframe,
                    weight: 30.0,
                    terms: vec![
                        Term::new("dem nay", 0.7),
                        Term::new("toi nay", 0.7),
                        Term::new("ngay mai", 0.6),
                        Term::new("tuan nay", 0.55),
                        Term::new("truoc khi troi sang", 0.75),
                        Term::new("truoc sinh nhat", 0.6),
                    ],
                },
                CategoryRule {
                    category: SignalCategory::Farewell,
                    weight: 65.0,
                    terms: vec![
                        Term::new("vinh biet", 0.85),
                        Term::new("tam biet moi nguoi", 0.85),
                        Term::new("tam biet tat ca", 0.8),
                        Term::new("gap lai kiep sau", 0.85),
                        Term::new("hen gap lai o kiep sau", 0.9),
                        Term::new("xin loi vi tat ca", 0.6),
                        Term::new("cam on vi tat ca", 0.55),
                    ],
                },
                CategoryRule {
                    category: SignalCategory::SelfInjury,
                    weight: 40.0,
                    terms: vec![
                        Term::new("rach tay", 0.8),
                        Term::new("cat tay", 0.8),
                        Term::new("tu lam dau", 0.75),
                        Term::new("lam dau ban than", 0.75),
                        Term::new("tu hanh ha ban than", 0.7),
                        Term::new("dap dau vao tuong", 0.7),
                    ],
                },
                CategoryRule {
                    category: SignalCategory::Ideation,
                    weight: 45.0,
                    terms: vec![
                        Term::new("khong con y nghia", 0.75),
                        Term::new("cuoc song vo nghia", 0.75),
                        Term::new("muon bien mat", 0.8),
                        Term::new("chan song", 0.7),
                        Term::new("met moi voi cuoc song", 0.65),
                        Term::new("khong ai can toi", 0.7),
                        Term::new("la ganh nang", 0.7),
                    ],
                },
                CategoryRule {
                    category: SignalCategory::Slang,
                    weight: 12.0,
                    terms: vec![
                        Term::new("muon bay mau", 0.6),
                        Term::new("toang that roi", 0.5),
                        Term::new("het cuu", 0.5),
                        Term::new("ngu mot giac khong day", 0.8),
                    ],
                },
                CategoryRule {
                    category: SignalCategory::Violence,
                    weight: 55.0,
                    terms: vec![
                        Term::new("muon giet", 0.8),
                        Term::new("giet het", 0.8),
                        Term::new("dam chet", 0.75),
                        Term::new("tra thu", 0.6),
                        Term::new("cho no biet tay", 0.55),
                    ],
                },
                CategoryRule {
                    category: SignalCategory::Psychosis,
                    weight: 45.0,
                    terms: vec![
                        Term::new("nghe thay giong noi", 0.75),
                        Term::new("giong noi trong dau", 0.8),
                        Term::new("ai do theo doi toi", 0.6),
                        Term::new("ho dang theo doi", 0.6),
                        Term::new("bi dieu khien", 0.65),
                    ],
                },
            ],
        }
    }

    /// Load an operator override from `<dir>/crisis_lexicon.toml`.
    pub fn load_from_data_dir(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join("crisis_lexicon.toml");
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Load an override or fall back to the built-in table. Never fails.
    pub fn load_or_builtin(dir: Option<&Path>) -> Self {
        match dir {
            Some(d) => match Self::load_from_data_dir(d) {
                Ok(lex) => lex,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::builtin(),
                Err(e) => {
                    warn!(target: "haven::moderation", "crisis lexicon override unreadable ({}), using built-in table", e);
                    Self::builtin()
                }
            },
            None => Self::builtin(),
        }
    }

    /// Compiles the table into per-category matchers. Phrases are normalized
    /// here so the table and the input always meet in canonical space.
    pub fn compile(&self) -> CompiledLexicon {
        let categories = self
            .categories
            .iter()
            .filter_map(|rule| CompiledCategory::compile(rule))
            .collect();
        CompiledLexicon {
            version: self.version.clone(),
            negation_markers: self
                .negation_markers
                .iter()
                .map(|m| normalize(m))
                .filter(|m| !m.is_empty())
                .collect(),
            negation_window: self.negation_window.max(1),
            negation_discount: self.negation_discount.clamp(0.0, 1.0),
            intensity_terms: self
                .intensity_terms
                .iter()
                .map(|t| normalize(t))
                .filter(|t| !t.is_empty())
                .collect(),
            intensity_boost: self.intensity_boost.clamp(0.0, 1.0),
            categories,
        }
    }
}

/// One category's compiled matcher: a word-bounded alternation over all of
/// its phrases plus a phrase -> confidence lookup.
#[derive(Debug, Clone)]
pub struct CompiledCategory {
    pub category: SignalCategory,
    pub weight: f32,
    pub pattern: Regex,
    pub confidence: HashMap<String, f32>,
}

impl CompiledCategory {
    fn compile(rule: &CategoryRule) -> Option<Self> {
        let mut confidence = HashMap::new();
        let mut escaped: Vec<String> = Vec::new();
        for term in &rule.terms {
            let canonical = normalize(&term.phrase);
            if canonical.is_empty() {
                continue;
            }
            escaped.push(regex::escape(&canonical));
            confidence.insert(canonical, term.confidence.clamp(0.0, 1.0));
        }
        if escaped.is_empty() {
            return None;
        }
        // Longest alternative first so "muon tu tu" wins over "tu tu".
        escaped.sort_by_key(|b| std::cmp::Reverse(b.len()));
        let pattern_str = format!(r"\b(?:{})\b", escaped.join("|"));
        let pattern = match Regex::new(&pattern_str) {
            Ok(p) => p,
            Err(e) => {
                warn!(target: "haven::moderation", "category {:?} pattern failed to compile: {}", rule.category, e);
                return None;
            }
        };
        Some(Self {
            category: rule.category,
            weight: rule.weight.max(0.0),
            pattern,
            confidence,
        })
    }
}

/// Ready-to-match rule table.
#[derive(Debug, Clone)]
pub struct CompiledLexicon {
    pub version: String,
    pub negation_markers: Vec<String>,
    pub negation_window: usize,
    pub negation_discount: f32,
    pub intensity_terms: Vec<String>,
    pub intensity_boost: f32,
    pub categories: Vec<CompiledCategory>,
}

impl CompiledLexicon {
    pub fn weight_of(&self, category: SignalCategory) -> f32 {
        self.categories
            .iter()
            .find(|c| c.category == category)
            .map(|c| c.weight)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_compiles_every_category() {
        let lex = Lexicon::builtin().compile();
        assert_eq!(lex.categories.len(), 10);
        assert_eq!(lex.version, LEXICON_VERSION);
    }

    #[test]
    fn table_round_trips_through_toml() {
        let table = Lexicon::builtin();
        let text = toml::to_string(&table).unwrap();
        let back: Lexicon = toml::from_str(&text).unwrap();
        assert_eq!(back.version, table.version);
        assert_eq!(back.categories.len(), table.categories.len());
    }

    #[test]
    fn longest_phrase_wins() {
        let lex = Lexicon::builtin().compile();
        let intent = lex
            .categories
            .iter()
            .find(|c| c.category == SignalCategory::DirectIntent)
            .unwrap();
        let m = intent.pattern.find("toi muon tu tu").unwrap();
        assert_eq!(m.as_str(), "muon tu tu");
    }
}
