//! Text canonicalization for signal detection.
//!
//! Crisis messages arrive adversarially obfuscated: leet digits ("ch3t"),
//! stripped or corrupted diacritics, emoji padding, stretched characters
//! ("chếtttt"). Everything is folded into one canonical form so the rule
//! table only ever has to describe that form. `normalize` is total,
//! side-effect-free, and idempotent.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Canonicalizes raw user text: lower-case, diacritics stripped, leet digits
/// mapped back to letters, emoji and symbols dropped, stretched runs
/// collapsed, whitespace normalized.
pub fn normalize(raw: &str) -> String {
    let folded = fold_marks(raw);
    let leeted = map_leet(&folded);
    let scrubbed: String = leeted
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let collapsed = collapse_repeats(&scrubbed);
    collapsed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// NFD-decompose, drop combining marks, lower-case. "chết" and its
/// accent-stripped variants converge here. U+0111 does not decompose, so the
/// đ/Đ mapping is explicit.
fn fold_marks(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.nfd() {
        if is_combining_mark(c) {
            continue;
        }
        for lc in c.to_lowercase() {
            match lc {
                'đ' => out.push('d'),
                _ => out.push(lc),
            }
        }
    }
    out
}

/// Maps common leet substitutions inside tokens that contain at least one
/// letter, so pure numbers ("2025") survive untouched. Stable under
/// re-application: mapped digits become letters, unmapped characters never
/// change.
fn map_leet(text: &str) -> String {
    text.split(' ')
        .map(|token| {
            if token.chars().any(|c| c.is_alphabetic()) {
                token.chars().map(leet_char).collect::<String>()
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn leet_char(c: char) -> char {
    match c {
        '0' => 'o',
        '1' => 'i',
        '3' => 'e',
        '4' => 'a',
        '5' => 's',
        '7' => 't',
        '8' => 'b',
        '@' => 'a',
        '$' => 's',
        _ => c,
    }
}

/// Collapses any run of 3+ identical characters to a single occurrence
/// ("chetttt" -> "chet"). Doubles are kept; Vietnamese never triples a letter.
fn collapse_repeats(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut j = i + 1;
        while j < chars.len() && chars[j] == c {
            j += 1;
        }
        let run = j - i;
        if run >= 3 {
            out.push(c);
        } else {
            for _ in 0..run {
                out.push(c);
            }
        }
        i = j;
    }
    out
}
