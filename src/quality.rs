//! Content quality scoring for cleaned message bodies.
//!
//! Scoring is pure and deterministic: the same text always yields the same
//! [`QualityScore`]. All component scores are density-based so that a short
//! promotional blast and a long newsletter are judged on the same footing.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;

use crate::models::QualityScore;

/// Bodies shorter than this (after trimming) get the zero score outright.
const MIN_SCOREABLE_CHARS: usize = 10;

/// Component weights for the overall score.
const W_CONTENT: f64 = 0.4;
const W_MARKETING: f64 = 0.25;
const W_TEMPLATE: f64 = 0.15;
const W_READABILITY: f64 = 0.15;
const W_LANGUAGE: f64 = 0.05;

pub struct QualityScorer {
    marketing: Vec<Regex>,
    template: Vec<Regex>,
    signature: Vec<Regex>,
    entity: Regex,
    function_words: HashSet<&'static str>,
}

impl QualityScorer {
    pub fn new() -> Result<Self> {
        let ci = |pattern: &str| -> Result<Regex> {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("Failed to compile quality pattern: {pattern}"))
        };

        let marketing = [
            r"\bshop\s+now\b",
            r"\bbuy\s+now\b",
            r"\border\s+now\b",
            r"\bact\s+now\b",
            r"\b\d{1,3}\s*%\s*off\b",
            r"\blimited\s+time\b",
            r"\bfree\s+shipping\b",
            r"\bclick\s+here\b",
            r"\bexclusive\s+(?:deal|offer)s?\b",
            r"\bsale\s+ends\b",
            r"\bdiscount\s+code\b",
            r"\b(?:promo|coupon)\s+code\b",
            r"\bdon'?t\s+miss\b",
            r"\bflash\s+sale\b",
            r"\bunsubscribe\b",
        ]
        .iter()
        .map(|p| ci(p))
        .collect::<Result<Vec<_>>>()?;

        let template = [
            r"\bdear\s+(?:valued\s+)?(?:customer|member|user|subscriber)\b",
            r"\bthis\s+is\s+an?\s+automated\s+(?:message|email|notification)\b",
            r"\bdo\s+not\s+reply\s+to\s+this\s+(?:email|message)\b",
            r"\byour\s+(?:order|account|subscription)\s+(?:number|id)\b",
            r"\bplease\s+find\s+attached\b",
            r"\bif\s+you\s+have\s+any\s+questions?,?\s+please\s+contact\b",
        ]
        .iter()
        .map(|p| ci(p))
        .collect::<Result<Vec<_>>>()?;

        let signature = [
            r"\bsent\s+from\s+my\s+\w+",
            r"\bbest\s+regards\b",
            r"\bkind\s+regards\b",
            r"\bconfidentiality\s+notice\b",
            r"\bthis\s+email\s+(?:and\s+any\s+attachments\s+)?(?:is|are)\s+confidential\b",
        ]
        .iter()
        .map(|p| ci(p))
        .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            marketing,
            template,
            signature,
            entity: Regex::new(r"&(?:[a-zA-Z]{2,8}|#\d{1,5});")
                .context("Failed to compile entity pattern")?,
            function_words: FUNCTION_WORDS.iter().copied().collect(),
        })
    }

    /// Scores cleaned body text. Never fails.
    pub fn score(&self, text: &str) -> QualityScore {
        let text = text.trim();
        if text.chars().count() < MIN_SCOREABLE_CHARS {
            return QualityScore::zero("empty or too short content");
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        let word_count = words.len();
        // Densities are hits per ten words, with a floor of one so short
        // texts are not divided into oblivion.
        let basis = (word_count as f64 / 10.0).max(1.0);

        let marketing_hits = count_hits(&self.marketing, text);
        let template_hits = count_hits(&self.template, text);
        let signature_hits = count_hits(&self.signature, text);
        let entity_hits = self.entity.find_iter(text).count() as f64;

        let marketing_density = marketing_hits / basis;
        let marketing = (marketing_density * 25.0).min(100.0);
        let template = (template_hits * 25.0).min(100.0);

        let noise = (25.0 * marketing_density
            + 15.0 * template_hits / basis
            + 15.0 * signature_hits / basis
            + 5.0 * entity_hits / basis)
            .min(100.0);
        let content_ratio = ((100.0 - noise) / 100.0).max(0.0);

        let readability = readability_score(text, &words);
        let language_confidence = self.language_confidence(&words, basis);

        let overall = (content_ratio * W_CONTENT
            + (100.0 - marketing) / 100.0 * W_MARKETING
            + (100.0 - template) / 100.0 * W_TEMPLATE
            + readability / 100.0 * W_READABILITY
            + language_confidence / 100.0 * W_LANGUAGE)
            * 100.0;

        let mut issues = Vec::new();
        if marketing > 50.0 {
            issues.push("high marketing content".to_string());
        }
        if template > 50.0 {
            issues.push("template-like content".to_string());
        }
        if readability < 40.0 {
            issues.push("low readability".to_string());
        }
        if language_confidence < 30.0 {
            issues.push("low language confidence".to_string());
        }
        if content_ratio < 0.3 {
            issues.push("mostly noise".to_string());
        }

        QualityScore {
            overall: overall.clamp(0.0, 100.0),
            content_ratio,
            marketing,
            template,
            readability,
            language_confidence,
            issues,
        }
    }

    fn language_confidence(&self, words: &[&str], basis: f64) -> f64 {
        let hits = words
            .iter()
            .filter(|w| {
                let w = w.trim_matches(|c: char| !c.is_alphanumeric());
                !w.is_empty() && self.function_words.contains(w.to_lowercase().as_str())
            })
            .count() as f64;
        (hits / basis * 100.0).min(100.0)
    }
}

fn count_hits(patterns: &[Regex], text: &str) -> f64 {
    patterns
        .iter()
        .map(|re| re.find_iter(text).count())
        .sum::<usize>() as f64
}

fn readability_score(text: &str, words: &[&str]) -> f64 {
    let sentences: Vec<&str> = text
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .collect();
    if sentences.is_empty() {
        return 0.0;
    }

    let avg_words = words.len() as f64 / sentences.len() as f64;
    let mut score: f64 = if avg_words < 3.0 {
        30.0
    } else if avg_words > 50.0 {
        40.0
    } else {
        80.0
    };

    let unique: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();
    let unique_ratio = unique.len() as f64 / words.len().max(1) as f64;
    if unique_ratio < 0.3 {
        score -= 30.0;
    }

    score.max(0.0)
}

/// English function words used as a cheap language-confidence signal.
const FUNCTION_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "to", "of", "in", "on",
    "at", "for", "with", "and", "or", "but", "if", "then", "that", "this", "these", "those", "it",
    "its", "as", "by", "from", "we", "you", "i", "he", "she", "they", "them", "his", "her", "our",
    "your", "their", "have", "has", "had", "will", "would", "can", "could", "should", "shall",
    "may", "might", "do", "does", "did", "not", "no", "so", "about", "into", "over", "under",
    "after", "before", "between", "through", "out", "up", "down", "there", "here", "what", "which",
    "who", "when", "where", "how", "why", "all", "any", "some", "each", "more", "most", "other",
    "such", "only", "own", "same", "than", "too", "very", "just", "also", "please",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> QualityScorer {
        QualityScorer::new().unwrap()
    }

    #[test]
    fn empty_body_scores_zero_with_issue() {
        let s = scorer();
        for text in ["", "   ", "hi"] {
            let score = s.score(text);
            assert_eq!(score.overall, 0.0);
            assert_eq!(score.issues, vec!["empty or too short content"]);
        }
    }

    #[test]
    fn marketing_blast_scores_low_overall_high_marketing() {
        let s = scorer();
        let score = s.score("SHOP NOW! BUY NOW! 50% OFF! LIMITED TIME ONLY!!!");
        assert!(
            score.marketing > 50.0,
            "marketing was {}",
            score.marketing
        );
        assert!(score.overall < 40.0, "overall was {}", score.overall);
        assert!(score
            .issues
            .iter()
            .any(|i| i.contains("marketing")));
    }

    #[test]
    fn normal_prose_scores_high() {
        let s = scorer();
        let score = s.score(
            "The quarterly report is attached with the revenue breakdown you asked about. \
             Please review the numbers before Friday's meeting and send me your feedback. \
             I think the projections for the second half are conservative.",
        );
        assert!(score.overall > 70.0, "overall was {}", score.overall);
        assert!(score.marketing < 10.0);
        assert!(score.language_confidence > 50.0);
        assert!(score.issues.is_empty());
    }

    #[test]
    fn template_notification_is_flagged() {
        let s = scorer();
        let score = s.score(
            "Dear valued customer, this is an automated message about your order number. \
             Do not reply to this email. If you have any questions, please contact support.",
        );
        assert!(score.template > 50.0, "template was {}", score.template);
        assert!(score.issues.iter().any(|i| i.contains("template")));
    }

    #[test]
    fn repetitive_text_loses_readability() {
        let s = scorer();
        let repeated = "buy buy buy buy buy buy buy buy buy buy buy buy buy buy buy buy now now now now.";
        let score = s.score(repeated);
        assert!(score.readability <= 50.0);
    }

    #[test]
    fn all_components_bounded() {
        let s = scorer();
        let texts = [
            "SHOP NOW! BUY NOW! 50% OFF! unsubscribe unsubscribe click here click here",
            "plain sentence about nothing in particular that reads fine.",
            "&nbsp;&amp;&lt;&gt; &#39; lots of leftover entities here today",
        ];
        for text in texts {
            let score = s.score(text);
            assert!((0.0..=100.0).contains(&score.overall));
            assert!((0.0..=1.0).contains(&score.content_ratio));
            assert!((0.0..=100.0).contains(&score.marketing));
            assert!((0.0..=100.0).contains(&score.template));
            assert!((0.0..=100.0).contains(&score.readability));
            assert!((0.0..=100.0).contains(&score.language_confidence));
        }
    }

    #[test]
    fn deterministic() {
        let s = scorer();
        let text = "Let's sync on the migration plan tomorrow morning before standup.";
        assert_eq!(s.score(text), s.score(text));
    }
}
