use std::borrow::Cow;

use indexmap::IndexMap;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::rubric::{Dimension, Rubric};

/// Score used for any dimension whose label cannot be found in the text.
pub const DEFAULT_SCORE: f64 = 7.0;

/// How far (in non-digit characters on the same line) a score may sit from
/// its label.
const LABEL_WINDOW: usize = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub scores: IndexMap<String, f64>,
    pub average_score: f64,
}

impl ScoreCard {
    pub fn from_scores(scores: IndexMap<String, f64>) -> Self {
        let average_score = if scores.is_empty() {
            0.0
        } else {
            round1(scores.values().sum::<f64>() / scores.len() as f64)
        };
        Self {
            scores,
            average_score,
        }
    }
}

/// Body of the synchronous analyze response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CritiqueReport {
    pub scores: IndexMap<String, f64>,
    pub average_score: f64,
    pub critique: String,
}

impl CritiqueReport {
    pub fn new(card: ScoreCard, critique: String) -> Self {
        Self {
            scores: card.scores,
            average_score: card.average_score,
            critique,
        }
    }
}

/// Turns a finished critique into per-dimension scores.
pub trait ScoreParser: Send + Sync {
    fn parse(&self, text: &str, rubric: &Rubric) -> ScoreCard;
}

/// Finds each dimension label followed on the same line by a decimal number.
#[derive(Debug, Clone)]
pub struct LabeledScoreParser {
    default_score: f64,
}

impl Default for LabeledScoreParser {
    fn default() -> Self {
        Self {
            default_score: DEFAULT_SCORE,
        }
    }
}

impl LabeledScoreParser {
    pub fn with_default(default_score: f64) -> Self {
        Self { default_score }
    }

    fn find_score(&self, text: &str, dim: &Dimension) -> Option<f64> {
        let cached = BUILTIN_PATTERNS
            .iter()
            .find(|(known, _)| {
                known.key == dim.key && known.label == dim.label && known.aliases == dim.aliases
            })
            .map(|(_, re)| re);
        let compiled;
        let re = match cached {
            Some(re) => re,
            None => {
                compiled = pattern_for(dim)?;
                &compiled
            }
        };
        let captures = re.captures(text)?;
        let value: f64 = captures.get(1)?.as_str().parse().ok()?;
        Some(value.clamp(dim.min, dim.max))
    }
}

/// Compiled once for every built-in dimension; other dimensions compile on
/// demand.
static BUILTIN_PATTERNS: Lazy<Vec<(Dimension, Regex)>> = Lazy::new(|| {
    Rubric::strict()
        .dimensions
        .into_iter()
        .filter_map(|dim| {
            let re = pattern_for(&dim)?;
            Some((dim, re))
        })
        .collect()
});

/// Label or alias, then at most `LABEL_WINDOW` non-digit characters on the
/// same line, then an ASCII decimal. ASCII aliases must be whole words.
fn pattern_for(dim: &Dimension) -> Option<Regex> {
    let labels = std::iter::once(dim.label)
        .chain(dim.aliases.iter().copied())
        .map(|label| {
            let escaped = regex::escape(label);
            if label.is_ascii() {
                format!(r"\b{escaped}\b")
            } else {
                escaped
            }
        })
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!(r"(?i)(?:{labels})[^0-9\n]{{0,{LABEL_WINDOW}}}?([0-9]+(?:\.[0-9]+)?)");
    Regex::new(&pattern).ok()
}

/// Full-width digits and decimal point to ASCII.
fn normalize_digits(text: &str) -> Cow<'_, str> {
    if !text.chars().any(|c| ('０'..='９').contains(&c) || c == '．') {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        text.chars()
            .map(|c| match c {
                '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
                '．' => '.',
                _ => c,
            })
            .collect(),
    )
}

impl ScoreParser for LabeledScoreParser {
    fn parse(&self, text: &str, rubric: &Rubric) -> ScoreCard {
        let text = normalize_digits(text);
        let mut scores = IndexMap::with_capacity(rubric.dimensions.len());
        for dim in &rubric.dimensions {
            let score = match self.find_score(&text, dim) {
                Some(score) => score,
                None => {
                    debug!("No score found for '{}', using {}", dim.label, self.default_score);
                    self.default_score
                }
            };
            scores.insert(dim.key.to_string(), score);
        }
        ScoreCard::from_scores(scores)
    }
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
