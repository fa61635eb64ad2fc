use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

/// Keyword/regex admission rule for one source, as written in the config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterRule {
    #[serde(default)]
    pub block_keywords: Vec<String>,
    #[serde(default)]
    pub block_regex: Vec<String>,
    #[serde(default)]
    pub allow_keywords: Vec<String>,
    #[serde(default)]
    pub allow_regex: Vec<String>,
    /// Only admit text that hits at least one allow term.
    #[serde(default)]
    pub require_allow: bool,
}

/// A [`FilterRule`] with its patterns compiled once.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    block_keywords: Vec<String>,
    block_regex: Vec<Regex>,
    allow_keywords: Vec<String>,
    allow_regex: Vec<Regex>,
    require_allow: bool,
}

impl CompiledRule {
    /// Invalid patterns are logged and skipped rather than failing the rule.
    pub fn compile(rule: &FilterRule) -> Self {
        Self {
            block_keywords: non_empty(&rule.block_keywords),
            block_regex: compile_all(&rule.block_regex),
            allow_keywords: non_empty(&rule.allow_keywords),
            allow_regex: compile_all(&rule.allow_regex),
            require_allow: rule.require_allow,
        }
    }

    fn blocks(&self, text: &str) -> bool {
        self.block_keywords.iter().any(|k| text.contains(k.as_str()))
            || self.block_regex.iter().any(|r| r.is_match(text))
    }

    fn has_allow_terms(&self) -> bool {
        !self.allow_keywords.is_empty() || !self.allow_regex.is_empty()
    }

    fn allows(&self, text: &str) -> bool {
        self.allow_keywords.iter().any(|k| text.contains(k.as_str()))
            || self.allow_regex.iter().any(|r| r.is_match(text))
    }
}

fn non_empty(terms: &[String]) -> Vec<String> {
    terms.iter().filter(|t| !t.is_empty()).cloned().collect()
}

fn compile_all(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Skipping invalid filter regex {:?}: {}", p, e);
                None
            }
        })
        .collect()
}

/// Decide whether `text` may be forwarded.
///
/// Block terms win over everything. With `require_allow` the text must also
/// hit an allow term, unless no allow terms exist at all.
pub fn admit(text: &str, rule: Option<&CompiledRule>) -> bool {
    let Some(rule) = rule else {
        return true;
    };
    if rule.blocks(text) {
        return false;
    }
    if rule.require_allow && rule.has_allow_terms() {
        return rule.allows(text);
    }
    true
}

/// Map a configured gray ratio onto a probability in `[0, 1]`.
///
/// Values above 1 are read as percentages.
pub fn normalize_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() || ratio <= 0.0 {
        0.0
    } else if ratio > 1.0 {
        (ratio / 100.0).min(1.0)
    } else {
        ratio
    }
}

/// One random draw against the gray ratio.
pub fn sample(ratio: f64) -> bool {
    sample_with(ratio, rand::rng().random::<f64>())
}

/// `draw` is uniform in `[0, 1)`.
pub fn sample_with(ratio: f64, draw: f64) -> bool {
    let p = normalize_ratio(ratio);
    p > 0.0 && draw < p
}
