use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    static ref STOPWORDS: HashSet<&'static str> = {
        let words: &[&str] = &[
            "a","about","an","and","as","at","be","been","being","but","by",
            "could","did","do","does","for","from","had","has","have","if","in","is","it",
            "of","on","or","out","should","the","to","up","will","would",
            // French, the corpus mixes both languages
            "au","aux","avec","chez","dans","de","depuis","des","donc","du","en","entre",
            "et","jusqu","la","le","les","mais","ou","par","pour","sans","sous","sur","un","une","vers",
        ];
        words.iter().copied().collect()
    };
}

fn is_stopword(token: &str) -> bool { STOPWORDS.contains(token) }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Terms shorter than this many characters are dropped.
    pub min_term_len: usize,
    pub drop_stopwords: bool,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self { min_term_len: 1, drop_stopwords: false }
    }
}

/// Turns raw text into index terms: accent folding (NFKD without combining
/// marks), lowercase, whitespace split, non-alphanumeric boundary characters
/// trimmed. No stemming.
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    config: TokenizerConfig,
}

impl Tokenizer {
    pub fn new(config: TokenizerConfig) -> Self { Self { config } }

    pub fn config(&self) -> &TokenizerConfig { &self.config }

    /// Lazily yields the normalized terms of `text` in original order.
    pub fn terms<'a>(&'a self, text: &'a str) -> impl Iterator<Item = String> + 'a {
        text.split_whitespace().filter_map(move |raw| self.normalize(raw))
    }

    /// Normalizes one whitespace-delimited token, `None` if nothing survives.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let folded = fold(raw);
        let trimmed = folded.trim_matches(|c: char| !c.is_alphanumeric());
        if trimmed.is_empty() || trimmed.chars().count() < self.config.min_term_len {
            return None;
        }
        if self.config.drop_stopwords && is_stopword(trimmed) {
            return None;
        }
        Some(trimmed.to_string())
    }
}

fn fold(raw: &str) -> String {
    raw.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Tokenize with the default configuration.
pub fn tokenize(text: &str) -> Vec<String> {
    Tokenizer::default().terms(text).collect()
}
