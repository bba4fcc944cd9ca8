use crate::error::{EngineError, Result};
use crate::index::{DocId, InvertedIndex};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Vocabulary terms scanned between two deadline/cancellation checks.
const CHECK_EVERY: usize = 256;

/// Cost ceiling for one pattern query. Compilation is bounded by the program
/// and DFA size limits, the vocabulary scan by `timeout_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternBudget {
    pub timeout_ms: u64,
    pub size_limit: usize,
    pub dfa_size_limit: usize,
    pub case_insensitive: bool,
}

impl Default for PatternBudget {
    fn default() -> Self {
        Self { timeout_ms: 2_000, size_limit: 2 << 20, dfa_size_limit: 2 << 20, case_insensitive: true }
    }
}

/// Shared flag used to abort one in-flight query.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }

    pub fn cancel(&self) { self.0.store(true, Ordering::Relaxed) }

    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Relaxed) }
}

/// Time budget and cancel flag shared by every step of one pattern query,
/// from the vocabulary scan through ranking.
#[derive(Debug, Clone)]
pub struct QueryDeadline {
    pattern: String,
    started: Instant,
    until: Instant,
    cancel: CancelToken,
}

impl QueryDeadline {
    pub fn new(pattern: &str, timeout: Duration, cancel: &CancelToken) -> Self {
        let started = Instant::now();
        Self { pattern: pattern.to_string(), started, until: started + timeout, cancel: cancel.clone() }
    }

    pub fn expired(&self) -> bool { self.cancel.is_cancelled() || Instant::now() >= self.until }

    pub fn elapsed_ms(&self) -> u64 { self.started.elapsed().as_millis() as u64 }

    pub fn timeout_error(&self) -> EngineError {
        EngineError::PatternTimeout { pattern: self.pattern.clone(), elapsed_ms: self.elapsed_ms() }
    }

    pub fn check(&self) -> Result<()> {
        if self.expired() {
            return Err(self.timeout_error());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternMatch {
    /// Matching vocabulary terms, sorted.
    pub terms: Vec<String>,
    /// Union of the postings of `terms`, sorted by id.
    pub docs: Vec<DocId>,
}

/// A compiled pattern evaluated against the vocabulary rather than raw texts.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    pattern: String,
    regex: Regex,
    timeout: Duration,
}

impl PatternMatcher {
    pub fn compile(pattern: &str, budget: &PatternBudget) -> Result<Self> {
        let started = Instant::now();
        let built = RegexBuilder::new(pattern)
            .case_insensitive(budget.case_insensitive)
            .size_limit(budget.size_limit)
            .dfa_size_limit(budget.dfa_size_limit)
            .build();
        match built {
            Ok(regex) => Ok(Self {
                pattern: pattern.to_string(),
                regex,
                timeout: Duration::from_millis(budget.timeout_ms),
            }),
            Err(regex::Error::CompiledTooBig(limit)) => {
                tracing::debug!(pattern, limit, "pattern exceeds compiled size limit");
                Err(EngineError::PatternTimeout {
                    pattern: pattern.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => Err(EngineError::InvalidPattern { pattern: pattern.to_string(), reason: e.to_string() }),
        }
    }

    pub fn pattern(&self) -> &str { &self.pattern }

    /// Starts this pattern's time budget.
    pub fn deadline(&self, cancel: &CancelToken) -> QueryDeadline {
        QueryDeadline::new(&self.pattern, self.timeout, cancel)
    }

    /// Terms matching anywhere (anchors apply), sorted. Fails with
    /// `PatternTimeout` once the time budget is spent or `cancel` fires.
    pub fn matching_terms<'a, I>(&self, vocabulary: I, cancel: &CancelToken) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.matching_terms_within(vocabulary, &self.deadline(cancel))
    }

    pub fn matching_terms_within<'a, I>(&self, vocabulary: I, deadline: &QueryDeadline) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = Vec::new();
        for (i, term) in vocabulary.into_iter().enumerate() {
            if i % CHECK_EVERY == 0 {
                deadline.check()?;
            }
            if self.regex.is_match(term) {
                out.push(term.to_string());
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    pub fn search(&self, index: &InvertedIndex, cancel: &CancelToken) -> Result<PatternMatch> {
        self.search_within(index, &self.deadline(cancel))
    }

    pub fn search_within(&self, index: &InvertedIndex, deadline: &QueryDeadline) -> Result<PatternMatch> {
        let terms = self.matching_terms_within(index.vocabulary(), deadline)?;
        deadline.check()?;
        let docs = index.search_any(&terms);
        Ok(PatternMatch { terms, docs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vec<&'static str> { vec!["quick", "question", "slow", "quiet"] }

    #[test]
    fn prefix_pattern_over_vocabulary() {
        let m = PatternMatcher::compile("^qu.*", &PatternBudget::default()).unwrap();
        let terms = m.matching_terms(vocab(), &CancelToken::new()).unwrap();
        assert_eq!(terms, vec!["question", "quick", "quiet"]);
    }

    #[test]
    fn full_syntax_is_supported() {
        let m = PatternMatcher::compile(r"^(sl|qui)[a-z]{1,2}(w|t)$", &PatternBudget::default()).unwrap();
        let terms = m.matching_terms(vocab(), &CancelToken::new()).unwrap();
        assert_eq!(terms, vec!["quiet", "slow"]);
    }

    #[test]
    fn case_insensitive_by_default() {
        let m = PatternMatcher::compile("^QUI", &PatternBudget::default()).unwrap();
        assert_eq!(m.matching_terms(vocab(), &CancelToken::new()).unwrap(), vec!["quick", "quiet"]);
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let m = PatternMatcher::compile("^zz", &PatternBudget::default()).unwrap();
        assert!(m.matching_terms(vocab(), &CancelToken::new()).unwrap().is_empty());
    }

    #[test]
    fn malformed_pattern_is_invalid() {
        let err = PatternMatcher::compile("(unclosed", &PatternBudget::default()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPattern { .. }));
    }

    #[test]
    fn oversized_program_hits_the_ceiling() {
        let budget = PatternBudget { size_limit: 1 << 16, ..PatternBudget::default() };
        let err = PatternMatcher::compile(r"((\w+)*\s*){500}", &budget).unwrap_err();
        assert!(matches!(err, EngineError::PatternTimeout { .. }));
    }

    #[test]
    fn exhausted_time_budget_times_out() {
        let big: Vec<String> = (0..100_000).map(|i| format!("term{i}")).collect();
        let budget = PatternBudget { timeout_ms: 0, ..PatternBudget::default() };
        let m = PatternMatcher::compile(r"^(a+)+$", &budget).unwrap();
        let err = m.matching_terms(big.iter().map(String::as_str), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, EngineError::PatternTimeout { ref pattern, .. } if pattern == "^(a+)+$"));
    }

    #[test]
    fn cancelled_scan_stops() {
        let token = CancelToken::new();
        token.cancel();
        let m = PatternMatcher::compile("^qu", &PatternBudget::default()).unwrap();
        assert!(matches!(m.matching_terms(vocab(), &token), Err(EngineError::PatternTimeout { .. })));
    }

    #[test]
    fn deadline_reports_the_pattern() {
        let token = CancelToken::new();
        let m = PatternMatcher::compile("^qu", &PatternBudget::default()).unwrap();
        let deadline = m.deadline(&token);
        deadline.check().unwrap();
        token.cancel();
        assert!(deadline.expired());
        let err = deadline.check().unwrap_err();
        assert!(matches!(err, EngineError::PatternTimeout { ref pattern, .. } if pattern == "^qu"));
    }
}
