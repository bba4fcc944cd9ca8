use crate::error::{EngineError, Result};
use crate::graph::SimilarityGraph;
use crate::index::{DocId, InvertedIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Postings scored between two interruption checks.
const CHECK_EVERY: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategy {
    /// TF-IDF over the query terms.
    Frequency,
    /// Graph centrality of the document, independent of the query.
    Centrality,
    #[default]
    Hybrid,
}

impl FromStr for RankingStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frequency" | "occurrences" | "tfidf" => Ok(Self::Frequency),
            "centrality" | "pagerank" => Ok(Self::Centrality),
            "hybrid" | "" => Ok(Self::Hybrid),
            other => Err(EngineError::InvalidParameter {
                name: "ranking",
                value: other.to_string(),
                reason: "expected frequency, centrality or hybrid".into(),
            }),
        }
    }
}

impl fmt::Display for RankingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Frequency => "frequency",
            Self::Centrality => "centrality",
            Self::Hybrid => "hybrid",
        })
    }
}

/// How keyword candidates are resolved: every term required, or any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

impl FromStr for MatchMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "and" | "" => Ok(Self::All),
            "any" | "or" => Ok(Self::Any),
            other => Err(EngineError::InvalidParameter {
                name: "mode",
                value: other.to_string(),
                reason: "expected all or any".into(),
            }),
        }
    }
}

/// Hybrid score combination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Combine {
    /// `alpha * norm(relevance) + (1 - alpha) * norm(centrality)`, both
    /// min-max normalized over the candidate set.
    Additive { alpha: f64 },
    /// `relevance * (1 + beta * centrality)`.
    Multiplicative { beta: f64 },
}

impl Default for Combine {
    fn default() -> Self { Combine::Additive { alpha: 0.7 } }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentralityKind {
    #[default]
    PageRank,
    WeightedDegree,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageRankParams {
    pub damping: f64,
    pub max_iterations: usize,
    /// Iteration stops once the L1 change drops below `tolerance * n`.
    pub tolerance: f64,
}

impl Default for PageRankParams {
    fn default() -> Self { Self { damping: 0.85, max_iterations: 100, tolerance: 1e-6 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// idf = ln(1 + N/df) when set, ln(N/df) otherwise.
    pub smoothed_idf: bool,
    pub hybrid: Combine,
    pub centrality: CentralityKind,
    pub pagerank: PageRankParams,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            smoothed_idf: true,
            hybrid: Combine::default(),
            centrality: CentralityKind::default(),
            pagerank: PageRankParams::default(),
        }
    }
}

impl RankingConfig {
    pub fn validate(&self) -> Result<()> {
        match self.hybrid {
            Combine::Additive { alpha } if !(0.0..=1.0).contains(&alpha) => {
                return Err(EngineError::Config(format!("hybrid alpha {alpha} outside [0, 1]")));
            }
            Combine::Multiplicative { beta } if !(beta >= 0.0 && beta.is_finite()) => {
                return Err(EngineError::Config(format!("hybrid beta {beta} must be a finite non-negative number")));
            }
            _ => {}
        }
        let p = &self.pagerank;
        if !(0.0..1.0).contains(&p.damping) {
            return Err(EngineError::Config(format!("damping {} outside [0, 1)", p.damping)));
        }
        if p.max_iterations == 0 || !(p.tolerance > 0.0 && p.tolerance.is_finite()) {
            return Err(EngineError::Config("pagerank needs max_iterations > 0 and tolerance > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageRankResult {
    pub scores: BTreeMap<DocId, f64>,
    pub iterations: usize,
    /// L1 change of the last iteration.
    pub delta: f64,
    pub converged: bool,
}

/// Weighted PageRank over the similarity graph. Each undirected edge is
/// followed both ways with probability proportional to its weight; isolated
/// nodes spread their mass uniformly. Scores sum to 1.
pub fn pagerank(graph: &SimilarityGraph, params: &PageRankParams) -> PageRankResult {
    let nodes: Vec<DocId> = graph.nodes().collect();
    let n = nodes.len();
    if n == 0 {
        return PageRankResult { scores: BTreeMap::new(), iterations: 0, delta: 0.0, converged: true };
    }
    let pos: HashMap<DocId, usize> = nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let out_weight: Vec<f64> = nodes.iter().map(|id| graph.weighted_degree(*id)).collect();
    let d = params.damping;
    let nf = n as f64;

    let mut rank = vec![1.0 / nf; n];
    let mut iterations = 0;
    let mut delta = f64::INFINITY;
    let mut converged = false;
    while iterations < params.max_iterations {
        iterations += 1;
        let dangling: f64 = (0..n).filter(|&i| out_weight[i] == 0.0).map(|i| rank[i]).sum();
        let base = (1.0 - d) / nf + d * dangling / nf;
        let mut next = vec![base; n];
        for i in 0..n {
            if out_weight[i] == 0.0 {
                continue;
            }
            let share = d * rank[i] / out_weight[i];
            for nb in graph.neighbors(nodes[i]) {
                if let Some(&j) = pos.get(&nb.doc_id) {
                    next[j] += share * nb.weight;
                }
            }
        }
        delta = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < params.tolerance * nf {
            converged = true;
            break;
        }
    }

    PageRankResult { scores: nodes.into_iter().zip(rank).collect(), iterations, delta, converged }
}

/// Weighted degree, scaled so the scores sum to 1 (uniform when there are no edges).
pub fn weighted_degree_centrality(graph: &SimilarityGraph) -> BTreeMap<DocId, f64> {
    let raw: BTreeMap<DocId, f64> = graph.nodes().map(|id| (id, graph.weighted_degree(id))).collect();
    let total: f64 = raw.values().sum();
    let n = raw.len().max(1) as f64;
    raw.into_iter().map(|(id, w)| (id, if total > 0.0 { w / total } else { 1.0 / n })).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredDoc {
    pub doc_id: DocId,
    pub score: f64,
    /// TF-IDF component.
    pub relevance: f64,
    pub centrality: f64,
}

/// Orders by score descending, then doc id ascending.
pub fn sort_scored(docs: &mut [ScoredDoc]) {
    docs.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

fn normalize(v: f64, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        (v - lo) / (hi - lo)
    } else if hi > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Scores candidates for one query. Centrality is computed once at construction.
#[derive(Debug, Clone)]
pub struct Ranker {
    config: RankingConfig,
    centrality: BTreeMap<DocId, f64>,
    pagerank_iterations: usize,
    pagerank_converged: bool,
}

impl Ranker {
    pub fn new(graph: &SimilarityGraph, config: RankingConfig) -> Result<Self> {
        config.validate()?;
        let (centrality, iterations, converged) = match config.centrality {
            CentralityKind::PageRank => {
                let pr = pagerank(graph, &config.pagerank);
                if !pr.converged {
                    tracing::warn!(iterations = pr.iterations, delta = pr.delta, "pagerank hit the iteration cap");
                }
                tracing::info!(iterations = pr.iterations, delta = pr.delta, "pagerank computed");
                (pr.scores, pr.iterations, pr.converged)
            }
            CentralityKind::WeightedDegree => (weighted_degree_centrality(graph), 0, true),
        };
        Ok(Self { config, centrality, pagerank_iterations: iterations, pagerank_converged: converged })
    }

    pub fn config(&self) -> &RankingConfig { &self.config }

    pub fn pagerank_iterations(&self) -> usize { self.pagerank_iterations }

    pub fn pagerank_converged(&self) -> bool { self.pagerank_converged }

    pub fn centrality(&self, id: DocId) -> f64 { self.centrality.get(&id).copied().unwrap_or(0.0) }

    /// The `n` most central documents, ties by lower id.
    pub fn top_central(&self, n: usize) -> Vec<(DocId, f64)> {
        let mut all: Vec<(DocId, f64)> = self.centrality.iter().map(|(id, c)| (*id, *c)).collect();
        all.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        all.truncate(n);
        all
    }

    pub fn idf(&self, index: &InvertedIndex, term: &str) -> f64 {
        let df = index.doc_freq(term);
        if df == 0 {
            return 0.0;
        }
        let ratio = index.num_docs() as f64 / df as f64;
        if self.config.smoothed_idf { (1.0 + ratio).ln() } else { ratio.ln() }
    }

    /// Sum of tf * idf over the distinct query terms.
    pub fn relevance<S: AsRef<str>>(&self, index: &InvertedIndex, doc: DocId, terms: &[S]) -> f64 {
        self.relevance_scores(index, &[doc], terms, &|| false).and_then(|scores| scores.get(&doc).copied()).unwrap_or(0.0)
    }

    /// Relevance of every candidate, walking each distinct term's postings
    /// once. `None` as soon as `interrupted` fires.
    fn relevance_scores<S, F>(&self, index: &InvertedIndex, candidates: &[DocId], terms: &[S], interrupted: &F) -> Option<HashMap<DocId, f64>>
    where
        S: AsRef<str>,
        F: Fn() -> bool + ?Sized,
    {
        let mut scores: HashMap<DocId, f64> = candidates.iter().map(|&id| (id, 0.0)).collect();
        let unique: BTreeSet<&str> = terms.iter().map(|t| t.as_ref()).collect();
        for term in unique {
            if interrupted() {
                return None;
            }
            let idf = self.idf(index, term);
            for (i, p) in index.postings(term).iter().enumerate() {
                if i % CHECK_EVERY == CHECK_EVERY - 1 && interrupted() {
                    return None;
                }
                if let Some(score) = scores.get_mut(&p.doc_id) {
                    *score += p.tf as f64 * idf;
                }
            }
        }
        Some(scores)
    }

    pub fn rank<S: AsRef<str>>(
        &self,
        index: &InvertedIndex,
        candidates: &[DocId],
        terms: &[S],
        strategy: RankingStrategy,
    ) -> Vec<ScoredDoc> {
        self.rank_until(index, candidates, terms, strategy, &|| false).unwrap_or_default()
    }

    /// Like [`Ranker::rank`], but gives up with `None` once `interrupted`
    /// returns true. Polled per term and every few thousand postings.
    pub fn rank_until<S, F>(
        &self,
        index: &InvertedIndex,
        candidates: &[DocId],
        terms: &[S],
        strategy: RankingStrategy,
        interrupted: &F,
    ) -> Option<Vec<ScoredDoc>>
    where
        S: AsRef<str>,
        F: Fn() -> bool + ?Sized,
    {
        let relevance = self.relevance_scores(index, candidates, terms, interrupted)?;
        let mut scored: Vec<ScoredDoc> = candidates
            .iter()
            .map(|&doc_id| ScoredDoc {
                doc_id,
                score: 0.0,
                relevance: relevance.get(&doc_id).copied().unwrap_or(0.0),
                centrality: self.centrality(doc_id),
            })
            .collect();
        if interrupted() {
            return None;
        }

        match strategy {
            RankingStrategy::Frequency => scored.iter_mut().for_each(|s| s.score = s.relevance),
            RankingStrategy::Centrality => scored.iter_mut().for_each(|s| s.score = s.centrality),
            RankingStrategy::Hybrid => match self.config.hybrid {
                Combine::Additive { alpha } => {
                    let (rlo, rhi) = min_max(scored.iter().map(|s| s.relevance));
                    let (clo, chi) = min_max(scored.iter().map(|s| s.centrality));
                    for s in scored.iter_mut() {
                        s.score = alpha * normalize(s.relevance, rlo, rhi) + (1.0 - alpha) * normalize(s.centrality, clo, chi);
                    }
                }
                Combine::Multiplicative { beta } => {
                    scored.iter_mut().for_each(|s| s.score = s.relevance * (1.0 + beta * s.centrality));
                }
            },
        }
        sort_scored(&mut scored);
        Some(scored)
    }
}
