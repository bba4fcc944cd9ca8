//! Query façade over the shared read-only index and graph.
//!
//! Each request moves through `Received -> Resolved -> Ranked -> Returned`;
//! a malformed query or invalid pattern fails before resolution, a pattern
//! that exhausts its budget fails while resolving or ranking. Requests share nothing
//! mutable, so any number can run at once.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::SimilarityGraph;
use crate::index::{DocId, InvertedIndex};
use crate::pattern::{CancelToken, PatternBudget, PatternMatcher, QueryDeadline};
use crate::rank::{MatchMode, Ranker, RankingStrategy, ScoredDoc};
use crate::tokenizer::Tokenizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    /// Top hits whose neighbours seed query suggestions.
    pub suggestion_seeds: usize,
    /// Matched vocabulary terms echoed back for a pattern query.
    pub max_matched_terms: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self { Self { default_limit: 10, max_limit: 100, suggestion_seeds: 3, max_matched_terms: 20 } }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_limit == 0 || self.max_limit < self.default_limit {
            return Err(EngineError::Config(format!(
                "need 0 < default_limit ({}) <= max_limit ({})",
                self.default_limit, self.max_limit
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    #[default]
    Keyword,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub text: String,
    #[serde(default)]
    pub kind: QueryKind,
    #[serde(default)]
    pub strategy: RankingStrategy,
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn keyword(text: impl Into<String>) -> Self {
        Self { text: text.into(), kind: QueryKind::Keyword, strategy: RankingStrategy::default(), mode: MatchMode::default(), limit: None }
    }

    pub fn pattern(text: impl Into<String>) -> Self {
        Self { kind: QueryKind::Pattern, mode: MatchMode::Any, ..Self::keyword(text) }
    }

    pub fn with_strategy(mut self, strategy: RankingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub doc_id: DocId,
    pub key: String,
    pub title: String,
    pub score: f64,
    pub relevance: f64,
    pub centrality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub kind: QueryKind,
    pub strategy: RankingStrategy,
    pub total_hits: usize,
    pub matched_terms: Vec<String>,
    pub hits: Vec<SearchHit>,
    pub took_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub doc_id: DocId,
    pub key: String,
    pub title: String,
    pub centrality: f64,
    /// Edge weight to the reference document (the best hit for query
    /// suggestions), 0 when not adjacent.
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestionResponse {
    pub query: String,
    pub seeds: Vec<SearchHit>,
    pub suggestions: Vec<Suggestion>,
    /// Candidates before truncation.
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentInfo {
    pub doc_id: DocId,
    pub key: String,
    pub title: String,
    pub total_terms: u32,
    pub distinct_terms: usize,
    pub byte_len: u64,
    pub centrality: f64,
    pub degree: usize,
    pub in_graph: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub document_count: usize,
    pub term_count: usize,
    pub posting_count: usize,
    pub node_count: usize,
    pub edge_count: usize,
    pub density: f64,
    pub average_degree: f64,
    pub min_weight: f64,
    pub pagerank_iterations: usize,
    pub top_central: Vec<(DocId, f64)>,
}

enum Query {
    Terms { terms: Vec<String>, mode: MatchMode },
    Pattern(PatternMatcher),
}

struct Resolved {
    candidates: Vec<DocId>,
    /// Vocabulary terms the query touched; these drive relevance scoring.
    terms: Vec<String>,
    /// Pattern queries keep their budget running through ranking.
    deadline: Option<QueryDeadline>,
}

enum RequestState {
    Received(Query),
    Resolved(Resolved),
    Ranked { terms: Vec<String>, ranked: Vec<ScoredDoc> },
    Returned(SearchResponse),
}

impl RequestState {
    fn name(&self) -> &'static str {
        match self {
            RequestState::Received(_) => "received",
            RequestState::Resolved(_) => "resolved",
            RequestState::Ranked { .. } => "ranked",
            RequestState::Returned(_) => "returned",
        }
    }
}

pub struct QueryService {
    index: Arc<InvertedIndex>,
    graph: Arc<SimilarityGraph>,
    ranker: Ranker,
    tokenizer: Tokenizer,
    budget: PatternBudget,
    config: ServiceConfig,
}

impl QueryService {
    /// Fails with `GraphBuild` when the graph does not describe the index's documents.
    pub fn new(index: Arc<InvertedIndex>, graph: Arc<SimilarityGraph>, config: &EngineConfig) -> Result<Self> {
        config.service.validate()?;
        graph.validate_against(&index)?;
        let ranker = Ranker::new(&graph, config.ranking.clone())?;
        Ok(Self {
            index,
            graph,
            ranker,
            tokenizer: Tokenizer::new(config.tokenizer.clone()),
            budget: config.pattern.clone(),
            config: config.service.clone(),
        })
    }

    pub fn index(&self) -> &InvertedIndex { &self.index }

    pub fn graph(&self) -> &SimilarityGraph { &self.graph }

    pub fn ranker(&self) -> &Ranker { &self.ranker }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.search_with_cancel(request, &CancelToken::new())
    }

    pub fn search_with_cancel(&self, request: &SearchRequest, cancel: &CancelToken) -> Result<SearchResponse> {
        let started = Instant::now();
        let mut state = match self.parse(request) {
            Ok(query) => RequestState::Received(query),
            Err(e) => {
                tracing::debug!(query = %request.text, from = "received", error = %e, "query failed");
                return Err(e);
            }
        };
        loop {
            let from = state.name();
            state = match state {
                RequestState::Received(query) => match self.resolve(query, cancel) {
                    Ok(resolved) => RequestState::Resolved(resolved),
                    Err(e) => {
                        tracing::debug!(query = %request.text, from, error = %e, "query failed");
                        return Err(e);
                    }
                },
                RequestState::Resolved(Resolved { candidates, terms, deadline }) => {
                    let interrupted = || deadline.as_ref().is_some_and(QueryDeadline::expired);
                    match self.ranker.rank_until(&self.index, &candidates, &terms, request.strategy, &interrupted) {
                        Some(ranked) => RequestState::Ranked { terms, ranked },
                        None => {
                            let e = match &deadline {
                                Some(d) => d.timeout_error(),
                                None => EngineError::PatternTimeout { pattern: request.text.clone(), elapsed_ms: 0 },
                            };
                            tracing::debug!(query = %request.text, from, candidates = candidates.len(), error = %e, "query failed");
                            return Err(e);
                        }
                    }
                }
                RequestState::Ranked { terms, ranked } => {
                    RequestState::Returned(self.respond(request, terms, ranked, started))
                }
                RequestState::Returned(response) => return Ok(response),
            };
            tracing::debug!(query = %request.text, from, to = state.name(), "query transition");
        }
    }

    fn parse(&self, request: &SearchRequest) -> Result<Query> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(EngineError::MalformedQuery { query: request.text.clone(), reason: "empty query".into() });
        }
        match request.kind {
            QueryKind::Keyword => {
                let terms: Vec<String> = self.tokenizer.terms(text).collect();
                if terms.is_empty() {
                    return Err(EngineError::MalformedQuery {
                        query: request.text.clone(),
                        reason: "no searchable terms after normalization".into(),
                    });
                }
                Ok(Query::Terms { terms, mode: request.mode })
            }
            QueryKind::Pattern => Ok(Query::Pattern(PatternMatcher::compile(text, &self.budget)?)),
        }
    }

    fn resolve(&self, query: Query, cancel: &CancelToken) -> Result<Resolved> {
        match query {
            Query::Terms { terms, mode } => {
                let candidates = match mode {
                    MatchMode::All => self.index.search_all(&terms),
                    MatchMode::Any => self.index.search_any(&terms),
                };
                let known: BTreeSet<String> = terms.into_iter().filter(|t| self.index.term_id(t).is_some()).collect();
                Ok(Resolved { candidates, terms: known.into_iter().collect(), deadline: None })
            }
            Query::Pattern(matcher) => {
                let deadline = matcher.deadline(cancel);
                let matched = matcher.search_within(&self.index, &deadline)?;
                Ok(Resolved { candidates: matched.docs, terms: matched.terms, deadline: Some(deadline) })
            }
        }
    }

    fn respond(&self, request: &SearchRequest, mut terms: Vec<String>, ranked: Vec<ScoredDoc>, started: Instant) -> SearchResponse {
        let limit = request.limit.unwrap_or(self.config.default_limit).clamp(1, self.config.max_limit);
        let total_hits = ranked.len();
        let hits = ranked.into_iter().take(limit).map(|s| self.hit(s)).collect();
        if request.kind == QueryKind::Pattern {
            terms.truncate(self.config.max_matched_terms);
        }
        SearchResponse {
            query: request.text.clone(),
            kind: request.kind,
            strategy: request.strategy,
            total_hits,
            matched_terms: terms,
            hits,
            took_s: started.elapsed().as_secs_f64(),
        }
    }

    fn hit(&self, s: ScoredDoc) -> SearchHit {
        let (key, title) = self
            .index
            .document(s.doc_id)
            .map(|d| (d.key.clone(), d.title.clone()))
            .unwrap_or_default();
        SearchHit { doc_id: s.doc_id, key, title, score: s.score, relevance: s.relevance, centrality: s.centrality }
    }

    /// The `n` documents most similar to `doc`; empty for unknown documents.
    pub fn suggest(&self, doc: DocId, n: usize) -> Vec<DocId> { self.graph.suggest(doc, n) }

    /// Neighbours of the best hybrid hits for `text`, minus those hits,
    /// ordered by centrality then id.
    pub fn suggest_for_query(&self, text: &str, n: usize) -> Result<SuggestionResponse> {
        let request = SearchRequest::keyword(text).with_strategy(RankingStrategy::Hybrid).with_limit(self.config.suggestion_seeds);
        let found = self.search(&request)?;
        let seeds = found.hits;
        let seed_ids: BTreeSet<DocId> = seeds.iter().map(|h| h.doc_id).collect();

        let mut pool: BTreeSet<DocId> = BTreeSet::new();
        for seed in &seeds {
            pool.extend(self.graph.neighbors(seed.doc_id).iter().map(|nb| nb.doc_id));
        }
        let mut ordered: Vec<DocId> = pool.difference(&seed_ids).copied().collect();
        ordered.sort_by(|a, b| self.ranker.centrality(*b).total_cmp(&self.ranker.centrality(*a)).then(a.cmp(b)));
        let total = ordered.len();

        let top = seeds.first().map(|h| h.doc_id);
        let suggestions = ordered.into_iter().take(n).map(|id| self.suggestion(id, top)).collect();
        Ok(SuggestionResponse { query: text.to_string(), seeds, suggestions, total })
    }

    /// Like [`suggest`](Self::suggest) with titles and weights; `None` for unknown documents.
    pub fn similar(&self, doc: DocId, n: usize) -> Option<Vec<Suggestion>> {
        if !self.index.contains_doc(doc) {
            return None;
        }
        Some(self.graph.suggest(doc, n).into_iter().map(|id| self.suggestion(id, Some(doc))).collect())
    }

    fn suggestion(&self, id: DocId, reference: Option<DocId>) -> Suggestion {
        let (key, title) = self.index.document(id).map(|d| (d.key.clone(), d.title.clone())).unwrap_or_default();
        Suggestion {
            doc_id: id,
            key,
            title,
            centrality: self.ranker.centrality(id),
            similarity: reference.and_then(|r| self.graph.weight(r, id)).unwrap_or(0.0),
        }
    }

    pub fn document_info(&self, id: DocId) -> Option<DocumentInfo> {
        let d = self.index.document(id)?;
        Some(DocumentInfo {
            doc_id: id,
            key: d.key.clone(),
            title: d.title.clone(),
            total_terms: d.total_terms,
            distinct_terms: d.distinct_terms(),
            byte_len: d.byte_len,
            centrality: self.ranker.centrality(id),
            degree: self.graph.degree(id),
            in_graph: self.graph.contains(id),
        })
    }

    pub fn document_by_key(&self, key: &str) -> Option<DocumentInfo> {
        self.index.doc_id_for_key(key).and_then(|id| self.document_info(id))
    }

    pub fn stats(&self) -> Stats {
        Stats {
            document_count: self.index.num_docs(),
            term_count: self.index.num_terms(),
            posting_count: self.index.num_postings(),
            node_count: self.graph.node_count(),
            edge_count: self.graph.edge_count(),
            density: self.graph.density(),
            average_degree: self.graph.average_degree(),
            min_weight: self.graph.min_weight(),
            pagerank_iterations: self.ranker.pagerank_iterations(),
            top_central: self.ranker.top_central(10),
        }
    }
}
