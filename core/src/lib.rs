pub mod config;
pub mod error;
pub mod graph;
pub mod index;
pub mod pattern;
pub mod persist;
pub mod pool;
pub mod rank;
pub mod service;
pub mod tokenizer;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use graph::{CandidateStrategy, Edge, GraphConfig, Neighbor, SimilarityGraph};
pub use index::{build_index, BuildReport, CorpusDoc, DocId, Document, IndexBuilder, InvertedIndex, Posting, TermId};
pub use pattern::{CancelToken, PatternBudget, PatternMatcher, QueryDeadline};
pub use pool::{PoolConfig, QueryPool};
pub use rank::{MatchMode, RankingConfig, RankingStrategy, ScoredDoc};
pub use service::{
    DocumentInfo, QueryKind, QueryService, SearchHit, SearchRequest, SearchResponse, Stats, Suggestion, SuggestionResponse,
};
