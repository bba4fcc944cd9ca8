use crate::error::{EngineError, Result};
use crate::index::{DocId, InvertedIndex, TermId};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::time::Instant;

/// Sorted distinct term ids per document.
pub type TermSets = BTreeMap<DocId, Vec<TermId>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub doc_id: DocId,
    pub weight: f64,
}

/// Undirected edge, `a < b`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub a: DocId,
    pub b: DocId,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateStrategy {
    /// Every pair, pruned by the set-size ratio bound.
    AllPairs,
    /// Only pairs sharing at least one term, found through the postings.
    SharedTerms,
    /// LSH banding over MinHash signatures. Recall is approximate, weights exact.
    MinHash { bands: usize, rows: usize, seed: u64 },
}

impl Default for CandidateStrategy {
    fn default() -> Self { CandidateStrategy::SharedTerms }
}

impl CandidateStrategy {
    pub fn generator(&self) -> Result<Box<dyn CandidateGenerator>> {
        Ok(match *self {
            CandidateStrategy::AllPairs => Box::new(AllPairs),
            CandidateStrategy::SharedTerms => Box::new(SharedTerms),
            CandidateStrategy::MinHash { bands, rows, seed } => {
                if bands == 0 || rows == 0 {
                    return Err(EngineError::Config("minhash needs at least one band and one row".into()));
                }
                Box::new(MinHashCandidates { bands, rows, seed })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Edges with a Jaccard weight below this are not stored.
    pub min_weight: f64,
    pub strategy: CandidateStrategy,
}

impl Default for GraphConfig {
    fn default() -> Self { Self { min_weight: 0.1, strategy: CandidateStrategy::default() } }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_weight) {
            return Err(EngineError::Config(format!("min_weight {} outside [0, 1]", self.min_weight)));
        }
        Ok(())
    }
}

/// Jaccard similarity of two sorted, deduplicated term sets.
pub fn jaccard(a: &[TermId], b: &[TermId]) -> f64 {
    let (mut i, mut j, mut inter) = (0, 0, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                inter += 1;
                i += 1;
                j += 1;
            }
        }
    }
    let union = a.len() + b.len() - inter;
    if union == 0 {
        return 0.0;
    }
    inter as f64 / union as f64
}

/// Jaccard can never exceed min(|A|,|B|) / max(|A|,|B|).
fn size_bound_ok(a: usize, b: usize, min_weight: f64) -> bool {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    hi > 0 && (lo as f64 / hi as f64) >= min_weight
}

/// Produces the document pairs the graph builder compares exactly.
pub trait CandidateGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unordered pairs `(a, b)` with `a < b`.
    fn candidates(&self, index: &InvertedIndex, sets: &TermSets, min_weight: f64) -> Vec<(DocId, DocId)>;
}

pub struct AllPairs;

impl CandidateGenerator for AllPairs {
    fn name(&self) -> &'static str { "all_pairs" }

    fn candidates(&self, _index: &InvertedIndex, sets: &TermSets, min_weight: f64) -> Vec<(DocId, DocId)> {
        let docs: Vec<(DocId, usize)> = sets.iter().map(|(id, s)| (*id, s.len())).collect();
        let docs = &docs;
        (0..docs.len())
            .into_par_iter()
            .flat_map_iter(move |i| {
                let (a, a_len) = docs[i];
                docs[i + 1..]
                    .iter()
                    .filter(move |(_, b_len)| size_bound_ok(a_len, *b_len, min_weight))
                    .map(move |(b, _)| (a, *b))
            })
            .collect()
    }
}

pub struct SharedTerms;

impl CandidateGenerator for SharedTerms {
    fn name(&self) -> &'static str { "shared_terms" }

    fn candidates(&self, index: &InvertedIndex, sets: &TermSets, min_weight: f64) -> Vec<(DocId, DocId)> {
        sets.par_iter()
            .flat_map_iter(move |(&a, terms)| {
                let mut others: BTreeSet<DocId> = BTreeSet::new();
                for &t in terms {
                    let list = index.postings_by_id(t);
                    let start = list.partition_point(|p| p.doc_id <= a);
                    others.extend(list[start..].iter().map(|p| p.doc_id));
                }
                let a_len = terms.len();
                others
                    .into_iter()
                    .filter(move |b| size_bound_ok(a_len, sets.get(b).map_or(0, Vec::len), min_weight))
                    .map(move |b| (a, b))
            })
            .collect()
    }
}

const MERSENNE_61: u64 = (1 << 61) - 1;

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

pub struct MinHashCandidates {
    pub bands: usize,
    pub rows: usize,
    pub seed: u64,
}

impl MinHashCandidates {
    /// Probability that a pair with Jaccard similarity `s` never shares a band.
    pub fn miss_probability(&self, s: f64) -> f64 {
        (1.0 - s.powi(self.rows as i32)).powi(self.bands as i32)
    }

    fn coefficients(&self) -> Vec<(u64, u64)> {
        let mut state = self.seed;
        (0..self.bands * self.rows)
            .map(|_| (splitmix64(&mut state) % (MERSENNE_61 - 1) + 1, splitmix64(&mut state) % MERSENNE_61))
            .collect()
    }

    fn signature(coeffs: &[(u64, u64)], terms: &[TermId]) -> Vec<u64> {
        coeffs
            .iter()
            .map(|&(a, b)| {
                terms
                    .iter()
                    .map(|&t| ((a as u128 * t as u128 + b as u128) % MERSENNE_61 as u128) as u64)
                    .min()
                    .unwrap_or(u64::MAX)
            })
            .collect()
    }
}

impl CandidateGenerator for MinHashCandidates {
    fn name(&self) -> &'static str { "minhash" }

    fn candidates(&self, _index: &InvertedIndex, sets: &TermSets, min_weight: f64) -> Vec<(DocId, DocId)> {
        tracing::info!(
            bands = self.bands,
            rows = self.rows,
            miss_probability_at_threshold = self.miss_probability(min_weight),
            "approximate candidate generation enabled"
        );
        let coeffs = self.coefficients();
        let signatures: Vec<(DocId, Vec<u64>)> =
            sets.par_iter().map(|(id, terms)| (*id, Self::signature(&coeffs, terms))).collect();

        let mut buckets: HashMap<(usize, u64), Vec<DocId>> = HashMap::new();
        for (id, sig) in &signatures {
            for (band, rows) in sig.chunks(self.rows).enumerate() {
                let mut h = DefaultHasher::new();
                rows.hash(&mut h);
                buckets.entry((band, h.finish())).or_default().push(*id);
            }
        }

        let mut pairs = BTreeSet::new();
        for ids in buckets.values() {
            for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    let len = |d: DocId| sets.get(&d).map_or(0, Vec::len);
                    if size_bound_ok(len(a), len(b), min_weight) {
                        pairs.insert((a.min(b), a.max(b)));
                    }
                }
            }
        }
        pairs.into_iter().collect()
    }
}

/// Weighted undirected document graph. Every indexed document is a node;
/// neighbour lists are kept sorted by weight desc, then doc id asc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityGraph {
    min_weight: f64,
    adjacency: BTreeMap<DocId, Vec<Neighbor>>,
    edge_count: usize,
}

impl SimilarityGraph {
    pub fn build(index: &InvertedIndex, config: &GraphConfig) -> Result<Self> {
        config.validate()?;
        let generator = config.strategy.generator()?;
        Self::build_with(index, config.min_weight, generator.as_ref())
    }

    pub fn build_with(index: &InvertedIndex, min_weight: f64, generator: &dyn CandidateGenerator) -> Result<Self> {
        let started = Instant::now();
        let sets: TermSets = index.doc_ids().map(|id| (id, index.term_set(id))).collect();

        let mut pairs = generator.candidates(index, &sets, min_weight);
        pairs.par_sort_unstable();
        pairs.dedup();
        for &(a, b) in &pairs {
            for id in [a, b] {
                if !sets.contains_key(&id) {
                    return Err(EngineError::GraphBuild {
                        reason: format!("candidate pair ({a}, {b}) references document {id} missing from the index"),
                    });
                }
            }
        }
        let compared = pairs.len();

        let edges: Vec<Edge> = pairs
            .par_iter()
            .filter(|(a, b)| a != b)
            .filter_map(|&(a, b)| {
                let weight = jaccard(&sets[&a], &sets[&b]);
                (weight > 0.0 && weight >= min_weight).then_some(Edge { a: a.min(b), b: a.max(b), weight })
            })
            .collect();

        let mut graph = Self::empty(sets.keys().copied(), min_weight);
        for e in edges {
            graph.insert(e);
        }
        graph.sort_neighbors();

        tracing::info!(
            strategy = generator.name(),
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            compared,
            min_weight,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "similarity graph built"
        );
        Ok(graph)
    }

    /// Assembles a graph from explicit edges, rejecting self-loops, duplicates,
    /// unknown endpoints and weights outside `(0, 1]` or below `min_weight`.
    pub fn from_edges<N, E>(nodes: N, edges: E, min_weight: f64) -> Result<Self>
    where
        N: IntoIterator<Item = DocId>,
        E: IntoIterator<Item = Edge>,
    {
        let mut graph = Self::empty(nodes, min_weight);
        let mut seen = BTreeSet::new();
        for e in edges {
            let bad = |reason: &str| EngineError::GraphBuild { reason: format!("edge ({}, {}): {reason}", e.a, e.b) };
            if e.a == e.b {
                return Err(bad("self-loop"));
            }
            if !(e.weight > 0.0 && e.weight <= 1.0) || e.weight < min_weight {
                return Err(bad(&format!("weight {} out of range", e.weight)));
            }
            if !graph.contains(e.a) || !graph.contains(e.b) {
                return Err(bad("unknown endpoint"));
            }
            if !seen.insert((e.a.min(e.b), e.a.max(e.b))) {
                return Err(bad("duplicate"));
            }
            graph.insert(Edge { a: e.a.min(e.b), b: e.a.max(e.b), weight: e.weight });
        }
        graph.sort_neighbors();
        Ok(graph)
    }

    fn empty<N: IntoIterator<Item = DocId>>(nodes: N, min_weight: f64) -> Self {
        Self { min_weight, adjacency: nodes.into_iter().map(|id| (id, Vec::new())).collect(), edge_count: 0 }
    }

    fn insert(&mut self, e: Edge) {
        self.adjacency.entry(e.a).or_default().push(Neighbor { doc_id: e.b, weight: e.weight });
        self.adjacency.entry(e.b).or_default().push(Neighbor { doc_id: e.a, weight: e.weight });
        self.edge_count += 1;
    }

    fn sort_neighbors(&mut self) {
        for list in self.adjacency.values_mut() {
            list.sort_by(|x, y| y.weight.total_cmp(&x.weight).then(x.doc_id.cmp(&y.doc_id)));
        }
    }

    pub fn min_weight(&self) -> f64 { self.min_weight }

    pub fn node_count(&self) -> usize { self.adjacency.len() }

    pub fn edge_count(&self) -> usize { self.edge_count }

    pub fn contains(&self, id: DocId) -> bool { self.adjacency.contains_key(&id) }

    pub fn nodes(&self) -> impl Iterator<Item = DocId> + '_ { self.adjacency.keys().copied() }

    /// Neighbours by weight desc, then id asc. Empty for unknown nodes.
    pub fn neighbors(&self, id: DocId) -> &[Neighbor] {
        self.adjacency.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn degree(&self, id: DocId) -> usize { self.neighbors(id).len() }

    pub fn weighted_degree(&self, id: DocId) -> f64 { self.neighbors(id).iter().map(|n| n.weight).sum() }

    pub fn weight(&self, a: DocId, b: DocId) -> Option<f64> {
        self.neighbors(a).iter().find(|n| n.doc_id == b).map(|n| n.weight)
    }

    /// Each edge once, `a < b`, ordered by `a` then neighbour order.
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.adjacency.iter().flat_map(|(&a, list)| {
            list.iter().filter(move |n| n.doc_id > a).map(move |n| Edge { a, b: n.doc_id, weight: n.weight })
        })
    }

    /// The `n` most similar documents to `id`.
    pub fn suggest(&self, id: DocId, n: usize) -> Vec<DocId> {
        self.neighbors(id).iter().take(n).map(|nb| nb.doc_id).collect()
    }

    pub fn density(&self) -> f64 {
        let n = self.node_count() as f64;
        if n < 2.0 {
            return 0.0;
        }
        2.0 * self.edge_count as f64 / (n * (n - 1.0))
    }

    pub fn average_degree(&self) -> f64 {
        if self.adjacency.is_empty() {
            return 0.0;
        }
        2.0 * self.edge_count as f64 / self.node_count() as f64
    }

    /// Neighbour lists must form a simple undirected graph: endpoints are
    /// nodes, weights are in `(0, 1]` and above `min_weight`, every half-edge
    /// has a twin of equal weight, lists are sorted and `edge_count` matches.
    pub fn check_structure(&self) -> Result<()> {
        let bad = |reason: String| Err(EngineError::GraphBuild { reason });
        if !(0.0..=1.0).contains(&self.min_weight) {
            return bad(format!("min_weight {} outside [0, 1]", self.min_weight));
        }
        let mut half_edges = HashSet::new();
        for (&a, list) in &self.adjacency {
            for nb in list {
                let b = nb.doc_id;
                if a == b {
                    return bad(format!("self-loop on node {a}"));
                }
                if !self.contains(b) {
                    return bad(format!("edge ({a}, {b}) points at a missing node"));
                }
                if !(nb.weight > 0.0 && nb.weight <= 1.0) || nb.weight < self.min_weight {
                    return bad(format!("edge ({a}, {b}) has weight {} out of range", nb.weight));
                }
                if !half_edges.insert((a, b, nb.weight.to_bits())) {
                    return bad(format!("edge ({a}, {b}) is listed twice"));
                }
            }
            let sorted = list.windows(2).all(|w| {
                w[1].weight.total_cmp(&w[0].weight).then(w[0].doc_id.cmp(&w[1].doc_id)).is_lt()
            });
            if !sorted {
                return bad(format!("neighbours of node {a} are not in weight order"));
            }
        }
        if let Some(&(a, b, _)) = half_edges.iter().find(|&&(a, b, w)| !half_edges.contains(&(b, a, w))) {
            return bad(format!("edge ({a}, {b}) has no matching reverse entry"));
        }
        if half_edges.len() != 2 * self.edge_count {
            return bad(format!("{} half-edges for a recorded {} edges", half_edges.len(), self.edge_count));
        }
        Ok(())
    }

    /// Structure must hold and the node set must equal the index's document set.
    pub fn validate_against(&self, index: &InvertedIndex) -> Result<()> {
        self.check_structure()?;
        if let Some(id) = self.nodes().find(|id| !index.contains_doc(*id)) {
            return Err(EngineError::GraphBuild { reason: format!("graph node {id} is missing from the index") });
        }
        if let Some(id) = index.doc_ids().find(|id| !self.contains(*id)) {
            return Err(EngineError::GraphBuild { reason: format!("indexed document {id} is missing from the graph") });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{build_index, CorpusDoc};
    use crate::tokenizer::TokenizerConfig;

    fn corpus_index() -> InvertedIndex {
        let texts = [
            "the cat sat on the mat",
            "the cat sat on a hat",
            "a dog ran in the park",
            "the dog ran in a park today",
            "completely unrelated words here",
            "the cat sat on the mat",
        ];
        let corpus = texts.iter().enumerate().map(|(i, t)| CorpusDoc {
            id: i as DocId,
            key: format!("b{i}"),
            title: String::new(),
            text: t.to_string(),
        });
        build_index(corpus, &TokenizerConfig::default()).index
    }

    fn fixture_graph() -> SimilarityGraph {
        let e = |a, b, weight| Edge { a, b, weight };
        SimilarityGraph::from_edges(
            0..5,
            vec![e(0, 1, 0.5), e(0, 2, 0.9), e(0, 3, 0.2), e(0, 4, 0.7), e(1, 2, 0.3), e(3, 4, 0.3)],
            0.1,
        )
        .unwrap()
    }

    #[test]
    fn jaccard_is_symmetric_and_reflexive() {
        let a = [1, 2, 3, 5];
        let b = [2, 3, 4];
        assert_eq!(jaccard(&a, &b), jaccard(&b, &a));
        assert!((jaccard(&a, &b) - 2.0 / 5.0).abs() < 1e-12);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&[], &[]), 0.0);
    }

    #[test]
    fn built_graph_is_simple_and_thresholded() {
        let idx = corpus_index();
        let g = SimilarityGraph::build(&idx, &GraphConfig { min_weight: 0.2, ..GraphConfig::default() }).unwrap();
        assert_eq!(g.node_count(), idx.num_docs());
        let mut seen = BTreeSet::new();
        for e in g.edges() {
            assert_ne!(e.a, e.b);
            assert!(e.weight >= 0.2 && e.weight <= 1.0);
            assert!(seen.insert((e.a, e.b)));
            assert_eq!(g.weight(e.a, e.b), g.weight(e.b, e.a));
            let exact = jaccard(&idx.term_set(e.a), &idx.term_set(e.b));
            assert_eq!(e.weight, exact);
        }
        assert_eq!(seen.len(), g.edge_count());
        assert_eq!(g.weight(0, 5), Some(1.0));
        assert_eq!(g.degree(4), 0);
    }

    #[test]
    fn exact_strategies_agree() {
        let idx = corpus_index();
        let shared = SimilarityGraph::build_with(&idx, 0.1, &SharedTerms).unwrap();
        let all = SimilarityGraph::build_with(&idx, 0.1, &AllPairs).unwrap();
        assert_eq!(shared, all);
    }

    #[test]
    fn minhash_edges_are_exact_subset() {
        let idx = corpus_index();
        let exact = SimilarityGraph::build_with(&idx, 0.1, &SharedTerms).unwrap();
        let approx = SimilarityGraph::build_with(&idx, 0.1, &MinHashCandidates { bands: 16, rows: 2, seed: 7 }).unwrap();
        for e in approx.edges() {
            assert_eq!(exact.weight(e.a, e.b), Some(e.weight));
        }
        // identical documents always collide
        assert_eq!(approx.weight(0, 5), Some(1.0));
        let mh = MinHashCandidates { bands: 20, rows: 5, seed: 0 };
        assert!(mh.miss_probability(0.9) < 1e-6);
        assert!(mh.miss_probability(0.1) > 0.99);
    }

    #[test]
    fn suggest_returns_heaviest_neighbors() {
        let g = fixture_graph();
        assert_eq!(g.suggest(0, 3), vec![2, 4, 1]);
        assert_eq!(g.suggest(0, 10), vec![2, 4, 1, 3]);
        assert!(g.suggest(42, 3).is_empty());
    }

    #[test]
    fn suggest_ties_prefer_lower_id() {
        let g = fixture_graph();
        // node 3: 0 (0.2) and 4 (0.3)
        assert_eq!(g.suggest(3, 2), vec![4, 0]);
        let e = |a, b, weight| Edge { a, b, weight };
        let tied = SimilarityGraph::from_edges(0..4, vec![e(0, 3, 0.4), e(0, 1, 0.4), e(0, 2, 0.4)], 0.0).unwrap();
        assert_eq!(tied.suggest(0, 2), vec![1, 2]);
    }

    #[test]
    fn malformed_edges_are_rejected() {
        let e = |a, b, weight| Edge { a, b, weight };
        assert!(SimilarityGraph::from_edges(0..2, vec![e(1, 1, 0.5)], 0.1).is_err());
        assert!(SimilarityGraph::from_edges(0..2, vec![e(0, 1, 0.5), e(1, 0, 0.5)], 0.1).is_err());
        assert!(SimilarityGraph::from_edges(0..2, vec![e(0, 1, 0.05)], 0.1).is_err());
        assert!(SimilarityGraph::from_edges(0..2, vec![e(0, 7, 0.5)], 0.1).is_err());
    }

    #[test]
    fn bad_threshold_is_config_error() {
        let idx = corpus_index();
        let err = SimilarityGraph::build(&idx, &GraphConfig { min_weight: 1.5, ..GraphConfig::default() }).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn foreign_candidate_is_structural_error() {
        struct Bogus;
        impl CandidateGenerator for Bogus {
            fn name(&self) -> &'static str { "bogus" }
            fn candidates(&self, _: &InvertedIndex, _: &TermSets, _: f64) -> Vec<(DocId, DocId)> { vec![(0, 999)] }
        }
        let err = SimilarityGraph::build_with(&corpus_index(), 0.1, &Bogus).unwrap_err();
        assert!(matches!(err, EngineError::GraphBuild { .. }));
    }

    #[test]
    fn graph_must_cover_the_index() {
        let idx = corpus_index();
        let g = SimilarityGraph::from_edges(0..3, vec![], 0.1).unwrap();
        assert!(matches!(g.validate_against(&idx), Err(EngineError::GraphBuild { .. })));
        let full = SimilarityGraph::build(&idx, &GraphConfig::default()).unwrap();
        full.validate_against(&idx).unwrap();
    }

    #[test]
    fn broken_adjacency_is_structural_error() {
        let idx = corpus_index();
        let good = SimilarityGraph::build(&idx, &GraphConfig::default()).unwrap();
        good.check_structure().unwrap();
        assert!(good.edge_count() > 0);

        let dangling = {
            let mut g = good.clone();
            g.adjacency.get_mut(&0).unwrap().push(Neighbor { doc_id: 99, weight: 0.5 });
            g
        };
        let one_sided = {
            let mut g = good.clone();
            g.adjacency.get_mut(&4).unwrap().push(Neighbor { doc_id: 1, weight: 0.15 });
            g.sort_neighbors();
            g
        };
        let self_loop = {
            let mut g = good.clone();
            g.adjacency.get_mut(&2).unwrap().insert(0, Neighbor { doc_id: 2, weight: 1.0 });
            g
        };
        let miscounted = {
            let mut g = good.clone();
            g.edge_count += 1;
            g
        };
        let nan_weight = {
            let mut g = good.clone();
            let e = g.edges().next().unwrap();
            for (x, y) in [(e.a, e.b), (e.b, e.a)] {
                g.adjacency.get_mut(&x).unwrap().iter_mut().find(|n| n.doc_id == y).unwrap().weight = f64::NAN;
            }
            g
        };
        for broken in [dangling, one_sided, self_loop, miscounted, nan_weight] {
            assert!(matches!(broken.validate_against(&idx), Err(EngineError::GraphBuild { .. })));
        }
    }
}
