use crate::error::{EngineError, Result};
use crate::tokenizer::{Tokenizer, TokenizerConfig};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type TermId = u32;
pub type DocId = u32;

/// Documents analyzed in parallel per merge round. Bounds the memory held in
/// flight to one chunk of raw texts.
const ANALYZE_CHUNK: usize = 256;

/// One input document as handed to the builder.
#[derive(Debug, Clone)]
pub struct CorpusDoc {
    pub id: DocId,
    /// Stable external key, e.g. the file stem of the book.
    pub key: String,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub title: String,
    pub term_freqs: BTreeMap<TermId, u32>,
    pub total_terms: u32,
    pub byte_len: u64,
}

impl Document {
    pub fn distinct_terms(&self) -> usize { self.term_freqs.len() }

    pub fn tf(&self, term: TermId) -> u32 { self.term_freqs.get(&term).copied().unwrap_or(0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub tf: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvertedIndex {
    dictionary: HashMap<String, TermId>,
    /// term id -> term
    terms: Vec<String>,
    /// term id -> postings sorted by doc_id
    postings: Vec<Vec<Posting>>,
    docs: BTreeMap<DocId, Document>,
    keys: HashMap<String, DocId>,
}

impl InvertedIndex {
    pub fn new() -> Self { Self::default() }

    pub fn num_docs(&self) -> usize { self.docs.len() }

    pub fn num_terms(&self) -> usize { self.terms.len() }

    pub fn num_postings(&self) -> usize { self.postings.iter().map(Vec::len).sum() }

    pub fn term_id(&self, term: &str) -> Option<TermId> { self.dictionary.get(term).copied() }

    pub fn term(&self, id: TermId) -> Option<&str> { self.terms.get(id as usize).map(String::as_str) }

    /// Every distinct term, in term-id order.
    pub fn vocabulary(&self) -> impl Iterator<Item = &str> + '_ { self.terms.iter().map(String::as_str) }

    /// Posting list of `term`, empty when the term is unknown.
    pub fn postings(&self, term: &str) -> &[Posting] {
        self.term_id(term).map(|id| self.postings_by_id(id)).unwrap_or(&[])
    }

    pub fn postings_by_id(&self, id: TermId) -> &[Posting] {
        self.postings.get(id as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn doc_freq(&self, term: &str) -> usize { self.postings(term).len() }

    pub fn document(&self, id: DocId) -> Option<&Document> { self.docs.get(&id) }

    pub fn documents(&self) -> impl Iterator<Item = (DocId, &Document)> + '_ {
        self.docs.iter().map(|(id, d)| (*id, d))
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = DocId> + '_ { self.docs.keys().copied() }

    pub fn contains_doc(&self, id: DocId) -> bool { self.docs.contains_key(&id) }

    pub fn doc_id_for_key(&self, key: &str) -> Option<DocId> { self.keys.get(key).copied() }

    /// Sorted distinct term ids of a document.
    pub fn term_set(&self, id: DocId) -> Vec<TermId> {
        self.docs.get(&id).map(|d| d.term_freqs.keys().copied().collect()).unwrap_or_default()
    }

    /// Documents containing every term. Lists are intersected shortest first.
    pub fn search_all<S: AsRef<str>>(&self, terms: &[S]) -> Vec<DocId> {
        let unique: BTreeSet<&str> = terms.iter().map(|t| t.as_ref()).collect();
        let mut lists: Vec<&[Posting]> = unique.iter().map(|t| self.postings(t)).collect();
        lists.sort_by_key(|l| l.len());
        let Some((first, rest)) = lists.split_first() else {
            return Vec::new();
        };
        let mut acc: Vec<DocId> = first.iter().map(|p| p.doc_id).collect();
        for list in rest {
            if acc.is_empty() {
                break;
            }
            acc.retain(|id| list.binary_search_by_key(id, |p| p.doc_id).is_ok());
        }
        acc
    }

    /// Documents containing at least one term, sorted by id.
    pub fn search_any<S: AsRef<str>>(&self, terms: &[S]) -> Vec<DocId> {
        let mut out = BTreeSet::new();
        for t in terms {
            out.extend(self.postings(t.as_ref()).iter().map(|p| p.doc_id));
        }
        out.into_iter().collect()
    }

    /// Verifies postings and per-document frequency maps agree in both directions.
    pub fn check_consistency(&self) -> Result<()> {
        let fail = |reason: String| Err(EngineError::IndexInconsistent { reason });
        if self.terms.len() != self.postings.len() || self.terms.len() != self.dictionary.len() {
            return fail(format!(
                "{} terms, {} dictionary entries, {} posting lists",
                self.terms.len(),
                self.dictionary.len(),
                self.postings.len()
            ));
        }
        for (tid, list) in self.postings.iter().enumerate() {
            let term = &self.terms[tid];
            if list.windows(2).any(|w| w[0].doc_id >= w[1].doc_id) {
                return fail(format!("postings of `{term}` not strictly ordered by doc id"));
            }
            for p in list {
                let Some(doc) = self.docs.get(&p.doc_id) else {
                    return fail(format!("`{term}` references missing document {}", p.doc_id));
                };
                if doc.tf(tid as TermId) != p.tf {
                    return fail(format!(
                        "`{term}` in document {}: posting tf {} vs document tf {}",
                        p.doc_id,
                        p.tf,
                        doc.tf(tid as TermId)
                    ));
                }
            }
        }
        for (id, doc) in &self.docs {
            for (tid, tf) in &doc.term_freqs {
                let found = self
                    .postings_by_id(*tid)
                    .binary_search_by_key(id, |p| p.doc_id)
                    .map(|i| self.postings[*tid as usize][i].tf);
                if found != Ok(*tf) {
                    return fail(format!("document {id} term {tid} missing from postings"));
                }
            }
        }
        Ok(())
    }
}

/// Term counts of one document, terms in first-occurrence order.
#[derive(Debug)]
pub struct AnalyzedDoc {
    pub id: DocId,
    pub key: String,
    pub title: String,
    pub counts: Vec<(String, u32)>,
    pub total_terms: u32,
    pub byte_len: u64,
}

/// Tokenizes and counts one document. Pure, safe to run in parallel.
pub fn analyze(tokenizer: &Tokenizer, doc: &CorpusDoc) -> Result<AnalyzedDoc> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut counts: Vec<(String, u32)> = Vec::new();
    let mut total: u32 = 0;
    for term in tokenizer.terms(&doc.text) {
        total += 1;
        match slots.get(&term) {
            Some(&i) => counts[i].1 += 1,
            None => {
                slots.insert(term.clone(), counts.len());
                counts.push((term, 1));
            }
        }
    }
    if total == 0 {
        return Err(EngineError::Ingest {
            doc: doc.id,
            key: doc.key.clone(),
            reason: "no tokens after normalization".into(),
        });
    }
    Ok(AnalyzedDoc {
        id: doc.id,
        key: doc.key.clone(),
        title: doc.title.clone(),
        counts,
        total_terms: total,
        byte_len: doc.text.len() as u64,
    })
}

/// Incremental index construction, one document at a time.
pub struct IndexBuilder {
    index: InvertedIndex,
    tokenizer: Tokenizer,
}

impl IndexBuilder {
    pub fn new(tokenizer: Tokenizer) -> Self { Self { index: InvertedIndex::new(), tokenizer } }

    pub fn add_document(&mut self, doc: &CorpusDoc) -> Result<()> {
        let analyzed = analyze(&self.tokenizer, doc)?;
        self.merge(analyzed)
    }

    /// Inserts an analyzed document. Postings stay ordered even when ids arrive out of order.
    pub fn merge(&mut self, doc: AnalyzedDoc) -> Result<()> {
        let ingest_err = |reason: String| EngineError::Ingest { doc: doc.id, key: doc.key.clone(), reason };
        if self.index.docs.contains_key(&doc.id) {
            return Err(ingest_err("duplicate document id".into()));
        }
        if self.index.keys.contains_key(&doc.key) {
            return Err(ingest_err("duplicate document key".into()));
        }

        let idx = &mut self.index;
        let mut term_freqs = BTreeMap::new();
        for (term, tf) in doc.counts {
            let tid = match idx.dictionary.get(&term) {
                Some(&tid) => tid,
                None => {
                    let tid = idx.terms.len() as TermId;
                    idx.dictionary.insert(term.clone(), tid);
                    idx.terms.push(term);
                    idx.postings.push(Vec::new());
                    tid
                }
            };
            let list = &mut idx.postings[tid as usize];
            let posting = Posting { doc_id: doc.id, tf };
            match list.last() {
                Some(last) if last.doc_id > doc.id => {
                    let pos = list.partition_point(|p| p.doc_id < doc.id);
                    list.insert(pos, posting);
                }
                _ => list.push(posting),
            }
            term_freqs.insert(tid, tf);
        }

        idx.keys.insert(doc.key.clone(), doc.id);
        idx.docs.insert(
            doc.id,
            Document {
                key: doc.key,
                title: doc.title,
                term_freqs,
                total_terms: doc.total_terms,
                byte_len: doc.byte_len,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize { self.index.num_docs() }

    pub fn is_empty(&self) -> bool { self.index.num_docs() == 0 }

    pub fn finish(self) -> InvertedIndex { self.index }
}

pub struct BuildReport {
    pub index: InvertedIndex,
    /// Documents skipped during the build, one `Ingest` error each.
    pub failures: Vec<EngineError>,
}

/// Builds an index from a corpus. Chunks are analyzed in parallel and merged
/// serially; a failing document is logged and skipped.
pub fn build_index<I>(corpus: I, config: &TokenizerConfig) -> BuildReport
where
    I: IntoIterator<Item = CorpusDoc>,
{
    let tokenizer = Tokenizer::new(config.clone());
    let mut builder = IndexBuilder::new(tokenizer.clone());
    let mut failures = Vec::new();
    let mut corpus = corpus.into_iter();
    let mut chunk: Vec<CorpusDoc> = Vec::with_capacity(ANALYZE_CHUNK);

    loop {
        chunk.clear();
        chunk.extend(corpus.by_ref().take(ANALYZE_CHUNK));
        if chunk.is_empty() {
            break;
        }
        let analyzed: Vec<Result<AnalyzedDoc>> = chunk.par_iter().map(|d| analyze(&tokenizer, d)).collect();
        for res in analyzed {
            if let Err(e) = res.and_then(|a| builder.merge(a)) {
                tracing::warn!(error = %e, "skipping document");
                failures.push(e);
            }
        }
        tracing::debug!(docs = builder.len(), "merged chunk");
    }

    let index = builder.finish();
    tracing::info!(num_docs = index.num_docs(), num_terms = index.num_terms(), skipped = failures.len(), "index built");
    BuildReport { index, failures }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: DocId, text: &str) -> CorpusDoc {
        CorpusDoc { id, key: format!("book_{id}"), title: format!("Book {id}"), text: text.into() }
    }

    fn fixture() -> InvertedIndex {
        let corpus = vec![
            doc(0, "the quick brown fox"),
            doc(1, "the slow brown dog, the end"),
            doc(2, "a quick question"),
            doc(3, "quiet fox quiet dog"),
        ];
        let report = build_index(corpus, &TokenizerConfig::default());
        assert!(report.failures.is_empty());
        report.index
    }

    #[test]
    fn postings_match_document_frequencies() {
        let idx = fixture();
        idx.check_consistency().unwrap();
        for (id, d) in idx.documents() {
            for (tid, tf) in &d.term_freqs {
                let p = idx.postings_by_id(*tid).iter().find(|p| p.doc_id == id).unwrap();
                assert_eq!(p.tf, *tf);
            }
        }
        assert_eq!(idx.postings("the"), &[Posting { doc_id: 0, tf: 1 }, Posting { doc_id: 1, tf: 2 }]);
    }

    #[test]
    fn unknown_term_has_empty_postings() {
        let idx = fixture();
        assert!(idx.postings("zebra").is_empty());
        assert_eq!(idx.doc_freq("zebra"), 0);
    }

    #[test]
    fn and_search_matches_brute_force() {
        let idx = fixture();
        let queries: &[&[&str]] = &[&["fox"], &["brown", "the"], &["quick", "fox"], &["dog", "quiet"], &["fox", "zebra"]];
        for q in queries {
            let expected: Vec<DocId> = idx
                .documents()
                .filter(|(_, d)| q.iter().all(|t| idx.term_id(t).map_or(false, |tid| d.tf(tid) > 0)))
                .map(|(id, _)| id)
                .collect();
            assert_eq!(idx.search_all(*q), expected, "query {q:?}");
        }
        assert!(idx.search_all::<&str>(&[]).is_empty());
    }

    #[test]
    fn or_search_is_union() {
        let idx = fixture();
        assert_eq!(idx.search_any(&["question", "slow"]), vec![1, 2]);
    }

    #[test]
    fn empty_document_is_reported_not_fatal() {
        let corpus = vec![doc(0, "words here"), doc(1, " -- ... "), doc(2, "more words")];
        let report = build_index(corpus, &TokenizerConfig::default());
        assert_eq!(report.index.num_docs(), 2);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0], EngineError::Ingest { doc: 1, .. }));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut b = IndexBuilder::new(Tokenizer::default());
        b.add_document(&doc(4, "alpha")).unwrap();
        let mut dup = doc(4, "beta");
        dup.key = "other".into();
        assert!(matches!(b.add_document(&dup), Err(EngineError::Ingest { doc: 4, .. })));
    }

    #[test]
    fn out_of_order_ids_keep_postings_sorted() {
        let mut b = IndexBuilder::new(Tokenizer::default());
        for id in [5, 1, 3] {
            b.add_document(&doc(id, "shared")).unwrap();
        }
        let idx = b.finish();
        let ids: Vec<DocId> = idx.postings("shared").iter().map(|p| p.doc_id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        idx.check_consistency().unwrap();
    }

    #[test]
    fn term_ids_follow_first_occurrence() {
        let idx = fixture();
        let vocab: Vec<&str> = idx.vocabulary().take(4).collect();
        assert_eq!(vocab, vec!["the", "quick", "brown", "fox"]);
        assert_eq!(idx, fixture());
    }
}
