use crate::graph::SimilarityGraph;
use crate::index::{DocId, InvertedIndex};
use crate::tokenizer::TokenizerConfig;
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;

pub const FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaFile {
    pub num_docs: usize,
    pub num_terms: usize,
    pub num_edges: usize,
    pub min_weight: f64,
    /// Queries must be tokenized the way the corpus was.
    pub tokenizer: TokenizerConfig,
    pub created_at: String,
    pub version: u32,
}

impl MetaFile {
    pub fn describe(index: &InvertedIndex, graph: &SimilarityGraph, tokenizer: &TokenizerConfig) -> Self {
        Self {
            num_docs: index.num_docs(),
            num_terms: index.num_terms(),
            num_edges: graph.edge_count(),
            min_weight: graph.min_weight(),
            tokenizer: tokenizer.clone(),
            created_at: time::OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            version: FORMAT_VERSION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    pub fn index(&self) -> PathBuf { self.root.join("index.bin") }
    pub fn graph(&self) -> PathBuf { self.root.join("graph.bin") }
    pub fn meta(&self) -> PathBuf { self.root.join("meta.json") }
    pub fn texts_dir(&self) -> PathBuf { self.root.join("texts") }
    pub fn text(&self, id: DocId) -> PathBuf { self.texts_dir().join(format!("{id}.txt")) }
}

fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(f);
    bincode::serialize_into(&mut w, value).with_context(|| format!("encoding {}", path.display()))?;
    w.flush()?;
    Ok(())
}

fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut buf = Vec::new();
    BufReader::new(f).read_to_end(&mut buf)?;
    let value = bincode::deserialize(&buf).with_context(|| format!("decoding {}", path.display()))?;
    Ok(value)
}

pub fn save_index(paths: &IndexPaths, index: &InvertedIndex) -> Result<()> {
    create_dir_all(&paths.root)?;
    write_bincode(&paths.index(), index)
}

/// Decodes the index and re-checks its posting/document agreement.
pub fn load_index(paths: &IndexPaths) -> Result<InvertedIndex> {
    let index: InvertedIndex = read_bincode(&paths.index())?;
    index.check_consistency().context("index snapshot is inconsistent")?;
    Ok(index)
}

pub fn save_graph(paths: &IndexPaths, graph: &SimilarityGraph) -> Result<()> {
    create_dir_all(&paths.root)?;
    write_bincode(&paths.graph(), graph)
}

pub fn load_graph(paths: &IndexPaths) -> Result<SimilarityGraph> {
    read_bincode(&paths.graph())
}

pub fn save_meta(paths: &IndexPaths, meta: &MetaFile) -> Result<()> {
    create_dir_all(&paths.root)?;
    let mut f = File::create(paths.meta())?;
    let json = serde_json::to_string_pretty(meta)?;
    f.write_all(json.as_bytes())?;
    Ok(())
}

pub fn load_meta(paths: &IndexPaths) -> Result<MetaFile> {
    let mut f = File::open(paths.meta()).with_context(|| format!("opening {}", paths.meta().display()))?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let meta: MetaFile = serde_json::from_str(&buf)?;
    if meta.version != FORMAT_VERSION {
        bail!("snapshot format version {} is not supported (expected {FORMAT_VERSION})", meta.version);
    }
    Ok(meta)
}

/// Keeps a copy of a book's raw text next to the snapshot for `/book` lookups.
pub fn save_text(paths: &IndexPaths, id: DocId, text: &str) -> Result<()> {
    create_dir_all(paths.texts_dir())?;
    std::fs::write(paths.text(id), text).with_context(|| format!("writing text for document {id}"))
}

/// `None` when the snapshot was built without text copies.
pub fn load_text(paths: &IndexPaths, id: DocId) -> Result<Option<String>> {
    let path = paths.text(id);
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Some(text))
}

/// Everything the query side needs, loaded together.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub index: InvertedIndex,
    pub graph: SimilarityGraph,
    pub meta: MetaFile,
}

pub fn save_snapshot(paths: &IndexPaths, index: &InvertedIndex, graph: &SimilarityGraph, tokenizer: &TokenizerConfig) -> Result<MetaFile> {
    let meta = MetaFile::describe(index, graph, tokenizer);
    save_index(paths, index)?;
    save_graph(paths, graph)?;
    save_meta(paths, &meta)?;
    tracing::info!(root = %paths.root.display(), docs = meta.num_docs, edges = meta.num_edges, "snapshot saved");
    Ok(meta)
}

pub fn load_snapshot(paths: &IndexPaths) -> Result<Snapshot> {
    let meta = load_meta(paths)?;
    let index = load_index(paths)?;
    let graph = load_graph(paths)?;
    graph.validate_against(&index).context("graph does not match index")?;
    if index.num_docs() != meta.num_docs || graph.edge_count() != meta.num_edges {
        bail!(
            "meta.json describes {} docs / {} edges but snapshot holds {} / {}",
            meta.num_docs,
            meta.num_edges,
            index.num_docs(),
            graph.edge_count()
        );
    }
    tracing::info!(root = %paths.root.display(), docs = index.num_docs(), terms = index.num_terms(), "snapshot loaded");
    Ok(Snapshot { index, graph, meta })
}
