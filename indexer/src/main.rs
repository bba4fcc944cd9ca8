use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gutensearch_core::persist::{load_snapshot, save_graph, save_meta, save_snapshot, save_text, IndexPaths, MetaFile};
use gutensearch_core::{build_index, CandidateStrategy, CorpusDoc, DocId, EngineConfig, QueryService, SimilarityGraph};
use tracing_subscriber::{fmt, EnvFilter};
use walkdir::WalkDir;

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lines scanned for a `Title:` header before falling back to the file name.
const TITLE_SCAN_LINES: usize = 60;

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Build the book index and similarity graph", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a directory of .txt books and build the similarity graph
    Build {
        /// Directory holding the books (searched recursively)
        #[arg(long)]
        input: PathBuf,
        /// Output snapshot directory
        #[arg(long)]
        output: PathBuf,
        /// Minimum term length in characters
        #[arg(long)]
        min_term_len: Option<usize>,
        /// Drop English/French stopwords
        #[arg(long, default_value_t = false)]
        stopwords: bool,
        /// Skip copying raw texts next to the snapshot
        #[arg(long, default_value_t = false)]
        no_texts: bool,
        #[command(flatten)]
        graph: GraphArgs,
    },
    /// Rebuild only the similarity graph of an existing snapshot
    Graph {
        #[arg(long)]
        index: PathBuf,
        #[command(flatten)]
        graph: GraphArgs,
    },
    /// Print snapshot statistics as JSON
    Stats {
        #[arg(long)]
        index: PathBuf,
        /// JSON engine config (ranking parameters)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct GraphArgs {
    /// Jaccard threshold for an edge
    #[arg(long)]
    min_weight: Option<f64>,
    /// Candidate pair generation
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,
    /// MinHash bands
    #[arg(long, default_value_t = 20)]
    bands: usize,
    /// MinHash rows per band
    #[arg(long, default_value_t = 5)]
    rows: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// JSON engine config, flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    AllPairs,
    SharedTerms,
    MinHash,
}

impl GraphArgs {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(w) = self.min_weight {
            config.graph.min_weight = w;
        }
        if let Some(s) = self.strategy {
            config.graph.strategy = match s {
                StrategyArg::AllPairs => CandidateStrategy::AllPairs,
                StrategyArg::SharedTerms => CandidateStrategy::SharedTerms,
                StrategyArg::MinHash => CandidateStrategy::MinHash { bands: self.bands, rows: self.rows, seed: self.seed },
            };
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { input, output, min_term_len, stopwords, no_texts, graph } => {
            let mut config = graph.engine_config()?;
            if let Some(n) = min_term_len {
                config.tokenizer.min_term_len = n;
            }
            config.tokenizer.drop_stopwords |= stopwords;
            build(&input, &output, &config, !no_texts)
        }
        Commands::Graph { index, graph } => rebuild_graph(&index, &graph.engine_config()?),
        Commands::Stats { index, config } => {
            let config = match config {
                Some(path) => EngineConfig::from_json_file(path)?,
                None => EngineConfig::default(),
            };
            print_stats(&index, config)
        }
    }
}

fn build(input: &Path, output: &Path, config: &EngineConfig, keep_texts: bool) -> Result<()> {
    let files = book_files(input)?;
    if files.is_empty() {
        bail!("no .txt books under {}", input.display());
    }
    tracing::info!(books = files.len(), input = %input.display(), "reading corpus");

    let paths = IndexPaths::new(output);
    // books are read one chunk at a time as the builder pulls them
    let corpus = files.iter().enumerate().filter_map(|(i, file)| match read_book(i as DocId, file) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::warn!(file = %file.display(), error = %e, "skipping unreadable book");
            None
        }
    });

    let report = build_index(corpus, &config.tokenizer);
    for failure in &report.failures {
        tracing::warn!(error = %failure, "document left out of the index");
    }
    if keep_texts {
        for id in report.index.doc_ids() {
            let doc = read_book(id, &files[id as usize])?;
            save_text(&paths, id, &doc.text)?;
        }
    }
    let graph = SimilarityGraph::build(&report.index, &config.graph)?;
    let meta = save_snapshot(&paths, &report.index, &graph, &config.tokenizer)?;
    tracing::info!(
        output = %output.display(),
        docs = meta.num_docs,
        terms = meta.num_terms,
        edges = meta.num_edges,
        skipped = report.failures.len(),
        "index build complete"
    );
    Ok(())
}

fn rebuild_graph(index_dir: &Path, config: &EngineConfig) -> Result<()> {
    let paths = IndexPaths::new(index_dir);
    let snap = load_snapshot(&paths)?;
    let graph = SimilarityGraph::build(&snap.index, &config.graph)?;
    save_graph(&paths, &graph)?;
    save_meta(&paths, &MetaFile::describe(&snap.index, &graph, &snap.meta.tokenizer))?;
    tracing::info!(edges = graph.edge_count(), previous = snap.meta.num_edges, "graph rebuilt");
    Ok(())
}

fn print_stats(index_dir: &Path, mut config: EngineConfig) -> Result<()> {
    let snap = load_snapshot(&IndexPaths::new(index_dir))?;
    config.tokenizer = snap.meta.tokenizer.clone();
    let service = QueryService::new(Arc::new(snap.index), Arc::new(snap.graph), &config)?;
    println!("{}", serde_json::to_string_pretty(&service.stats())?);
    Ok(())
}

/// `.txt` files under `root`, sorted so doc ids are stable across runs.
fn book_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && p.extension().and_then(|s| s.to_str()) == Some("txt"))
        .collect();
    files.sort();
    Ok(files)
}

fn read_book(id: DocId, path: &Path) -> Result<CorpusDoc> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    let key = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
    let title = find_title(&text).unwrap_or_else(|| key.clone());
    Ok(CorpusDoc { id, key, title, text })
}

fn find_title(text: &str) -> Option<String> {
    text.lines()
        .take(TITLE_SCAN_LINES)
        .find_map(|line| line.trim().strip_prefix("Title:"))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_header_is_used_when_present() {
        let text = "The Project Gutenberg eBook\n\nTitle: Moby Dick; Or, The Whale\nAuthor: Herman Melville\n";
        assert_eq!(find_title(text).as_deref(), Some("Moby Dick; Or, The Whale"));
        assert_eq!(find_title("no header here"), None);
        assert_eq!(find_title("Title:   \n"), None);
    }

    #[test]
    fn build_without_texts_writes_none() {
        let dir = tempfile::tempdir().unwrap();
        let books = dir.path().join("books");
        std::fs::create_dir_all(&books).unwrap();
        std::fs::write(books.join("a.txt"), "the whale swims in the sea").unwrap();
        std::fs::write(books.join("b.txt"), "the whale and the sea").unwrap();
        let out = dir.path().join("index");
        build(&books, &out, &EngineConfig::default(), false).unwrap();
        assert!(!IndexPaths::new(&out).texts_dir().exists());
        assert_eq!(load_snapshot(&IndexPaths::new(&out)).unwrap().index.num_docs(), 2);
    }

    #[test]
    fn build_then_rebuild_graph() {
        let dir = tempfile::tempdir().unwrap();
        let books = dir.path().join("books");
        std::fs::create_dir_all(books.join("nested")).unwrap();
        std::fs::write(books.join("b.txt"), "Title: Sea\nthe whale and the sea").unwrap();
        std::fs::write(books.join("a.txt"), "the whale swims in the sea").unwrap();
        std::fs::write(books.join("nested/c.txt"), "desert sand and sun").unwrap();
        std::fs::write(books.join("notes.md"), "ignored").unwrap();
        std::fs::write(books.join("blank.txt"), "  ...  ").unwrap();

        let out = dir.path().join("index");
        build(&books, &out, &EngineConfig::default(), true).unwrap();
        let snap = load_snapshot(&IndexPaths::new(&out)).unwrap();
        // blank.txt gets id 2 and is rejected for having no terms
        assert_eq!(snap.index.num_docs(), 3);
        assert_eq!(snap.index.doc_id_for_key("a"), Some(0));
        assert_eq!(snap.index.doc_id_for_key("c"), Some(3));
        assert_eq!(snap.index.document(1).map(|d| d.title.as_str()), Some("Sea"));
        assert!(IndexPaths::new(&out).text(0).is_file());
        assert!(IndexPaths::new(&out).text(3).is_file());
        // rejected books get no text copy
        assert!(!IndexPaths::new(&out).text(2).exists());

        let mut config = EngineConfig::default();
        config.graph.min_weight = 0.99;
        rebuild_graph(&out, &config).unwrap();
        let snap = load_snapshot(&IndexPaths::new(&out)).unwrap();
        assert_eq!(snap.graph.edge_count(), 0);
        assert_eq!(snap.meta.min_weight, 0.99);
    }
}
