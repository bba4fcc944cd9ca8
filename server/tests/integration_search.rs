use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use gutensearch_core::persist::{save_snapshot, save_text, IndexPaths};
use gutensearch_core::{build_index, CorpusDoc, EngineConfig, GraphConfig, SimilarityGraph};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::tempdir;
use tower::ServiceExt;

const BOOKS: &[(&str, &str, &str)] = &[
    ("moby", "Moby Dick", "Call me Ishmael. The whale, the white whale, crossed the sea."),
    ("wolf", "The Sea Wolf", "The sea wolf sailed the cold sea and hunted the seal."),
    ("whalers", "Whalers", "Whalers chased the whale across the sea."),
    ("dunes", "Dunes", "Sand and sun; the caravan crossed the dunes."),
];

fn build_tiny_snapshot(dir: &std::path::Path) {
    let paths = IndexPaths::new(dir);
    let corpus: Vec<CorpusDoc> = BOOKS
        .iter()
        .enumerate()
        .map(|(i, (key, title, text))| CorpusDoc {
            id: i as u32,
            key: key.to_string(),
            title: title.to_string(),
            text: text.to_string(),
        })
        .collect();
    for doc in &corpus {
        save_text(&paths, doc.id, &doc.text).unwrap();
    }
    let report = build_index(corpus, &Default::default());
    assert!(report.failures.is_empty());
    let graph = SimilarityGraph::build(&report.index, &GraphConfig::default()).unwrap();
    save_snapshot(&paths, &report.index, &graph, &Default::default()).unwrap();
}

fn app(dir: &std::path::Path) -> Router {
    build_tiny_snapshot(dir);
    server::build_app(dir, EngineConfig::default()).unwrap()
}

async fn call(app: Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::get(uri).body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn search_returns_ranked_results() {
    let dir = tempdir().unwrap();
    let app = app(dir.path());

    let (status, json) = call(app, "/search?query=whale&ranking=frequency&limit=5").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total_hits"], 2);
    let hits = json["hits"].as_array().unwrap();
    assert_eq!(hits[0]["key"], "moby");
    assert_eq!(hits[1]["key"], "whalers");
    assert_eq!(json["strategy"], "frequency");
}

#[tokio::test]
async fn or_mode_and_limit() {
    let dir = tempdir().unwrap();
    let app = app(dir.path());
    let (status, json) = call(app, "/search?query=seal%20dunes&mode=any&limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total_hits"], 2);
    assert_eq!(json["hits"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn advanced_search_matches_vocabulary() {
    let dir = tempdir().unwrap();
    let app = app(dir.path());
    let (status, json) = call(app, "/advanced-search?regex=%5Ewhal").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["matched_terms"], serde_json::json!(["whale", "whalers"]));
    assert_eq!(json["total_hits"], 2);
}

#[tokio::test]
async fn bad_requests_map_to_client_errors() {
    let dir = tempdir().unwrap();
    let app = app(dir.path());
    let (status, json) = call(app.clone(), "/search?query=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "malformed_query");

    let (status, json) = call(app.clone(), "/advanced-search?regex=%28oops").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_pattern");

    let (status, json) = call(app.clone(), "/search?query=whale&ranking=alphabetical").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_parameter");
    let message = json["message"].as_str().unwrap();
    assert!(message.contains("ranking") && message.contains("alphabetical"), "{message}");

    let (status, json) = call(app.clone(), "/search?query=whale&mode=xor").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["message"].as_str().unwrap().contains("mode"));

    let (status, json) = call(app, "/book/99").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn book_suggest_and_stats() {
    let dir = tempdir().unwrap();
    let app = app(dir.path());

    let (status, json) = call(app.clone(), "/book/0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["title"], "Moby Dick");
    assert!(json["text"].as_str().unwrap().starts_with("Call me Ishmael"));

    let (status, json) = call(app.clone(), "/suggest/0?top_n=2").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["suggestions"].as_array().unwrap().len() <= 2);

    let (status, json) = call(app.clone(), "/suggestions?query=whale&top_n=3").await;
    assert_eq!(status, StatusCode::OK);
    let seeds: Vec<u64> = json["seeds"].as_array().unwrap().iter().map(|h| h["doc_id"].as_u64().unwrap()).collect();
    for s in json["suggestions"].as_array().unwrap() {
        assert!(!seeds.contains(&s["doc_id"].as_u64().unwrap()));
    }

    let (status, json) = call(app.clone(), "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["document_count"], 4);
    assert_eq!(json["node_count"], 4);
    let edges = json["edge_count"].clone();
    let terms = json["term_count"].clone();

    let (status, json) = call(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["books_count"], 4);
    assert_eq!(json["graph_nodes"], 4);
    assert_eq!(json["graph_edges"], edges);
    assert_eq!(json["vocabulary_size"], terms);
    assert!(json["vocabulary_size"].as_u64().unwrap() > 0);
}
