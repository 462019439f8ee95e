use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use shared::domain::SortOrder;

use super::support::spawn_service;
use super::*;

#[derive(Clone)]
struct LettersState {
    hits: Arc<AtomicUsize>,
}

async fn list_letters(
    State(state): State<LettersState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    // the adjacent-page fetch must re-issue the same order and page size
    assert_eq!(params.get("order").map(String::as_str), Some("desc"));
    assert_eq!(params.get("page_size").map(String::as_str), Some("2"));
    let page = match params.get("cursor").map(String::as_str) {
        None => json!({ "items": ["a", "b"], "cursor": { "next": "c2" } }),
        Some("c1") => json!({ "items": ["a", "b"], "cursor": { "next": "c2" } }),
        Some("c2") => json!({ "items": ["c", "d"], "cursor": { "prev": "c1", "next": "c3" } }),
        Some("c3") => json!({ "items": ["e"], "cursor": { "prev": "c2", "next": "" } }),
        other => panic!("unexpected cursor {other:?}"),
    };
    Json(page)
}

async fn letters_fetcher() -> (Arc<pagination::HttpPageFetcher<String>>, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/v0.3/letters", get(list_letters))
        .with_state(LettersState { hits: hits.clone() });
    let url = spawn_service(router).await;
    let session = Arc::new(Session::new(ClientConfig::new(url, "token")));
    let api = Arc::new(ApiClient::new(session));
    (
        pagination::HttpPageFetcher::new(api, "letters", ApiVersion::V03),
        hits,
    )
}

fn letters_request() -> PageRequest {
    PageRequest {
        order: SortOrder::Desc,
        page_size: 2,
        cursor: None,
    }
}

#[tokio::test]
async fn next_then_prev_round_trips_to_the_same_items() {
    let (fetcher, _hits) = letters_fetcher().await;
    let first = Arc::clone(&fetcher)
        .fetch_page(letters_request())
        .await
        .expect("first page");
    assert_eq!(first.items(), ["a", "b"]);

    let second = first.get_next().await.expect("second page");
    assert_eq!(second.items(), ["c", "d"]);

    let back = second.get_prev().await.expect("back to first");
    assert_eq!(back.items(), first.items());
    // advancing never mutates the page it was called on
    assert_eq!(first.items(), ["a", "b"]);
    assert!(first.has_next());
}

#[tokio::test]
async fn cursor_presence_drives_has_prev_and_has_next() {
    let (fetcher, _hits) = letters_fetcher().await;
    let first = Arc::clone(&fetcher)
        .fetch_page(letters_request())
        .await
        .expect("first page");
    assert!(!first.has_prev());
    assert!(first.has_next());

    let last = first
        .get_next()
        .await
        .expect("second")
        .get_next()
        .await
        .expect("third");
    assert_eq!(last.items(), ["e"]);
    assert!(last.has_prev());
    // an empty cursor string counts as absent
    assert!(!last.has_next());
}

#[tokio::test]
async fn absent_cursor_is_a_deterministic_error_with_no_network_call() {
    let (fetcher, hits) = letters_fetcher().await;
    let first = Arc::clone(&fetcher)
        .fetch_page(letters_request())
        .await
        .expect("first page");
    let fetches_so_far = hits.load(Ordering::SeqCst);

    let err = first.get_prev().await.expect_err("no previous page");
    assert!(matches!(
        err,
        ClientError::NoSuchPage(PageDirection::Prev)
    ));
    assert_eq!(hits.load(Ordering::SeqCst), fetches_so_far);

    let last = first
        .get_next()
        .await
        .expect("second")
        .get_next()
        .await
        .expect("third");
    let fetches_so_far = hits.load(Ordering::SeqCst);
    let err = last.get_next().await.expect_err("no next page");
    assert!(matches!(
        err,
        ClientError::NoSuchPage(PageDirection::Next)
    ));
    assert_eq!(hits.load(Ordering::SeqCst), fetches_so_far);
}
